// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Logging setup
//!
//! The crate logs through the `log` facade. Binaries and tests pick a backend;
//! these helpers install `env_logger`. The `coll_*` macros take an optional
//! `[rank, group]` head that prefixes the line with `[Rank r][group]`.

pub use log::{debug, error, info, trace, warn};

/// Initialize logging from `RUST_LOG`
pub fn init_logging() {
    let _ = env_logger::try_init();
}

/// Initialize logging with a specific level
pub fn init_logging_with_level(level: log::LevelFilter) {
    let _ = env_logger::Builder::from_default_env()
        .filter_level(level)
        .try_init();
}

/// Initialize logging for tests; output is captured by the test harness
pub fn init_test_logging() {
    let _ = env_logger::Builder::from_default_env()
        .is_test(true)
        .try_init();
}

/// Prefix used on every log line about a group
pub fn group_prefix(rank: usize, group: &str) -> String {
    format!("[Rank {}][{}]", rank, group)
}

#[macro_export]
macro_rules! coll_info {
    ([$rank:expr, $group:expr] $($arg:tt)+) => {
        $crate::util::logging::info!(
            "{} {}",
            $crate::util::logging::group_prefix($rank, $group),
            format_args!($($arg)+)
        )
    };
    ($($arg:tt)+) => {
        $crate::util::logging::info!($($arg)+)
    };
}

#[macro_export]
macro_rules! coll_debug {
    ([$rank:expr, $group:expr] $($arg:tt)+) => {
        $crate::util::logging::debug!(
            "{} {}",
            $crate::util::logging::group_prefix($rank, $group),
            format_args!($($arg)+)
        )
    };
    ($($arg:tt)+) => {
        $crate::util::logging::debug!($($arg)+)
    };
}

#[macro_export]
macro_rules! coll_warn {
    ([$rank:expr, $group:expr] $($arg:tt)+) => {
        $crate::util::logging::warn!(
            "{} {}",
            $crate::util::logging::group_prefix($rank, $group),
            format_args!($($arg)+)
        )
    };
    ($($arg:tt)+) => {
        $crate::util::logging::warn!($($arg)+)
    };
}

#[macro_export]
macro_rules! coll_error {
    ([$rank:expr, $group:expr] $($arg:tt)+) => {
        $crate::util::logging::error!(
            "{} {}",
            $crate::util::logging::group_prefix($rank, $group),
            format_args!($($arg)+)
        )
    };
    ($($arg:tt)+) => {
        $crate::util::logging::error!($($arg)+)
    };
}

#[macro_export]
macro_rules! coll_trace {
    ([$rank:expr, $group:expr] $($arg:tt)+) => {
        $crate::util::logging::trace!(
            "{} {}",
            $crate::util::logging::group_prefix($rank, $group),
            format_args!($($arg)+)
        )
    };
    ($($arg:tt)+) => {
        $crate::util::logging::trace!($($arg)+)
    };
}
