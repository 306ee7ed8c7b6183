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

//! Backend configuration
//!
//! Everything here is consumed, never produced, by the core. Values come from
//! [`CommConfig::default`], the builder setters, or [`CommConfig::from_env`].

use std::str::FromStr;
use std::time::Duration;

use crate::error::{CommError, CommResult};

/// How REDUCE_SCATTER is executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReduceScatterStrategy {
    /// Native if the transport has it, otherwise all-reduce then slice
    #[default]
    Auto,
    /// Require the transport primitive
    Native,
    /// All-reduce the whole input into scratch, keep this rank's chunk
    AllReduceThenSlice,
    /// All-gather every input into scratch, reduce this rank's chunk locally
    AllGatherThenReduce,
}

/// How REDUCE is executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReduceStrategy {
    /// Native if the transport has it, otherwise all-reduce
    #[default]
    Auto,
    Native,
    /// All-reduce into scratch, root copies the result out
    AllReduce,
}

impl FromStr for ReduceScatterStrategy {
    type Err = CommError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "native" => Ok(Self::Native),
            "allreduce" | "allreduce_slice" => Ok(Self::AllReduceThenSlice),
            "allgather" | "allgather_reduce" => Ok(Self::AllGatherThenReduce),
            other => Err(CommError::invalid(format!(
                "unknown reduce-scatter strategy '{}'",
                other
            ))),
        }
    }
}

impl FromStr for ReduceStrategy {
    type Err = CommError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "native" => Ok(Self::Native),
            "allreduce" => Ok(Self::AllReduce),
            other => Err(CommError::invalid(format!(
                "unknown reduce strategy '{}'",
                other
            ))),
        }
    }
}

/// Configuration of a [`CommContext`](crate::ctx::CommContext)
#[derive(Debug, Clone)]
pub struct CommConfig {
    /// Sleep between polls while operations are outstanding (zero = yield)
    pub progress_poll_interval: Duration,

    /// Age after which an outstanding operation is reported as stalled, and
    /// the period of the repeated reports
    pub liveness_timeout: Duration,

    /// Bound on waiting for peers during communicator creation
    pub rendezvous_timeout: Duration,

    pub reduce_scatter_strategy: ReduceScatterStrategy,

    pub reduce_strategy: ReduceStrategy,

    /// Reject new posts on a group after one of its operations failed in the
    /// transport
    pub invalidate_on_error: bool,

    /// Namespace for rendezvous keys in the store
    pub key_prefix: String,
}

impl Default for CommConfig {
    fn default() -> Self {
        Self {
            progress_poll_interval: Duration::from_micros(50),
            liveness_timeout: Duration::from_secs(60),
            rendezvous_timeout: Duration::from_secs(300),
            reduce_scatter_strategy: ReduceScatterStrategy::Auto,
            reduce_strategy: ReduceStrategy::Auto,
            invalidate_on_error: true,
            key_prefix: "coll".to_string(),
        }
    }
}

const ENV_PROGRESS_POLL_US: &str = "COLL_PROGRESS_POLL_US";
const ENV_LIVENESS_TIMEOUT_MS: &str = "COLL_LIVENESS_TIMEOUT_MS";
const ENV_RENDEZVOUS_TIMEOUT_MS: &str = "COLL_RENDEZVOUS_TIMEOUT_MS";
const ENV_REDUCE_SCATTER_STRATEGY: &str = "COLL_REDUCE_SCATTER_STRATEGY";
const ENV_REDUCE_STRATEGY: &str = "COLL_REDUCE_STRATEGY";
const ENV_INVALIDATE_ON_ERROR: &str = "COLL_INVALIDATE_ON_ERROR";
const ENV_KEY_PREFIX: &str = "COLL_KEY_PREFIX";

impl CommConfig {
    /// Defaults overridden by `COLL_*` environment variables
    pub fn from_env() -> CommResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an explicit variable source
    pub fn from_lookup<F>(lookup: F) -> CommResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = lookup(ENV_PROGRESS_POLL_US) {
            config.progress_poll_interval =
                Duration::from_micros(parse_num(ENV_PROGRESS_POLL_US, &v)?);
        }
        if let Some(v) = lookup(ENV_LIVENESS_TIMEOUT_MS) {
            config.liveness_timeout =
                Duration::from_millis(parse_num(ENV_LIVENESS_TIMEOUT_MS, &v)?);
        }
        if let Some(v) = lookup(ENV_RENDEZVOUS_TIMEOUT_MS) {
            config.rendezvous_timeout =
                Duration::from_millis(parse_num(ENV_RENDEZVOUS_TIMEOUT_MS, &v)?);
        }
        if let Some(v) = lookup(ENV_REDUCE_SCATTER_STRATEGY) {
            config.reduce_scatter_strategy = v.parse()?;
        }
        if let Some(v) = lookup(ENV_REDUCE_STRATEGY) {
            config.reduce_strategy = v.parse()?;
        }
        if let Some(v) = lookup(ENV_INVALIDATE_ON_ERROR) {
            config.invalidate_on_error = match v.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "y" => true,
                "0" | "false" | "no" | "n" => false,
                other => {
                    return Err(CommError::invalid(format!(
                        "{} must be a boolean, got '{}'",
                        ENV_INVALIDATE_ON_ERROR, other
                    )))
                }
            };
        }
        if let Some(v) = lookup(ENV_KEY_PREFIX) {
            config.key_prefix = v;
        }

        Ok(config)
    }

    /// Builder pattern: set progress poll interval
    pub fn progress_poll_interval(mut self, interval: Duration) -> Self {
        self.progress_poll_interval = interval;
        self
    }

    /// Builder pattern: set liveness timeout
    pub fn liveness_timeout(mut self, timeout: Duration) -> Self {
        self.liveness_timeout = timeout;
        self
    }

    /// Builder pattern: set rendezvous timeout
    pub fn rendezvous_timeout(mut self, timeout: Duration) -> Self {
        self.rendezvous_timeout = timeout;
        self
    }

    pub fn reduce_scatter_strategy(mut self, strategy: ReduceScatterStrategy) -> Self {
        self.reduce_scatter_strategy = strategy;
        self
    }

    pub fn reduce_strategy(mut self, strategy: ReduceStrategy) -> Self {
        self.reduce_strategy = strategy;
        self
    }

    pub fn invalidate_on_error(mut self, invalidate: bool) -> Self {
        self.invalidate_on_error = invalidate;
        self
    }

    pub fn key_prefix(mut self, prefix: &str) -> Self {
        self.key_prefix = prefix.to_string();
        self
    }

    /// Builder pattern: isolate rendezvous keys under a fresh session id
    ///
    /// Every rank of a job must end up with the same prefix, so this is only
    /// useful when the config is built once and shipped to all ranks.
    pub fn with_session(mut self) -> Self {
        self.key_prefix = format!("{}/{}", self.key_prefix, uuid::Uuid::new_v4());
        self
    }
}

fn parse_num(key: &str, value: &str) -> CommResult<u64> {
    value.trim().parse::<u64>().map_err(|_| {
        CommError::invalid(format!("{} must be an unsigned integer, got '{}'", key, value))
    })
}
