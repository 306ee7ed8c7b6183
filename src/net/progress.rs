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

//! Background progress engine
//!
//! One thread per [`CommContext`](crate::ctx::CommContext) drives every
//! registered communicator. It spins with a short sleep while work is
//! outstanding, parks when all queues are empty, and exits once the last
//! communicator is unregistered. Registering a communicator again restarts it.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::CommConfig;
use crate::error::{CommError, CommResult};
use crate::util::lock;
use super::communicator::Communicator;

/// Upper bound on an idle park; liveness is re-checked at least this often
const IDLE_PARK: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    NotStarted,
    Running,
    Stopping,
    Stopped,
}

/// Counters since the engine was created
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EngineStats {
    /// Progress passes over the communicator set
    pub iterations: u64,
    /// Works that reached a terminal state inside the engine
    pub completed: u64,
    pub liveness_warnings: u64,
    /// Times a progress thread was spawned
    pub threads_started: u64,
}

struct Control {
    state: EngineState,
    communicators: Vec<Arc<Communicator>>,
    shutdown: bool,
    notified: bool,
}

struct Shared {
    rank: usize,
    poll_interval: Duration,
    liveness_timeout: Duration,
    control: Mutex<Control>,
    wakeup: Condvar,
    stats: Mutex<EngineStats>,
}

pub struct ProgressEngine {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ProgressEngine {
    pub fn new(rank: usize, config: &CommConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                rank,
                poll_interval: config.progress_poll_interval,
                liveness_timeout: config.liveness_timeout,
                control: Mutex::new(Control {
                    state: EngineState::NotStarted,
                    communicators: Vec::new(),
                    shutdown: false,
                    notified: false,
                }),
                wakeup: Condvar::new(),
                stats: Mutex::new(EngineStats::default()),
            }),
            handle: Mutex::new(None),
        }
    }

    pub fn state(&self) -> EngineState {
        lock(&self.shared.control).state
    }

    pub fn stats(&self) -> EngineStats {
        *lock(&self.shared.stats)
    }

    /// Number of communicators being driven
    pub fn registered(&self) -> usize {
        lock(&self.shared.control).communicators.len()
    }

    /// Start driving `comm`, starting the thread if it is not running
    pub fn register(&self, comm: Arc<Communicator>) -> CommResult<()> {
        let mut control = lock(&self.shared.control);
        if control
            .communicators
            .iter()
            .any(|c| Arc::ptr_eq(c, &comm))
        {
            return Ok(());
        }
        control.communicators.push(comm);
        control.shutdown = false;
        match control.state {
            EngineState::Running => {
                control.notified = true;
                self.shared.wakeup.notify_all();
                Ok(())
            }
            // The thread has not exited yet; tell it to keep going.
            EngineState::Stopping => {
                control.state = EngineState::Running;
                control.notified = true;
                self.shared.wakeup.notify_all();
                Ok(())
            }
            EngineState::NotStarted | EngineState::Stopped => {
                control.state = EngineState::Running;
                drop(control);
                self.spawn()
            }
        }
    }

    fn spawn(&self) -> CommResult<()> {
        let mut handle = lock(&self.handle);
        if let Some(previous) = handle.take() {
            let _ = previous.join();
        }
        let shared = self.shared.clone();
        let spawned = thread::Builder::new()
            .name(format!("coll-progress-{}", self.shared.rank))
            .spawn(move || run(shared));
        match spawned {
            Ok(h) => {
                *handle = Some(h);
                lock(&self.shared.stats).threads_started += 1;
                Ok(())
            }
            Err(e) => {
                let mut control = lock(&self.shared.control);
                control.state = EngineState::Stopped;
                control.communicators.clear();
                Err(CommError::TransportInit(format!(
                    "failed to spawn progress thread: {}",
                    e
                )))
            }
        }
    }

    pub fn unregister(&self, comm: &Arc<Communicator>) {
        let mut control = lock(&self.shared.control);
        control.communicators.retain(|c| !Arc::ptr_eq(c, comm));
        self.shared.wakeup.notify_all();
    }

    /// Wake the thread after new work was posted
    pub fn notify(&self) {
        let mut control = lock(&self.shared.control);
        control.notified = true;
        self.shared.wakeup.notify_all();
    }

    /// Block until the engine reaches `state` or `timeout` passes
    pub fn wait_for_state(&self, state: EngineState, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut control = lock(&self.shared.control);
        while control.state != state {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            control = match self.shared.wakeup.wait_timeout(control, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }

    /// Stop the thread and wait for it, whatever is still registered
    pub fn shutdown(&self) {
        {
            let mut control = lock(&self.shared.control);
            control.shutdown = true;
            self.shared.wakeup.notify_all();
        }
        if let Some(handle) = lock(&self.handle).take() {
            let _ = handle.join();
        }
        let mut control = lock(&self.shared.control);
        control.communicators.clear();
        if control.state != EngineState::NotStarted {
            control.state = EngineState::Stopped;
        }
    }
}

impl Drop for ProgressEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(shared: Arc<Shared>) {
    crate::coll_info!("[Rank {}] progress engine started", shared.rank);
    loop {
        let communicators = {
            let mut control = lock(&shared.control);
            if control.communicators.is_empty() || control.shutdown {
                control.state = EngineState::Stopping;
                shared.wakeup.notify_all();
                drop(control);

                let mut control = lock(&shared.control);
                if control.state == EngineState::Stopping {
                    control.state = EngineState::Stopped;
                    shared.wakeup.notify_all();
                    crate::coll_info!("[Rank {}] progress engine stopped", shared.rank);
                    return;
                }
                continue;
            }
            control.notified = false;
            control.communicators.clone()
        };

        let mut outstanding = 0;
        let mut completed = 0;
        let mut warnings = 0;
        for comm in &communicators {
            let report = comm.progress(shared.liveness_timeout);
            outstanding += report.outstanding;
            completed += report.completed;
            warnings += report.liveness_warnings;
        }
        drop(communicators);

        {
            let mut stats = lock(&shared.stats);
            stats.iterations += 1;
            stats.completed += completed as u64;
            stats.liveness_warnings += warnings as u64;
        }

        if outstanding == 0 {
            let control = lock(&shared.control);
            if !control.notified && !control.shutdown && !control.communicators.is_empty() {
                let _ = shared.wakeup.wait_timeout(control, IDLE_PARK);
            }
        } else if completed == 0 {
            if shared.poll_interval.is_zero() {
                thread::yield_now();
            } else {
                thread::sleep(shared.poll_interval);
            }
        }
    }
}
