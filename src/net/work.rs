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

//! Completion handles for posted operations

use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{CommError, CommResult};
use crate::util::lock;
use super::comm_operations::OpKind;

/// Lifecycle of a posted operation
///
/// `Pending -> InProgress -> Completed | Aborted | Errored`. A pending work
/// may also go straight to `Aborted` or `Errored`. Terminal states are final.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkState {
    Pending,
    InProgress,
    Completed,
    Aborted,
    Errored(CommError),
}

impl WorkState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkState::Completed | WorkState::Aborted | WorkState::Errored(_)
        )
    }
}

struct WorkStatus {
    state: WorkState,
    abort_requested: bool,
}

struct WorkInner {
    seq: u64,
    kind: OpKind,
    group: String,
    posted_at: Instant,
    status: Mutex<WorkStatus>,
    done: Condvar,
}

/// Handle returned to the caller for every posted operation
///
/// Cloning shares the same underlying state; the progress engine holds one
/// clone and callers hold the others.
#[derive(Clone)]
pub struct Work {
    inner: Arc<WorkInner>,
}

impl Work {
    pub(crate) fn new(seq: u64, kind: OpKind, group: &str) -> Self {
        Self {
            inner: Arc::new(WorkInner {
                seq,
                kind,
                group: group.to_string(),
                posted_at: Instant::now(),
                status: Mutex::new(WorkStatus {
                    state: WorkState::Pending,
                    abort_requested: false,
                }),
                done: Condvar::new(),
            }),
        }
    }

    /// Position in the communicator's post order
    pub fn seq(&self) -> u64 {
        self.inner.seq
    }

    pub fn kind(&self) -> OpKind {
        self.inner.kind
    }

    pub fn group(&self) -> &str {
        &self.inner.group
    }

    /// Time since the operation was posted
    pub fn elapsed(&self) -> Duration {
        self.inner.posted_at.elapsed()
    }

    pub fn state(&self) -> WorkState {
        lock(&self.inner.status).state.clone()
    }

    /// Whether the work reached a terminal state, successful or not
    pub fn is_completed(&self) -> bool {
        lock(&self.inner.status).state.is_terminal()
    }

    pub fn is_success(&self) -> bool {
        lock(&self.inner.status).state == WorkState::Completed
    }

    /// The failure of a terminal work, if any
    pub fn exception(&self) -> Option<CommError> {
        match &lock(&self.inner.status).state {
            WorkState::Errored(e) => Some(e.clone()),
            WorkState::Aborted => Some(CommError::Aborted),
            _ => None,
        }
    }

    /// Block until the work is terminal
    pub fn wait(&self) -> CommResult<()> {
        let mut status = lock(&self.inner.status);
        while !status.state.is_terminal() {
            status = match self.inner.done.wait(status) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
        outcome(&status.state)
    }

    /// Block up to `timeout`; `Ok(false)` if the work is still running
    pub fn wait_timeout(&self, timeout: Duration) -> CommResult<bool> {
        let deadline = Instant::now() + timeout;
        let mut status = lock(&self.inner.status);
        while !status.state.is_terminal() {
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            status = match self.inner.done.wait_timeout(status, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        outcome(&status.state).map(|_| true)
    }

    /// Request cancellation
    ///
    /// A pending work is aborted at once. A running work is aborted as soon
    /// as the transport cancels it or its current step finishes. Aborting a
    /// terminal work does nothing.
    pub fn abort(&self) {
        let mut status = lock(&self.inner.status);
        match status.state {
            WorkState::Pending => {
                status.state = WorkState::Aborted;
                self.inner.done.notify_all();
                crate::coll_warn!("{} #{} aborted before start", self.inner.kind, self.inner.seq);
            }
            WorkState::InProgress => status.abort_requested = true,
            _ => {}
        }
    }

    pub(crate) fn abort_requested(&self) -> bool {
        lock(&self.inner.status).abort_requested
    }

    /// Move to `InProgress`; `false` if the work is already terminal
    pub(crate) fn start(&self) -> bool {
        let mut status = lock(&self.inner.status);
        match status.state {
            WorkState::Pending => {
                status.state = WorkState::InProgress;
                true
            }
            WorkState::InProgress => true,
            _ => false,
        }
    }

    /// Record the outcome; only the first terminal transition sticks
    pub(crate) fn finish(&self, result: CommResult<()>) -> bool {
        self.complete(match result {
            Ok(()) => WorkState::Completed,
            Err(CommError::Aborted) => WorkState::Aborted,
            Err(e) => WorkState::Errored(e),
        })
    }

    pub(crate) fn finish_aborted(&self) -> bool {
        self.complete(WorkState::Aborted)
    }

    fn complete(&self, state: WorkState) -> bool {
        let mut status = lock(&self.inner.status);
        if status.state.is_terminal() {
            return false;
        }
        status.state = state;
        self.inner.done.notify_all();
        true
    }
}

fn outcome(state: &WorkState) -> CommResult<()> {
    match state {
        WorkState::Errored(e) => Err(e.clone()),
        WorkState::Aborted => Err(CommError::Aborted),
        _ => Ok(()),
    }
}

impl fmt::Debug for Work {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Work")
            .field("seq", &self.inner.seq)
            .field("kind", &self.inner.kind)
            .field("group", &self.inner.group)
            .field("state", &self.state())
            .finish()
    }
}
