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

//! Per-group communicators and their registry
//!
//! A [`Communicator`] owns one transport context and the queue of operations
//! posted to it. Collectives run strictly in post order: only the head of the
//! queue talks to the transport, which keeps the n-th collective of every
//! rank matched with the n-th collective of its peers. Point-to-point
//! operations are matched by tag and run as soon as they are posted.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use crate::config::CommConfig;
use crate::error::{CommError, CommResult};
use crate::util::lock;
use super::comm_operations::OpKind;
use super::dispatcher::{Plan, Step};
use super::group::GroupDescriptor;
use super::progress::ProgressEngine;
use super::rendezvous::Rendezvous;
use super::transport::{RequestId, RequestStatus, Transport, TransportContext};
use super::work::Work;

/// Outcome of one progress pass over a communicator
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ProgressReport {
    pub outstanding: usize,
    pub completed: usize,
    pub liveness_warnings: usize,
}

struct Entry {
    work: Work,
    plan: Plan,
    cursor: usize,
    inflight: Option<RequestId>,
    cancel_attempted: bool,
    last_report: Instant,
}

impl Entry {
    fn new(work: Work, plan: Plan) -> Self {
        Self {
            work,
            plan,
            cursor: 0,
            inflight: None,
            cancel_attempted: false,
            last_report: Instant::now(),
        }
    }
}

enum Drive {
    Pending,
    /// Terminal; carries the transport failure message, if any
    Done(Option<String>),
}

/// Advance one entry as far as it goes without blocking
fn drive(context: &mut dyn TransportContext, entry: &mut Entry) -> Drive {
    loop {
        if let Some(request) = entry.inflight {
            if entry.work.abort_requested() && !entry.cancel_attempted {
                entry.cancel_attempted = true;
                if context.cancel(request) {
                    context.release(request);
                    entry.inflight = None;
                    entry.work.finish_aborted();
                    return Drive::Done(None);
                }
            }
            match context.test(request) {
                RequestStatus::InProgress => return Drive::Pending,
                RequestStatus::Completed => {
                    context.release(request);
                    entry.inflight = None;
                    entry.cursor += 1;
                }
                RequestStatus::Failed(message) => {
                    context.release(request);
                    entry.inflight = None;
                    let message = format!(
                        "{} #{}: {}",
                        entry.work.kind(),
                        entry.work.seq(),
                        message
                    );
                    entry.work.finish(Err(CommError::TransportOp(message.clone())));
                    return Drive::Done(Some(message));
                }
            }
        }

        if entry.work.is_completed() {
            return Drive::Done(None);
        }
        if entry.work.abort_requested() {
            entry.work.finish_aborted();
            return Drive::Done(None);
        }

        match entry.plan.step(entry.cursor) {
            None => {
                entry.work.finish(Ok(()));
                return Drive::Done(None);
            }
            Some(Step::Local(step)) => {
                // Local steps only exist in plans whose buffers are host accessible.
                if let Err(e) = unsafe { step.run() } {
                    entry.work.finish(Err(e));
                    return Drive::Done(None);
                }
                entry.cursor += 1;
            }
            Some(Step::Transport(op)) => {
                if !entry.work.start() {
                    return Drive::Done(None);
                }
                match context.post(op) {
                    Ok(request) => entry.inflight = Some(request),
                    Err(e) => {
                        let message = format!("{} #{}: {}", entry.work.kind(), entry.work.seq(), e);
                        entry.work.finish(Err(CommError::TransportOp(message.clone())));
                        return Drive::Done(Some(message));
                    }
                }
            }
        }
    }
}

struct CommState {
    context: Box<dyn TransportContext>,
    destroyed: bool,
    invalidated: Option<String>,
    next_seq: u64,
    collectives: VecDeque<Entry>,
    p2p: Vec<Entry>,
}

/// Live transport state of one group on this process
pub struct Communicator {
    group_id: String,
    rank: usize,
    size: usize,
    transport: String,
    created_at: SystemTime,
    invalidate_on_error: bool,
    state: Mutex<CommState>,
}

impl Communicator {
    pub(crate) fn new(
        group: &GroupDescriptor,
        transport: &str,
        context: Box<dyn TransportContext>,
        config: &CommConfig,
    ) -> Self {
        Self {
            group_id: group.id().to_string(),
            rank: group.rank(),
            size: group.size(),
            transport: transport.to_string(),
            created_at: SystemTime::now(),
            invalidate_on_error: config.invalidate_on_error,
            state: Mutex::new(CommState {
                context,
                destroyed: false,
                invalidated: None,
                next_seq: 0,
                collectives: VecDeque::new(),
                p2p: Vec::new(),
            }),
        }
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn transport_name(&self) -> &str {
        &self.transport
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// Operations posted but not yet terminal
    pub fn outstanding(&self) -> usize {
        let state = lock(&self.state);
        state.collectives.len() + state.p2p.len()
    }

    pub fn is_destroyed(&self) -> bool {
        lock(&self.state).destroyed
    }

    /// Why the communicator stopped accepting work, if it did
    pub fn invalidation(&self) -> Option<String> {
        lock(&self.state).invalidated.clone()
    }

    /// Queue a planned operation and hand back its work handle
    pub(crate) fn enqueue(&self, kind: OpKind, plan: Plan) -> CommResult<Work> {
        let mut state = lock(&self.state);
        if state.destroyed {
            return Err(CommError::CommunicatorDestroyed(self.group_id.clone()));
        }
        if let Some(reason) = &state.invalidated {
            return Err(CommError::CommunicatorInvalidated(format!(
                "group '{}': {}",
                self.group_id, reason
            )));
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        let work = Work::new(seq, kind, &self.group_id);
        crate::coll_debug!(
            [self.rank, &self.group_id] "posted {} #{} ({:?})",
            kind,
            seq,
            plan.decomposition()
        );
        let entry = Entry::new(work.clone(), plan);
        if kind.is_point_to_point() {
            state.p2p.push(entry);
        } else {
            state.collectives.push_back(entry);
        }
        Ok(work)
    }

    /// Drive queued operations; called by the progress engine
    pub(crate) fn progress(&self, liveness_timeout: Duration) -> ProgressReport {
        let mut guard = lock(&self.state);
        let state = &mut *guard;
        let mut report = ProgressReport::default();
        if state.destroyed || (state.collectives.is_empty() && state.p2p.is_empty()) {
            return report;
        }

        if let Err(e) = state.context.progress() {
            let reason = format!("transport progress failed: {}", e);
            for mut entry in state.collectives.drain(..).chain(state.p2p.drain(..)) {
                if let Some(request) = entry.inflight.take() {
                    state.context.cancel(request);
                    state.context.release(request);
                }
                if entry.work.finish(Err(CommError::TransportOp(reason.clone()))) {
                    report.completed += 1;
                }
            }
            self.invalidate(state, reason);
            return report;
        }

        let mut failures = Vec::new();
        let now = Instant::now();
        {
            let CommState {
                context,
                collectives,
                p2p,
                ..
            } = &mut *state;

            while let Some(head) = collectives.front_mut() {
                match drive(context.as_mut(), head) {
                    Drive::Pending => break,
                    Drive::Done(failure) => {
                        failures.extend(failure);
                        collectives.pop_front();
                        report.completed += 1;
                    }
                }
            }
            p2p.retain_mut(|entry| match drive(context.as_mut(), entry) {
                Drive::Pending => true,
                Drive::Done(failure) => {
                    failures.extend(failure);
                    report.completed += 1;
                    false
                }
            });

            for entry in collectives.front_mut().into_iter().chain(p2p.iter_mut()) {
                if now.saturating_duration_since(entry.last_report) >= liveness_timeout {
                    entry.last_report = now;
                    report.liveness_warnings += 1;
                    crate::coll_warn!(
                        [self.rank, &self.group_id] "{} #{} still in progress after {:?}",
                        entry.work.kind(),
                        entry.work.seq(),
                        entry.work.elapsed()
                    );
                }
            }
            report.outstanding = collectives.len() + p2p.len();
        }

        for failure in failures {
            self.invalidate(state, failure);
        }
        report
    }

    fn invalidate(&self, state: &mut CommState, reason: String) {
        crate::coll_error!([self.rank, &self.group_id] "transport error: {}", reason);
        if self.invalidate_on_error && state.invalidated.is_none() {
            crate::coll_warn!([self.rank, &self.group_id] "communicator invalidated");
            state.invalidated = Some(reason);
        }
    }

    /// Fail every outstanding work and tear down the transport context
    ///
    /// Returns how many works were failed. Calling it again does nothing.
    pub(crate) fn destroy(&self) -> usize {
        let mut guard = lock(&self.state);
        if guard.destroyed {
            return 0;
        }
        guard.destroyed = true;

        let error = CommError::CommunicatorDestroyed(self.group_id.clone());
        let CommState {
            context,
            collectives,
            p2p,
            ..
        } = &mut *guard;
        let mut failed = 0;
        for mut entry in collectives.drain(..).chain(p2p.drain(..)) {
            if let Some(request) = entry.inflight.take() {
                context.cancel(request);
                context.release(request);
            }
            if entry.work.finish(Err(error.clone())) {
                failed += 1;
            }
        }
        if let Err(e) = context.teardown() {
            crate::coll_warn!([self.rank, &self.group_id] "transport teardown failed: {}", e);
        }
        crate::coll_info!(
            [self.rank, &self.group_id] "communicator destroyed, {} outstanding operations failed",
            failed
        );
        failed
    }
}

impl Drop for Communicator {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for Communicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Communicator")
            .field("group_id", &self.group_id)
            .field("rank", &self.rank)
            .field("size", &self.size)
            .field("transport", &self.transport)
            .finish_non_exhaustive()
    }
}

type Slot = Arc<Mutex<Option<Arc<Communicator>>>>;

/// Lazily created communicators, one per group id
///
/// Creation is serialized per group: concurrent callers for the same group
/// wait for a single rendezvous and transport init. A failed creation leaves
/// the slot empty, so the next call retries from scratch. Destruction holds
/// the same slot lock, and a slot retired by `destroy` is never used for a
/// new creation.
pub struct CommunicatorRegistry {
    slots: Mutex<HashMap<String, Slot>>,
    /// Address blob first published per group; store keys are write-once
    addresses: Mutex<HashMap<String, Vec<u8>>>,
    transport: Arc<dyn Transport>,
    rendezvous: Rendezvous,
    config: Arc<CommConfig>,
    engine: Arc<ProgressEngine>,
}

impl CommunicatorRegistry {
    pub fn new(
        transport: Arc<dyn Transport>,
        config: Arc<CommConfig>,
        engine: Arc<ProgressEngine>,
    ) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            addresses: Mutex::new(HashMap::new()),
            rendezvous: Rendezvous::new(&config.key_prefix, config.rendezvous_timeout),
            transport,
            config,
            engine,
        }
    }

    fn slot(&self, group_id: &str) -> Slot {
        lock(&self.slots)
            .entry(group_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    fn is_current(&self, group_id: &str, slot: &Slot) -> bool {
        matches!(lock(&self.slots).get(group_id), Some(s) if Arc::ptr_eq(s, slot))
    }

    /// The group's communicator, created on first use
    pub fn get_or_create(&self, group: &GroupDescriptor) -> CommResult<Arc<Communicator>> {
        loop {
            let slot = self.slot(group.id());
            let mut cached = lock(&slot);
            // Retired by a destroy while we waited for the lock.
            if !self.is_current(group.id(), &slot) {
                continue;
            }
            if let Some(comm) = cached.as_ref() {
                if !comm.is_destroyed() {
                    return Ok(comm.clone());
                }
            }
            let comm = self.create(group)?;
            *cached = Some(comm.clone());
            return Ok(comm);
        }
    }

    /// Rendezvous, transport init and engine registration; slot lock held
    fn create(&self, group: &GroupDescriptor) -> CommResult<Arc<Communicator>> {
        let start = Instant::now();
        crate::coll_info!(
            [group.rank(), group.id()] "creating {} communicator for {} ranks",
            self.transport.name(),
            group.size()
        );

        let created = self
            .local_address(group)
            .and_then(|local| self.rendezvous.exchange(group, &local))
            .and_then(|peers| self.transport.create_context(group, &peers));
        let context = match created {
            Ok(context) => context,
            Err(e) => {
                crate::coll_warn!([group.rank(), group.id()] "communicator creation failed: {}", e);
                return Err(e);
            }
        };

        let comm = Arc::new(Communicator::new(
            group,
            self.transport.name(),
            context,
            &self.config,
        ));
        self.engine.register(comm.clone())?;
        crate::coll_info!([group.rank(), group.id()] "communicator ready in {:?}", start.elapsed());
        Ok(comm)
    }

    /// This rank's address blob for `group`, asked of the transport once
    ///
    /// Every later attempt republishes the same blob, so a retry after a
    /// failed creation never conflicts with the write-once store key.
    fn local_address(&self, group: &GroupDescriptor) -> CommResult<Vec<u8>> {
        if let Some(blob) = lock(&self.addresses).get(group.id()) {
            return Ok(blob.clone());
        }
        let blob = self.transport.local_address(group)?;
        lock(&self.addresses).insert(group.id().to_string(), blob.clone());
        Ok(blob)
    }

    /// The group's communicator if it was already created
    pub fn get(&self, group_id: &str) -> Option<Arc<Communicator>> {
        let slot = lock(&self.slots).get(group_id).cloned()?;
        let cached = lock(&slot);
        cached.clone()
    }

    /// Destroy and forget the group's communicator
    ///
    /// Waits for an in-flight creation of the group to finish first. Returns
    /// how many outstanding works were failed; 0 if the group never created a
    /// communicator.
    pub fn destroy(&self, group_id: &str) -> usize {
        let Some(slot) = lock(&self.slots).get(group_id).cloned() else {
            return 0;
        };
        let mut cached = lock(&slot);
        let failed = match cached.take() {
            Some(comm) => {
                let failed = comm.destroy();
                self.engine.unregister(&comm);
                failed
            }
            None => 0,
        };
        let mut slots = lock(&self.slots);
        if matches!(slots.get(group_id), Some(s) if Arc::ptr_eq(s, &slot)) {
            slots.remove(group_id);
        }
        drop(slots);
        drop(cached);
        failed
    }

    pub fn destroy_all(&self) {
        let ids: Vec<String> = lock(&self.slots).keys().cloned().collect();
        for id in ids {
            self.destroy(&id);
        }
    }

    /// Number of groups with a slot, created or in creation
    pub fn len(&self) -> usize {
        lock(&self.slots).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
