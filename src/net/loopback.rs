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

//! In-process loopback transport
//!
//! Ranks are threads of one process attached to a shared [`LoopbackFabric`].
//! Collectives are matched by their per-context sequence number: the n-th
//! collective posted by every rank of a group forms one operation, which runs
//! during the first `progress` call after the last rank contributed.
//! Point-to-point messages match on (source, destination, tag) in post order.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::data_types::DataType;
use crate::error::{CommError, CommResult};
use crate::memory::{BufferDescriptor, MemoryKind};
use crate::util::lock;
use super::comm_operations::OpKind;
use super::group::GroupDescriptor;
use super::reduce::reduce_all;
use super::transport::{PrimitiveOp, RequestId, RequestStatus, Transport, TransportContext};

type RequestKey = (u64, RequestId);

/// Shared medium connecting every loopback context of a job
pub struct LoopbackFabric {
    id: String,
    state: Mutex<FabricState>,
    contexts_created: AtomicUsize,
}

#[derive(Default)]
struct FabricState {
    groups: HashMap<String, FabricGroup>,
    requests: HashMap<RequestKey, RequestStatus>,
    next_context: u64,
}

struct FabricGroup {
    size: usize,
    attached: Vec<Option<u64>>,
    collectives: BTreeMap<u64, PendingCollective>,
    sends: Vec<Message>,
    recvs: Vec<Message>,
}

struct PendingCollective {
    slots: Vec<Option<Contribution>>,
}

struct Contribution {
    rank: usize,
    op: PrimitiveOp,
    key: RequestKey,
}

struct Message {
    rank: usize,
    peer: usize,
    tag: u64,
    buffer: BufferDescriptor,
    key: RequestKey,
}

impl LoopbackFabric {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: uuid::Uuid::new_v4().to_string(),
            state: Mutex::new(FabricState::default()),
            contexts_created: AtomicUsize::new(0),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Number of contexts ever created on this fabric
    pub fn contexts_created(&self) -> usize {
        self.contexts_created.load(Ordering::SeqCst)
    }

    /// Number of groups with at least one attached context
    pub fn attached_groups(&self) -> usize {
        lock(&self.state).groups.len()
    }

    fn attach(&self, group: &str, rank: usize, size: usize) -> CommResult<u64> {
        let mut state = lock(&self.state);
        let context = state.next_context;
        let entry = state
            .groups
            .entry(group.to_string())
            .or_insert_with(|| FabricGroup::new(size));
        if entry.size != size {
            return Err(CommError::TransportInit(format!(
                "group '{}' attached with sizes {} and {}",
                group, entry.size, size
            )));
        }
        if entry.attached[rank].is_some() {
            return Err(CommError::TransportInit(format!(
                "rank {} is already attached to group '{}'",
                rank, group
            )));
        }
        entry.attached[rank] = Some(context);
        state.next_context += 1;
        self.contexts_created.fetch_add(1, Ordering::SeqCst);
        Ok(context)
    }
}

impl FabricGroup {
    fn new(size: usize) -> Self {
        Self {
            size,
            attached: vec![None; size],
            collectives: BTreeMap::new(),
            sends: Vec::new(),
            recvs: Vec::new(),
        }
    }

    fn advance(&mut self, requests: &mut HashMap<RequestKey, RequestStatus>) {
        let ready: Vec<u64> = self
            .collectives
            .iter()
            .filter(|(_, c)| c.slots.iter().all(Option::is_some))
            .map(|(seq, _)| *seq)
            .collect();

        for seq in ready {
            let Some(pending) = self.collectives.remove(&seq) else {
                continue;
            };
            let contributions: Vec<Contribution> = pending.slots.into_iter().flatten().collect();
            let status = match unsafe { execute(&contributions) } {
                Ok(()) => RequestStatus::Completed,
                Err(e) => {
                    crate::coll_debug!("loopback collective #{} failed: {}", seq, e);
                    RequestStatus::Failed(e.to_string())
                }
            };
            for c in &contributions {
                requests.insert(c.key, status.clone());
            }
        }

        let mut i = 0;
        while i < self.sends.len() {
            let send = &self.sends[i];
            let matched = self
                .recvs
                .iter()
                .position(|r| r.rank == send.peer && r.peer == send.rank && r.tag == send.tag);
            match matched {
                Some(j) => {
                    let send = self.sends.remove(i);
                    let recv = self.recvs.remove(j);
                    let status = match unsafe { deliver(&send, &recv) } {
                        Ok(()) => RequestStatus::Completed,
                        Err(e) => RequestStatus::Failed(e.to_string()),
                    };
                    requests.insert(send.key, status.clone());
                    requests.insert(recv.key, status);
                }
                None => i += 1,
            }
        }
    }

    fn detach(&mut self, rank: usize, context: u64) {
        self.sends.retain(|m| m.key.0 != context);
        self.recvs.retain(|m| m.key.0 != context);
        for pending in self.collectives.values_mut() {
            if let Some(slot) = pending.slots.get_mut(rank) {
                if slot.as_ref().map(|c| c.key.0) == Some(context) {
                    *slot = None;
                }
            }
        }
        self.collectives
            .retain(|_, pending| pending.slots.iter().any(Option::is_some));
        if self.attached.get(rank).copied().flatten() == Some(context) {
            self.attached[rank] = None;
        }
    }

    fn is_detached(&self) -> bool {
        self.attached.iter().all(Option::is_none)
    }
}

fn mismatch(message: impl Into<String>) -> CommError {
    CommError::TransportOp(message.into())
}

fn root_of(op: &PrimitiveOp, size: usize) -> CommResult<usize> {
    match op.root {
        Some(root) if root < size => Ok(root),
        other => Err(mismatch(format!("{} with invalid root {:?}", op.kind, other))),
    }
}

fn data_type_of(contributions: &[Contribution]) -> CommResult<DataType> {
    let mut data_type = None;
    for c in contributions {
        for buffer in c.op.src.iter().chain(c.op.dst.iter()) {
            match data_type {
                None => data_type = Some(buffer.data_type()),
                Some(dt) if dt != buffer.data_type() => {
                    return Err(mismatch(format!(
                        "rank {} uses {} buffers, expected {}",
                        c.rank,
                        buffer.data_type(),
                        dt
                    )))
                }
                Some(_) => {}
            }
        }
    }
    data_type.ok_or_else(|| mismatch("collective without buffers"))
}

/// Copy every rank's input; all inputs must have the same length
unsafe fn inputs_of(contributions: &[Contribution]) -> CommResult<Vec<Vec<u8>>> {
    let mut inputs: Vec<Vec<u8>> = Vec::with_capacity(contributions.len());
    for c in contributions {
        let src = c
            .op
            .src
            .ok_or_else(|| {
                mismatch(format!("rank {} posted {} without input", c.rank, c.op.kind))
            })?;
        let bytes = src.as_bytes().to_vec();
        if let Some(first) = inputs.first() {
            if first.len() != bytes.len() {
                return Err(mismatch(format!(
                    "rank {} contributed {} bytes, rank 0 contributed {}",
                    c.rank,
                    bytes.len(),
                    first.len()
                )));
            }
        }
        inputs.push(bytes);
    }
    Ok(inputs)
}

unsafe fn write(c: &Contribution, data: &[u8]) -> CommResult<()> {
    let dst = c
        .op
        .dst
        .ok_or_else(|| mismatch(format!("rank {} posted {} without output", c.rank, c.op.kind)))?;
    if dst.len_bytes() != data.len() {
        return Err(mismatch(format!(
            "rank {} provided {} output bytes for a {} byte result",
            c.rank,
            dst.len_bytes(),
            data.len()
        )));
    }
    dst.as_bytes_mut().copy_from_slice(data);
    Ok(())
}

fn chunk_len(len: usize, parts: usize, data_type: DataType) -> CommResult<usize> {
    let elements = len / data_type.size_in_bytes();
    if elements % parts != 0 {
        return Err(mismatch(format!(
            "{} elements cannot be split into {} equal chunks",
            elements, parts
        )));
    }
    Ok(len / parts)
}

/// Run one fully contributed collective
///
/// Inputs are copied out before any output is written, so in-place
/// operations are safe.
unsafe fn execute(contributions: &[Contribution]) -> CommResult<()> {
    let first = &contributions
        .first()
        .ok_or_else(|| mismatch("collective without participants"))?
        .op;
    for c in contributions {
        if c.op.kind != first.kind || c.op.reduce_op != first.reduce_op || c.op.root != first.root {
            return Err(mismatch(format!(
                "mismatched collective: rank {} posted {} {:?} root {:?}, \
                 rank 0 posted {} {:?} root {:?}",
                c.rank,
                c.op.kind,
                c.op.reduce_op,
                c.op.root,
                first.kind,
                first.reduce_op,
                first.root
            )));
        }
    }
    let size = contributions.len();

    match first.kind {
        OpKind::Barrier => Ok(()),
        OpKind::Broadcast => {
            let root = root_of(first, size)?;
            data_type_of(contributions)?;
            let src = contributions[root]
                .op
                .src
                .ok_or_else(|| mismatch("broadcast root without input"))?;
            let data = src.as_bytes().to_vec();
            for c in contributions {
                write(c, &data)?;
            }
            Ok(())
        }
        OpKind::AllReduce | OpKind::Reduce | OpKind::ReduceScatter => {
            let op = first
                .reduce_op
                .ok_or_else(|| mismatch(format!("{} without a reduction operator", first.kind)))?;
            let data_type = data_type_of(contributions)?;
            let inputs = inputs_of(contributions)?;
            let acc = reduce_all(data_type, op, inputs.iter().map(Vec::as_slice))
                .map_err(|e| mismatch(e.to_string()))?;
            match first.kind {
                OpKind::AllReduce => {
                    for c in contributions {
                        write(c, &acc)?;
                    }
                }
                OpKind::Reduce => write(&contributions[root_of(first, size)?], &acc)?,
                _ => {
                    let chunk = chunk_len(acc.len(), size, data_type)?;
                    for (r, c) in contributions.iter().enumerate() {
                        write(c, &acc[r * chunk..(r + 1) * chunk])?;
                    }
                }
            }
            Ok(())
        }
        OpKind::AllGather => {
            data_type_of(contributions)?;
            let all = inputs_of(contributions)?.concat();
            for c in contributions {
                write(c, &all)?;
            }
            Ok(())
        }
        OpKind::Gather => {
            let root = root_of(first, size)?;
            data_type_of(contributions)?;
            let all = inputs_of(contributions)?.concat();
            write(&contributions[root], &all)
        }
        OpKind::Scatter => {
            let root = root_of(first, size)?;
            let data_type = data_type_of(contributions)?;
            let src = contributions[root]
                .op
                .src
                .ok_or_else(|| mismatch("scatter root without input"))?;
            let data = src.as_bytes().to_vec();
            let chunk = chunk_len(data.len(), size, data_type)?;
            for (r, c) in contributions.iter().enumerate() {
                write(c, &data[r * chunk..(r + 1) * chunk])?;
            }
            Ok(())
        }
        OpKind::AllToAll => {
            let data_type = data_type_of(contributions)?;
            let inputs = inputs_of(contributions)?;
            let chunk = chunk_len(inputs[0].len(), size, data_type)?;
            for (r, c) in contributions.iter().enumerate() {
                let out: Vec<u8> = inputs
                    .iter()
                    .flat_map(|input| input[r * chunk..(r + 1) * chunk].iter().copied())
                    .collect();
                write(c, &out)?;
            }
            Ok(())
        }
        OpKind::Send | OpKind::Recv => Err(mismatch(format!(
            "{} cannot be matched as a collective",
            first.kind
        ))),
    }
}

unsafe fn deliver(send: &Message, recv: &Message) -> CommResult<()> {
    if send.buffer.data_type() != recv.buffer.data_type()
        || send.buffer.len_bytes() != recv.buffer.len_bytes()
    {
        return Err(mismatch(format!(
            "message {} -> {} tag {}: sent {} x {}, receiver expects {} x {}",
            send.rank,
            recv.rank,
            send.tag,
            send.buffer.count(),
            send.buffer.data_type(),
            recv.buffer.count(),
            recv.buffer.data_type()
        )));
    }
    recv.buffer
        .as_bytes_mut()
        .copy_from_slice(send.buffer.as_bytes());
    Ok(())
}

/// [`Transport`] over a [`LoopbackFabric`]
///
/// Supports host memory only. The builder methods shape the transport for
/// tests: dropping native operations forces decompositions, init delays and
/// injected failures exercise communicator creation.
pub struct LoopbackTransport {
    fabric: Arc<LoopbackFabric>,
    unsupported: Vec<OpKind>,
    init_delay: Duration,
    failing_inits: AtomicUsize,
}

impl LoopbackTransport {
    pub fn new(fabric: Arc<LoopbackFabric>) -> Self {
        Self {
            fabric,
            unsupported: Vec::new(),
            init_delay: Duration::ZERO,
            failing_inits: AtomicUsize::new(0),
        }
    }

    /// Report `kind` as not natively supported
    pub fn without_native(mut self, kind: OpKind) -> Self {
        if !self.unsupported.contains(&kind) {
            self.unsupported.push(kind);
        }
        self
    }

    /// Sleep this long in every context creation
    pub fn with_init_delay(mut self, delay: Duration) -> Self {
        self.init_delay = delay;
        self
    }

    /// Make the next `count` context creations fail
    pub fn fail_next_inits(&self, count: usize) {
        self.failing_inits.store(count, Ordering::SeqCst);
    }

    pub fn fabric(&self) -> &Arc<LoopbackFabric> {
        &self.fabric
    }

    fn address(&self, group: &str, rank: usize) -> Vec<u8> {
        format!("loopback/{}/{}/{}", self.fabric.id, group, rank).into_bytes()
    }
}

impl Transport for LoopbackTransport {
    fn name(&self) -> &str {
        "loopback"
    }

    fn supports_memory(&self, kind: MemoryKind) -> bool {
        kind == MemoryKind::Host
    }

    fn supports_native(&self, kind: OpKind) -> bool {
        !self.unsupported.contains(&kind)
    }

    fn local_address(&self, group: &GroupDescriptor) -> CommResult<Vec<u8>> {
        Ok(self.address(group.id(), group.rank()))
    }

    fn create_context(
        &self,
        group: &GroupDescriptor,
        peers: &[Vec<u8>],
    ) -> CommResult<Box<dyn TransportContext>> {
        if !self.init_delay.is_zero() {
            thread::sleep(self.init_delay);
        }
        if self
            .failing_inits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(CommError::TransportInit(format!(
                "injected init failure for group '{}'",
                group.id()
            )));
        }
        if peers.len() != group.size() {
            return Err(CommError::TransportInit(format!(
                "expected {} peer addresses, got {}",
                group.size(),
                peers.len()
            )));
        }
        for (rank, blob) in peers.iter().enumerate() {
            if *blob != self.address(group.id(), rank) {
                return Err(CommError::TransportInit(format!(
                    "rank {} published an address outside this fabric: {}",
                    rank,
                    String::from_utf8_lossy(blob)
                )));
            }
        }

        let id = self.fabric.attach(group.id(), group.rank(), group.size())?;
        Ok(Box::new(LoopbackContext {
            fabric: self.fabric.clone(),
            group: group.id().to_string(),
            rank: group.rank(),
            size: group.size(),
            id,
            next_seq: 0,
            next_request: 0,
            torn_down: false,
        }))
    }
}

/// One rank's attachment to a fabric group
pub struct LoopbackContext {
    fabric: Arc<LoopbackFabric>,
    group: String,
    rank: usize,
    size: usize,
    id: u64,
    next_seq: u64,
    next_request: RequestId,
    torn_down: bool,
}

impl LoopbackContext {
    fn key(&self, request: RequestId) -> RequestKey {
        (self.id, request)
    }

    fn message(
        &self,
        op: &PrimitiveOp,
        buffer: Option<BufferDescriptor>,
        key: RequestKey,
    ) -> CommResult<Message> {
        let buffer = buffer.ok_or_else(|| mismatch(format!("{} without a buffer", op.kind)))?;
        let peer = match op.peer {
            Some(peer) if peer < self.size => peer,
            other => return Err(mismatch(format!("{} with invalid peer {:?}", op.kind, other))),
        };
        let tag = op
            .tag
            .ok_or_else(|| mismatch(format!("{} without a tag", op.kind)))?;
        Ok(Message {
            rank: self.rank,
            peer,
            tag,
            buffer,
            key,
        })
    }
}

impl TransportContext for LoopbackContext {
    fn post(&mut self, op: &PrimitiveOp) -> CommResult<RequestId> {
        if self.torn_down {
            return Err(mismatch(format!("context for group '{}' is torn down", self.group)));
        }
        let request = self.next_request;
        let key = self.key(request);

        let mut state = lock(&self.fabric.state);
        let FabricState { groups, requests, .. } = &mut *state;
        let group = groups
            .get_mut(&self.group)
            .ok_or_else(|| mismatch(format!("group '{}' is not attached", self.group)))?;

        match op.kind {
            OpKind::Send => {
                let message = self.message(op, op.src, key)?;
                group.sends.push(message);
            }
            OpKind::Recv => {
                let message = self.message(op, op.dst, key)?;
                group.recvs.push(message);
            }
            _ => {
                let seq = self.next_seq;
                self.next_seq += 1;
                let size = group.size;
                let pending = group.collectives.entry(seq).or_insert_with(|| PendingCollective {
                    slots: (0..size).map(|_| None).collect(),
                });
                pending.slots[self.rank] = Some(Contribution {
                    rank: self.rank,
                    op: *op,
                    key,
                });
            }
        }
        requests.insert(key, RequestStatus::InProgress);
        self.next_request += 1;
        Ok(request)
    }

    fn progress(&mut self) -> CommResult<()> {
        let mut state = lock(&self.fabric.state);
        let FabricState { groups, requests, .. } = &mut *state;
        if let Some(group) = groups.get_mut(&self.group) {
            group.advance(requests);
        }
        Ok(())
    }

    fn test(&mut self, request: RequestId) -> RequestStatus {
        let state = lock(&self.fabric.state);
        state
            .requests
            .get(&self.key(request))
            .cloned()
            .unwrap_or_else(|| RequestStatus::Failed(format!("unknown request {}", request)))
    }

    /// Only unmatched point-to-point messages can be cancelled
    fn cancel(&mut self, request: RequestId) -> bool {
        let key = self.key(request);
        let mut state = lock(&self.fabric.state);
        let FabricState { groups, requests, .. } = &mut *state;
        let Some(group) = groups.get_mut(&self.group) else {
            return false;
        };
        let before = group.sends.len() + group.recvs.len();
        group.sends.retain(|m| m.key != key);
        group.recvs.retain(|m| m.key != key);
        if group.sends.len() + group.recvs.len() == before {
            return false;
        }
        requests.insert(key, RequestStatus::Failed("cancelled".to_string()));
        true
    }

    fn release(&mut self, request: RequestId) {
        let key = self.key(request);
        lock(&self.fabric.state).requests.remove(&key);
    }

    fn teardown(&mut self) -> CommResult<()> {
        if self.torn_down {
            return Ok(());
        }
        self.torn_down = true;
        let mut state = lock(&self.fabric.state);
        let id = self.id;
        state.requests.retain(|(context, _), _| *context != id);
        let detached = match state.groups.get_mut(&self.group) {
            Some(group) => {
                group.detach(self.rank, id);
                group.is_detached()
            }
            None => false,
        };
        if detached {
            state.groups.remove(&self.group);
        }
        crate::coll_debug!("loopback context {} left group '{}'", id, self.group);
        Ok(())
    }
}

impl Drop for LoopbackContext {
    fn drop(&mut self) {
        let _ = self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::rendezvous::{MemoryStore, Store};
    use crate::net::comm_operations::ReduceOp;

    fn contexts(transport: &LoopbackTransport, size: usize) -> Vec<Box<dyn TransportContext>> {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let ranks: Vec<usize> = (0..size).collect();
        let peers: Vec<Vec<u8>> = (0..size).map(|r| transport.address("g", r)).collect();
        (0..size)
            .map(|r| {
                let group = GroupDescriptor::new("g", ranks.clone(), r, store.clone()).unwrap();
                transport.create_context(&group, &peers).unwrap()
            })
            .collect()
    }

    fn wait_all(ctxs: &mut [Box<dyn TransportContext>], reqs: &[RequestId]) -> Vec<RequestStatus> {
        for ctx in ctxs.iter_mut() {
            ctx.progress().unwrap();
        }
        ctxs.iter_mut().zip(reqs).map(|(c, r)| c.test(*r)).collect()
    }

    fn in_place(buffer: BufferDescriptor, op: ReduceOp) -> PrimitiveOp {
        PrimitiveOp::new(OpKind::AllReduce, Some(buffer), Some(buffer)).with_reduce_op(Some(op))
    }

    #[test]
    fn test_allreduce_two_ranks() {
        let transport = LoopbackTransport::new(LoopbackFabric::new());
        let mut ctxs = contexts(&transport, 2);
        let mut a = [1.0f32, 2.0];
        let mut b = [10.0f32, 20.0];
        let bufs = unsafe {
            [
                BufferDescriptor::host_mut(&mut a),
                BufferDescriptor::host_mut(&mut b),
            ]
        };

        let r0 = ctxs[0]
            .post(&in_place(bufs[0], ReduceOp::Sum))
            .unwrap();
        assert_eq!(ctxs[0].test(r0), RequestStatus::InProgress);
        ctxs[0].progress().unwrap();
        assert_eq!(ctxs[0].test(r0), RequestStatus::InProgress);

        let r1 = ctxs[1]
            .post(&in_place(bufs[1], ReduceOp::Sum))
            .unwrap();
        let statuses = wait_all(&mut ctxs, &[r0, r1]);
        assert_eq!(statuses, vec![RequestStatus::Completed, RequestStatus::Completed]);
        assert_eq!(a, [11.0, 22.0]);
        assert_eq!(b, [11.0, 22.0]);
    }

    #[test]
    fn test_mismatched_collective_fails_everyone() {
        let transport = LoopbackTransport::new(LoopbackFabric::new());
        let mut ctxs = contexts(&transport, 2);
        let mut a = [1i32];
        let mut b = [2i32];
        let bufs = unsafe {
            [
                BufferDescriptor::host_mut(&mut a),
                BufferDescriptor::host_mut(&mut b),
            ]
        };
        let r0 = ctxs[0]
            .post(&in_place(bufs[0], ReduceOp::Sum))
            .unwrap();
        let r1 = ctxs[1]
            .post(&in_place(bufs[1], ReduceOp::Max))
            .unwrap();
        let statuses = wait_all(&mut ctxs, &[r0, r1]);
        assert!(statuses.iter().all(|s| matches!(s, RequestStatus::Failed(_))));
        assert_eq!(a, [1]);
    }

    #[test]
    fn test_send_recv_and_cancel() {
        let transport = LoopbackTransport::new(LoopbackFabric::new());
        let mut ctxs = contexts(&transport, 2);
        let data = [5u8, 6, 7];
        let mut out = [0u8; 3];
        let src = unsafe { BufferDescriptor::host(&data) };
        let dst = unsafe { BufferDescriptor::host_mut(&mut out) };

        let stray = ctxs[1]
            .post(&PrimitiveOp::new(OpKind::Recv, None, Some(dst)).with_peer(Some(0), Some(99)))
            .unwrap();
        assert!(ctxs[1].cancel(stray));
        assert!(!ctxs[1].cancel(stray));
        ctxs[1].release(stray);

        let s = ctxs[0]
            .post(&PrimitiveOp::new(OpKind::Send, Some(src), None).with_peer(Some(1), Some(3)))
            .unwrap();
        let r = ctxs[1]
            .post(&PrimitiveOp::new(OpKind::Recv, None, Some(dst)).with_peer(Some(0), Some(3)))
            .unwrap();
        let statuses = wait_all(&mut ctxs, &[s, r]);
        assert_eq!(statuses, vec![RequestStatus::Completed, RequestStatus::Completed]);
        assert_eq!(out, [5, 6, 7]);
    }

    #[test]
    fn test_injected_init_failure_and_foreign_address() {
        let fabric = LoopbackFabric::new();
        let transport = LoopbackTransport::new(fabric.clone());
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let group = GroupDescriptor::new("solo", vec![0], 0, store).unwrap();
        let peers = vec![transport.local_address(&group).unwrap()];

        transport.fail_next_inits(1);
        assert!(matches!(
            transport.create_context(&group, &peers),
            Err(CommError::TransportInit(_))
        ));
        assert!(transport
            .create_context(&group, &[b"loopback/other/solo/0".to_vec()])
            .is_err());
        let mut ctx = transport.create_context(&group, &peers).unwrap();
        assert_eq!(fabric.contexts_created(), 1);
        ctx.teardown().unwrap();
        assert_eq!(fabric.attached_groups(), 0);
    }
}
