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

//! Tests for communicator lifecycle, work cancellation and the progress engine

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use collective_backend::config::CommConfig;
use collective_backend::ctx::CommContext;
use collective_backend::error::{CommError, CommResult};
use collective_backend::memory::{BufferDescriptor, MemoryKind};
use collective_backend::net::{
    EngineState, GroupDescriptor, LoopbackFabric, LoopbackTransport, MemoryStore, OpKind,
    OperationRequest, ReduceOp, Store, Transport, TransportContext, WorkState,
};
use collective_backend::util::logging::init_test_logging;

const STATE_TIMEOUT: Duration = Duration::from_secs(5);

/// Loopback transport that records how many context creations overlap
struct CountingTransport {
    inner: LoopbackTransport,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl CountingTransport {
    fn new(inner: LoopbackTransport) -> Self {
        Self {
            inner,
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }
}

impl Transport for CountingTransport {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn supports_memory(&self, kind: MemoryKind) -> bool {
        self.inner.supports_memory(kind)
    }

    fn supports_native(&self, kind: OpKind) -> bool {
        self.inner.supports_native(kind)
    }

    fn local_address(&self, group: &GroupDescriptor) -> CommResult<Vec<u8>> {
        self.inner.local_address(group)
    }

    fn create_context(
        &self,
        group: &GroupDescriptor,
        peers: &[Vec<u8>],
    ) -> CommResult<Box<dyn TransportContext>> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        let context = self.inner.create_context(group, peers);
        self.active.fetch_sub(1, Ordering::SeqCst);
        context
    }
}

/// Loopback transport whose address blob changes every time it is asked
struct FreshAddressTransport {
    inner: LoopbackTransport,
    issued: AtomicUsize,
}

impl FreshAddressTransport {
    fn new(inner: LoopbackTransport) -> Self {
        Self {
            inner,
            issued: AtomicUsize::new(0),
        }
    }
}

impl Transport for FreshAddressTransport {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn supports_memory(&self, kind: MemoryKind) -> bool {
        self.inner.supports_memory(kind)
    }

    fn supports_native(&self, kind: OpKind) -> bool {
        self.inner.supports_native(kind)
    }

    fn local_address(&self, group: &GroupDescriptor) -> CommResult<Vec<u8>> {
        let attempt = self.issued.fetch_add(1, Ordering::SeqCst);
        let mut blob = self.inner.local_address(group)?;
        blob.extend_from_slice(format!("#{}", attempt).as_bytes());
        Ok(blob)
    }

    fn create_context(
        &self,
        group: &GroupDescriptor,
        peers: &[Vec<u8>],
    ) -> CommResult<Box<dyn TransportContext>> {
        let peers: Vec<Vec<u8>> = peers
            .iter()
            .map(|blob| {
                let end = blob.iter().position(|&b| b == b'#').unwrap_or(blob.len());
                blob[..end].to_vec()
            })
            .collect();
        self.inner.create_context(group, &peers)
    }
}

/// Rank 1 of a two-rank group that joins late and runs one barrier
fn late_peer(
    transport: Arc<dyn Transport>,
    store: Arc<dyn Store>,
    group_id: &'static str,
) -> thread::JoinHandle<CommResult<()>> {
    thread::spawn(move || {
        let config = CommConfig::default().rendezvous_timeout(STATE_TIMEOUT);
        let ctx = CommContext::new(1, config, transport);
        let group = ctx.create_group(group_id, vec![0, 1], store)?;
        ctx.post(&group, OperationRequest::barrier())?.wait()
    })
}

// ========================================================================
// Creation
// ========================================================================

#[test]
fn test_concurrent_first_use_creates_once() {
    init_test_logging();
    let fabric = LoopbackFabric::new();
    let transport =
        LoopbackTransport::new(fabric.clone()).with_init_delay(Duration::from_millis(50));
    let ctx = Arc::new(CommContext::new(0, CommConfig::default(), Arc::new(transport)));
    let group = ctx
        .create_group("solo", vec![0], Arc::new(MemoryStore::new()))
        .unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let ctx = ctx.clone();
            let group = group.clone();
            thread::spawn(move || ctx.communicator(&group).unwrap())
        })
        .collect();
    let comms: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert!(comms.iter().all(|c| Arc::ptr_eq(c, &comms[0])));
    assert_eq!(fabric.contexts_created(), 1);
    assert_eq!(comms[0].size(), 1);
    assert_eq!(comms[0].transport_name(), "loopback");
}

#[test]
fn test_transport_init_failure_is_retried() {
    init_test_logging();
    let fabric = LoopbackFabric::new();
    let transport = Arc::new(LoopbackTransport::new(fabric.clone()));
    transport.fail_next_inits(1);
    let ctx = CommContext::new(0, CommConfig::default(), transport.clone());
    let group = ctx
        .create_group("retry", vec![0], Arc::new(MemoryStore::new()))
        .unwrap();

    let first = ctx.post(&group, OperationRequest::barrier());
    match first {
        Err(e) => {
            assert!(matches!(e, CommError::TransportInit(_)));
            assert!(e.is_retryable());
        }
        Ok(_) => panic!("first creation should fail"),
    }
    assert_eq!(fabric.contexts_created(), 0);
    assert_eq!(ctx.engine().registered(), 0);

    ctx.post(&group, OperationRequest::barrier()).unwrap().wait().unwrap();
    assert_eq!(fabric.contexts_created(), 1);
}

#[test]
fn test_rendezvous_timeout_then_retry() {
    init_test_logging();
    let fabric = LoopbackFabric::new();
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let config = CommConfig::default().rendezvous_timeout(Duration::from_millis(100));

    let ctx = CommContext::new(0, config, Arc::new(LoopbackTransport::new(fabric.clone())));
    let group = ctx.create_group("late", vec![0, 1], store.clone()).unwrap();
    match ctx.communicator(&group) {
        Err(CommError::RendezvousTimeout { missing, .. }) => assert_eq!(missing, vec![1]),
        other => panic!("expected a rendezvous timeout, got {:?}", other),
    }
    assert_eq!(ctx.engine().registered(), 0);

    let late = late_peer(
        Arc::new(LoopbackTransport::new(fabric.clone())),
        store.clone(),
        "late",
    );
    assert!(store.get("coll/late/addr/1", STATE_TIMEOUT).unwrap().is_some());

    // Same context, same registry: the next use simply tries again.
    ctx.post(&group, OperationRequest::barrier())
        .unwrap()
        .wait()
        .unwrap();
    late.join().unwrap().unwrap();
    assert_eq!(fabric.contexts_created(), 2);
}

#[test]
fn test_retry_republishes_first_address() {
    init_test_logging();
    let fabric = LoopbackFabric::new();
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let config = CommConfig::default().rendezvous_timeout(Duration::from_millis(100));
    let transport = Arc::new(FreshAddressTransport::new(LoopbackTransport::new(
        fabric.clone(),
    )));

    let ctx = CommContext::new(0, config, transport.clone());
    let group = ctx.create_group("fresh", vec![0, 1], store.clone()).unwrap();
    assert!(matches!(
        ctx.communicator(&group),
        Err(CommError::RendezvousTimeout { .. })
    ));

    let late = late_peer(
        Arc::new(FreshAddressTransport::new(LoopbackTransport::new(
            fabric.clone(),
        ))),
        store.clone(),
        "fresh",
    );
    assert!(store.get("coll/fresh/addr/1", STATE_TIMEOUT).unwrap().is_some());

    ctx.post(&group, OperationRequest::barrier())
        .unwrap()
        .wait()
        .unwrap();
    late.join().unwrap().unwrap();
    assert_eq!(transport.issued.load(Ordering::SeqCst), 1);
}

#[test]
fn test_destroy_during_creation_does_not_overlap_init() {
    init_test_logging();
    let fabric = LoopbackFabric::new();
    let transport = Arc::new(CountingTransport::new(
        LoopbackTransport::new(fabric.clone()).with_init_delay(Duration::from_millis(300)),
    ));
    let ctx = Arc::new(CommContext::new(0, CommConfig::default(), transport.clone()));
    let group = ctx
        .create_group("racy", vec![0], Arc::new(MemoryStore::new()))
        .unwrap();

    let first = {
        let ctx = ctx.clone();
        let group = group.clone();
        thread::spawn(move || ctx.communicator(&group).map(|_| ()))
    };
    thread::sleep(Duration::from_millis(50));
    let destroyer = {
        let ctx = ctx.clone();
        let group = group.clone();
        thread::spawn(move || ctx.destroy_group(&group))
    };
    thread::sleep(Duration::from_millis(50));
    let third = ctx.communicator(&group).map(|_| ());

    first.join().unwrap().unwrap();
    destroyer.join().unwrap();
    third.unwrap();
    assert_eq!(transport.max_active.load(Ordering::SeqCst), 1);
    assert!(ctx.communicator(&group).is_ok());
}

// ========================================================================
// Destruction and abort
// ========================================================================

/// Rank 1 joins the group but never posts; returns a sender that releases it
fn silent_peer(
    fabric: Arc<LoopbackFabric>,
    store: Arc<dyn Store>,
    group_id: &'static str,
) -> (mpsc::Sender<()>, thread::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel::<()>();
    let handle = thread::spawn(move || {
        let transport = Arc::new(LoopbackTransport::new(fabric));
        let ctx = CommContext::new(1, CommConfig::default(), transport);
        let group = ctx.create_group(group_id, vec![0, 1], store).unwrap();
        ctx.communicator(&group).unwrap();
        let _ = rx.recv();
    });
    (tx, handle)
}

#[test]
fn test_destroy_fails_outstanding_works() {
    init_test_logging();
    let fabric = LoopbackFabric::new();
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let (release, peer) = silent_peer(fabric.clone(), store.clone(), "stuck");

    let ctx = CommContext::new(0, CommConfig::default(), Arc::new(LoopbackTransport::new(fabric)));
    let group = ctx.create_group("stuck", vec![0, 1], store).unwrap();
    let mut buffers = vec![vec![1f32; 4]; 3];
    let works: Vec<_> = buffers
        .iter_mut()
        .map(|b| {
            let buffer = unsafe { BufferDescriptor::host_mut(b) };
            ctx.post(&group, OperationRequest::all_reduce_in_place(buffer, ReduceOp::Sum))
                .unwrap()
        })
        .collect();
    assert_eq!(works[0].wait_timeout(Duration::from_millis(50)), Ok(false));

    assert_eq!(ctx.destroy_group(&group), 3);
    for work in &works {
        assert!(work.is_completed());
        assert!(matches!(work.wait(), Err(CommError::CommunicatorDestroyed(_))));
    }
    assert_eq!(ctx.destroy_group(&group), 0);
    assert!(ctx.engine().wait_for_state(EngineState::Stopped, STATE_TIMEOUT));

    release.send(()).unwrap();
    peer.join().unwrap();
}

#[test]
fn test_abort_pending_and_in_progress() {
    init_test_logging();
    let fabric = LoopbackFabric::new();
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let (release, peer) = silent_peer(fabric.clone(), store.clone(), "abort");

    let ctx = CommContext::new(0, CommConfig::default(), Arc::new(LoopbackTransport::new(fabric)));
    let group = ctx.create_group("abort", vec![0, 1], store).unwrap();

    // A receive nobody sends to can be cancelled at the transport.
    let mut inbox = vec![0u8; 4];
    let recv = ctx
        .post(
            &group,
            OperationRequest::recv(unsafe { BufferDescriptor::host_mut(&mut inbox) }, 1, 42),
        )
        .unwrap();
    // The first collective blocks the queue; the second stays pending.
    let mut head = vec![0i32; 2];
    let mut queued = vec![0i32; 2];
    let blocked = ctx
        .post(
            &group,
            OperationRequest::all_reduce_in_place(
                unsafe { BufferDescriptor::host_mut(&mut head) },
                ReduceOp::Sum,
            ),
        )
        .unwrap();
    let pending = ctx
        .post(
            &group,
            OperationRequest::all_reduce_in_place(
                unsafe { BufferDescriptor::host_mut(&mut queued) },
                ReduceOp::Sum,
            ),
        )
        .unwrap();

    assert_eq!(blocked.wait_timeout(Duration::from_millis(50)), Ok(false));
    assert_eq!(pending.state(), WorkState::Pending);
    pending.abort();
    assert_eq!(pending.state(), WorkState::Aborted);
    pending.abort();
    assert_eq!(pending.wait(), Err(CommError::Aborted));

    recv.abort();
    assert_eq!(recv.wait(), Err(CommError::Aborted));
    recv.abort();
    assert_eq!(recv.state(), WorkState::Aborted);

    assert_eq!(ctx.destroy_group(&group), 1);
    assert!(matches!(blocked.wait(), Err(CommError::CommunicatorDestroyed(_))));

    release.send(()).unwrap();
    peer.join().unwrap();
}

#[test]
fn test_abort_running_collective_completes_as_aborted() {
    init_test_logging();
    let fabric = LoopbackFabric::new();
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let (go, gate) = mpsc::channel::<()>();

    let peer = {
        let fabric = fabric.clone();
        let store = store.clone();
        thread::spawn(move || {
            let transport = Arc::new(LoopbackTransport::new(fabric));
            let ctx = CommContext::new(1, CommConfig::default(), transport);
            let group = ctx.create_group("running", vec![0, 1], store).unwrap();
            ctx.communicator(&group).unwrap();
            gate.recv().unwrap();
            let mut data = vec![2i32; 2];
            ctx.post(
                &group,
                OperationRequest::all_reduce_in_place(
                    unsafe { BufferDescriptor::host_mut(&mut data) },
                    ReduceOp::Sum,
                ),
            )
            .unwrap()
            .wait()
            .unwrap();
            data
        })
    };

    let ctx = CommContext::new(0, CommConfig::default(), Arc::new(LoopbackTransport::new(fabric)));
    let group = ctx.create_group("running", vec![0, 1], store).unwrap();
    let mut data = vec![1i32; 2];
    let work = ctx
        .post(
            &group,
            OperationRequest::all_reduce_in_place(
                unsafe { BufferDescriptor::host_mut(&mut data) },
                ReduceOp::Sum,
            ),
        )
        .unwrap();
    assert_eq!(work.wait_timeout(Duration::from_millis(50)), Ok(false));
    assert_eq!(work.state(), WorkState::InProgress);

    // A posted collective cannot be pulled back from the fabric.
    work.abort();
    assert_eq!(work.wait_timeout(Duration::from_millis(50)), Ok(false));
    assert_eq!(work.state(), WorkState::InProgress);

    go.send(()).unwrap();
    assert_eq!(work.wait(), Err(CommError::Aborted));
    assert_eq!(work.state(), WorkState::Aborted);
    assert_eq!(peer.join().unwrap(), vec![3, 3]);
}

// ========================================================================
// Progress engine
// ========================================================================

#[test]
fn test_engine_stops_and_restarts() {
    init_test_logging();
    let transport = Arc::new(LoopbackTransport::new(LoopbackFabric::new()));
    let ctx = CommContext::new(0, CommConfig::default(), transport);
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    assert_eq!(ctx.engine_state(), EngineState::NotStarted);

    let first = ctx.create_group("a", vec![0], store.clone()).unwrap();
    ctx.post(&first, OperationRequest::barrier()).unwrap().wait().unwrap();
    assert_eq!(ctx.engine_state(), EngineState::Running);

    ctx.destroy_group(&first);
    assert!(ctx.engine().wait_for_state(EngineState::Stopped, STATE_TIMEOUT));

    let second = ctx.create_group("b", vec![0], store).unwrap();
    ctx.post(&second, OperationRequest::barrier()).unwrap().wait().unwrap();
    assert_eq!(ctx.engine_state(), EngineState::Running);
    ctx.destroy_group(&second);
    assert!(ctx.engine().wait_for_state(EngineState::Stopped, STATE_TIMEOUT));

    let stats = ctx.engine_stats();
    assert_eq!(stats.threads_started, 2);
    assert!(stats.completed >= 2);
}

#[test]
fn test_liveness_warnings_are_counted() {
    init_test_logging();
    let fabric = LoopbackFabric::new();
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let (release, peer) = silent_peer(fabric.clone(), store.clone(), "slow");

    let config = CommConfig::default().liveness_timeout(Duration::from_millis(20));
    let ctx = CommContext::new(0, config, Arc::new(LoopbackTransport::new(fabric)));
    let group = ctx.create_group("slow", vec![0, 1], store).unwrap();
    let work = ctx.post(&group, OperationRequest::barrier()).unwrap();
    assert_eq!(work.wait_timeout(Duration::from_millis(200)), Ok(false));
    assert!(ctx.engine_stats().liveness_warnings >= 1);

    ctx.destroy_group(&group);
    release.send(()).unwrap();
    peer.join().unwrap();
}
