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

//! Transport capability interface
//!
//! A [`Transport`] knows how to create per-group [`TransportContext`]s from
//! the address blobs gathered at rendezvous. A context executes primitive
//! operations asynchronously: `post` returns immediately with a request id,
//! and the request only moves forward when `progress` is called. Contexts
//! are not thread-safe; the owning communicator serializes all calls.

use crate::error::CommResult;
use crate::memory::{BufferDescriptor, MemoryKind};
use super::comm_operations::{OpKind, ReduceOp};
use super::group::GroupDescriptor;

/// Handle of a posted primitive, unique within one context
pub type RequestId = u64;

/// Status of a posted request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestStatus {
    InProgress,
    Completed,
    Failed(String),
}

impl RequestStatus {
    pub fn is_done(&self) -> bool {
        !matches!(self, RequestStatus::InProgress)
    }
}

/// A single primitive handed to a transport context
///
/// `src` is absent for receives and non-root scatter, `dst` for sends and
/// non-root gather.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrimitiveOp {
    pub kind: OpKind,
    pub src: Option<BufferDescriptor>,
    pub dst: Option<BufferDescriptor>,
    pub reduce_op: Option<ReduceOp>,
    pub root: Option<usize>,
    pub peer: Option<usize>,
    pub tag: Option<u64>,
}

impl PrimitiveOp {
    pub fn new(kind: OpKind, src: Option<BufferDescriptor>, dst: Option<BufferDescriptor>) -> Self {
        Self {
            kind,
            src,
            dst,
            reduce_op: None,
            root: None,
            peer: None,
            tag: None,
        }
    }

    pub fn with_reduce_op(mut self, op: Option<ReduceOp>) -> Self {
        self.reduce_op = op;
        self
    }

    pub fn with_root(mut self, root: Option<usize>) -> Self {
        self.root = root;
        self
    }

    pub fn with_peer(mut self, peer: Option<usize>, tag: Option<u64>) -> Self {
        self.peer = peer;
        self.tag = tag;
        self
    }
}

/// A communication library able to run collectives for a group
pub trait Transport: Send + Sync {
    fn name(&self) -> &str;

    /// Whether buffers of this memory kind can be handed to the transport
    fn supports_memory(&self, kind: MemoryKind) -> bool;

    /// Whether the transport implements `kind` natively
    fn supports_native(&self, kind: OpKind) -> bool;

    /// Opaque address blob published at rendezvous
    ///
    /// Asked once per group by the registry; the blob is republished on
    /// every later creation attempt for that group, so `create_context` must
    /// accept it for as long as the group id is in use.
    fn local_address(&self, group: &GroupDescriptor) -> CommResult<Vec<u8>>;

    /// Build a context from every member's address blob, indexed by group rank
    fn create_context(
        &self,
        group: &GroupDescriptor,
        peers: &[Vec<u8>],
    ) -> CommResult<Box<dyn TransportContext>>;
}

/// Per-group transport state
pub trait TransportContext: Send {
    /// Start a primitive; never blocks on remote ranks
    fn post(&mut self, op: &PrimitiveOp) -> CommResult<RequestId>;

    /// Drive outstanding requests forward
    fn progress(&mut self) -> CommResult<()>;

    fn test(&mut self, request: RequestId) -> RequestStatus;

    /// Try to cancel a request that has not started moving data
    ///
    /// Returns `false` if the request already matched or completed. A
    /// cancelled request still has to be released.
    fn cancel(&mut self, request: RequestId) -> bool;

    /// Forget a finished or cancelled request
    fn release(&mut self, request: RequestId);

    fn teardown(&mut self) -> CommResult<()>;
}
