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

//! Communication operation types

use std::fmt;

use crate::memory::BufferDescriptor;

/// Reduction operations for collective communication
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    Sum,
    Prod,
    Min,
    Max,
    /// Sum divided by the group size; floating point only
    Avg,
    /// Bitwise ops; integer types only
    Band,
    Bor,
    Bxor,
}

impl ReduceOp {
    pub fn is_bitwise(&self) -> bool {
        matches!(self, ReduceOp::Band | ReduceOp::Bor | ReduceOp::Bxor)
    }
}

/// Kinds of operations the dispatcher accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Broadcast,
    AllReduce,
    AllGather,
    Reduce,
    ReduceScatter,
    Barrier,
    Send,
    Recv,
    AllToAll,
    Gather,
    Scatter,
}

impl OpKind {
    pub const ALL: [OpKind; 11] = [
        OpKind::Broadcast,
        OpKind::AllReduce,
        OpKind::AllGather,
        OpKind::Reduce,
        OpKind::ReduceScatter,
        OpKind::Barrier,
        OpKind::Send,
        OpKind::Recv,
        OpKind::AllToAll,
        OpKind::Gather,
        OpKind::Scatter,
    ];

    pub fn is_point_to_point(&self) -> bool {
        matches!(self, OpKind::Send | OpKind::Recv)
    }

    pub fn is_collective(&self) -> bool {
        !self.is_point_to_point()
    }

    pub fn needs_reduce_op(&self) -> bool {
        matches!(self, OpKind::AllReduce | OpKind::Reduce | OpKind::ReduceScatter)
    }

    pub fn is_rooted(&self) -> bool {
        matches!(
            self,
            OpKind::Broadcast | OpKind::Reduce | OpKind::Gather | OpKind::Scatter
        )
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OpKind::Broadcast => "broadcast",
            OpKind::AllReduce => "allreduce",
            OpKind::AllGather => "allgather",
            OpKind::Reduce => "reduce",
            OpKind::ReduceScatter => "reduce_scatter",
            OpKind::Barrier => "barrier",
            OpKind::Send => "send",
            OpKind::Recv => "recv",
            OpKind::AllToAll => "alltoall",
            OpKind::Gather => "gather",
            OpKind::Scatter => "scatter",
        };
        f.write_str(name)
    }
}

/// One framework call, consumed by the dispatcher
///
/// Ranks (`root`, `peer`) are positions inside the group, not global ranks.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationRequest {
    pub kind: OpKind,
    pub inputs: Vec<BufferDescriptor>,
    pub outputs: Vec<BufferDescriptor>,
    pub reduce_op: Option<ReduceOp>,
    pub root: Option<usize>,
    pub peer: Option<usize>,
    pub tag: Option<u64>,
}

impl OperationRequest {
    /// An empty request of the given kind; fill it with the `with_*` setters
    pub fn new(kind: OpKind) -> Self {
        Self {
            kind,
            inputs: Vec::new(),
            outputs: Vec::new(),
            reduce_op: None,
            root: None,
            peer: None,
            tag: None,
        }
    }

    /// In-place broadcast of `buffer` from `root`
    pub fn broadcast(buffer: BufferDescriptor, root: usize) -> Self {
        Self::new(OpKind::Broadcast)
            .with_inputs(vec![buffer])
            .with_outputs(vec![buffer])
            .with_root(root)
    }

    pub fn all_reduce(input: BufferDescriptor, output: BufferDescriptor, op: ReduceOp) -> Self {
        Self::new(OpKind::AllReduce)
            .with_inputs(vec![input])
            .with_outputs(vec![output])
            .with_reduce_op(op)
    }

    pub fn all_reduce_in_place(buffer: BufferDescriptor, op: ReduceOp) -> Self {
        Self::all_reduce(buffer, buffer, op)
    }

    /// Reduce into `output` on `root`; other ranks' outputs are left untouched
    pub fn reduce(
        input: BufferDescriptor,
        output: BufferDescriptor,
        op: ReduceOp,
        root: usize,
    ) -> Self {
        Self::new(OpKind::Reduce)
            .with_inputs(vec![input])
            .with_outputs(vec![output])
            .with_reduce_op(op)
            .with_root(root)
    }

    /// `output` holds `input` of every rank, in rank order
    pub fn all_gather(input: BufferDescriptor, output: BufferDescriptor) -> Self {
        Self::new(OpKind::AllGather)
            .with_inputs(vec![input])
            .with_outputs(vec![output])
    }

    /// Reduce `input` across ranks; rank `r` keeps chunk `r` of the result
    pub fn reduce_scatter(input: BufferDescriptor, output: BufferDescriptor, op: ReduceOp) -> Self {
        Self::new(OpKind::ReduceScatter)
            .with_inputs(vec![input])
            .with_outputs(vec![output])
            .with_reduce_op(op)
    }

    /// Chunk `j` of `input` goes to rank `j`; chunk `i` of `output` comes from rank `i`
    pub fn all_to_all(input: BufferDescriptor, output: BufferDescriptor) -> Self {
        Self::new(OpKind::AllToAll)
            .with_inputs(vec![input])
            .with_outputs(vec![output])
    }

    /// Gather every rank's `input` into `output` on `root`
    pub fn gather(input: BufferDescriptor, output: Option<BufferDescriptor>, root: usize) -> Self {
        Self::new(OpKind::Gather)
            .with_inputs(vec![input])
            .with_outputs(output.into_iter().collect())
            .with_root(root)
    }

    /// Split `input` on `root` into one chunk per rank
    pub fn scatter(input: Option<BufferDescriptor>, output: BufferDescriptor, root: usize) -> Self {
        Self::new(OpKind::Scatter)
            .with_inputs(input.into_iter().collect())
            .with_outputs(vec![output])
            .with_root(root)
    }

    pub fn barrier() -> Self {
        Self::new(OpKind::Barrier)
    }

    pub fn send(input: BufferDescriptor, dst: usize, tag: u64) -> Self {
        Self::new(OpKind::Send)
            .with_inputs(vec![input])
            .with_peer(dst)
            .with_tag(tag)
    }

    pub fn recv(output: BufferDescriptor, src: usize, tag: u64) -> Self {
        Self::new(OpKind::Recv)
            .with_outputs(vec![output])
            .with_peer(src)
            .with_tag(tag)
    }

    pub fn with_inputs(mut self, inputs: Vec<BufferDescriptor>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_outputs(mut self, outputs: Vec<BufferDescriptor>) -> Self {
        self.outputs = outputs;
        self
    }

    pub fn with_reduce_op(mut self, op: ReduceOp) -> Self {
        self.reduce_op = Some(op);
        self
    }

    pub fn with_root(mut self, root: usize) -> Self {
        self.root = Some(root);
        self
    }

    pub fn with_peer(mut self, peer: usize) -> Self {
        self.peer = Some(peer);
        self
    }

    pub fn with_tag(mut self, tag: u64) -> Self {
        self.tag = Some(tag);
        self
    }
}
