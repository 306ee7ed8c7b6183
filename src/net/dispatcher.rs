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

//! Operation dispatch
//!
//! Turns an [`OperationRequest`] into a [`Plan`]: an ordered list of
//! transport primitives and local steps. Validation happens here, before
//! anything is enqueued, so malformed requests never reach a transport.
//! Operations the transport lacks are rewritten into ones it has; the
//! rewrite owns any scratch memory it needs until the plan is dropped.

use std::sync::Arc;

use crate::config::{CommConfig, ReduceScatterStrategy, ReduceStrategy};
use crate::data_types::DataType;
use crate::error::{CommError, CommResult};
use crate::memory::{classify, BufferDescriptor, ScratchBuffer};
use super::comm_operations::{OpKind, OperationRequest, ReduceOp};
use super::reduce::{check_reduce_op, reduce_all};
use super::transport::{PrimitiveOp, Transport};

/// How a request is carried out on the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decomposition {
    Native,
    /// Reduce-scatter as an allreduce into scratch, then keep this rank's chunk
    AllReduceThenSlice,
    /// Reduce-scatter as an allgather into scratch, then a local reduction
    AllGatherThenReduce,
    /// Reduce as an allreduce into scratch; only the root copies out
    AllReduceToRoot,
    /// Barrier as a one-byte allreduce
    AllReduceBarrier,
}

impl Decomposition {
    /// Native operations the decomposition posts
    pub fn requires(&self, kind: OpKind) -> OpKind {
        match self {
            Decomposition::Native => kind,
            Decomposition::AllReduceThenSlice
            | Decomposition::AllReduceToRoot
            | Decomposition::AllReduceBarrier => OpKind::AllReduce,
            Decomposition::AllGatherThenReduce => OpKind::AllGather,
        }
    }
}

/// Pick a decomposition for `kind` given what the transport supports natively
pub fn select_decomposition<F>(
    kind: OpKind,
    config: &CommConfig,
    native: F,
) -> CommResult<Decomposition>
where
    F: Fn(OpKind) -> bool,
{
    let candidates: &[Decomposition] = match kind {
        OpKind::ReduceScatter => match config.reduce_scatter_strategy {
            ReduceScatterStrategy::Auto => &[
                Decomposition::Native,
                Decomposition::AllReduceThenSlice,
                Decomposition::AllGatherThenReduce,
            ],
            ReduceScatterStrategy::Native => &[Decomposition::Native],
            ReduceScatterStrategy::AllReduceThenSlice => &[Decomposition::AllReduceThenSlice],
            ReduceScatterStrategy::AllGatherThenReduce => &[Decomposition::AllGatherThenReduce],
        },
        OpKind::Reduce => match config.reduce_strategy {
            ReduceStrategy::Auto => &[Decomposition::Native, Decomposition::AllReduceToRoot],
            ReduceStrategy::Native => &[Decomposition::Native],
            ReduceStrategy::AllReduce => &[Decomposition::AllReduceToRoot],
        },
        OpKind::Barrier => &[Decomposition::Native, Decomposition::AllReduceBarrier],
        _ => &[Decomposition::Native],
    };

    candidates
        .iter()
        .copied()
        .find(|d| native(d.requires(kind)))
        .ok_or_else(|| {
            CommError::NotImplemented(format!(
                "{} is not supported natively and no configured decomposition applies",
                kind
            ))
        })
}

/// Work done on the host between transport primitives
#[derive(Debug, Clone, Copy)]
pub enum LocalStep {
    Copy {
        src: BufferDescriptor,
        dst: BufferDescriptor,
    },
    /// `dst = op(src[r * stride + offset .. + dst.count] for r in 0..contributors)`
    ReduceChunks {
        src: BufferDescriptor,
        stride: usize,
        offset: usize,
        dst: BufferDescriptor,
        op: ReduceOp,
        contributors: usize,
    },
}

impl LocalStep {
    /// # Safety
    /// Every descriptor must be host accessible and valid for the duration of
    /// the call, and `dst` must not overlap `src`.
    pub(crate) unsafe fn run(&self) -> CommResult<()> {
        match *self {
            LocalStep::Copy { src, dst } => {
                if src.len_bytes() != dst.len_bytes() {
                    return Err(CommError::invalid(format!(
                        "copy of {} bytes into {} bytes",
                        src.len_bytes(),
                        dst.len_bytes()
                    )));
                }
                dst.as_bytes_mut().copy_from_slice(src.as_bytes());
                Ok(())
            }
            LocalStep::ReduceChunks {
                src,
                stride,
                offset,
                dst,
                op,
                contributors,
            } => {
                let mut chunks = Vec::with_capacity(contributors);
                for r in 0..contributors {
                    chunks.push(src.slice(r * stride + offset, dst.count())?);
                }
                let acc = reduce_all(dst.data_type(), op, chunks.iter().map(|c| c.as_bytes()))?;
                dst.as_bytes_mut().copy_from_slice(&acc);
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Step {
    Transport(PrimitiveOp),
    Local(LocalStep),
}

/// Ordered steps of one operation plus the scratch memory they reference
pub struct Plan {
    decomposition: Decomposition,
    steps: Vec<Step>,
    // Referenced by raw descriptors in `steps`; must outlive them.
    _scratch: Vec<ScratchBuffer>,
}

impl Plan {
    pub fn decomposition(&self) -> Decomposition {
        self.decomposition
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub(crate) fn step(&self, index: usize) -> Option<&Step> {
        self.steps.get(index)
    }
}

impl std::fmt::Debug for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plan")
            .field("decomposition", &self.decomposition)
            .field("steps", &self.steps)
            .finish()
    }
}

fn expect_buffers(request: &OperationRequest, inputs: usize, outputs: usize) -> CommResult<()> {
    if request.inputs.len() != inputs || request.outputs.len() != outputs {
        return Err(CommError::invalid(format!(
            "{} takes {} input and {} output buffers, got {} and {}",
            request.kind,
            inputs,
            outputs,
            request.inputs.len(),
            request.outputs.len()
        )));
    }
    Ok(())
}

fn expect_count(what: &str, kind: OpKind, actual: usize, expected: usize) -> CommResult<()> {
    if actual != expected {
        return Err(CommError::invalid(format!(
            "{} {} has {} elements, expected {}",
            kind, what, actual, expected
        )));
    }
    Ok(())
}

fn group_rank(kind: OpKind, what: &str, value: Option<usize>, size: usize) -> CommResult<usize> {
    match value {
        Some(r) if r < size => Ok(r),
        Some(r) => Err(CommError::invalid(format!(
            "{} {} {} is outside a group of {}",
            kind, what, r, size
        ))),
        None => Err(CommError::invalid(format!("{} requires a {}", kind, what))),
    }
}

/// Check a request against the group shape; `rank` and `size` are group-local
pub fn validate(request: &OperationRequest, rank: usize, size: usize) -> CommResult<()> {
    let kind = request.kind;

    let root = if kind.is_rooted() {
        Some(group_rank(kind, "root", request.root, size)?)
    } else {
        None
    };
    let is_root = root == Some(rank);

    match kind {
        OpKind::Broadcast | OpKind::AllReduce | OpKind::Reduce => {
            expect_buffers(request, 1, 1)?;
            expect_count("output", kind, request.outputs[0].count(), request.inputs[0].count())?;
        }
        OpKind::AllGather => {
            expect_buffers(request, 1, 1)?;
            expect_count(
                "output",
                kind,
                request.outputs[0].count(),
                request.inputs[0].count() * size,
            )?;
        }
        OpKind::ReduceScatter => {
            expect_buffers(request, 1, 1)?;
            expect_count(
                "input",
                kind,
                request.inputs[0].count(),
                request.outputs[0].count() * size,
            )?;
        }
        OpKind::AllToAll => {
            expect_buffers(request, 1, 1)?;
            expect_count("output", kind, request.outputs[0].count(), request.inputs[0].count())?;
            if request.inputs[0].count() % size != 0 {
                return Err(CommError::invalid(format!(
                    "alltoall of {} elements does not split into {} chunks",
                    request.inputs[0].count(),
                    size
                )));
            }
        }
        OpKind::Gather => {
            if is_root {
                expect_buffers(request, 1, 1)?;
                expect_count(
                    "output",
                    kind,
                    request.outputs[0].count(),
                    request.inputs[0].count() * size,
                )?;
            } else if request.inputs.len() != 1 || request.outputs.len() > 1 {
                expect_buffers(request, 1, 0)?;
            }
        }
        OpKind::Scatter => {
            if is_root {
                expect_buffers(request, 1, 1)?;
                expect_count(
                    "input",
                    kind,
                    request.inputs[0].count(),
                    request.outputs[0].count() * size,
                )?;
            } else if request.outputs.len() != 1 || request.inputs.len() > 1 {
                expect_buffers(request, 0, 1)?;
            }
        }
        OpKind::Barrier => expect_buffers(request, 0, 0)?,
        OpKind::Send | OpKind::Recv => {
            if kind == OpKind::Send {
                expect_buffers(request, 1, 0)?;
            } else {
                expect_buffers(request, 0, 1)?;
            }
            let peer = group_rank(kind, "peer", request.peer, size)?;
            if peer == rank {
                return Err(CommError::invalid(format!("{} to self (rank {})", kind, rank)));
            }
            if request.tag.is_none() {
                return Err(CommError::invalid(format!("{} requires a tag", kind)));
            }
        }
    }

    let mut data_type: Option<DataType> = None;
    for buffer in request.inputs.iter().chain(request.outputs.iter()) {
        match data_type {
            None => data_type = Some(buffer.data_type()),
            Some(dt) if dt != buffer.data_type() => {
                return Err(CommError::invalid(format!(
                    "{} mixes {} and {} buffers",
                    kind,
                    dt,
                    buffer.data_type()
                )))
            }
            Some(_) => {}
        }
        if buffer.ptr().is_null() && buffer.count() > 0 {
            return Err(CommError::invalid(format!("{} with a null buffer", kind)));
        }
    }
    // Non-root gather outputs and scatter inputs are never touched.
    let written = match kind {
        OpKind::Gather if !is_root => &[][..],
        _ => &request.outputs[..],
    };
    if let Some(buffer) = written.iter().find(|b| !b.is_writable()) {
        return Err(CommError::invalid(format!(
            "{} output of {} elements is read-only",
            kind,
            buffer.count()
        )));
    }

    if kind.needs_reduce_op() {
        let op = request
            .reduce_op
            .ok_or_else(|| CommError::invalid(format!("{} requires a reduction operator", kind)))?;
        if let Some(dt) = data_type {
            check_reduce_op(dt, op)?;
        }
    }
    Ok(())
}

/// Validates requests and plans them against one transport
pub struct Dispatcher {
    config: Arc<CommConfig>,
    transport: Arc<dyn Transport>,
}

impl Dispatcher {
    pub fn new(config: Arc<CommConfig>, transport: Arc<dyn Transport>) -> Self {
        Self { config, transport }
    }

    /// Validate `request` and build its plan for group rank `rank` of `size`
    pub fn prepare(
        &self,
        request: &OperationRequest,
        rank: usize,
        size: usize,
    ) -> CommResult<Plan> {
        validate(request, rank, size)?;

        let mut all_host = true;
        for buffer in request.inputs.iter().chain(request.outputs.iter()) {
            let kind = classify(buffer)?;
            if !self.transport.supports_memory(kind) {
                return Err(CommError::UnsupportedMemoryKind(format!(
                    "{} transport cannot access {} memory",
                    self.transport.name(),
                    kind
                )));
            }
            all_host &= kind.is_host_accessible();
        }

        let decomposition = select_decomposition(request.kind, &self.config, |k| {
            self.transport.supports_native(k)
        })?;
        if decomposition != Decomposition::Native && !all_host {
            return Err(CommError::UnsupportedMemoryKind(format!(
                "{} has no native implementation and its buffers are not host accessible",
                request.kind
            )));
        }
        build_plan(request, decomposition, rank, size)
    }
}

fn native_op(request: &OperationRequest) -> PrimitiveOp {
    PrimitiveOp::new(
        request.kind,
        request.inputs.first().copied(),
        request.outputs.first().copied(),
    )
    .with_reduce_op(request.reduce_op)
    .with_root(request.root)
    .with_peer(request.peer, request.tag)
}

/// Build the steps for a validated request
pub(crate) fn build_plan(
    request: &OperationRequest,
    decomposition: Decomposition,
    rank: usize,
    size: usize,
) -> CommResult<Plan> {
    let mut scratch = Vec::new();
    let mut steps = Vec::new();
    let reduce_op = request.reduce_op;

    match decomposition {
        Decomposition::Native => {
            let mut op = native_op(request);
            match request.kind {
                OpKind::Gather if request.root != Some(rank) => op.dst = None,
                OpKind::Scatter if request.root != Some(rank) => op.src = None,
                _ => {}
            }
            steps.push(Step::Transport(op));
        }
        Decomposition::AllReduceThenSlice => {
            let (input, output) = (request.inputs[0], request.outputs[0]);
            let mut buffer = ScratchBuffer::zeroed(input.count(), input.data_type());
            let full = buffer.descriptor();
            scratch.push(buffer);
            steps.push(Step::Transport(
                PrimitiveOp::new(OpKind::AllReduce, Some(input), Some(full))
                    .with_reduce_op(reduce_op),
            ));
            steps.push(Step::Local(LocalStep::Copy {
                src: full.slice(rank * output.count(), output.count())?,
                dst: output,
            }));
        }
        Decomposition::AllGatherThenReduce => {
            let (input, output) = (request.inputs[0], request.outputs[0]);
            let op =
                reduce_op.ok_or_else(|| CommError::invalid("reduce_scatter without operator"))?;
            let mut buffer = ScratchBuffer::zeroed(input.count() * size, input.data_type());
            let gathered = buffer.descriptor();
            scratch.push(buffer);
            steps.push(Step::Transport(PrimitiveOp::new(
                OpKind::AllGather,
                Some(input),
                Some(gathered),
            )));
            steps.push(Step::Local(LocalStep::ReduceChunks {
                src: gathered,
                stride: input.count(),
                offset: rank * output.count(),
                dst: output,
                op,
                contributors: size,
            }));
        }
        Decomposition::AllReduceToRoot => {
            let (input, output) = (request.inputs[0], request.outputs[0]);
            let mut buffer = ScratchBuffer::zeroed(input.count(), input.data_type());
            let reduced = buffer.descriptor();
            scratch.push(buffer);
            steps.push(Step::Transport(
                PrimitiveOp::new(OpKind::AllReduce, Some(input), Some(reduced))
                    .with_reduce_op(reduce_op),
            ));
            if request.root == Some(rank) {
                steps.push(Step::Local(LocalStep::Copy {
                    src: reduced,
                    dst: output,
                }));
            }
        }
        Decomposition::AllReduceBarrier => {
            let mut buffer = ScratchBuffer::zeroed(1, DataType::UInt8);
            let token = buffer.descriptor();
            scratch.push(buffer);
            steps.push(Step::Transport(
                PrimitiveOp::new(OpKind::AllReduce, Some(token), Some(token))
                    .with_reduce_op(Some(ReduceOp::Max)),
            ));
        }
    }

    Ok(Plan {
        decomposition,
        steps,
        _scratch: scratch,
    })
}
