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

//! Collective communication backend
//!
//! Runs a framework's collective and point-to-point operations on a pluggable
//! transport. Groups rendezvous through a key-value store, communicators are
//! created lazily per group, and a background progress engine completes
//! posted operations in order while callers hold [`Work`] handles.

pub mod config;
pub mod ctx;
pub mod data_types;
pub mod error;
pub mod memory;
pub mod net;
pub mod util;

// Re-export commonly used types
pub use crate::config::CommConfig;
pub use crate::ctx::CommContext;
pub use crate::data_types::DataType;
pub use crate::error::{CommError, CommResult};
pub use crate::memory::{BufferDescriptor, Device, MemoryKind};
pub use crate::net::{GroupDescriptor, OpKind, OperationRequest, ReduceOp, Work, WorkState};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
