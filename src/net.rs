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

//! Networking and communication components

pub mod comm_operations;
pub mod communicator;
pub mod dispatcher;
pub mod group;
pub mod loopback;
pub mod progress;
pub mod reduce;
pub mod rendezvous;
pub mod transport;
pub mod work;

#[cfg(feature = "redis")]
pub mod redis_store;

// Re-exports for convenience
pub use comm_operations::{OpKind, OperationRequest, ReduceOp};
pub use communicator::{Communicator, CommunicatorRegistry};
pub use dispatcher::{Decomposition, Dispatcher, Plan};
pub use group::GroupDescriptor;
pub use loopback::{LoopbackFabric, LoopbackTransport};
pub use progress::{EngineState, EngineStats, ProgressEngine};
pub use rendezvous::{MemoryStore, Rendezvous, Store};
pub use transport::{PrimitiveOp, RequestId, RequestStatus, Transport, TransportContext};
pub use work::{Work, WorkState};

#[cfg(feature = "redis")]
pub use redis_store::RedisStore;
