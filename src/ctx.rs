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

//! Per-process communication context
//!
//! The entry point for a framework integration: one [`CommContext`] per
//! process (or per rank thread in tests) owns the transport, the progress
//! engine, the communicator registry and the dispatcher.

use std::sync::Arc;

use crate::config::CommConfig;
use crate::error::CommResult;
use crate::net::communicator::{Communicator, CommunicatorRegistry};
use crate::net::dispatcher::Dispatcher;
use crate::net::group::GroupDescriptor;
use crate::net::progress::{EngineState, EngineStats, ProgressEngine};
use crate::net::rendezvous::Store;
use crate::net::transport::Transport;
use crate::net::comm_operations::OperationRequest;
use crate::net::work::Work;

pub struct CommContext {
    rank: usize,
    config: Arc<CommConfig>,
    transport: Arc<dyn Transport>,
    engine: Arc<ProgressEngine>,
    registry: CommunicatorRegistry,
    dispatcher: Dispatcher,
}

impl CommContext {
    /// Context for the process with global rank `rank`
    pub fn new(rank: usize, config: CommConfig, transport: Arc<dyn Transport>) -> Self {
        let config = Arc::new(config);
        let engine = Arc::new(ProgressEngine::new(rank, &config));
        crate::coll_debug!(
            "[Rank {}] context on {} transport, {:?}",
            rank,
            transport.name(),
            config
        );
        Self {
            rank,
            registry: CommunicatorRegistry::new(transport.clone(), config.clone(), engine.clone()),
            dispatcher: Dispatcher::new(config.clone(), transport.clone()),
            config,
            transport,
            engine,
        }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn config(&self) -> &CommConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Describe a group; its communicator is created by the first operation
    pub fn create_group(
        &self,
        id: &str,
        ranks: Vec<usize>,
        store: Arc<dyn Store>,
    ) -> CommResult<GroupDescriptor> {
        GroupDescriptor::new(id, ranks, self.rank, store)
    }

    /// The group's communicator, creating it now if needed
    pub fn communicator(&self, group: &GroupDescriptor) -> CommResult<Arc<Communicator>> {
        self.registry.get_or_create(group)
    }

    /// Tear down the group's communicator
    ///
    /// Outstanding works fail with `CommunicatorDestroyed`. Returns their
    /// number.
    pub fn destroy_group(&self, group: &GroupDescriptor) -> usize {
        let failed = self.registry.destroy(group.id());
        crate::coll_debug!([group.rank(), group.id()] "group destroyed");
        failed
    }

    /// Validate, plan and enqueue one operation on `group`
    pub fn post(&self, group: &GroupDescriptor, request: OperationRequest) -> CommResult<Work> {
        let plan = self
            .dispatcher
            .prepare(&request, group.rank(), group.size())?;
        let comm = self.registry.get_or_create(group)?;
        let work = comm.enqueue(request.kind, plan)?;
        self.engine.notify();
        Ok(work)
    }

    pub fn engine(&self) -> &ProgressEngine {
        &self.engine
    }

    pub fn engine_state(&self) -> EngineState {
        self.engine.state()
    }

    pub fn engine_stats(&self) -> EngineStats {
        self.engine.stats()
    }
}

impl Drop for CommContext {
    fn drop(&mut self) {
        self.registry.destroy_all();
        self.engine.shutdown();
    }
}
