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

//! Process group descriptors

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::error::{CommError, CommResult};
use super::rendezvous::Store;

/// A logical set of ranks that run collectives together
///
/// The descriptor is cheap to clone. Its communicator is created on first use
/// and keyed by [`id`](Self::id), so ids must be unique for every group
/// creation within a job.
#[derive(Clone)]
pub struct GroupDescriptor {
    id: String,
    /// Global ranks, in group order
    ranks: Vec<usize>,
    /// Position of this process in `ranks`
    rank: usize,
    store: Arc<dyn Store>,
}

impl GroupDescriptor {
    /// Describe a group containing `ranks` as seen from process `global_rank`
    pub fn new(
        id: &str,
        ranks: Vec<usize>,
        global_rank: usize,
        store: Arc<dyn Store>,
    ) -> CommResult<Self> {
        if id.is_empty() {
            return Err(CommError::invalid("group id must not be empty"));
        }
        if ranks.is_empty() {
            return Err(CommError::invalid(format!("group '{}' has no ranks", id)));
        }
        let mut seen = HashSet::with_capacity(ranks.len());
        if let Some(dup) = ranks.iter().find(|r| !seen.insert(**r)) {
            return Err(CommError::invalid(format!(
                "rank {} appears twice in group '{}'",
                dup, id
            )));
        }
        let rank = ranks.iter().position(|r| *r == global_rank).ok_or_else(|| {
            CommError::invalid(format!(
                "process rank {} is not a member of group '{}' {:?}",
                global_rank, id, ranks
            ))
        })?;

        Ok(Self {
            id: id.to_string(),
            ranks,
            rank,
            store,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Rank of this process inside the group
    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.ranks.len()
    }

    pub fn ranks(&self) -> &[usize] {
        &self.ranks
    }

    /// Global rank of the member at `group_rank`
    pub fn global_rank(&self, group_rank: usize) -> Option<usize> {
        self.ranks.get(group_rank).copied()
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }
}

impl fmt::Debug for GroupDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupDescriptor")
            .field("id", &self.id)
            .field("ranks", &self.ranks)
            .field("rank", &self.rank)
            .finish_non_exhaustive()
    }
}
