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

//! Out-of-band rendezvous
//!
//! Before a communicator exists, ranks exchange transport address blobs
//! through a key-value [`Store`]. Every rank publishes its blob under
//! `<prefix>/<group>/addr/<rank>` and then reads everyone else's, waiting for
//! slow joiners up to a deadline. This never runs on the data path.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{CommError, CommResult};
use crate::util::lock;
use super::group::GroupDescriptor;

/// Blocking key-value store with read-after-write visibility across ranks
pub trait Store: Send + Sync {
    /// Publish `value` under `key`
    ///
    /// Keys are write-once: re-publishing the identical value is accepted,
    /// a different value is an error.
    fn put(&self, key: &str, value: &[u8]) -> CommResult<()>;

    /// Wait up to `timeout` for `key`; `Ok(None)` if it never appeared
    fn get(&self, key: &str, timeout: Duration) -> CommResult<Option<Vec<u8>>>;
}

/// In-process store shared by ranks running as threads
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
    changed: Condvar,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        lock(&self.entries).contains_key(key)
    }
}

impl Store for MemoryStore {
    fn put(&self, key: &str, value: &[u8]) -> CommResult<()> {
        let mut entries = lock(&self.entries);
        if let Some(existing) = entries.get(key) {
            if existing.as_slice() == value {
                return Ok(());
            }
            return Err(CommError::Store(format!(
                "key '{}' was already written with a different value",
                key
            )));
        }
        entries.insert(key.to_string(), value.to_vec());
        self.changed.notify_all();
        Ok(())
    }

    fn get(&self, key: &str, timeout: Duration) -> CommResult<Option<Vec<u8>>> {
        let deadline = Instant::now() + timeout;
        let mut entries = lock(&self.entries);
        loop {
            if let Some(value) = entries.get(key) {
                return Ok(Some(value.clone()));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            entries = match self.changed.wait_timeout(entries, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}

/// Address exchange for one communicator creation
#[derive(Debug, Clone)]
pub struct Rendezvous {
    prefix: String,
    timeout: Duration,
}

impl Rendezvous {
    pub fn new(prefix: &str, timeout: Duration) -> Self {
        Self {
            prefix: prefix.to_string(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Store key for the address blob of `rank` in `group`
    pub fn address_key(&self, group: &str, rank: usize) -> String {
        format!("{}/{}/addr/{}", self.prefix, group, rank)
    }

    /// Publish `local` and collect every member's blob, indexed by group rank
    pub fn exchange(&self, group: &GroupDescriptor, local: &[u8]) -> CommResult<Vec<Vec<u8>>> {
        let store = group.store();
        let me = group.rank();

        store.put(&self.address_key(group.id(), me), local)?;
        crate::coll_debug!([me, group.id()] "published {} byte address", local.len());

        let deadline = Instant::now() + self.timeout;
        let mut blobs: Vec<Vec<u8>> = Vec::with_capacity(group.size());
        let mut missing = Vec::new();

        for peer in 0..group.size() {
            if peer == me {
                blobs.push(local.to_vec());
                continue;
            }
            // After the deadline the remaining lookups are non-blocking, so
            // the error names every rank that is absent right now.
            let remaining = deadline.saturating_duration_since(Instant::now());
            match store.get(&self.address_key(group.id(), peer), remaining)? {
                Some(blob) => blobs.push(blob),
                None => {
                    missing.push(peer);
                    blobs.push(Vec::new());
                }
            }
        }

        if !missing.is_empty() {
            crate::coll_warn!(
                [me, group.id()] "rendezvous timed out after {:?}, missing ranks {:?}",
                self.timeout,
                missing
            );
            return Err(CommError::RendezvousTimeout {
                group: group.id().to_string(),
                missing,
                timeout: self.timeout,
            });
        }

        crate::coll_debug!([me, group.id()] "rendezvous complete with {} ranks", group.size());
        Ok(blobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_store_write_once() {
        let store = MemoryStore::new();
        store.put("k", b"v1").unwrap();
        store.put("k", b"v1").unwrap();
        assert!(matches!(store.put("k", b"v2"), Err(CommError::Store(_))));
        assert_eq!(store.get("k", Duration::ZERO).unwrap(), Some(b"v1".to_vec()));
    }

    #[test]
    fn test_store_get_times_out() {
        let store = MemoryStore::new();
        let start = Instant::now();
        assert_eq!(store.get("absent", Duration::from_millis(30)).unwrap(), None);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_store_get_wakes_on_put() {
        let store = Arc::new(MemoryStore::new());
        let writer = {
            let store = store.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                store.put("late", b"here").unwrap();
            })
        };
        let got = store.get("late", Duration::from_secs(5)).unwrap();
        writer.join().unwrap();
        assert_eq!(got, Some(b"here".to_vec()));
    }

    #[test]
    fn test_exchange_collects_all_blobs() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let rdv = Rendezvous::new("t", Duration::from_secs(5));
        let handles: Vec<_> = (0..3)
            .map(|rank| {
                let store = store.clone();
                let rdv = rdv.clone();
                thread::spawn(move || {
                    let group = GroupDescriptor::new("g", vec![0, 1, 2], rank, store).unwrap();
                    rdv.exchange(&group, format!("addr-{}", rank).as_bytes()).unwrap()
                })
            })
            .collect();
        for h in handles {
            let blobs = h.join().unwrap();
            assert_eq!(blobs, vec![b"addr-0".to_vec(), b"addr-1".to_vec(), b"addr-2".to_vec()]);
        }
    }

    #[test]
    fn test_exchange_reports_missing_ranks() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let rdv = Rendezvous::new("t", Duration::from_millis(40));
        let group = GroupDescriptor::new("g", vec![0, 1, 2], 0, store).unwrap();
        match rdv.exchange(&group, b"a") {
            Err(CommError::RendezvousTimeout { missing, .. }) => assert_eq!(missing, vec![1, 2]),
            other => panic!("expected timeout, got {:?}", other),
        }
    }
}
