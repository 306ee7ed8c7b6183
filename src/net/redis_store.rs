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

//! Redis-backed rendezvous store
//!
//! Values are written with `SET NX`, so a key keeps its first value. Each key
//! has a companion list `<key>:ready`; writers push a token onto it and
//! readers block on `BRPOPLPUSH` of the list onto itself, which leaves the
//! token in place for every other reader.

use std::time::{Duration, Instant};

use redis::{Client, Commands, Connection};

use crate::error::{CommError, CommResult};
use super::rendezvous::Store;

/// Environment variable holding the Redis address (`host:port`)
pub const ENV_REDIS_ADDR: &str = "COLL_REDIS_ADDR";

/// Rendezvous store on a Redis server
pub struct RedisStore {
    client: Client,
}

impl RedisStore {
    /// Connect to `redis_addr`, e.g. `"redis://127.0.0.1:6379"`
    pub fn new(redis_addr: &str) -> CommResult<Self> {
        let client = Client::open(redis_addr).map_err(|e| {
            CommError::Store(format!("Failed to connect to Redis at {}: {}", redis_addr, e))
        })?;
        // Fail early on a bad address instead of at the first rendezvous.
        client.get_connection().map_err(|e| {
            CommError::Store(format!("Failed to get Redis connection: {}", e))
        })?;
        Ok(Self { client })
    }

    /// Connect to the address in `COLL_REDIS_ADDR`
    pub fn from_env() -> CommResult<Self> {
        let addr = std::env::var(ENV_REDIS_ADDR)
            .map_err(|_| CommError::invalid(format!("{} not set", ENV_REDIS_ADDR)))?;
        Self::new(&format!("redis://{}", addr))
    }

    fn connection(&self) -> CommResult<Connection> {
        self.client
            .get_connection()
            .map_err(|e| CommError::Store(format!("Failed to get Redis connection: {}", e)))
    }

    fn ready_key(key: &str) -> String {
        format!("{}:ready", key)
    }
}

impl Store for RedisStore {
    fn put(&self, key: &str, value: &[u8]) -> CommResult<()> {
        let mut conn = self.connection()?;
        let written: bool = conn.set_nx(key, value)?;
        if !written {
            let existing: Option<Vec<u8>> = conn.get(key)?;
            if existing.as_deref() != Some(value) {
                return Err(CommError::Store(format!(
                    "key '{}' was already written with a different value",
                    key
                )));
            }
        }
        let _: () = conn.lpush(Self::ready_key(key), "1")?;
        Ok(())
    }

    fn get(&self, key: &str, timeout: Duration) -> CommResult<Option<Vec<u8>>> {
        let mut conn = self.connection()?;
        let ready = Self::ready_key(key);
        let deadline = Instant::now() + timeout;

        loop {
            let value: Option<Vec<u8>> = conn.get(key)?;
            if value.is_some() {
                return Ok(value);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            // A zero timeout means "forever" to Redis.
            let wait = remaining.as_secs_f64().max(0.01);
            let _: Option<String> = conn.brpoplpush(&ready, &ready, wait)?;
        }
    }
}
