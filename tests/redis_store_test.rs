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

//! Tests for the Redis rendezvous store
//!
//! Require a running Redis server:
//! `COLL_REDIS_ADDR=127.0.0.1:6379 cargo test --features redis -- --ignored`

#[cfg(feature = "redis")]
mod redis_store_tests {
    use std::sync::Arc;
    use std::thread;

    use collective_backend::config::CommConfig;
    use collective_backend::ctx::CommContext;
    use collective_backend::memory::BufferDescriptor;
    use collective_backend::net::{
        LoopbackFabric, LoopbackTransport, OperationRequest, ReduceOp, RedisStore, Store,
    };
    use collective_backend::util::logging::init_test_logging;

    #[test]
    #[ignore]
    fn test_allreduce_over_redis_rendezvous() {
        init_test_logging();
        let fabric = LoopbackFabric::new();
        // Fresh key namespace per run; Redis keys outlive the test.
        let config = CommConfig::default().with_session();

        let handles: Vec<_> = (0..3)
            .map(|rank| {
                let fabric = fabric.clone();
                let config = config.clone();
                thread::spawn(move || {
                    let store: Arc<dyn Store> = Arc::new(RedisStore::from_env().unwrap());
                    let transport = Arc::new(LoopbackTransport::new(fabric));
                    let ctx = CommContext::new(rank, config, transport);
                    let group = ctx.create_group("redis-world", vec![0, 1, 2], store).unwrap();
                    let mut data = vec![rank as i32; 2];
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
            })
            .collect();

        for h in handles {
            assert_eq!(h.join().unwrap(), vec![3, 3]);
        }
    }
}
