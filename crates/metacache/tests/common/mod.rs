//! Shared fixtures for cache integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metacache::CacheConfig;
use metacache_health::LivenessProbe;
use metacache_state::keys;
use metacache_state::*;

/// Probe that reports every server as dead.
pub struct DeadProbe;

#[async_trait]
impl LivenessProbe for DeadProbe {
    async fn is_alive(&self, _server: &Server) -> bool {
        false
    }
}

/// Delegates to a shared `StateStore`, counting writes per key across
/// every wrapper cloned from the same counter.
pub struct WriteCountingSource {
    pub inner: StateStore,
    pub puts: Arc<parking_lot::Mutex<Vec<String>>>,
}

impl WriteCountingSource {
    pub fn puts_of(&self, key: &str) -> usize {
        self.puts.lock().iter().filter(|k| *k == key).count()
    }
}

#[async_trait]
impl MetaSource for WriteCountingSource {
    async fn get(&self, key: &str) -> StateResult<Option<Vec<u8>>> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: &[u8]) -> StateResult<u64> {
        self.puts.lock().push(key.to_string());
        self.inner.put(key, value).await
    }

    async fn delete(&self, key: &str) -> StateResult<bool> {
        self.inner.delete(key).await
    }

    async fn prefix_scan(&self, prefix: &str) -> StateResult<(u64, Vec<KeyValue>)> {
        self.inner.prefix_scan(prefix).await
    }

    async fn watch(&self, prefix: &str, start_revision: u64) -> StateResult<WatchStream> {
        self.inner.watch(prefix, start_revision).await
    }

    fn new_lock(&self, name: &str, ttl: Duration) -> Box<dyn MetaLock> {
        self.inner.new_lock(name, ttl)
    }
}

pub fn fast_config() -> CacheConfig {
    CacheConfig {
        retry_count: 10,
        retry_interval: "20ms".to_string(),
        watch_backoff: "100ms".to_string(),
        resolve_retries: 1,
        ..CacheConfig::default()
    }
}

pub fn server(id: NodeId, resource: &str, partitions: Vec<PartitionId>) -> Server {
    Server {
        id,
        ip: "127.0.0.1".to_string(),
        rpc_port: 1,
        resource_name: resource.to_string(),
        partition_ids: partitions,
    }
}

pub fn space(id: SpaceId, name: &str, version: u64, resource: &str) -> Space {
    Space {
        id,
        name: name.to_string(),
        db_id: 1,
        version,
        resource_name: resource.to_string(),
        partition_num: 1,
        replica_num: 1,
        partitions: vec![],
    }
}

pub fn user(name: &str, role: &str) -> User {
    User {
        name: name.to_string(),
        password: None,
        role_name: role.to_string(),
    }
}

/// Store holding database `db1` (id 1).
pub async fn store_with_db() -> StateStore {
    let store = StateStore::open_in_memory().unwrap();
    seed_db(&store).await;
    store
}

pub async fn seed_db(store: &StateStore) {
    put_json(store, &keys::db_body_key(1), &Db { id: 1, name: "db1".into() })
        .await
        .unwrap();
    store.put_raw(&keys::db_name_key("db1"), b"1").unwrap();
}

/// Poll `check` until it holds or two seconds pass.
pub async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
