//! ClientCache: the public lookup API.
//!
//! Every `*_by_cache` lookup follows the same protocol:
//!
//! 1. hit → return the cached record
//! 2. miss → reload through the single-flight coordinator, inline for
//!    users, roles, aliases and spaces (a fetch error is returned at once)
//!    or in the background for partitions and servers
//! 3. poll the store `retry_count` times, `retry_interval` apart
//! 4. still missing → `CacheError::NotFound`
//!
//! A reload only fills a miss. It never replaces a record the watcher
//! already holds, except where an explicit version (spaces) or update time
//! (partitions) shows the fetched copy is newer.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use metacache_health::{HttpLivenessProbe, LivenessProbe};
use metacache_state::{
    Alias, MetaSource, NodeId, Partition, PartitionId, Role, Server, Space, SpaceId, StateError,
    User,
};

use crate::config::CacheConfig;
use crate::error::{CacheError, CacheResult};
use crate::failserver::{FailServerCoordinator, NoopRecovery, RecoveryTrigger};
use crate::handlers::{NamedHandler, PartitionHandler, ServerHandler, SpaceHandler};
use crate::kind::EntityKind;
use crate::singleflight::ReloadCoordinator;
use crate::store::{CacheStores, partition_cache_key, space_cache_key};
use crate::watcher::{WatchHandler, WatchManager, WatchState};

/// How a miss is reloaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReloadMode {
    Inline,
    Background,
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub users: usize,
    pub roles: usize,
    pub spaces: usize,
    pub partitions: usize,
    pub servers: usize,
    pub aliases: usize,
    pub reloads_in_flight: usize,
    pub dropped_space_events: u64,
}

/// Metadata cache of one process.
pub struct ClientCache {
    source: Arc<dyn MetaSource>,
    config: Arc<CacheConfig>,
    stores: Arc<CacheStores>,
    reloads: ReloadCoordinator,
    probe: Arc<dyn LivenessProbe>,
    recovery: Arc<dyn RecoveryTrigger>,
    failserver: Arc<FailServerCoordinator>,
    shutdown_tx: watch::Sender<bool>,
    jobs: Mutex<Vec<JoinHandle<()>>>,
    states: Mutex<Vec<(EntityKind, watch::Receiver<WatchState>)>>,
}

impl ClientCache {
    pub fn new(source: Arc<dyn MetaSource>, config: CacheConfig) -> Self {
        let probe: Arc<dyn LivenessProbe> = Arc::new(
            HttpLivenessProbe::new(config.probe_timeout()).with_path(config.probe_path.clone()),
        );
        let recovery: Arc<dyn RecoveryTrigger> = Arc::new(NoopRecovery);
        let (shutdown_tx, _) = watch::channel(false);
        let mut cache = Self {
            failserver: Arc::new(FailServerCoordinator::new(
                source.clone(),
                probe.clone(),
                config.lock_ttl(),
            )),
            source,
            config: Arc::new(config),
            stores: Arc::new(CacheStores::new()),
            reloads: ReloadCoordinator::new(),
            probe,
            recovery,
            shutdown_tx,
            jobs: Mutex::new(Vec::new()),
            states: Mutex::new(Vec::new()),
        };
        cache.rebuild_failserver();
        cache
    }

    /// Replace the liveness probe used by fail-server detection.
    pub fn with_probe(mut self, probe: Arc<dyn LivenessProbe>) -> Self {
        self.probe = probe;
        self.rebuild_failserver();
        self
    }

    /// Replace the recovery trigger invoked for empty registering nodes.
    pub fn with_recovery(mut self, recovery: Arc<dyn RecoveryTrigger>) -> Self {
        self.recovery = recovery;
        self.rebuild_failserver();
        self
    }

    fn rebuild_failserver(&mut self) {
        self.failserver = Arc::new(
            FailServerCoordinator::new(self.source.clone(), self.probe.clone(), self.config.lock_ttl())
                .with_recovery(self.recovery.clone())
                .with_auto_recover(self.config.auto_recover),
        );
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn failserver(&self) -> Arc<FailServerCoordinator> {
        self.failserver.clone()
    }

    /// Direct read access to the stores, bypassing reload.
    pub fn stores(&self) -> &CacheStores {
        &self.stores
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    /// Bulk-load every kind and start its watcher.
    ///
    /// Kinds load one after another, each immediately followed by its
    /// watcher. An error leaves the kinds already started running; call
    /// [`stop`](Self::stop) to tear them down.
    pub async fn start(&self) -> CacheResult<()> {
        self.start_kinds(&EntityKind::ALL).await
    }

    /// Watch only the server registry. Entry point for control-plane
    /// processes that need fail-server handling without the full cache.
    pub async fn start_server_watch(&self) -> CacheResult<()> {
        self.start_kinds(&[EntityKind::Server]).await
    }

    async fn start_kinds(&self, kinds: &[EntityKind]) -> CacheResult<()> {
        let backoff = self.config.watch_backoff();
        for &kind in kinds {
            if self.states.lock().iter().any(|(k, _)| *k == kind) {
                debug!(%kind, "watcher already running");
                continue;
            }
            let manager = WatchManager::new(self.source.clone(), self.handler(kind), backoff);
            let (revision, _) = manager.initial_load().await?;
            self.states.lock().push((kind, manager.state()));
            let handle = manager.spawn(revision + 1, self.shutdown_tx.subscribe());
            self.jobs.lock().push(handle);
        }
        info!(kinds = kinds.len(), "cache watchers started");
        Ok(())
    }

    fn handler(&self, kind: EntityKind) -> Arc<dyn WatchHandler> {
        let stores = self.stores.clone();
        match kind {
            EntityKind::User => Arc::new(NamedHandler::<User>::new(stores)),
            EntityKind::Role => Arc::new(NamedHandler::<Role>::new(stores)),
            EntityKind::Alias => Arc::new(NamedHandler::<Alias>::new(stores)),
            EntityKind::Space => Arc::new(SpaceHandler::new(
                stores,
                self.source.clone(),
                self.config.resource_name.clone(),
                self.config.resolve_retries,
            )),
            EntityKind::Partition => Arc::new(PartitionHandler::new(stores, self.source.clone())),
            EntityKind::Server => Arc::new(ServerHandler::new(
                stores,
                self.config.resource_name.clone(),
                self.failserver.clone(),
            )),
        }
    }

    /// Stop every watcher and wait for them to exit. Cached records stay
    /// readable. A stopped cache cannot be started again.
    pub async fn stop(&self) {
        self.shutdown_tx.send_replace(true);
        let jobs = std::mem::take(&mut *self.jobs.lock());
        for job in jobs {
            if let Err(e) = job.await {
                warn!(error = %e, "watch job ended abnormally");
            }
        }
        info!("cache watchers stopped");
    }

    /// Current state of every started watcher.
    pub fn watch_states(&self) -> Vec<(EntityKind, WatchState)> {
        self.states
            .lock()
            .iter()
            .map(|(kind, rx)| (*kind, *rx.borrow()))
            .collect()
    }

    pub fn stats(&self) -> CacheStats {
        let stores = &self.stores;
        CacheStats {
            users: stores.len(EntityKind::User),
            roles: stores.len(EntityKind::Role),
            spaces: stores.len(EntityKind::Space),
            partitions: stores.len(EntityKind::Partition),
            servers: stores.len(EntityKind::Server),
            aliases: stores.len(EntityKind::Alias),
            reloads_in_flight: self.reloads.inflight(),
            dropped_space_events: stores.dropped_space_events.load(Ordering::Relaxed),
        }
    }

    // ── Lookups ────────────────────────────────────────────────────

    pub async fn user_by_cache(&self, name: &str) -> CacheResult<Arc<User>> {
        let (source, stores, key) = (self.source.clone(), self.stores.clone(), name.to_string());
        self.by_cache(
            EntityKind::User,
            name,
            ReloadMode::Inline,
            || self.stores.users.get(name),
            async move {
                if stores.users.contains(&key) {
                    return Ok(());
                }
                let user = source.query_user(&key).await.map_err(fetch_err(EntityKind::User, &key))?;
                fill(stores.users.add(key, user))
            },
        )
        .await
    }

    pub async fn role_by_cache(&self, name: &str) -> CacheResult<Arc<Role>> {
        let (source, stores, key) = (self.source.clone(), self.stores.clone(), name.to_string());
        self.by_cache(
            EntityKind::Role,
            name,
            ReloadMode::Inline,
            || self.stores.roles.get(name),
            async move {
                if stores.roles.contains(&key) {
                    return Ok(());
                }
                let role = source.query_role(&key).await.map_err(fetch_err(EntityKind::Role, &key))?;
                fill(stores.roles.add(key, role))
            },
        )
        .await
    }

    pub async fn alias_by_cache(&self, name: &str) -> CacheResult<Arc<Alias>> {
        let (source, stores, key) = (self.source.clone(), self.stores.clone(), name.to_string());
        self.by_cache(
            EntityKind::Alias,
            name,
            ReloadMode::Inline,
            || self.stores.aliases.get(name),
            async move {
                if stores.aliases.contains(&key) {
                    return Ok(());
                }
                let alias = source
                    .query_alias(&key)
                    .await
                    .map_err(fetch_err(EntityKind::Alias, &key))?;
                fill(stores.aliases.add(key, alias))
            },
        )
        .await
    }

    pub async fn space_by_cache(&self, db_name: &str, space_name: &str) -> CacheResult<Arc<Space>> {
        let key = space_cache_key(db_name, space_name);
        let (source, stores) = (self.source.clone(), self.stores.clone());
        let resource = self.config.resource_name.clone();
        let (db, name, cache_key) = (db_name.to_string(), space_name.to_string(), key.clone());
        self.by_cache(
            EntityKind::Space,
            &key,
            ReloadMode::Inline,
            || self.stores.spaces.get(&key),
            async move {
                if stores.spaces.get(&cache_key).is_some() {
                    return Ok(());
                }
                let fetch = fetch_err(EntityKind::Space, &cache_key);
                let db_id = source.query_db_name_to_id(&db).await.map_err(&fetch)?;
                let space = source.query_space_by_name(db_id, &name).await.map_err(&fetch)?;
                if space.resource_name != resource {
                    return Err(CacheError::not_found(EntityKind::Space, cache_key));
                }
                stores.spaces.upsert(cache_key, space);
                Ok(())
            },
        )
        .await
    }

    /// Cached space by numeric id. Never reloads: the id alone does not
    /// name the database.
    pub fn space_by_id_cache(&self, space_id: SpaceId) -> CacheResult<Arc<Space>> {
        self.stores
            .spaces
            .get_by_id(space_id)
            .ok_or_else(|| CacheError::not_found(EntityKind::Space, space_id.to_string()))
    }

    pub async fn partition_by_cache(
        &self,
        space_name: &str,
        partition_id: PartitionId,
    ) -> CacheResult<Arc<Partition>> {
        let key = partition_cache_key(space_name, partition_id);
        let (source, stores) = (self.source.clone(), self.stores.clone());
        let (name, cache_key) = (space_name.to_string(), key.clone());
        self.by_cache(
            EntityKind::Partition,
            &key,
            ReloadMode::Background,
            || self.stores.partitions.get(&key),
            async move {
                if stores.partitions.contains(&cache_key) {
                    return Ok(());
                }
                let fetch = fetch_err(EntityKind::Partition, &cache_key);
                let partition = source.query_partition(partition_id).await.map_err(&fetch)?;
                let space = source
                    .query_space_by_id(partition.db_id, partition.space_id)
                    .await
                    .map_err(&fetch)?;
                if space.name != name {
                    return Err(CacheError::not_found(EntityKind::Partition, cache_key));
                }
                stores
                    .partitions
                    .set_if(cache_key, partition, |old, new| new.update_time >= old.update_time);
                Ok(())
            },
        )
        .await
    }

    pub async fn server_by_cache(&self, node_id: NodeId) -> CacheResult<Arc<Server>> {
        let key = node_id.to_string();
        let (source, stores) = (self.source.clone(), self.stores.clone());
        let resource = self.config.resource_name.clone();
        let cache_key = key.clone();
        self.by_cache(
            EntityKind::Server,
            &key,
            ReloadMode::Background,
            || self.stores.servers.get(&key),
            async move {
                if stores.servers.contains(&cache_key) {
                    return Ok(());
                }
                let server = source
                    .query_server(node_id)
                    .await
                    .map_err(fetch_err(EntityKind::Server, &cache_key))?;
                if server.resource_name != resource {
                    return Err(CacheError::not_found(EntityKind::Server, cache_key));
                }
                fill(stores.servers.add(cache_key, server))
            },
        )
        .await
    }

    /// Drop a space from both indices. Returns whether it was cached.
    pub fn delete_space_cache(&self, db_name: &str, space_name: &str) -> bool {
        let key = space_cache_key(db_name, space_name);
        let removed = self.stores.spaces.remove(&key).is_some();
        debug!(%key, removed, "space cache invalidated");
        removed
    }

    async fn by_cache<T, G, F>(
        &self,
        kind: EntityKind,
        key: &str,
        mode: ReloadMode,
        lookup: G,
        reload: F,
    ) -> CacheResult<Arc<T>>
    where
        G: Fn() -> Option<Arc<T>>,
        F: Future<Output = CacheResult<()>> + Send + 'static,
    {
        if let Some(record) = lookup() {
            return Ok(record);
        }

        let reload = bounded(kind, key.to_string(), self.config.reload_timeout(), reload);
        match mode {
            ReloadMode::Inline => {
                self.reloads.reload_now(kind, key, reload).await?;
            }
            ReloadMode::Background => {
                self.reloads.try_reload(kind, key, reload);
            }
        }

        let retries = self.config.retry_count;
        let interval = self.config.retry_interval();
        for attempt in 0..=retries {
            if let Some(record) = lookup() {
                return Ok(record);
            }
            if attempt < retries {
                tokio::time::sleep(interval).await;
            }
        }
        debug!(%kind, %key, retries, "cache miss after retries");
        Err(CacheError::not_found(kind, key))
    }
}

/// Bound a reload by `timeout`.
async fn bounded<F>(kind: EntityKind, key: String, timeout: Duration, reload: F) -> CacheResult<()>
where
    F: Future<Output = CacheResult<()>>,
{
    match tokio::time::timeout(timeout, reload).await {
        Ok(result) => result,
        Err(_) => Err(CacheError::Timeout { kind, key }),
    }
}

/// Absence in the source is `NotFound`; anything else is a failed fetch.
fn fetch_err(kind: EntityKind, key: &str) -> impl Fn(StateError) -> CacheError + use<> {
    let key = key.to_string();
    move |source| {
        if source.is_not_found() {
            CacheError::not_found(kind, key.clone())
        } else {
            CacheError::Fetch {
                kind,
                key: key.clone(),
                source,
            }
        }
    }
}

/// A reload racing the watcher may find the key already filled; the
/// watcher's copy is at least as recent.
fn fill(result: CacheResult<()>) -> CacheResult<()> {
    match result {
        Err(CacheError::Duplicate { .. }) => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use metacache_state::keys;
    use metacache_state::{Db, KeyValue, MetaLock, StateResult, StateStore, WatchStream, put_json};

    /// Delegates to a `StateStore`, counting point reads per key and
    /// slowing them down so concurrent misses overlap.
    struct CountingSource {
        inner: StateStore,
        gets: Mutex<Vec<String>>,
        delay: Duration,
    }

    impl CountingSource {
        fn new(inner: StateStore) -> Self {
            Self {
                inner,
                gets: Mutex::new(Vec::new()),
                delay: Duration::from_millis(50),
            }
        }

        fn gets_of(&self, key: &str) -> usize {
            self.gets.lock().iter().filter(|k| *k == key).count()
        }
    }

    #[async_trait]
    impl MetaSource for CountingSource {
        async fn get(&self, key: &str) -> StateResult<Option<Vec<u8>>> {
            self.gets.lock().push(key.to_string());
            tokio::time::sleep(self.delay).await;
            self.inner.get(key).await
        }

        async fn put(&self, key: &str, value: &[u8]) -> StateResult<u64> {
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

    fn fast_config() -> CacheConfig {
        CacheConfig {
            retry_count: 10,
            retry_interval: "20ms".to_string(),
            ..CacheConfig::default()
        }
    }

    fn server(id: NodeId, resource: &str) -> Server {
        Server {
            id,
            ip: "127.0.0.1".to_string(),
            rpc_port: 1,
            resource_name: resource.to_string(),
            partition_ids: vec![1],
        }
    }

    async fn seeded() -> StateStore {
        let store = StateStore::open_in_memory().unwrap();
        put_json(&store, &keys::db_body_key(1), &Db { id: 1, name: "db1".into() })
            .await
            .unwrap();
        store.put_raw(&keys::db_name_key("db1"), b"1").unwrap();
        let space = Space {
            id: 7,
            name: "ts".into(),
            db_id: 1,
            version: 1,
            resource_name: "default".into(),
            partition_num: 1,
            replica_num: 1,
            partitions: vec![3],
        };
        put_json(&store, &keys::space_key(1, 7), &space).await.unwrap();
        let partition = Partition {
            id: 3,
            space_id: 7,
            db_id: 1,
            leader_id: 1,
            replicas: vec![1],
            update_time: 1,
        };
        put_json(&store, &keys::partition_key(3), &partition).await.unwrap();
        put_json(&store, &keys::server_key(7), &server(7, "default")).await.unwrap();
        put_json(&store, &keys::server_key(8), &server(8, "gpu")).await.unwrap();
        store
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_server_misses_fetch_once() {
        let source = Arc::new(CountingSource::new(seeded().await));
        let cache = Arc::new(ClientCache::new(source.clone(), fast_config()));

        let mut handles = Vec::new();
        for _ in 0..50 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move { cache.server_by_cache(7).await }));
        }
        for handle in handles {
            let server = handle.await.unwrap().unwrap();
            assert_eq!(server.id, 7);
        }
        assert_eq!(source.gets_of("/server/7"), 1);
    }

    #[tokio::test]
    async fn inline_miss_surfaces_not_found_immediately() {
        let cache = ClientCache::new(Arc::new(seeded().await), fast_config());
        let err = cache.space_by_cache("db1", "missing").await.unwrap_err();
        assert!(matches!(err, CacheError::NotFound { kind: EntityKind::Space, .. }));
    }

    #[tokio::test]
    async fn missing_named_records_are_typed_not_found() {
        let cache = ClientCache::new(Arc::new(StateStore::open_in_memory().unwrap()), fast_config());
        let err = cache.user_by_cache("nobody").await.unwrap_err();
        assert!(matches!(err, CacheError::NotFound { kind: EntityKind::User, ref key } if key == "nobody"));
        let err = cache.role_by_cache("nobody").await.unwrap_err();
        assert!(matches!(err, CacheError::NotFound { kind: EntityKind::Role, .. }));
        let err = cache.alias_by_cache("nobody").await.unwrap_err();
        assert!(matches!(err, CacheError::NotFound { kind: EntityKind::Alias, .. }));
    }

    #[test]
    fn fetch_err_keeps_transport_failures() {
        let map = fetch_err(EntityKind::Server, "7");
        assert!(matches!(
            map(StateError::NotFound("/server/7".into())),
            CacheError::NotFound { kind: EntityKind::Server, .. }
        ));
        assert!(matches!(
            map(StateError::Deserialize("bad".into())),
            CacheError::Fetch { kind: EntityKind::Server, .. }
        ));
    }

    #[tokio::test]
    async fn space_reload_fills_both_indices() {
        let cache = ClientCache::new(Arc::new(seeded().await), fast_config());
        let space = cache.space_by_cache("db1", "ts").await.unwrap();
        assert_eq!(space.id, 7);
        let by_id = cache.space_by_id_cache(7).unwrap();
        assert!(Arc::ptr_eq(&space, &by_id));

        assert!(cache.delete_space_cache("db1", "ts"));
        assert!(cache.space_by_id_cache(7).is_err());
    }

    #[tokio::test]
    async fn partition_reload_resolves_space_name() {
        let cache = ClientCache::new(Arc::new(seeded().await), fast_config());
        let partition = cache.partition_by_cache("ts", 3).await.unwrap();
        assert_eq!(partition.space_id, 7);

        let err = cache.partition_by_cache("other", 3).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn foreign_resource_server_is_not_cached() {
        let cache = ClientCache::new(Arc::new(seeded().await), fast_config());
        let err = cache.server_by_cache(8).await.unwrap_err();
        assert!(matches!(err, CacheError::NotFound { kind: EntityKind::Server, .. }));
        assert_eq!(cache.stats().servers, 0);
    }

    #[tokio::test]
    async fn start_loads_and_watches_then_stops() {
        let store = seeded().await;
        let cache = ClientCache::new(Arc::new(store.clone()), fast_config());
        cache.start().await.unwrap();

        let stats = cache.stats();
        assert_eq!(stats.spaces, 1);
        assert_eq!(stats.partitions, 1);
        assert_eq!(stats.servers, 1);

        put_json(
            &store,
            &keys::alias_key("a"),
            &Alias {
                name: "a".into(),
                db_name: "db1".into(),
                space_name: "ts".into(),
            },
        )
        .await
        .unwrap();
        let alias = cache.alias_by_cache("a").await.unwrap();
        assert_eq!(alias.space_name, "ts");

        cache.stop().await;
        assert!(
            cache
                .watch_states()
                .iter()
                .all(|(_, state)| *state == WatchState::Stopped)
        );
        // Records stay readable after stop.
        assert!(cache.server_by_cache(7).await.is_ok());
    }

    #[tokio::test]
    async fn slow_reload_times_out() {
        let mut source = CountingSource::new(seeded().await);
        source.delay = Duration::from_millis(500);
        let config = CacheConfig {
            reload_timeout: "50ms".to_string(),
            ..fast_config()
        };
        let cache = ClientCache::new(Arc::new(source), config);
        let err = cache.user_by_cache("nobody").await.unwrap_err();
        assert!(matches!(err, CacheError::Timeout { kind: EntityKind::User, .. }));
    }

    #[test]
    fn fill_ignores_duplicates_only() {
        assert!(fill(Err(CacheError::Duplicate { kind: EntityKind::User, key: "a".into() })).is_ok());
        assert!(fill(Err(CacheError::not_found(EntityKind::User, "a"))).is_err());
    }

    #[test]
    fn cache_is_shareable_across_tasks() {
        fn check<T: Send + Sync>() {}
        check::<ClientCache>();
    }
}
