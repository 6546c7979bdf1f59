//! Per-kind watch handlers.
//!
//! Each handler turns raw change events of one prefix into store writes.
//! Users, roles and aliases are keyed by their own name. Spaces and
//! partitions need a cross reference resolved through the gateway to build
//! their composite key. Server events also drive the fail-server
//! coordinator.

use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use metacache_state::keys::{last_segment, last_two_segments};
use metacache_state::{
    Alias, DbId, KeyValue, MetaSource, NodeId, Partition, PartitionId, Role, Server, Space,
    SpaceId, User,
};

use crate::error::{CacheError, CacheResult};
use crate::failserver::FailServerCoordinator;
use crate::kind::EntityKind;
use crate::store::{CacheStores, EntityStore, partition_cache_key, space_cache_key};
use crate::watcher::{LoadMode, LoadStats, WatchHandler};

/// Pause between db-name lookups for one space event.
const RESOLVE_PAUSE: Duration = Duration::from_millis(50);

fn decode<T: DeserializeOwned>(kind: EntityKind, value: &[u8]) -> CacheResult<T> {
    serde_json::from_slice(value).map_err(|source| CacheError::Decode { kind, source })
}

/// Apply prepared records to a keyed store per `mode`. On resync, also
/// returns the cached entries the source no longer has.
fn load_into<T>(
    store: &EntityStore<T>,
    records: Vec<(String, T)>,
    mode: LoadMode,
    mut stats: LoadStats,
) -> (LoadStats, Vec<(String, Arc<T>)>) {
    let mut seen = HashSet::new();
    for (key, record) in records {
        match mode {
            LoadMode::Initial => match store.add(key, record) {
                Ok(()) => stats.loaded += 1,
                Err(e) => {
                    warn!(error = %e, "duplicate key in bulk load");
                    stats.duplicates += 1;
                }
            },
            LoadMode::Resync => {
                seen.insert(key.clone());
                store.set(key, record);
                stats.loaded += 1;
            }
        }
    }
    let mut evicted = Vec::new();
    if mode == LoadMode::Resync {
        evicted = store.retain(|key, _| seen.contains(key));
        stats.removed = evicted.len();
    }
    (stats, evicted)
}

// ── Name-keyed kinds ─────────────────────────────────────────────

/// A record cached under its own name.
pub trait NamedRecord: DeserializeOwned + Send + Sync + 'static {
    const KIND: EntityKind;

    fn name(&self) -> &str;

    fn store(stores: &CacheStores) -> &EntityStore<Self>;
}

impl NamedRecord for User {
    const KIND: EntityKind = EntityKind::User;

    fn name(&self) -> &str {
        &self.name
    }

    fn store(stores: &CacheStores) -> &EntityStore<Self> {
        &stores.users
    }
}

impl NamedRecord for Role {
    const KIND: EntityKind = EntityKind::Role;

    fn name(&self) -> &str {
        &self.name
    }

    fn store(stores: &CacheStores) -> &EntityStore<Self> {
        &stores.roles
    }
}

impl NamedRecord for Alias {
    const KIND: EntityKind = EntityKind::Alias;

    fn name(&self) -> &str {
        &self.name
    }

    fn store(stores: &CacheStores) -> &EntityStore<Self> {
        &stores.aliases
    }
}

/// Handler for users, roles and aliases.
pub struct NamedHandler<T> {
    stores: Arc<CacheStores>,
    _record: PhantomData<fn() -> T>,
}

impl<T: NamedRecord> NamedHandler<T> {
    pub fn new(stores: Arc<CacheStores>) -> Self {
        Self {
            stores,
            _record: PhantomData,
        }
    }
}

#[async_trait]
impl<T: NamedRecord> WatchHandler for NamedHandler<T> {
    fn kind(&self) -> EntityKind {
        T::KIND
    }

    async fn put(&self, value: &[u8]) -> CacheResult<()> {
        let record: T = decode(T::KIND, value)?;
        let key = record.name().to_string();
        T::store(&self.stores).set(key, record);
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        T::store(&self.stores).delete(last_segment(key));
        Ok(())
    }

    async fn load(&self, entries: Vec<KeyValue>, mode: LoadMode) -> LoadStats {
        let mut stats = LoadStats::default();
        let mut records = Vec::with_capacity(entries.len());
        for entry in entries {
            match decode::<T>(T::KIND, &entry.value) {
                Ok(record) => records.push((record.name().to_string(), record)),
                Err(e) => {
                    warn!(key = %entry.key, error = %e, "skipping undecodable record");
                    stats.skipped += 1;
                }
            }
        }
        load_into(T::store(&self.stores), records, mode, stats).0
    }
}

// ── Spaces ───────────────────────────────────────────────────────

pub struct SpaceHandler {
    stores: Arc<CacheStores>,
    source: Arc<dyn MetaSource>,
    resource_name: String,
    resolve_retries: u32,
}

impl SpaceHandler {
    pub fn new(
        stores: Arc<CacheStores>,
        source: Arc<dyn MetaSource>,
        resource_name: impl Into<String>,
        resolve_retries: u32,
    ) -> Self {
        Self {
            stores,
            source,
            resource_name: resource_name.into(),
            resolve_retries,
        }
    }

    /// Resolve a database name, retrying a few times: the database record
    /// may land after the space in another prefix's stream.
    async fn resolve_db_name(&self, db_id: DbId) -> CacheResult<String> {
        let attempts = self.resolve_retries.max(1);
        let mut reason = String::new();
        for attempt in 1..=attempts {
            match self.source.query_db_id_to_name(db_id).await {
                Ok(name) => return Ok(name),
                Err(e) => {
                    debug!(db_id, attempt, error = %e, "db name lookup failed");
                    reason = e.to_string();
                }
            }
            if attempt < attempts {
                tokio::time::sleep(RESOLVE_PAUSE).await;
            }
        }
        Err(CacheError::Unresolved {
            kind: EntityKind::Space,
            what: format!("db {db_id}"),
            reason,
        })
    }
}

#[async_trait]
impl WatchHandler for SpaceHandler {
    fn kind(&self) -> EntityKind {
        EntityKind::Space
    }

    async fn put(&self, value: &[u8]) -> CacheResult<()> {
        let space: Space = decode(EntityKind::Space, value)?;
        if space.resource_name != self.resource_name {
            debug!(space = %space.name, resource = %space.resource_name, "space outside resource scope");
            return Ok(());
        }
        let db_name = match self.resolve_db_name(space.db_id).await {
            Ok(name) => name,
            Err(e) => {
                // Dropped here; the next resync repairs the entry.
                self.stores.dropped_space_events.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };
        let key = space_cache_key(&db_name, &space.name);
        let version = space.version;
        if !self.stores.spaces.upsert(key.clone(), space) {
            debug!(%key, version, "stale space version ignored");
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        let ids = last_two_segments(key)
            .and_then(|(db, space)| Some((db.parse::<DbId>().ok()?, space.parse::<SpaceId>().ok()?)));
        let Some((db_id, space_id)) = ids else {
            return Err(CacheError::InvalidKey {
                kind: EntityKind::Space,
                key: key.to_string(),
            });
        };
        if let Some((cache_key, _)) = self.stores.spaces.remove_by_id(db_id, space_id) {
            debug!(%cache_key, space_id, "space removed");
        }
        Ok(())
    }

    async fn load(&self, entries: Vec<KeyValue>, mode: LoadMode) -> LoadStats {
        let mut stats = LoadStats::default();
        let mut db_names: HashMap<DbId, Option<String>> = HashMap::new();
        let mut seen = HashSet::new();

        for entry in entries {
            let space: Space = match decode(EntityKind::Space, &entry.value) {
                Ok(space) => space,
                Err(e) => {
                    warn!(key = %entry.key, error = %e, "skipping undecodable space");
                    stats.skipped += 1;
                    continue;
                }
            };
            if space.resource_name != self.resource_name {
                stats.skipped += 1;
                continue;
            }
            let db_name = match db_names.get(&space.db_id) {
                Some(name) => name.clone(),
                None => {
                    let name = match self.source.query_db_id_to_name(space.db_id).await {
                        Ok(name) => Some(name),
                        Err(e) => {
                            warn!(db_id = space.db_id, error = %e, "cannot resolve db name");
                            None
                        }
                    };
                    db_names.insert(space.db_id, name.clone());
                    name
                }
            };
            let Some(db_name) = db_name else {
                // Still in the source: keep whatever the cache holds for it.
                if mode == LoadMode::Resync {
                    if let Some(cached) = self.stores.spaces.key_of(space.id) {
                        seen.insert(cached);
                    }
                }
                stats.skipped += 1;
                continue;
            };

            let key = space_cache_key(&db_name, &space.name);
            match mode {
                LoadMode::Initial => match self.stores.spaces.add(key, space) {
                    Ok(()) => stats.loaded += 1,
                    Err(e) => {
                        warn!(error = %e, "duplicate key in bulk load");
                        stats.duplicates += 1;
                    }
                },
                LoadMode::Resync => {
                    seen.insert(key.clone());
                    self.stores.spaces.upsert(key, space);
                    stats.loaded += 1;
                }
            }
        }
        if mode == LoadMode::Resync {
            stats.removed = self.stores.spaces.retain_keys(&seen);
        }
        stats
    }
}

// ── Partitions ───────────────────────────────────────────────────

pub struct PartitionHandler {
    stores: Arc<CacheStores>,
    source: Arc<dyn MetaSource>,
}

impl PartitionHandler {
    pub fn new(stores: Arc<CacheStores>, source: Arc<dyn MetaSource>) -> Self {
        Self { stores, source }
    }

    async fn space_name(&self, partition: &Partition) -> CacheResult<String> {
        self.source
            .query_space_by_id(partition.db_id, partition.space_id)
            .await
            .map(|space| space.name)
            .map_err(|e| CacheError::Unresolved {
                kind: EntityKind::Partition,
                what: format!("space {}", partition.space_id),
                reason: e.to_string(),
            })
    }
}

/// Newest `update_time` wins.
fn is_newer(old: &Partition, new: &Partition) -> bool {
    new.update_time >= old.update_time
}

#[async_trait]
impl WatchHandler for PartitionHandler {
    fn kind(&self) -> EntityKind {
        EntityKind::Partition
    }

    async fn put(&self, value: &[u8]) -> CacheResult<()> {
        let partition: Partition = decode(EntityKind::Partition, value)?;
        let space_name = self.space_name(&partition).await?;
        let key = partition_cache_key(&space_name, partition.id);
        let update_time = partition.update_time;
        if !self.stores.partitions.set_if(key.clone(), partition, is_newer) {
            debug!(%key, update_time, "stale partition ignored");
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        let Ok(pid) = last_segment(key).parse::<PartitionId>() else {
            return Err(CacheError::InvalidKey {
                kind: EntityKind::Partition,
                key: key.to_string(),
            });
        };
        let suffix = format!("/{pid}");
        let removed = self.stores.partitions.retain(|k, _| !k.ends_with(&suffix)).len();
        debug!(pid, removed, "partition removed");
        Ok(())
    }

    async fn load(&self, entries: Vec<KeyValue>, mode: LoadMode) -> LoadStats {
        let mut stats = LoadStats::default();
        let mut space_names: HashMap<(DbId, SpaceId), Option<String>> = HashMap::new();
        let mut records = Vec::with_capacity(entries.len());

        for entry in entries {
            let partition: Partition = match decode(EntityKind::Partition, &entry.value) {
                Ok(partition) => partition,
                Err(e) => {
                    warn!(key = %entry.key, error = %e, "skipping undecodable partition");
                    stats.skipped += 1;
                    continue;
                }
            };
            let space_key = (partition.db_id, partition.space_id);
            let name = match space_names.get(&space_key) {
                Some(name) => name.clone(),
                None => {
                    let name = match self.space_name(&partition).await {
                        Ok(name) => Some(name),
                        Err(e) => {
                            warn!(pid = partition.id, error = %e, "skipping partition");
                            None
                        }
                    };
                    space_names.insert(space_key, name.clone());
                    name
                }
            };
            match name {
                Some(name) => records.push((partition_cache_key(&name, partition.id), partition)),
                None => stats.skipped += 1,
            }
        }
        load_into(&self.stores.partitions, records, mode, stats).0
    }
}

// ── Servers ──────────────────────────────────────────────────────

pub struct ServerHandler {
    stores: Arc<CacheStores>,
    resource_name: String,
    failserver: Arc<FailServerCoordinator>,
}

impl ServerHandler {
    pub fn new(
        stores: Arc<CacheStores>,
        resource_name: impl Into<String>,
        failserver: Arc<FailServerCoordinator>,
    ) -> Self {
        Self {
            stores,
            resource_name: resource_name.into(),
            failserver,
        }
    }
}

/// Node id of a `/server/<id>` key. Zero is not a valid id.
fn parse_node_id(key: &str) -> Option<NodeId> {
    last_segment(key)
        .parse::<NodeId>()
        .ok()
        .filter(|id| *id != 0)
}

#[async_trait]
impl WatchHandler for ServerHandler {
    fn kind(&self) -> EntityKind {
        EntityKind::Server
    }

    async fn put(&self, value: &[u8]) -> CacheResult<()> {
        let server: Server = decode(EntityKind::Server, value)?;
        if server.resource_name != self.resource_name {
            debug!(node_id = server.id, resource = %server.resource_name, "server outside resource scope");
            return Ok(());
        }
        let server = Arc::new(server);
        let previous = self
            .stores
            .servers
            .set(server.id.to_string(), Arc::clone(&server));
        if let Some(previous) = previous {
            if previous.rpc_addr() != server.rpc_addr() {
                info!(
                    node_id = server.id,
                    old = %previous.rpc_addr(),
                    new = %server.rpc_addr(),
                    "server address changed"
                );
            }
        }
        self.failserver.on_server_registered(&server).await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        let Some(node_id) = parse_node_id(key) else {
            return Err(CacheError::InvalidKey {
                kind: EntityKind::Server,
                key: key.to_string(),
            });
        };
        let last_known = self.stores.servers.delete(&node_id.to_string());
        info!(node_id, cached = last_known.is_some(), "server registration removed");
        self.failserver.on_server_removed(node_id, last_known).await;
        Ok(())
    }

    async fn load(&self, entries: Vec<KeyValue>, mode: LoadMode) -> LoadStats {
        let mut stats = LoadStats::default();
        let mut records = Vec::with_capacity(entries.len());
        for entry in entries {
            match decode::<Server>(EntityKind::Server, &entry.value) {
                Ok(server) if server.resource_name == self.resource_name => {
                    records.push((server.id.to_string(), server));
                }
                Ok(_) => stats.skipped += 1,
                Err(e) => {
                    warn!(key = %entry.key, error = %e, "skipping undecodable server");
                    stats.skipped += 1;
                }
            }
        }
        let (stats, evicted) = load_into(&self.stores.servers, records, mode, stats);
        // Deregistrations that happened while the stream was down.
        for (key, last_known) in evicted {
            let Some(node_id) = parse_node_id(&key) else {
                continue;
            };
            info!(node_id, "server missing after resync");
            self.failserver.on_server_removed(node_id, Some(last_known)).await;
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use metacache_health::LivenessProbe;
    use metacache_state::keys::{self, fail_server_key};
    use metacache_state::{Db, StateStore, put_json};

    struct DeadProbe;

    #[async_trait]
    impl LivenessProbe for DeadProbe {
        async fn is_alive(&self, _server: &Server) -> bool {
            false
        }
    }

    fn space(id: SpaceId, name: &str, version: u64, resource: &str) -> Space {
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

    async fn source_with_db() -> StateStore {
        let store = StateStore::open_in_memory().unwrap();
        put_json(&store, &keys::db_body_key(1), &Db { id: 1, name: "db1".into() })
            .await
            .unwrap();
        store
    }

    fn json<T: serde::Serialize>(value: &T) -> Vec<u8> {
        serde_json::to_vec(value).unwrap()
    }

    #[tokio::test]
    async fn named_put_and_delete() {
        let stores = Arc::new(CacheStores::new());
        let handler = NamedHandler::<User>::new(stores.clone());
        let user = User {
            name: "alice".into(),
            password: None,
            role_name: "admin".into(),
        };
        handler.put(&json(&user)).await.unwrap();
        assert_eq!(stores.users.get("alice").unwrap().role_name, "admin");

        handler.delete("/user/alice").await.unwrap();
        assert!(stores.users.get("alice").is_none());
    }

    #[tokio::test]
    async fn named_put_rejects_garbage() {
        let stores = Arc::new(CacheStores::new());
        let handler = NamedHandler::<Alias>::new(stores);
        let err = handler.put(b"{oops").await.unwrap_err();
        assert!(matches!(err, CacheError::Decode { kind: EntityKind::Alias, .. }));
    }

    #[tokio::test]
    async fn named_load_counts_duplicates_and_resync_removes() {
        let stores = Arc::new(CacheStores::new());
        let handler = NamedHandler::<Role>::new(stores.clone());
        let role = |name: &str| Role {
            name: name.into(),
            privileges: Default::default(),
        };
        let kv = |key: &str, role: &Role| KeyValue {
            key: key.into(),
            value: json(role),
            mod_revision: 1,
        };

        let stats = handler
            .load(
                vec![kv("/role/a", &role("a")), kv("/role/a2", &role("a")), kv("/role/b", &role("b"))],
                LoadMode::Initial,
            )
            .await;
        assert_eq!((stats.loaded, stats.duplicates), (2, 1));

        let stats = handler.load(vec![kv("/role/b", &role("b"))], LoadMode::Resync).await;
        assert_eq!(stats.removed, 1);
        assert!(stores.roles.get("a").is_none());
        assert!(stores.roles.get("b").is_some());
    }

    #[tokio::test]
    async fn space_put_indexes_both_ways_and_filters_resource() {
        let source = source_with_db().await;
        let stores = Arc::new(CacheStores::new());
        let handler = SpaceHandler::new(stores.clone(), Arc::new(source), "default", 1);

        handler.put(&json(&space(7, "ts", 1, "default"))).await.unwrap();
        handler.put(&json(&space(8, "other", 1, "gpu"))).await.unwrap();

        assert_eq!(stores.spaces.get("db1/ts").unwrap().id, 7);
        assert_eq!(stores.spaces.get_by_id(7).unwrap().name, "ts");
        assert!(stores.spaces.get_by_id(8).is_none());
    }

    #[tokio::test]
    async fn space_versions_win_regardless_of_order() {
        let source = source_with_db().await;
        let stores = Arc::new(CacheStores::new());
        let handler = SpaceHandler::new(stores.clone(), Arc::new(source), "default", 1);

        let mut v2 = space(7, "ts", 2, "default");
        v2.partition_num = 8;
        handler.put(&json(&v2)).await.unwrap();
        handler.put(&json(&space(7, "ts", 1, "default"))).await.unwrap();

        assert_eq!(stores.spaces.get("db1/ts").unwrap().partition_num, 8);
    }

    #[tokio::test]
    async fn unresolvable_space_is_dropped_and_counted() {
        let source = StateStore::open_in_memory().unwrap();
        let stores = Arc::new(CacheStores::new());
        let handler = SpaceHandler::new(stores.clone(), Arc::new(source), "default", 2);

        let err = handler.put(&json(&space(7, "ts", 1, "default"))).await.unwrap_err();
        assert!(matches!(err, CacheError::Unresolved { .. }));
        assert_eq!(stores.dropped_space_events.load(Ordering::Relaxed), 1);
        assert!(stores.spaces.is_empty());
    }

    #[tokio::test]
    async fn space_resync_keeps_entry_with_unresolvable_db() {
        let source = source_with_db().await;
        let stores = Arc::new(CacheStores::new());
        let handler = SpaceHandler::new(stores.clone(), Arc::new(source.clone()), "default", 1);
        handler.put(&json(&space(7, "ts", 1, "default"))).await.unwrap();
        handler.put(&json(&space(8, "gone", 1, "default"))).await.unwrap();

        source.put_raw(&keys::db_body_key(1), b"{broken").unwrap();
        let entries = vec![KeyValue {
            key: keys::space_key(1, 7),
            value: json(&space(7, "ts", 1, "default")),
            mod_revision: 5,
        }];
        let stats = handler.load(entries, LoadMode::Resync).await;

        assert_eq!((stats.skipped, stats.removed), (1, 1));
        assert_eq!(stores.spaces.get("db1/ts").unwrap().id, 7);
        assert!(stores.spaces.get_by_id(8).is_none());
    }

    #[tokio::test]
    async fn space_delete_uses_id_key() {
        let source = source_with_db().await;
        let stores = Arc::new(CacheStores::new());
        let handler = SpaceHandler::new(stores.clone(), Arc::new(source), "default", 1);
        handler.put(&json(&space(7, "ts", 1, "default"))).await.unwrap();

        handler.delete("/space/1/7").await.unwrap();
        assert!(stores.spaces.get("db1/ts").is_none());
        assert!(stores.spaces.get_by_id(7).is_none());

        assert!(handler.delete("/space/x").await.is_err());
    }

    #[tokio::test]
    async fn partition_keeps_newest_update_time() {
        let source = source_with_db().await;
        put_json(&source, &keys::space_key(1, 7), &space(7, "ts", 1, "default"))
            .await
            .unwrap();
        let stores = Arc::new(CacheStores::new());
        let handler = PartitionHandler::new(stores.clone(), Arc::new(source));

        let partition = |update_time, leader_id| Partition {
            id: 3,
            space_id: 7,
            db_id: 1,
            leader_id,
            replicas: vec![1, 2],
            update_time,
        };
        handler.put(&json(&partition(200, 2))).await.unwrap();
        handler.put(&json(&partition(100, 1))).await.unwrap();
        assert_eq!(stores.partitions.get("ts/3").unwrap().leader_id, 2);

        handler.delete("/partition/3").await.unwrap();
        assert!(stores.partitions.is_empty());
    }

    #[tokio::test]
    async fn server_delete_records_failure_and_rejects_bad_keys() {
        let source = Arc::new(StateStore::open_in_memory().unwrap());
        let stores = Arc::new(CacheStores::new());
        let coordinator = Arc::new(FailServerCoordinator::new(
            source.clone(),
            Arc::new(DeadProbe),
            Duration::from_secs(60),
        ));
        let handler = ServerHandler::new(stores.clone(), "default", coordinator);

        let server = Server {
            id: 5,
            ip: "127.0.0.1".into(),
            rpc_port: 1,
            resource_name: "default".into(),
            partition_ids: vec![1],
        };
        handler.put(&json(&server)).await.unwrap();
        assert!(stores.servers.get("5").is_some());

        handler.delete("/server/5").await.unwrap();
        assert!(stores.servers.get("5").is_none());
        assert!(source.get_raw(&fail_server_key(5)).unwrap().is_some());

        assert!(handler.delete("/server/0").await.is_err());
        assert!(handler.delete("/server/abc").await.is_err());
    }
}
