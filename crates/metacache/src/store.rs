//! In-memory entity stores.
//!
//! [`EntityStore`] is a concurrent key → record map with no expiry and no
//! eviction. Records are held as `Arc` snapshots; writers replace the whole
//! record and readers never observe a partial update.
//!
//! [`SpaceStore`] keeps spaces under two indices, the composite
//! `"<db>/<space>"` name and the numeric space id. Both live behind one
//! lock so every mutation updates them together.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use parking_lot::RwLock;

use metacache_state::{Alias, DbId, Partition, Role, Server, Space, SpaceId, User};

use crate::error::{CacheError, CacheResult};
use crate::kind::EntityKind;

/// Concurrent map of one entity kind.
pub struct EntityStore<T> {
    kind: EntityKind,
    entries: RwLock<HashMap<String, Arc<T>>>,
}

impl<T> EntityStore<T> {
    pub fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn get(&self, key: &str) -> Option<Arc<T>> {
        self.entries.read().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.read().contains_key(key)
    }

    /// Insert or replace. Returns the previous record.
    pub fn set(&self, key: impl Into<String>, value: impl Into<Arc<T>>) -> Option<Arc<T>> {
        self.entries.write().insert(key.into(), value.into())
    }

    /// Insert unless a record already present is preferred over `value`.
    ///
    /// `accept(old, new)` runs under the write lock, so the check and the
    /// write are atomic with respect to other writers.
    pub fn set_if<F>(&self, key: impl Into<String>, value: impl Into<Arc<T>>, accept: F) -> bool
    where
        F: FnOnce(&T, &T) -> bool,
    {
        let key = key.into();
        let value = value.into();
        let mut entries = self.entries.write();
        if let Some(old) = entries.get(&key) {
            if !accept(old, &value) {
                return false;
            }
        }
        entries.insert(key, value);
        true
    }

    /// Insert a record that must not exist yet. Used by bulk load to surface
    /// duplicate keys in the source.
    pub fn add(&self, key: impl Into<String>, value: impl Into<Arc<T>>) -> CacheResult<()> {
        let key = key.into();
        let mut entries = self.entries.write();
        if entries.contains_key(&key) {
            return Err(CacheError::Duplicate {
                kind: self.kind,
                key,
            });
        }
        entries.insert(key, value.into());
        Ok(())
    }

    pub fn delete(&self, key: &str) -> Option<Arc<T>> {
        self.entries.write().remove(key)
    }

    /// Snapshot of every entry at call time.
    pub fn items(&self) -> Vec<(String, Arc<T>)> {
        self.entries
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect()
    }

    /// Keep only entries for which `keep` returns true. Returns the evicted
    /// entries.
    pub fn retain<F>(&self, mut keep: F) -> Vec<(String, Arc<T>)>
    where
        F: FnMut(&str, &T) -> bool,
    {
        let mut entries = self.entries.write();
        let evicted: Vec<String> = entries
            .iter()
            .filter(|(k, v)| !keep(k, v))
            .map(|(k, _)| k.clone())
            .collect();
        evicted
            .into_iter()
            .filter_map(|k| entries.remove(&k).map(|v| (k, v)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// Composite cache key of a space: `"<db_name>/<space_name>"`.
pub fn space_cache_key(db_name: &str, space_name: &str) -> String {
    format!("{db_name}/{space_name}")
}

/// Composite cache key of a partition: `"<space_name>/<partition_id>"`.
pub fn partition_cache_key(space_name: &str, partition_id: u32) -> String {
    format!("{space_name}/{partition_id}")
}

#[derive(Default)]
struct SpaceIndex {
    by_name: HashMap<String, Arc<Space>>,
    /// Secondary index: space id → (composite key, record).
    by_id: HashMap<SpaceId, (String, Arc<Space>)>,
}

impl SpaceIndex {
    fn insert(&mut self, key: String, space: Arc<Space>) {
        // A different space previously under this name loses its id entry.
        if let Some(prev) = self.by_name.get(&key) {
            if prev.id != space.id {
                self.by_id.remove(&prev.id);
            }
        }
        // A renamed space loses its old name entry.
        if let Some((old_key, _)) = self.by_id.get(&space.id) {
            if *old_key != key {
                self.by_name.remove(old_key);
            }
        }
        self.by_id.insert(space.id, (key.clone(), Arc::clone(&space)));
        self.by_name.insert(key, space);
    }

    fn remove_key(&mut self, key: &str) -> Option<Arc<Space>> {
        let space = self.by_name.remove(key)?;
        if matches!(self.by_id.get(&space.id), Some((k, _)) if k == key) {
            self.by_id.remove(&space.id);
        }
        Some(space)
    }
}

/// Dual-indexed space store.
#[derive(Default)]
pub struct SpaceStore {
    index: RwLock<SpaceIndex>,
}

impl SpaceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Arc<Space>> {
        self.index.read().by_name.get(key).cloned()
    }

    pub fn get_by_id(&self, space_id: SpaceId) -> Option<Arc<Space>> {
        self.index
            .read()
            .by_id
            .get(&space_id)
            .map(|(_, space)| Arc::clone(space))
    }

    /// Composite key a space id is cached under.
    pub fn key_of(&self, space_id: SpaceId) -> Option<String> {
        self.index.read().by_id.get(&space_id).map(|(k, _)| k.clone())
    }

    /// Insert or replace unless the cached copy of the same space carries a
    /// higher version. Returns whether the write was applied.
    pub fn upsert(&self, key: impl Into<String>, space: impl Into<Arc<Space>>) -> bool {
        let key = key.into();
        let space = space.into();
        let mut index = self.index.write();
        if let Some((_, current)) = index.by_id.get(&space.id) {
            if space.version < current.version {
                return false;
            }
        }
        index.insert(key, space);
        true
    }

    /// Bulk-load insert; fails if the key or id is already present.
    pub fn add(&self, key: impl Into<String>, space: impl Into<Arc<Space>>) -> CacheResult<()> {
        let key = key.into();
        let space = space.into();
        let mut index = self.index.write();
        if index.by_name.contains_key(&key) || index.by_id.contains_key(&space.id) {
            return Err(CacheError::Duplicate {
                kind: EntityKind::Space,
                key,
            });
        }
        index.insert(key, space);
        Ok(())
    }

    /// Remove by composite key from both indices.
    pub fn remove(&self, key: &str) -> Option<Arc<Space>> {
        self.index.write().remove_key(key)
    }

    /// Remove by id from both indices. `db_id` must match the cached record.
    pub fn remove_by_id(&self, db_id: DbId, space_id: SpaceId) -> Option<(String, Arc<Space>)> {
        let mut index = self.index.write();
        let key = match index.by_id.get(&space_id) {
            Some((key, space)) if space.db_id == db_id => key.clone(),
            _ => return None,
        };
        index.remove_key(&key).map(|space| (key, space))
    }

    pub fn items(&self) -> Vec<(String, Arc<Space>)> {
        self.index
            .read()
            .by_name
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect()
    }

    /// Drop every space whose key is not in `keep`. Returns the number
    /// removed.
    pub fn retain_keys(&self, keep: &HashSet<String>) -> usize {
        let mut index = self.index.write();
        let stale: Vec<String> = index
            .by_name
            .keys()
            .filter(|k| !keep.contains(*k))
            .cloned()
            .collect();
        for key in &stale {
            index.remove_key(key);
        }
        stale.len()
    }

    pub fn len(&self) -> usize {
        self.index.read().by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Every store of one cache instance.
pub struct CacheStores {
    pub users: EntityStore<User>,
    pub roles: EntityStore<Role>,
    pub spaces: SpaceStore,
    /// Keyed by `"<space_name>/<partition_id>"`.
    pub partitions: EntityStore<Partition>,
    /// Keyed by the decimal node id.
    pub servers: EntityStore<Server>,
    pub aliases: EntityStore<Alias>,
    /// Space puts dropped because their database could not be resolved.
    pub dropped_space_events: AtomicU64,
}

impl CacheStores {
    pub fn new() -> Self {
        Self {
            users: EntityStore::new(EntityKind::User),
            roles: EntityStore::new(EntityKind::Role),
            spaces: SpaceStore::new(),
            partitions: EntityStore::new(EntityKind::Partition),
            servers: EntityStore::new(EntityKind::Server),
            aliases: EntityStore::new(EntityKind::Alias),
            dropped_space_events: AtomicU64::new(0),
        }
    }

    /// Entry count of one kind.
    pub fn len(&self, kind: EntityKind) -> usize {
        match kind {
            EntityKind::User => self.users.len(),
            EntityKind::Role => self.roles.len(),
            EntityKind::Space => self.spaces.len(),
            EntityKind::Partition => self.partitions.len(),
            EntityKind::Server => self.servers.len(),
            EntityKind::Alias => self.aliases.len(),
        }
    }
}

impl Default for CacheStores {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space(id: SpaceId, name: &str, version: u64) -> Space {
        Space {
            id,
            name: name.to_string(),
            db_id: 1,
            version,
            resource_name: "default".to_string(),
            partition_num: 1,
            replica_num: 1,
            partitions: vec![],
        }
    }

    // ── EntityStore ────────────────────────────────────────────────

    #[test]
    fn set_get_delete() {
        let store = EntityStore::<String>::new(EntityKind::User);
        assert!(store.get("alice").is_none());

        assert!(store.set("alice", "v1".to_string()).is_none());
        let prev = store.set("alice", "v2".to_string());
        assert_eq!(prev.as_deref().map(String::as_str), Some("v1"));
        assert_eq!(store.get("alice").as_deref().map(String::as_str), Some("v2"));

        assert!(store.delete("alice").is_some());
        assert!(store.get("alice").is_none());
        assert!(store.delete("alice").is_none());
    }

    #[test]
    fn add_rejects_duplicates() {
        let store = EntityStore::<u32>::new(EntityKind::Role);
        store.add("admin", 1).unwrap();
        let err = store.add("admin", 2).unwrap_err();
        assert!(matches!(err, CacheError::Duplicate { kind: EntityKind::Role, .. }));
        assert_eq!(*store.get("admin").unwrap(), 1);
    }

    #[test]
    fn set_if_keeps_preferred_record() {
        let store = EntityStore::<i64>::new(EntityKind::Partition);
        assert!(store.set_if("ts/1", 10, |old, new| new > old));
        assert!(!store.set_if("ts/1", 5, |old, new| new > old));
        assert!(store.set_if("ts/1", 20, |old, new| new > old));
        assert_eq!(*store.get("ts/1").unwrap(), 20);
    }

    #[test]
    fn retain_returns_evicted_entries() {
        let store = EntityStore::<u32>::new(EntityKind::Server);
        for i in 0..5 {
            store.set(i.to_string(), i);
        }
        let mut removed = store.retain(|_, v| v % 2 == 0);
        removed.sort_by(|a, b| a.0.cmp(&b.0));
        let keys: Vec<&str> = removed.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["1", "3"]);
        assert_eq!(*removed[1].1, 3);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn items_is_snapshot_under_concurrent_writes() {
        let store = Arc::new(EntityStore::<u32>::new(EntityKind::Alias));
        let writer = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                for i in 0..1000u32 {
                    store.set(format!("k{}", i % 50), i);
                    if i % 3 == 0 {
                        store.delete(&format!("k{}", i % 50));
                    }
                }
            })
        };
        for _ in 0..100 {
            let items = store.items();
            assert!(items.len() <= 50);
        }
        writer.join().unwrap();
    }

    // ── SpaceStore ─────────────────────────────────────────────────

    #[test]
    fn both_indices_agree() {
        let store = SpaceStore::new();
        assert!(store.upsert("db1/ts", space(7, "ts", 1)));
        let by_name = store.get("db1/ts").unwrap();
        let by_id = store.get_by_id(7).unwrap();
        assert!(Arc::ptr_eq(&by_name, &by_id));
        assert_eq!(store.key_of(7).as_deref(), Some("db1/ts"));
    }

    #[test]
    fn upsert_rejects_lower_version() {
        let store = SpaceStore::new();
        assert!(store.upsert("db1/ts", space(7, "ts", 2)));
        assert!(!store.upsert("db1/ts", space(7, "ts", 1)));
        assert_eq!(store.get("db1/ts").unwrap().version, 2);
        assert_eq!(store.get_by_id(7).unwrap().version, 2);
    }

    #[test]
    fn rename_drops_old_name() {
        let store = SpaceStore::new();
        store.upsert("db1/old", space(7, "old", 1));
        store.upsert("db1/new", space(7, "new", 2));
        assert!(store.get("db1/old").is_none());
        assert_eq!(store.get_by_id(7).unwrap().name, "new");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn recreated_name_drops_old_id() {
        let store = SpaceStore::new();
        store.upsert("db1/ts", space(7, "ts", 3));
        store.upsert("db1/ts", space(8, "ts", 1));
        assert!(store.get_by_id(7).is_none());
        assert_eq!(store.get("db1/ts").unwrap().id, 8);
    }

    #[test]
    fn remove_by_id_clears_both() {
        let store = SpaceStore::new();
        store.upsert("db1/ts", space(7, "ts", 1));
        assert!(store.remove_by_id(2, 7).is_none());

        let (key, removed) = store.remove_by_id(1, 7).unwrap();
        assert_eq!(key, "db1/ts");
        assert_eq!(removed.id, 7);
        assert!(store.get("db1/ts").is_none());
        assert!(store.get_by_id(7).is_none());
    }

    #[test]
    fn remove_by_key_clears_both() {
        let store = SpaceStore::new();
        store.upsert("db1/ts", space(7, "ts", 1));
        assert!(store.remove("db1/ts").is_some());
        assert!(store.get_by_id(7).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn add_rejects_duplicate_name_or_id() {
        let store = SpaceStore::new();
        store.add("db1/a", space(1, "a", 1)).unwrap();
        assert!(store.add("db1/a", space(2, "a", 1)).is_err());
        assert!(store.add("db1/b", space(1, "b", 1)).is_err());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn retain_keys_drops_missing() {
        let store = SpaceStore::new();
        store.upsert("db1/a", space(1, "a", 1));
        store.upsert("db1/b", space(2, "b", 1));
        let keep: HashSet<String> = ["db1/a".to_string()].into_iter().collect();
        assert_eq!(store.retain_keys(&keep), 1);
        assert!(store.get_by_id(2).is_none());
        assert!(store.get_by_id(1).is_some());
    }
}
