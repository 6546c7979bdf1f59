//! Gateway to the coordination store.
//!
//! [`MetaSource`] is the only way the cache talks to the source of truth.
//! Implementors provide the raw key/value, watch and lock primitives; the
//! typed `query_*` lookups are provided on top of them and decode JSON.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;

use crate::error::{StateError, StateResult};
use crate::keys;
use crate::types::*;

/// One key/value pair returned by a prefix scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    /// Revision of the last write to this key.
    pub mod_revision: u64,
}

/// Kind of change carried by a [`WatchEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Put,
    Delete,
}

/// A single change to a watched key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: EventType,
    pub key: String,
    /// New value for `Put`; empty for `Delete`.
    pub value: Vec<u8>,
    pub revision: u64,
}

/// A batch of events delivered by a watch stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchResponse {
    pub events: Vec<WatchEvent>,
    /// The source closed this stream; the subscriber must re-subscribe.
    pub canceled: bool,
}

/// Receiving end of a watch subscription. The stream is over when the
/// channel closes or a `canceled` response arrives.
pub type WatchStream = mpsc::Receiver<WatchResponse>;

/// Lease-scoped mutual exclusion.
///
/// A held lock expires on its own once its TTL elapses, so a crashed holder
/// blocks others for at most one lease.
#[async_trait]
pub trait MetaLock: Send + Sync {
    /// Try to take the lock without waiting. `Ok(false)` means another
    /// holder owns a live lease.
    async fn try_lock(&self) -> StateResult<bool>;

    /// Release the lock if this handle holds it.
    async fn unlock(&self) -> StateResult<()>;
}

/// Strongly-consistent key/value store with change notifications.
#[async_trait]
pub trait MetaSource: Send + Sync + 'static {
    async fn get(&self, key: &str) -> StateResult<Option<Vec<u8>>>;

    /// Write a value, returning the store revision of the write.
    async fn put(&self, key: &str, value: &[u8]) -> StateResult<u64>;

    /// Remove a key. Returns true if it existed.
    async fn delete(&self, key: &str) -> StateResult<bool>;

    /// All keys under `prefix`, plus the store revision they were read at.
    async fn prefix_scan(&self, prefix: &str) -> StateResult<(u64, Vec<KeyValue>)>;

    /// Subscribe to changes under `prefix` starting at `start_revision`
    /// (`0` means "from now").
    async fn watch(&self, prefix: &str, start_revision: u64) -> StateResult<WatchStream>;

    /// Create a handle on the named lease lock.
    fn new_lock(&self, name: &str, ttl: Duration) -> Box<dyn MetaLock>;

    // ── Typed lookups ──────────────────────────────────────────────

    async fn query_user(&self, name: &str) -> StateResult<User> {
        let key = keys::user_key(name);
        decode(self.get(&key).await?, &key)
    }

    async fn query_role(&self, name: &str) -> StateResult<Role> {
        let key = keys::role_key(name);
        decode(self.get(&key).await?, &key)
    }

    async fn query_alias(&self, name: &str) -> StateResult<Alias> {
        let key = keys::alias_key(name);
        decode(self.get(&key).await?, &key)
    }

    async fn query_server(&self, id: NodeId) -> StateResult<Server> {
        let key = keys::server_key(id);
        decode(self.get(&key).await?, &key)
    }

    async fn query_partition(&self, id: PartitionId) -> StateResult<Partition> {
        let key = keys::partition_key(id);
        decode(self.get(&key).await?, &key)
    }

    async fn query_db_name_to_id(&self, name: &str) -> StateResult<DbId> {
        let key = keys::db_name_key(name);
        let raw = self
            .get(&key)
            .await?
            .ok_or_else(|| StateError::NotFound(key.clone()))?;
        let text = String::from_utf8_lossy(&raw);
        text.trim()
            .parse()
            .map_err(|e| StateError::Deserialize(format!("{key}: {e}")))
    }

    async fn query_db_id_to_name(&self, id: DbId) -> StateResult<String> {
        let key = keys::db_body_key(id);
        let db: Db = decode(self.get(&key).await?, &key)?;
        Ok(db.name)
    }

    async fn query_space_by_id(&self, db_id: DbId, space_id: SpaceId) -> StateResult<Space> {
        let key = keys::space_key(db_id, space_id);
        decode(self.get(&key).await?, &key)
    }

    async fn query_space_by_name(&self, db_id: DbId, name: &str) -> StateResult<Space> {
        let prefix = keys::space_prefix(db_id);
        let (_, entries) = self.prefix_scan(&prefix).await?;
        for entry in entries {
            let space: Space = serde_json::from_slice(&entry.value)
                .map_err(|e| StateError::Deserialize(format!("{}: {e}", entry.key)))?;
            if space.name == name {
                return Ok(space);
            }
        }
        Err(StateError::NotFound(format!("{prefix}{name}")))
    }
}

/// Decode a JSON value fetched from `key`, mapping absence to `NotFound`.
fn decode<T: DeserializeOwned>(raw: Option<Vec<u8>>, key: &str) -> StateResult<T> {
    let raw = raw.ok_or_else(|| StateError::NotFound(key.to_string()))?;
    serde_json::from_slice(&raw).map_err(|e| StateError::Deserialize(format!("{key}: {e}")))
}

/// Serialize `value` as JSON and write it under `key`.
pub async fn put_json<S, T>(source: &S, key: &str, value: &T) -> StateResult<u64>
where
    S: MetaSource + ?Sized,
    T: Serialize + Sync,
{
    let bytes = serde_json::to_vec(value).map_err(|e| StateError::Serialize(e.to_string()))?;
    source.put(key, &bytes).await
}
