//! StateStore: embedded coordination store backed by redb.
//!
//! Provides the raw primitives behind [`MetaSource`]: point reads and
//! writes, prefix scans, revisioned change streams, and lease locks. Every
//! write bumps a persisted revision counter and is appended to a bounded
//! in-memory event log so that a watcher can resume from the revision after
//! its last applied event. Revisions older than the log are reported as
//! [`StateError::Compacted`]; the caller is expected to rescan.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;
use redb::{Database, ReadableDatabase, ReadableTable};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::error::{StateError, StateResult};
use crate::source::{EventType, KeyValue, MetaLock, MetaSource, WatchEvent, WatchResponse, WatchStream};
use crate::tables::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Events retained for watch replay.
const DEFAULT_HISTORY: usize = 4096;

/// Capacity of the live fan-out channel shared by all watchers.
const BROADCAST_CAPACITY: usize = 1024;

/// Per-subscription buffer between the fan-out task and the subscriber.
const WATCH_BUFFER: usize = 256;

/// Thread-safe coordination store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    inner: Arc<Inner>,
}

struct Inner {
    db: Database,
    /// Serializes writes so revision order equals delivery order.
    history: Mutex<History>,
    events: broadcast::Sender<Signal>,
    next_token: AtomicU64,
}

struct History {
    log: VecDeque<WatchEvent>,
    capacity: usize,
    /// Highest revision no longer replayable.
    compacted: u64,
    revision: u64,
}

impl History {
    fn push(&mut self, event: WatchEvent) {
        if self.log.len() == self.capacity {
            if let Some(evicted) = self.log.pop_front() {
                self.compacted = evicted.revision;
            }
        }
        self.log.push_back(event);
    }
}

#[derive(Debug, Clone)]
enum Signal {
    Event(WatchEvent),
    Cancel,
}

impl StateStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::from_database(db, DEFAULT_HISTORY)?;
        debug!(?path, revision = store.revision(), "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        Self::open_in_memory_with_history(DEFAULT_HISTORY)
    }

    /// In-memory store retaining only `history` events for watch replay.
    pub fn open_in_memory_with_history(history: usize) -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::from_database(db, history.max(1))?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn from_database(db: Database, capacity: usize) -> StateResult<Self> {
        ensure_tables(&db)?;
        let revision = read_revision(&db)?;
        let (events, _) = broadcast::channel(BROADCAST_CAPACITY);
        Ok(Self {
            inner: Arc::new(Inner {
                db,
                history: Mutex::new(History {
                    log: VecDeque::new(),
                    capacity,
                    // Nothing written before this process is replayable.
                    compacted: revision,
                    revision,
                }),
                events,
                next_token: AtomicU64::new(1),
            }),
        })
    }

    /// Current store revision (revision of the latest write).
    pub fn revision(&self) -> u64 {
        self.inner.history.lock().revision
    }

    // ── Key/value ──────────────────────────────────────────────────

    /// Read a raw value.
    pub fn get_raw(&self, key: &str) -> StateResult<Option<Vec<u8>>> {
        let txn = self.inner.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(KV).map_err(map_err!(Table))?;
        let value = table
            .get(key)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value().to_vec());
        Ok(value)
    }

    /// Insert or replace a raw value. Returns the revision of the write.
    pub fn put_raw(&self, key: &str, value: &[u8]) -> StateResult<u64> {
        let mut history = self.inner.history.lock();
        let revision = history.revision + 1;
        let txn = self.inner.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(KV).map_err(map_err!(Table))?;
            table.insert(key, value).map_err(map_err!(Write))?;
            let mut meta = txn.open_table(META).map_err(map_err!(Table))?;
            meta.insert(REVISION_KEY, revision).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;

        history.revision = revision;
        self.publish(
            &mut history,
            WatchEvent {
                kind: EventType::Put,
                key: key.to_string(),
                value: value.to_vec(),
                revision,
            },
        );
        debug!(%key, revision, "key stored");
        Ok(revision)
    }

    /// Delete a key. Returns true if it existed; absent keys do not
    /// advance the revision.
    pub fn delete_raw(&self, key: &str) -> StateResult<bool> {
        let mut history = self.inner.history.lock();
        let revision = history.revision + 1;
        let txn = self.inner.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(KV).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
            if existed {
                let mut meta = txn.open_table(META).map_err(map_err!(Table))?;
                meta.insert(REVISION_KEY, revision).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;

        if existed {
            history.revision = revision;
            self.publish(
                &mut history,
                WatchEvent {
                    kind: EventType::Delete,
                    key: key.to_string(),
                    value: Vec::new(),
                    revision,
                },
            );
        }
        debug!(%key, existed, "key deleted");
        Ok(existed)
    }

    /// All key/values under `prefix`, with the revision they were read at.
    pub fn scan_prefix(&self, prefix: &str) -> StateResult<(u64, Vec<KeyValue>)> {
        // Hold the write gate so the revision matches the snapshot.
        let history = self.inner.history.lock();
        let txn = self.inner.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(KV).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.range(prefix..).map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if !key.value().starts_with(prefix) {
                break;
            }
            results.push(KeyValue {
                key: key.value().to_string(),
                value: value.value().to_vec(),
                mod_revision: history.revision,
            });
        }
        Ok((history.revision, results))
    }

    fn publish(&self, history: &mut History, event: WatchEvent) {
        history.push(event.clone());
        // No receivers is fine: nobody is watching.
        let _ = self.inner.events.send(Signal::Event(event));
    }

    // ── Watch ──────────────────────────────────────────────────────

    /// Subscribe to changes under `prefix`, replaying retained events from
    /// `start_revision` (`0` = live events only).
    pub fn watch_prefix(&self, prefix: &str, start_revision: u64) -> StateResult<WatchStream> {
        let (replay, live) = {
            let history = self.inner.history.lock();
            if start_revision != 0 && start_revision <= history.compacted {
                return Err(StateError::Compacted {
                    requested: start_revision,
                    compacted: history.compacted,
                });
            }
            let replay: Vec<WatchEvent> = if start_revision == 0 {
                Vec::new()
            } else {
                history
                    .log
                    .iter()
                    .filter(|e| e.revision >= start_revision && e.key.starts_with(prefix))
                    .cloned()
                    .collect()
            };
            // Subscribe under the gate: no write can slip between the
            // replay snapshot and the live feed.
            (replay, self.inner.events.subscribe())
        };

        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        tokio::spawn(forward_events(prefix.to_string(), replay, live, tx));
        debug!(%prefix, start_revision, "watch subscription opened");
        Ok(rx)
    }

    /// Close every live watch stream. Subscribers see a `canceled`
    /// response and must re-subscribe.
    pub fn cancel_watches(&self) {
        let _history = self.inner.history.lock();
        let _ = self.inner.events.send(Signal::Cancel);
        debug!("all watch streams canceled");
    }

    // ── Locks ──────────────────────────────────────────────────────

    /// Create a lease lock handle. Each handle has its own holder token.
    pub fn lock(&self, name: &str, ttl: Duration) -> StoreLock {
        StoreLock {
            store: self.clone(),
            name: name.to_string(),
            ttl,
            token: self.inner.next_token.fetch_add(1, Ordering::Relaxed),
        }
    }

    fn acquire_lease(&self, name: &str, token: u64, ttl: Duration) -> StateResult<bool> {
        let now = epoch_millis();
        let txn = self.inner.db.begin_write().map_err(map_err!(Transaction))?;
        let acquired;
        {
            let mut table = txn.open_table(LOCKS).map_err(map_err!(Table))?;
            let held_by_other = match table.get(name).map_err(map_err!(Read))? {
                Some(guard) => {
                    let lease: LeaseRecord =
                        serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                    lease.token != token && lease.expires_at_ms > now
                }
                None => false,
            };
            acquired = !held_by_other;
            if acquired {
                let lease = LeaseRecord {
                    token,
                    expires_at_ms: now + ttl.as_millis() as u64,
                };
                let value = serde_json::to_vec(&lease).map_err(map_err!(Serialize))?;
                table
                    .insert(name, value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(acquired)
    }

    fn release_lease(&self, name: &str, token: u64) -> StateResult<bool> {
        let txn = self.inner.db.begin_write().map_err(map_err!(Transaction))?;
        let released;
        {
            let mut table = txn.open_table(LOCKS).map_err(map_err!(Table))?;
            let ours = match table.get(name).map_err(map_err!(Read))? {
                Some(guard) => {
                    let lease: LeaseRecord =
                        serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                    lease.token == token
                }
                None => false,
            };
            if ours {
                table.remove(name).map_err(map_err!(Write))?;
            }
            released = ours;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(released)
    }
}

/// Create all tables if they don't exist yet.
fn ensure_tables(db: &Database) -> StateResult<()> {
    let txn = db.begin_write().map_err(map_err!(Transaction))?;
    // Opening a table in a write transaction creates it if absent.
    txn.open_table(KV).map_err(map_err!(Table))?;
    txn.open_table(META).map_err(map_err!(Table))?;
    txn.open_table(LOCKS).map_err(map_err!(Table))?;
    txn.commit().map_err(map_err!(Transaction))?;
    Ok(())
}

fn read_revision(db: &Database) -> StateResult<u64> {
    let txn = db.begin_read().map_err(map_err!(Transaction))?;
    let table = txn.open_table(META).map_err(map_err!(Table))?;
    let revision = table
        .get(REVISION_KEY)
        .map_err(map_err!(Read))?
        .map(|guard| guard.value())
        .unwrap_or(0);
    Ok(revision)
}

/// Fan-out task for one subscription: replay first, then live events.
async fn forward_events(
    prefix: String,
    replay: Vec<WatchEvent>,
    mut live: broadcast::Receiver<Signal>,
    tx: mpsc::Sender<WatchResponse>,
) {
    if !replay.is_empty() {
        let response = WatchResponse {
            events: replay,
            canceled: false,
        };
        if tx.send(response).await.is_err() {
            return;
        }
    }

    loop {
        let signal = tokio::select! {
            _ = tx.closed() => return,
            signal = live.recv() => signal,
        };
        let response = match signal {
            Ok(Signal::Event(event)) if event.key.starts_with(&prefix) => WatchResponse {
                events: vec![event],
                canceled: false,
            },
            Ok(Signal::Event(_)) => continue,
            Ok(Signal::Cancel) => WatchResponse {
                events: Vec::new(),
                canceled: true,
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(%prefix, skipped, "watch subscriber lagged, canceling stream");
                WatchResponse {
                    events: Vec::new(),
                    canceled: true,
                }
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };
        let canceled = response.canceled;
        if tx.send(response).await.is_err() || canceled {
            return;
        }
    }
}

/// Persisted state of one lease lock.
#[derive(Debug, Serialize, Deserialize)]
struct LeaseRecord {
    token: u64,
    expires_at_ms: u64,
}

/// Handle on a named lease lock in a [`StateStore`].
pub struct StoreLock {
    store: StateStore,
    name: String,
    ttl: Duration,
    token: u64,
}

#[async_trait]
impl MetaLock for StoreLock {
    async fn try_lock(&self) -> StateResult<bool> {
        let acquired = self.store.acquire_lease(&self.name, self.token, self.ttl)?;
        debug!(lock = %self.name, token = self.token, acquired, "try lock");
        Ok(acquired)
    }

    async fn unlock(&self) -> StateResult<()> {
        let released = self.store.release_lease(&self.name, self.token)?;
        debug!(lock = %self.name, token = self.token, released, "unlock");
        Ok(())
    }
}

#[async_trait]
impl MetaSource for StateStore {
    async fn get(&self, key: &str) -> StateResult<Option<Vec<u8>>> {
        self.get_raw(key)
    }

    async fn put(&self, key: &str, value: &[u8]) -> StateResult<u64> {
        self.put_raw(key, value)
    }

    async fn delete(&self, key: &str) -> StateResult<bool> {
        self.delete_raw(key)
    }

    async fn prefix_scan(&self, prefix: &str) -> StateResult<(u64, Vec<KeyValue>)> {
        self.scan_prefix(prefix)
    }

    async fn watch(&self, prefix: &str, start_revision: u64) -> StateResult<WatchStream> {
        self.watch_prefix(prefix, start_revision)
    }

    fn new_lock(&self, name: &str, ttl: Duration) -> Box<dyn MetaLock> {
        Box::new(self.lock(name, ttl))
    }
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
