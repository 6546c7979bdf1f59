//! Single-flight reload coordination.
//!
//! At most one reload per `(kind, key)` is in flight at a time. A caller
//! that misses while a reload is already running does not start another;
//! it polls the store instead. The registry is owned by one cache instance
//! and cloned into its workers.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::CacheResult;
use crate::kind::EntityKind;

type InFlight = Arc<Mutex<HashSet<(EntityKind, String)>>>;

/// Registry of reloads in flight.
#[derive(Clone, Default)]
pub struct ReloadCoordinator {
    inflight: InFlight,
}

impl ReloadCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a reload for `(kind, key)`. Returns `None` if one is
    /// already running. The key stays registered until the ticket drops.
    pub fn begin(&self, kind: EntityKind, key: &str) -> Option<ReloadTicket> {
        let entry = (kind, key.to_string());
        if !self.inflight.lock().insert(entry.clone()) {
            debug!(%kind, %key, "reload already in flight");
            return None;
        }
        Some(ReloadTicket {
            inflight: Arc::clone(&self.inflight),
            entry,
        })
    }

    /// Start `fetch` in the background unless a reload for the key is
    /// already running. Failures are logged. Returns whether a reload was
    /// started.
    pub fn try_reload<F>(&self, kind: EntityKind, key: &str, fetch: F) -> bool
    where
        F: Future<Output = CacheResult<()>> + Send + 'static,
    {
        match self.begin(kind, key) {
            Some(ticket) => {
                ticket.spawn(fetch);
                true
            }
            None => false,
        }
    }

    /// Run `fetch` inline unless a reload for the key is already running.
    /// Returns `Ok(false)` when another reload owns the key.
    pub async fn reload_now<F>(&self, kind: EntityKind, key: &str, fetch: F) -> CacheResult<bool>
    where
        F: Future<Output = CacheResult<()>>,
    {
        match self.begin(kind, key) {
            Some(ticket) => ticket.run(fetch).await.map(|()| true),
            None => Ok(false),
        }
    }

    pub fn is_inflight(&self, kind: EntityKind, key: &str) -> bool {
        self.inflight.lock().contains(&(kind, key.to_string()))
    }

    /// Number of reloads currently registered.
    pub fn inflight(&self) -> usize {
        self.inflight.lock().len()
    }
}

/// Ownership of one in-flight reload. Unregisters the key on drop, so a
/// failed or panicking reload never leaves the key stuck.
pub struct ReloadTicket {
    inflight: InFlight,
    entry: (EntityKind, String),
}

impl ReloadTicket {
    pub fn kind(&self) -> EntityKind {
        self.entry.0
    }

    pub fn key(&self) -> &str {
        &self.entry.1
    }

    /// Run `fetch` on a background task, releasing the key when it ends.
    pub fn spawn<F>(self, fetch: F) -> JoinHandle<()>
    where
        F: Future<Output = CacheResult<()>> + Send + 'static,
    {
        tokio::spawn(async move {
            if let Err(e) = fetch.await {
                warn!(kind = %self.kind(), key = %self.key(), error = %e, "background reload failed");
            }
            drop(self);
        })
    }

    /// Run `fetch` on the current task, releasing the key when it ends.
    pub async fn run<F, T>(self, fetch: F) -> CacheResult<T>
    where
        F: Future<Output = CacheResult<T>>,
    {
        let result = fetch.await;
        drop(self);
        result
    }
}

impl Drop for ReloadTicket {
    fn drop(&mut self) {
        self.inflight.lock().remove(&self.entry);
    }
}
