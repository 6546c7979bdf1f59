//! Watch subscription manager.
//!
//! One [`WatchManager`] per entity kind keeps its store in step with the
//! coordination store. The initial bulk load records the scan revision and
//! the stream starts right after it. Each applied event advances the resume
//! revision, so a dropped stream is re-subscribed without gaps. If the
//! resume revision has been compacted away, the manager rescans the prefix
//! and reconciles the store instead.
//!
//! ```text
//! Starting ──subscribe──▶ Watching ──stream ends──▶ Backoff ──sleep──▶ Starting
//!     │                      │
//!     └──────shutdown────────┴──────────────▶ Stopped
//! ```
//!
//! Handler failures never end the loop: errors are logged and panics are
//! caught at the handler boundary.

use std::any::Any;
use std::backtrace::Backtrace;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use metacache_state::{EventType, KeyValue, MetaSource, StateError, WatchEvent};

use crate::error::{CacheError, CacheResult};
use crate::kind::EntityKind;

/// Lifecycle of one watch manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Starting,
    Watching,
    Backoff,
    Stopped,
}

/// Why a batch of records is being loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    /// First load into an empty store. Duplicate keys are reported.
    Initial,
    /// Reconciliation after a gap: the batch is the complete truth for the
    /// prefix, so cached keys absent from it are removed.
    Resync,
}

/// Counters from one bulk load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadStats {
    pub loaded: usize,
    /// Undecodable, out-of-scope or unresolvable records.
    pub skipped: usize,
    pub duplicates: usize,
    /// Cached keys dropped because the source no longer has them.
    pub removed: usize,
}

/// Kind-specific application of change events to a store.
#[async_trait]
pub trait WatchHandler: Send + Sync + 'static {
    fn kind(&self) -> EntityKind;

    /// Apply a put; `value` is the raw record payload.
    async fn put(&self, value: &[u8]) -> CacheResult<()>;

    /// Apply a delete of the full store key.
    async fn delete(&self, key: &str) -> CacheResult<()>;

    /// Load a full prefix scan.
    async fn load(&self, entries: Vec<KeyValue>, mode: LoadMode) -> LoadStats;
}

/// Drives one kind's watch stream.
pub struct WatchManager {
    source: Arc<dyn MetaSource>,
    handler: Arc<dyn WatchHandler>,
    backoff: Duration,
    state_tx: watch::Sender<WatchState>,
}

impl WatchManager {
    pub fn new(
        source: Arc<dyn MetaSource>,
        handler: Arc<dyn WatchHandler>,
        backoff: Duration,
    ) -> Self {
        let (state_tx, _) = watch::channel(WatchState::Starting);
        Self {
            source,
            handler,
            backoff,
            state_tx,
        }
    }

    pub fn kind(&self) -> EntityKind {
        self.handler.kind()
    }

    /// Subscribe to state transitions.
    pub fn state(&self) -> watch::Receiver<WatchState> {
        self.state_tx.subscribe()
    }

    /// Scan the prefix into an empty store. Returns the scan revision.
    pub async fn initial_load(&self) -> CacheResult<(u64, LoadStats)> {
        self.load(LoadMode::Initial).await
    }

    async fn load(&self, mode: LoadMode) -> CacheResult<(u64, LoadStats)> {
        let kind = self.kind();
        let (revision, entries) = self.source.prefix_scan(kind.prefix()).await?;
        let stats = self.handler.load(entries, mode).await;
        info!(
            %kind,
            ?mode,
            revision,
            loaded = stats.loaded,
            skipped = stats.skipped,
            duplicates = stats.duplicates,
            removed = stats.removed,
            "prefix loaded"
        );
        Ok((revision, stats))
    }

    /// Run the watch loop on a background task, resuming after
    /// `start_revision - 1`.
    pub fn spawn(self, start_revision: u64, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(start_revision, shutdown))
    }

    /// Watch until `shutdown` flips (or its sender goes away).
    pub async fn run(self, start_revision: u64, mut shutdown: watch::Receiver<bool>) {
        let kind = self.kind();
        let prefix = kind.prefix();
        let mut next_revision = start_revision;

        'outer: loop {
            if *shutdown.borrow() {
                break;
            }
            self.set_state(WatchState::Starting);

            let subscribed = tokio::select! {
                _ = shutdown.changed() => break 'outer,
                r = self.source.watch(prefix, next_revision) => r,
            };

            match subscribed {
                Ok(mut stream) => {
                    self.set_state(WatchState::Watching);
                    info!(%kind, revision = next_revision, "watch subscribed");
                    loop {
                        let response = tokio::select! {
                            _ = shutdown.changed() => break 'outer,
                            r = stream.recv() => r,
                        };
                        let Some(response) = response else {
                            warn!(%kind, "watch stream closed");
                            break;
                        };
                        for event in &response.events {
                            self.apply(event).await;
                            next_revision = event.revision + 1;
                        }
                        if response.canceled {
                            warn!(%kind, "watch stream canceled by source");
                            break;
                        }
                    }
                }
                Err(StateError::Compacted { requested, compacted }) => {
                    warn!(%kind, requested, compacted, "resume revision compacted, resyncing");
                    match self.load(LoadMode::Resync).await {
                        Ok((revision, _)) => {
                            next_revision = revision + 1;
                            continue;
                        }
                        Err(e) => warn!(%kind, error = %e, "resync failed"),
                    }
                }
                Err(e) => warn!(%kind, error = %e, "watch subscribe failed"),
            }

            self.set_state(WatchState::Backoff);
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(self.backoff) => {}
            }
        }

        self.set_state(WatchState::Stopped);
        info!(%kind, "watch stopped");
    }

    /// Apply one event, isolating handler failures from the loop.
    async fn apply(&self, event: &WatchEvent) {
        let kind = self.kind();
        let handler = &self.handler;
        let outcome = match event.kind {
            EventType::Put => AssertUnwindSafe(handler.put(&event.value)).catch_unwind().await,
            EventType::Delete => AssertUnwindSafe(handler.delete(&event.key)).catch_unwind().await,
        };
        match outcome {
            Ok(Ok(())) => {
                debug!(%kind, key = %event.key, revision = event.revision, op = ?event.kind, "event applied");
            }
            Ok(Err(e)) => {
                warn!(%kind, key = %event.key, revision = event.revision, error = %e, "event not applied");
            }
            Err(panic) => {
                let err = CacheError::Handler {
                    kind,
                    message: panic_message(panic.as_ref()),
                };
                error!(
                    %kind,
                    key = %event.key,
                    revision = event.revision,
                    error = %err,
                    backtrace = %Backtrace::force_capture(),
                    "watch handler panicked"
                );
            }
        }
    }

    fn set_state(&self, state: WatchState) {
        self.state_tx.send_replace(state);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
