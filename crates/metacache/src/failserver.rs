//! Fail-server detection and recovery.
//!
//! Every cache instance sees the same server registry events, but the side
//! effects below must happen once cluster-wide. Each workflow therefore
//! runs only while holding the lease lock [`LOCK_WATCH_SERVER`]; instances
//! that lose the race just keep their local cache updated.
//!
//! Removal (registration lease expired):
//! 1. no cached record → nothing to do
//! 2. node held no partitions → nothing to do
//! 3. node still answers the liveness probe → nothing to do
//! 4. otherwise write a [`FailServer`] record, unless one already exists
//!
//! Registration:
//! - empty node and auto-recovery on → hand it to the [`RecoveryTrigger`]
//! - node with partitions → clear its fail record, if any

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use metacache_health::LivenessProbe;
use metacache_state::keys::{LOCK_WATCH_SERVER, fail_server_key};
use metacache_state::{FailServer, MetaLock, MetaSource, NodeId, Server, put_json};

/// What happened after a server's registration disappeared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalOutcome {
    /// Another instance holds the lock.
    NotLeader,
    UnknownServer,
    NoPartitions,
    Alive,
    AlreadyRecorded,
    Recorded,
    /// The coordination store rejected a read or write.
    StoreFailed,
}

/// What happened after a server (re-)registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationOutcome {
    NotLeader,
    RecoveryTriggered,
    RecoveryFailed,
    RecoveryDisabled,
    /// Carries whether a record existed.
    FailRecordCleared(bool),
    StoreFailed,
}

/// Hands an empty node to the external recovery process.
#[async_trait]
pub trait RecoveryTrigger: Send + Sync + 'static {
    async fn recover_by_new_server(&self, server: &Server) -> anyhow::Result<()>;
}

/// Recovery trigger that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRecovery;

#[async_trait]
impl RecoveryTrigger for NoopRecovery {
    async fn recover_by_new_server(&self, server: &Server) -> anyhow::Result<()> {
        info!(node_id = server.id, addr = %server.rpc_addr(), "recovery requested, no recovery backend configured");
        Ok(())
    }
}

pub struct FailServerCoordinator {
    source: Arc<dyn MetaSource>,
    probe: Arc<dyn LivenessProbe>,
    recovery: Arc<dyn RecoveryTrigger>,
    lock_ttl: Duration,
    auto_recover: bool,
}

impl FailServerCoordinator {
    pub fn new(source: Arc<dyn MetaSource>, probe: Arc<dyn LivenessProbe>, lock_ttl: Duration) -> Self {
        Self {
            source,
            probe,
            recovery: Arc::new(NoopRecovery),
            lock_ttl,
            auto_recover: false,
        }
    }

    pub fn with_recovery(mut self, recovery: Arc<dyn RecoveryTrigger>) -> Self {
        self.recovery = recovery;
        self
    }

    pub fn with_auto_recover(mut self, enabled: bool) -> Self {
        self.auto_recover = enabled;
        self
    }

    /// Handle the disappearance of `node_id`. `last_known` is the record
    /// the local cache held for it.
    pub async fn on_server_removed(
        &self,
        node_id: NodeId,
        last_known: Option<Arc<Server>>,
    ) -> RemovalOutcome {
        let Some(lock) = self.acquire().await else {
            debug!(node_id, "fail-server lock held elsewhere, cache updated only");
            return RemovalOutcome::NotLeader;
        };
        let outcome = self.record_failure(node_id, last_known).await;
        self.release(lock).await;
        info!(node_id, ?outcome, "server removal handled");
        outcome
    }

    async fn record_failure(&self, node_id: NodeId, last_known: Option<Arc<Server>>) -> RemovalOutcome {
        let Some(server) = last_known else {
            return RemovalOutcome::UnknownServer;
        };
        if server.partition_ids.is_empty() {
            return RemovalOutcome::NoPartitions;
        }
        if self.probe.is_alive(&server).await {
            return RemovalOutcome::Alive;
        }

        let key = fail_server_key(node_id);
        match self.source.get(&key).await {
            Ok(Some(_)) => return RemovalOutcome::AlreadyRecorded,
            Ok(None) => {}
            Err(e) => {
                warn!(node_id, error = %e, "cannot read fail-server record");
                return RemovalOutcome::StoreFailed;
            }
        }

        let record = FailServer {
            id: node_id,
            time_stamp: epoch_secs(),
            node: Server::clone(&server),
        };
        match put_json(self.source.as_ref(), &key, &record).await {
            Ok(revision) => {
                info!(node_id, %key, revision, partitions = ?server.partition_ids, "fail-server recorded");
                RemovalOutcome::Recorded
            }
            Err(e) => {
                error!(node_id, error = %e, "failed to write fail-server record");
                RemovalOutcome::StoreFailed
            }
        }
    }

    /// Handle a (re-)registration of `server`.
    pub async fn on_server_registered(&self, server: &Server) -> RegistrationOutcome {
        let Some(lock) = self.acquire().await else {
            debug!(node_id = server.id, "fail-server lock held elsewhere, cache updated only");
            return RegistrationOutcome::NotLeader;
        };
        let outcome = self.recover_or_clear(server).await;
        self.release(lock).await;
        debug!(node_id = server.id, ?outcome, "server registration handled");
        outcome
    }

    async fn recover_or_clear(&self, server: &Server) -> RegistrationOutcome {
        if server.partition_ids.is_empty() {
            if !self.auto_recover {
                return RegistrationOutcome::RecoveryDisabled;
            }
            return match self.recovery.recover_by_new_server(server).await {
                Ok(()) => {
                    info!(node_id = server.id, "recovery by new server triggered");
                    RegistrationOutcome::RecoveryTriggered
                }
                Err(e) => {
                    warn!(node_id = server.id, error = %e, "recovery by new server failed");
                    RegistrationOutcome::RecoveryFailed
                }
            };
        }

        match self.source.delete(&fail_server_key(server.id)).await {
            Ok(existed) => {
                if existed {
                    info!(node_id = server.id, "server rejoined, fail-server record cleared");
                }
                RegistrationOutcome::FailRecordCleared(existed)
            }
            Err(e) => {
                warn!(node_id = server.id, error = %e, "cannot clear fail-server record");
                RegistrationOutcome::StoreFailed
            }
        }
    }

    async fn acquire(&self) -> Option<Box<dyn MetaLock>> {
        let lock = self.source.new_lock(LOCK_WATCH_SERVER, self.lock_ttl);
        match lock.try_lock().await {
            Ok(true) => Some(lock),
            Ok(false) => None,
            Err(e) => {
                warn!(error = %e, "fail-server lock attempt failed");
                None
            }
        }
    }

    async fn release(&self, lock: Box<dyn MetaLock>) {
        // Lease expiry bounds the damage of a failed unlock.
        if let Err(e) = lock.unlock().await {
            error!(error = %e, "failed to release fail-server lock");
        }
    }
}

fn epoch_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
