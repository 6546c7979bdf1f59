//! `run` mode: open the store, start the cache, wait for Ctrl-C.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::info;

use metacache::{CacheConfig, ClientCache};
use metacache_state::StateStore;

/// File name of the coordination store inside the data directory.
pub const STORE_FILE: &str = "metacache.redb";

pub async fn run(
    data_dir: PathBuf,
    config_path: Option<PathBuf>,
    stats_interval: u64,
) -> anyhow::Result<()> {
    info!("metacache daemon starting");

    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join(STORE_FILE);

    // ── Coordination store ─────────────────────────────────────

    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, revision = store.revision(), "coordination store opened");

    // ── Cache ──────────────────────────────────────────────────

    let config = match config_path {
        Some(path) => CacheConfig::from_file(&path)?,
        None => CacheConfig::default(),
    };
    info!(
        resource = %config.resource_name,
        auto_recover = config.auto_recover,
        "cache configured"
    );

    let cache = Arc::new(ClientCache::new(Arc::new(store), config));
    cache.start().await?;
    info!(stats = ?cache.stats(), "cache started");

    // ── Background tasks ───────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let stats_handle = tokio::spawn(log_stats(
        cache.clone(),
        Duration::from_secs(stats_interval.max(1)),
        shutdown_rx,
    ));

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    cache.stop().await;
    let _ = stats_handle.await;

    info!("metacache daemon stopped");
    Ok(())
}

/// Log cache counters every `interval` until shutdown.
async fn log_stats(cache: Arc<ClientCache>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let stats = cache.stats();
                info!(
                    users = stats.users,
                    roles = stats.roles,
                    spaces = stats.spaces,
                    partitions = stats.partitions,
                    servers = stats.servers,
                    aliases = stats.aliases,
                    reloads_in_flight = stats.reloads_in_flight,
                    dropped_space_events = stats.dropped_space_events,
                    "cache stats"
                );
            }
            _ = shutdown.changed() => break,
        }
    }
}
