//! metacache — client-side cache of cluster metadata.
//!
//! Resolves users, roles, spaces, partitions, servers and aliases from local
//! memory, keeps every kind in step with the coordination store through a
//! per-prefix watch, and runs the cluster-wide fail-server workflow when a
//! serving node's registration disappears.
//!
//! # Architecture
//!
//! ```text
//! ClientCache (facade)
//!   ├── *_by_cache lookups
//!   │   ├── CacheStores (EntityStore per kind, dual-indexed SpaceStore)
//!   │   └── ReloadCoordinator (single-flight reload on miss)
//!   ├── WatchManager per kind
//!   │   ├── initial bulk load (prefix scan)
//!   │   ├── watch from scan revision + 1, resume after drops
//!   │   └── WatchHandler (User/Role/Alias, Space, Partition, Server)
//!   └── FailServerCoordinator (lease lock, liveness probe, fail records)
//!          ▲
//!          └── Server handler put / delete
//! ```
//!
//! Records outside the configured resource scope are never cached. Records
//! are never expired; they leave the cache only through a watched delete or
//! an explicit invalidation.

pub mod client;
pub mod config;
pub mod error;
pub mod failserver;
pub mod handlers;
pub mod kind;
pub mod singleflight;
pub mod store;
pub mod watcher;

pub use client::{CacheStats, ClientCache};
pub use config::CacheConfig;
pub use error::{CacheError, CacheResult};
pub use failserver::{
    FailServerCoordinator, NoopRecovery, RecoveryTrigger, RegistrationOutcome, RemovalOutcome,
};
pub use kind::EntityKind;
pub use singleflight::{ReloadCoordinator, ReloadTicket};
pub use store::{CacheStores, EntityStore, SpaceStore};
pub use watcher::{LoadMode, LoadStats, WatchHandler, WatchManager, WatchState};
