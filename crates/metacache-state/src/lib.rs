//! metacache-state — metadata records and the coordination-store gateway.
//!
//! Defines the records cached by `metacache` (users, roles, spaces,
//! partitions, servers, aliases, fail-server markers), the key namespace
//! they live under, and the [`MetaSource`] gateway trait through which the
//! cache reads, writes, scans, watches and locks.
//!
//! # Architecture
//!
//! ```text
//! MetaSource (trait)
//!   ├── get / put / delete / prefix_scan
//!   ├── watch(prefix, start_revision) → WatchStream
//!   ├── new_lock(name, ttl) → MetaLock (lease-scoped mutex)
//!   └── query_* helpers (provided, JSON-decoded)
//!
//! StateStore (redb)
//!   ├── kv table + persisted revision counter
//!   ├── bounded event log for watch replay
//!   └── lease table for MetaLock
//! ```
//!
//! `StateStore` is `Clone + Send + Sync` (backed by `Arc`) and can be shared
//! by any number of cache instances in one process, which is how the
//! multi-instance scenarios are exercised in tests.

pub mod error;
pub mod keys;
pub mod source;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use source::{
    EventType, KeyValue, MetaLock, MetaSource, WatchEvent, WatchResponse, WatchStream, put_json,
};
pub use store::StateStore;
pub use types::*;
