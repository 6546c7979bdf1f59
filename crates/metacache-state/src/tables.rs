//! redb table definitions for the embedded coordination store.
//!
//! All metadata shares one `&str → &[u8]` table so that prefix scans see
//! every kind the same way a remote key-value store would.

use redb::TableDefinition;

/// Every metadata key/value, keyed by its full path.
pub const KV: TableDefinition<&str, &[u8]> = TableDefinition::new("kv");

/// Store bookkeeping (the revision counter).
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

/// Lease locks keyed by lock name; values are JSON lease records.
pub const LOCKS: TableDefinition<&str, &[u8]> = TableDefinition::new("locks");

/// Key of the revision counter in [`META`].
pub const REVISION_KEY: &str = "revision";
