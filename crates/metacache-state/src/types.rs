//! Metadata records kept in the coordination store.
//!
//! Every record is JSON-serialized into the store's value column. The cache
//! never owns these records; it holds `Arc` snapshots that are replaced
//! wholesale when a newer copy arrives.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Identifier of a serving node.
pub type NodeId = u64;

/// Identifier of a database.
pub type DbId = i64;

/// Identifier of a space (table) within a database.
pub type SpaceId = i64;

/// Identifier of a data partition, unique cluster-wide.
pub type PartitionId = u32;

/// Resource-affinity tag used when a record does not carry one.
pub const DEFAULT_RESOURCE_NAME: &str = "default";

fn default_resource_name() -> String {
    DEFAULT_RESOURCE_NAME.to_string()
}

// ── Accounts ─────────────────────────────────────────────────────

/// An account allowed to talk to the cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub name: String,
    /// Password hash; absent when fetched through a redacting gateway.
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub role_name: String,
}

/// Access level a role grants on one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Privilege {
    ReadOnly,
    WriteOnly,
    WriteRead,
}

/// A named permission set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Role {
    pub name: String,
    /// Resource name → privilege.
    #[serde(default)]
    pub privileges: HashMap<String, Privilege>,
}

// ── Schema ───────────────────────────────────────────────────────

/// A database: a namespace of spaces.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Db {
    pub id: DbId,
    pub name: String,
}

/// A space (vector table) and its placement parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Space {
    pub id: SpaceId,
    pub name: String,
    pub db_id: DbId,
    /// Bumped on every schema or placement change.
    #[serde(default)]
    pub version: u64,
    #[serde(default = "default_resource_name")]
    pub resource_name: String,
    #[serde(default)]
    pub partition_num: u32,
    #[serde(default)]
    pub replica_num: u8,
    #[serde(default)]
    pub partitions: Vec<PartitionId>,
}

/// A shard of a space, replicated across servers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Partition {
    pub id: PartitionId,
    pub space_id: SpaceId,
    pub db_id: DbId,
    #[serde(default)]
    pub leader_id: NodeId,
    #[serde(default)]
    pub replicas: Vec<NodeId>,
    /// Unix timestamp (nanoseconds) of the last change.
    #[serde(default)]
    pub update_time: i64,
}

/// Alternative name resolving to a space.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Alias {
    pub name: String,
    pub db_name: String,
    pub space_name: String,
}

// ── Servers ──────────────────────────────────────────────────────

/// A serving node registered under a heartbeat lease.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Server {
    pub id: NodeId,
    pub ip: String,
    pub rpc_port: u16,
    #[serde(default = "default_resource_name")]
    pub resource_name: String,
    /// Partitions this node hosts a replica of.
    #[serde(default)]
    pub partition_ids: Vec<PartitionId>,
}

impl Server {
    /// Address the node's RPC endpoint listens on (ip:port).
    pub fn rpc_addr(&self) -> String {
        format!("{}:{}", self.ip, self.rpc_port)
    }
}

/// Durable marker written when a node is judged dead while still owning
/// partitions. Consumed by the external rebalancer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailServer {
    pub id: NodeId,
    /// Unix timestamp (seconds) of detection.
    pub time_stamp: i64,
    /// Last-known registration of the node.
    pub node: Server,
}
