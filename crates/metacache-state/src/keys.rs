//! Key namespace of the coordination store.
//!
//! Records live under one prefix per kind. Watchers subscribe to a whole
//! prefix, so every key of a kind must start with its prefix and nothing
//! else may.

use crate::types::{DbId, NodeId, PartitionId, SpaceId};

pub const PREFIX_USER: &str = "/user/";
pub const PREFIX_ROLE: &str = "/role/";
pub const PREFIX_DB_BODY: &str = "/db/body/";
pub const PREFIX_DB_NAME: &str = "/db/name/";
pub const PREFIX_SPACE: &str = "/space/";
pub const PREFIX_PARTITION: &str = "/partition/";
pub const PREFIX_SERVER: &str = "/server/";
pub const PREFIX_ALIAS: &str = "/alias/";
pub const PREFIX_FAIL_SERVER: &str = "/fail_server/";

/// Name of the lease lock serializing fail-server handling cluster-wide.
pub const LOCK_WATCH_SERVER: &str = "/cluster/watch/server";

pub fn user_key(name: &str) -> String {
    format!("{PREFIX_USER}{name}")
}

pub fn role_key(name: &str) -> String {
    format!("{PREFIX_ROLE}{name}")
}

pub fn db_body_key(id: DbId) -> String {
    format!("{PREFIX_DB_BODY}{id}")
}

pub fn db_name_key(name: &str) -> String {
    format!("{PREFIX_DB_NAME}{name}")
}

/// `/space/{db_id}/{space_id}`
pub fn space_key(db_id: DbId, space_id: SpaceId) -> String {
    format!("{PREFIX_SPACE}{db_id}/{space_id}")
}

/// `/space/{db_id}/`: every space of one database.
pub fn space_prefix(db_id: DbId) -> String {
    format!("{PREFIX_SPACE}{db_id}/")
}

pub fn partition_key(id: PartitionId) -> String {
    format!("{PREFIX_PARTITION}{id}")
}

pub fn server_key(id: NodeId) -> String {
    format!("{PREFIX_SERVER}{id}")
}

pub fn alias_key(name: &str) -> String {
    format!("{PREFIX_ALIAS}{name}")
}

pub fn fail_server_key(id: NodeId) -> String {
    format!("{PREFIX_FAIL_SERVER}{id}")
}

/// Last `/`-separated segment of a key (`/user/alice` → `alice`).
pub fn last_segment(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// Last two segments of a key (`/space/1/7` → `("1", "7")`).
pub fn last_two_segments(key: &str) -> Option<(&str, &str)> {
    let mut parts = key.rsplit('/');
    let last = parts.next()?;
    let parent = parts.next()?;
    Some((parent, last))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_sit_under_their_prefix() {
        assert!(user_key("alice").starts_with(PREFIX_USER));
        assert!(space_key(1, 7).starts_with(PREFIX_SPACE));
        assert!(server_key(3).starts_with(PREFIX_SERVER));
        assert!(fail_server_key(3).starts_with(PREFIX_FAIL_SERVER));
        assert!(!fail_server_key(3).starts_with(PREFIX_SERVER));
    }

    #[test]
    fn segments() {
        assert_eq!(last_segment("/user/alice"), "alice");
        assert_eq!(last_segment("bare"), "bare");
        assert_eq!(last_two_segments("/space/1/7"), Some(("1", "7")));
        assert_eq!(last_two_segments("solo"), None);
    }
}
