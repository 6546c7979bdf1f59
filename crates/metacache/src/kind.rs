//! Entity kinds held by the cache.

use std::fmt;

use metacache_state::keys;

/// One cached entity kind. Each kind has its own store, key prefix and
/// watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityKind {
    User,
    Role,
    Space,
    Partition,
    Server,
    Alias,
}

impl EntityKind {
    /// Every kind, in bulk-load order. Spaces load before partitions so
    /// partition keys can be resolved from the fresh space set.
    pub const ALL: [EntityKind; 6] = [
        EntityKind::User,
        EntityKind::Role,
        EntityKind::Space,
        EntityKind::Partition,
        EntityKind::Server,
        EntityKind::Alias,
    ];

    /// Key prefix this kind is stored and watched under.
    pub fn prefix(self) -> &'static str {
        match self {
            EntityKind::User => keys::PREFIX_USER,
            EntityKind::Role => keys::PREFIX_ROLE,
            EntityKind::Space => keys::PREFIX_SPACE,
            EntityKind::Partition => keys::PREFIX_PARTITION,
            EntityKind::Server => keys::PREFIX_SERVER,
            EntityKind::Alias => keys::PREFIX_ALIAS,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::User => "user",
            EntityKind::Role => "role",
            EntityKind::Space => "space",
            EntityKind::Partition => "partition",
            EntityKind::Server => "server",
            EntityKind::Alias => "alias",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixes_are_distinct() {
        let mut prefixes: Vec<_> = EntityKind::ALL.iter().map(|k| k.prefix()).collect();
        prefixes.sort();
        prefixes.dedup();
        assert_eq!(prefixes.len(), EntityKind::ALL.len());
    }

    #[test]
    fn display_matches_as_str() {
        assert_eq!(EntityKind::Partition.to_string(), "partition");
    }
}
