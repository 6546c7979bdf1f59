//! `seed` mode: bulk-write key/values into the coordination store.

use std::path::Path;

use anyhow::{Context, bail};
use serde_json::Value;

use metacache_state::StateStore;

use crate::serve::STORE_FILE;

/// Apply the JSON object in `file` to the store under `data_dir`.
/// Returns the number of keys written.
pub fn seed_file(data_dir: &Path, file: &Path) -> anyhow::Result<usize> {
    let content =
        std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    let entries: Value =
        serde_json::from_str(&content).with_context(|| format!("parsing {}", file.display()))?;

    std::fs::create_dir_all(data_dir)?;
    let store = StateStore::open(&data_dir.join(STORE_FILE))?;
    apply(&store, &entries)
}

fn apply(store: &StateStore, entries: &Value) -> anyhow::Result<usize> {
    let Value::Object(map) = entries else {
        bail!("seed file must hold a JSON object of key → value");
    };
    for (key, value) in map {
        let bytes = match value {
            Value::String(raw) => raw.clone().into_bytes(),
            other => serde_json::to_vec(other)?,
        };
        store.put_raw(key, &bytes)?;
    }
    Ok(map.len())
}
