// The document tree and its TTL store, plus JSON snapshot persistence. This
// store is snapshot-based by design: it holds the tree as a plain in-memory
// `Value::Object` and only touches disk on an explicit `save`/`load` — there
// is no write-ahead log to maintain.

mod tree;
mod ttl;

pub use tree::DataStore;
pub use ttl::TtlStore;

use mgin_base::{Result, Value};
use std::path::Path;
use tracing::{info, warn};

/// Read a JSON snapshot from `path`, defaulting to `default` if the file
/// does not exist yet. A malformed file is logged and treated as absent
/// rather than aborting startup, matching the original's degrade-to-empty
/// behavior on a JSON decode error.
pub fn load_snapshot(path: impl AsRef<Path>, default: Value) -> Value {
    let path = path.as_ref();
    if !path.exists() {
        return default;
    }
    match std::fs::read_to_string(path) {
        Ok(text) => match serde_json::from_str::<serde_json::Value>(&text) {
            Ok(json) => Value::from_json(&json),
            Err(e) => {
                warn!(target: "mgin", "failed to parse snapshot {}: {e}", path.display());
                default
            }
        },
        Err(e) => {
            warn!(target: "mgin", "failed to read snapshot {}: {e}", path.display());
            default
        }
    }
}

/// Write a JSON snapshot to `path`. I/O failure is logged and surfaced to
/// the caller so the dirty flag can be preserved for retry on the next save
/// interval (§4.16: persistence failures never panic or lose in-memory
/// state).
pub fn save_snapshot(path: impl AsRef<Path>, value: &Value) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let text = serde_json::to_string_pretty(&value.to_json())?;
    std::fs::write(path, text)?;
    info!(target: "mgin", "snapshot written to {}", path.display());
    Ok(())
}
