// Typed key-value settings, persisted as `conf.json`. Defaults back-fill
// anything absent on disk; unknown keys present on disk but not in the
// default set are dropped on load (schema drift from an older version is
// discarded rather than carried forward).

use indexmap::IndexMap;
use mgin_base::{err, Error, Result, Value};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Configuration keys that `CONFIG DEL` refuses to remove, enumerated
/// literally (the original does not wildcard on a prefix).
pub const PROTECTED_KEYS: &[&str] = &[
    "HOST",
    "PORT",
    "USERNAME",
    "PASSWORD",
    "BACKUP_ON_SHUTDOWN",
    "SCHEDULER",
    "REPLICATION",
    "REPLICATION_TYPE",
    "REPLICATION_AUTHORIZED_SLAVES",
    "SHARDING_TYPE",
    "SHARDING",
    "SHARDING_BATCH_SIZE",
    "SHARDS",
];

/// Config keys that must always be a list, coerced to `[]` when the value
/// on disk is some other shape.
const LIST_KEYS: &[&str] = &["REPLICATION_SLAVES", "REPLICATION_AUTHORIZED_SLAVES", "SHARDS"];

#[derive(Clone, Debug)]
pub struct Config {
    store: IndexMap<String, Value>,
    path: PathBuf,
}

pub fn default_config() -> IndexMap<String, Value> {
    let mut m = IndexMap::new();
    let mut set = |k: &str, v: Value| {
        m.insert(k.to_string(), v);
    };
    set("INSTANCE_UUID", Value::Str(uuid::Uuid::new_v4().to_string()));
    set("HOST", Value::Str("127.0.0.1".into()));
    set("PORT", Value::Str("6446".into()));
    set("USERNAME", Value::Str("".into()));
    set("PASSWORD", Value::Str("".into()));
    set("AUTO_UPDATE", Value::Str("1".into()));
    set("SAVE_ON_FILE_INTERVAL", Value::Str("15".into()));
    set("BACKUP_ON_SHUTDOWN", Value::Str("0".into()));
    set("SCHEDULER", Value::Str("1".into()));
    set("QUERY_CACHING", Value::Str("1".into()));
    set("QUERY_CACHING_TTL", Value::Str("300".into()));
    set("REPLICATION", Value::Str("0".into()));
    set("REPLICATION_TYPE", Value::Str("MASTER".into()));
    set("REPLICATION_MASTER", Value::Str("".into()));
    set("REPLICATION_SLAVES", Value::List(vec![]));
    set("REPLICATION_AUTHORIZED_SLAVES", Value::List(vec![]));
    set("SHARDING_TYPE", Value::Str("MASTER".into()));
    set("SHARDING", Value::Str("0".into()));
    set("SHARDING_BATCH_SIZE", Value::Str("500".into()));
    set("SHARDS", Value::List(vec![]));
    set("BLOCKCHAIN", Value::Str("0".into()));
    set("BLOCKCHAIN_TYPE", Value::Str("".into()));
    set("BLOCKCHAIN_NAME", Value::Str("".into()));
    set("BLOCKCHAIN_DESCRIPTION", Value::Str("".into()));
    set("BLOCKCHAIN_LOGO", Value::Str("".into()));
    set("BLOCKCHAIN_SYMBOL", Value::Str("".into()));
    set("BLOCKCHAIN_DECIMAL", Value::Str("8".into()));
    set("BLOCKCHAIN_SUPPLY", Value::Str("".into()));
    set("BLOCKCHAIN_MAX_SUPPLY", Value::Str("".into()));
    set("BLOCKCHAIN_CAN_MINT", Value::Bool(false));
    set("BLOCKCHAIN_CAN_BURN", Value::Bool(false));
    set("BLOCKCHAIN_SETUP_FEE", Value::Str("".into()));
    set("BLOCKCHAIN_CONTRACT_FEE", Value::Str("5000".into()));
    set("BLOCKCHAIN_VALIDATOR_REWARD", Value::Str("".into()));
    set("BLOCKCHAIN_SYNC_CHUNKS", Value::Str("100".into()));
    set("BLOCKCHAIN_BLOCK_MAX_SIZE", Value::Str("100".into()));
    set("BLOCKCHAIN_BLOCK_AUTO_CREATION_INTERVAL", Value::Str("60".into()));
    set("BLOCKCHAIN_CONF", Value::object());
    m
}

impl Config {
    /// Build a config from defaults only, not touching disk. Used by tests
    /// and as the in-memory shape before `load` merges a file over it.
    pub fn defaults() -> Config {
        Config {
            store: default_config(),
            path: PathBuf::from("conf.json"),
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Config> {
        let path = path.as_ref().to_path_buf();
        let defaults = default_config();

        let loaded: IndexMap<String, Value> = if path.exists() {
            let text = std::fs::read_to_string(&path)?;
            match serde_json::from_str::<serde_json::Value>(&text) {
                Ok(json) => match Value::from_json(&json) {
                    Value::Object(m) => m,
                    _ => IndexMap::new(),
                },
                Err(e) => {
                    warn!(target: "mgin", "conf.json is not valid JSON: {e}");
                    IndexMap::new()
                }
            }
        } else {
            IndexMap::new()
        };

        // Merge loaded over defaults, then drop keys the default set no
        // longer recognizes (schema drift is discarded, not carried
        // forward).
        let mut merged = defaults.clone();
        for (k, v) in loaded {
            if defaults.contains_key(&k) {
                merged.insert(k, v);
            }
        }
        for key in LIST_KEYS {
            let is_list = matches!(merged.get(*key), Some(Value::List(_)));
            if !is_list {
                merged.insert(key.to_string(), Value::List(vec![]));
            }
        }

        let cfg = Config { store: merged, path };
        cfg.save()?;
        Ok(cfg)
    }

    /// Redirect where `save` writes, without touching the in-memory store.
    /// Used by other crates' tests to avoid scribbling a `conf.json` into
    /// the current directory.
    pub fn set_path(&mut self, path: impl Into<PathBuf>) {
        self.path = path.into();
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let obj = Value::Object(self.store.clone());
        let text = serde_json::to_string_pretty(&obj.to_json())?;
        std::fs::write(&self.path, text)?;
        info!(target: "mgin", "configuration saved to {}", self.path.display());
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.store.get(key)
    }

    pub fn get_str(&self, key: &str) -> String {
        self.store.get(key).map(Value::stringify).unwrap_or_default()
    }

    pub fn get_bool(&self, key: &str) -> bool {
        self.get_str(key) == "1" || self.get_str(key).eq_ignore_ascii_case("true")
    }

    pub fn get_i64(&self, key: &str) -> i64 {
        self.get_str(key).parse().unwrap_or(0)
    }

    pub fn get_list(&self, key: &str) -> Vec<String> {
        match self.store.get(key) {
            Some(Value::List(items)) => items.iter().map(Value::stringify).collect(),
            _ => vec![],
        }
    }

    pub fn set(&mut self, key: &str, value: Value) -> Result<()> {
        self.store.insert(key.to_string(), value);
        self.save()
    }

    pub fn del(&mut self, key: &str) -> Result<()> {
        if PROTECTED_KEYS.contains(&key) {
            return Err(err(format!(
                "Cannot delete essential configuration key '{key}'"
            )));
        }
        if self.store.shift_remove(key).is_none() {
            return Err(err(format!("Configuration key '{key}' does not exist")));
        }
        self.save()
    }

    pub fn list_add(&mut self, key: &str, value: &str) -> Result<bool> {
        let entry = self
            .store
            .entry(key.to_string())
            .or_insert_with(|| Value::List(vec![]));
        let list = match entry {
            Value::List(l) => l,
            other => {
                *other = Value::List(vec![]);
                match other {
                    Value::List(l) => l,
                    _ => unreachable!(),
                }
            }
        };
        if list.iter().any(|v| v.stringify() == value) {
            return Ok(false);
        }
        list.push(Value::Str(value.to_string()));
        self.save()?;
        Ok(true)
    }

    pub fn list_remove(&mut self, key: &str, value: &str) -> Result<bool> {
        if let Some(Value::List(l)) = self.store.get_mut(key) {
            let before = l.len();
            l.retain(|v| v.stringify() != value);
            let removed = l.len() != before;
            if removed {
                self.save()?;
            }
            return Ok(removed);
        }
        Ok(false)
    }

    pub fn as_json(&self) -> String {
        Value::Object(self.store.clone()).canonical_json()
    }

    pub fn sharding_enabled(&self) -> bool {
        self.get_bool("SHARDING")
    }

    pub fn shards(&self) -> Vec<String> {
        self.get_list("SHARDS")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_have_empty_shards() {
        let cfg = Config::defaults();
        assert_eq!(cfg.shards(), Vec::<String>::new());
        assert_eq!(cfg.get_str("PORT"), "6446");
    }

    #[test]
    fn protected_keys_refuse_deletion() {
        let mut cfg = Config::defaults();
        let err = cfg.del("SHARDING").unwrap_err();
        assert!(format!("{err:?}").contains("essential"));
    }

    #[test]
    fn list_add_and_remove_roundtrip() {
        let mut cfg = Config::defaults();
        cfg.path = PathBuf::from(std::env::temp_dir().join("mgin-config-test.json"));
        assert!(cfg.list_add("SHARDS", "10.0.0.1").unwrap());
        assert!(!cfg.list_add("SHARDS", "10.0.0.1").unwrap());
        assert_eq!(cfg.shards(), vec!["10.0.0.1".to_string()]);
        assert!(cfg.list_remove("SHARDS", "10.0.0.1").unwrap());
        assert!(cfg.shards().is_empty());
        let _ = std::fs::remove_file(&cfg.path);
    }
}
