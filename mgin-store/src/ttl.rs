use indexmap::IndexMap;

use crate::DataStore;

/// Mapping from full path to absolute expiry timestamp (Unix seconds). Not
/// persisted to disk: the original's `expires_store` is rebuilt from SET
/// `EXPIRE(...)` calls during the process's lifetime only.
#[derive(Clone, Debug, Default)]
pub struct TtlStore {
    expires: IndexMap<String, i64>,
}

impl TtlStore {
    pub fn new() -> Self {
        TtlStore::default()
    }

    pub fn set(&mut self, path: &str, expire_at: i64) {
        self.expires.insert(path.to_string(), expire_at);
    }

    pub fn remove(&mut self, path: &str) {
        self.expires.shift_remove(path);
    }

    pub fn get(&self, path: &str) -> Option<i64> {
        self.expires.get(path).copied()
    }

    pub fn len(&self) -> usize {
        self.expires.len()
    }

    pub fn is_empty(&self) -> bool {
        self.expires.is_empty()
    }

    /// Remove every path whose expiry is `<= now` from both the TTL store
    /// and the document tree, pruning ancestors left empty. Returns the
    /// paths that were actually removed (for cache invalidation and
    /// subscriber notification at the scheduler tick).
    pub fn sweep(&mut self, data: &mut DataStore, now: i64) -> Vec<String> {
        let expired: Vec<String> = self
            .expires
            .iter()
            .filter(|(_, exp)| **exp <= now)
            .map(|(k, _)| k.clone())
            .collect();

        let mut removed = Vec::new();
        for path in expired {
            if data.delete(&path).is_some() {
                data.prune_ancestors(&path);
                removed.push(path.clone());
            }
            self.expires.shift_remove(&path);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mgin_base::Value;

    #[test]
    fn sweep_removes_expired_paths_and_empty_ancestors() {
        let mut data = DataStore::new();
        data.set("session:1:token", Value::Str("abc".into())).unwrap();
        let mut ttl = TtlStore::new();
        ttl.set("session:1:token", 100);
        let removed = ttl.sweep(&mut data, 200);
        assert_eq!(removed, vec!["session:1:token".to_string()]);
        assert_eq!(data.get("session:1"), None);
        assert!(ttl.is_empty());
    }

    #[test]
    fn sweep_keeps_unexpired_paths() {
        let mut data = DataStore::new();
        data.set("session:1:token", Value::Str("abc".into())).unwrap();
        let mut ttl = TtlStore::new();
        ttl.set("session:1:token", 1_000_000);
        let removed = ttl.sweep(&mut data, 200);
        assert!(removed.is_empty());
        assert!(data.get("session:1:token").is_some());
    }
}
