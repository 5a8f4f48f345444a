// The query result cache (§4.8). Keyed by the normalized command string
// that produced a result; invalidated either by the exact top-level key
// a query ran against, or coarsely, by any cached key-path that contains
// the mutated key as a substring. `now` is supplied by the caller (the
// engine's clock) rather than read internally, matching `mgin-store`'s
// `TtlStore` convention and keeping this crate trivially testable.

use indexmap::IndexMap;
use mgin_base::Value;

#[derive(Clone, Debug)]
struct Entry {
    result: Value,
    last_accessed: i64,
    expiration: i64,
}

#[derive(Clone, Debug, Default)]
pub struct QueryCache {
    enabled: bool,
    ttl: i64,
    cache: IndexMap<String, Entry>,
    /// query_key (or `query_key:entity_key`) -> commands that depend on it.
    key_commands: IndexMap<String, Vec<String>>,
}

impl QueryCache {
    pub fn new(enabled: bool, ttl: i64) -> Self {
        QueryCache { enabled, ttl, cache: IndexMap::new(), key_commands: IndexMap::new() }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn set_ttl(&mut self, ttl: i64) {
        self.ttl = ttl;
    }

    /// Look up a command's cached result, refreshing `last_accessed` on a
    /// hit. Returns `None` on a miss, on expiry, or when caching is off.
    pub fn get(&mut self, command: &str, now: i64) -> Option<Value> {
        if !self.enabled {
            return None;
        }
        let hit = match self.cache.get(command) {
            Some(entry) if entry.expiration > now => true,
            _ => false,
        };
        if !hit {
            return None;
        }
        let entry = self.cache.get_mut(command).expect("checked above");
        entry.last_accessed = now;
        Some(entry.result.clone())
    }

    /// Record a result for `command`, run against `query_key`. Every row
    /// of a list result that carries a `key` field additionally registers
    /// the command under `query_key:key`, so a mutation to that single
    /// entity can invalidate the broader query too.
    pub fn insert(&mut self, command: &str, query_key: &str, result: &Value, now: i64) {
        if !self.enabled {
            return;
        }
        let expiration = now + self.ttl;
        self.cache.insert(
            command.to_string(),
            Entry { result: result.clone(), last_accessed: now, expiration },
        );
        self.key_commands.entry(query_key.to_string()).or_default().push(command.to_string());

        if let Some(rows) = result.as_list() {
            for row in rows {
                if let Some(entity_key) = row.as_object().and_then(|o| o.get("key")) {
                    let individual = format!("{query_key}:{}", entity_key.stringify());
                    self.key_commands.entry(individual).or_default().push(command.to_string());
                }
            }
        }
    }

    /// Invalidate every command cached under `query_key` exactly, plus
    /// every broader tracked key whose path contains `query_key` as a
    /// substring (so `SET user:1:name ...` also drops a cached
    /// `QUERY user ...`).
    pub fn invalidate(&mut self, query_key: &str) {
        if !self.enabled {
            return;
        }
        let mut keys_to_drop = Vec::new();
        for (key, commands) in self.key_commands.iter() {
            if key == query_key || key.contains(query_key) {
                for command in commands {
                    self.cache.shift_remove(command);
                }
                keys_to_drop.push(key.clone());
            }
        }
        for key in keys_to_drop {
            self.key_commands.shift_remove(&key);
        }
    }

    /// Drop every cache entry whose expiration is `<= now` (§4.10 scheduler
    /// tick). Returns the number of entries removed.
    pub fn sweep(&mut self, now: i64) -> usize {
        let expired: Vec<String> = self
            .cache
            .iter()
            .filter(|(_, e)| e.expiration <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for command in &expired {
            self.cache.shift_remove(command);
            for commands in self.key_commands.values_mut() {
                commands.retain(|c| c != command);
            }
        }
        self.key_commands.retain(|_, commands| !commands.is_empty());
        expired.len()
    }

    pub fn flush(&mut self) {
        self.cache.clear();
        self.key_commands.clear();
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap as Map;

    fn list_row(key: &str) -> Value {
        let mut m = Map::new();
        m.insert("key".to_string(), Value::Str(key.to_string()));
        Value::Object(m)
    }

    #[test]
    fn disabled_cache_never_stores_or_returns() {
        let mut cache = QueryCache::new(false, 60);
        cache.insert("QUERY user", "user", &Value::List(vec![]), 0);
        assert_eq!(cache.get("QUERY user", 0), None);
    }

    #[test]
    fn hit_returns_stored_result_before_expiry() {
        let mut cache = QueryCache::new(true, 60);
        let result = Value::List(vec![list_row("1")]);
        cache.insert("QUERY user", "user", &result, 100);
        assert_eq!(cache.get("QUERY user", 150), Some(result));
    }

    #[test]
    fn expired_entry_misses() {
        let mut cache = QueryCache::new(true, 60);
        cache.insert("QUERY user", "user", &Value::List(vec![]), 100);
        assert_eq!(cache.get("QUERY user", 161), None);
    }

    #[test]
    fn invalidate_drops_exact_key_match() {
        let mut cache = QueryCache::new(true, 60);
        cache.insert("QUERY user", "user", &Value::List(vec![]), 0);
        cache.invalidate("user");
        assert_eq!(cache.get("QUERY user", 0), None);
    }

    #[test]
    fn invalidate_drops_commands_tracking_individual_entity() {
        let mut cache = QueryCache::new(true, 60);
        let result = Value::List(vec![list_row("1")]);
        cache.insert("QUERY user", "user", &result, 0);
        cache.invalidate("user:1");
        assert_eq!(cache.get("QUERY user", 0), None);
    }

    #[test]
    fn sweep_removes_only_expired_entries() {
        let mut cache = QueryCache::new(true, 60);
        cache.insert("fresh", "a", &Value::List(vec![]), 0);
        cache.insert("stale", "b", &Value::List(vec![]), 0);
        cache.cache.get_mut("stale").unwrap().expiration = -1;
        let removed = cache.sweep(0);
        assert_eq!(removed, 1);
        assert!(cache.get("fresh", 0).is_some());
        assert!(cache.get("stale", 0).is_none());
    }

    #[test]
    fn flush_clears_everything() {
        let mut cache = QueryCache::new(true, 60);
        cache.insert("QUERY user", "user", &Value::List(vec![]), 0);
        cache.flush();
        assert!(cache.is_empty());
    }
}
