use indexmap::IndexMap;
use mgin_base::{err, split, Result, Value};

/// The process-wide document tree: a mapping from top-level key to
/// arbitrarily nested `Value::Object`s. Paths are colon-joined; navigation
/// creates intermediate objects as needed on write, and is read-only
/// (returning `None` on a missing segment) on read.
#[derive(Clone, Debug, Default)]
pub struct DataStore {
    root: IndexMap<String, Value>,
}

impl DataStore {
    pub fn new() -> Self {
        DataStore { root: IndexMap::new() }
    }

    pub fn from_value(v: Value) -> Self {
        match v {
            Value::Object(m) => DataStore { root: m },
            _ => DataStore::new(),
        }
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.root.clone())
    }

    pub fn top_level_keys(&self) -> Vec<String> {
        self.root.keys().cloned().collect()
    }

    pub fn has_top_level(&self, key: &str) -> bool {
        self.root.contains_key(key)
    }

    pub fn top_level(&self, key: &str) -> Option<&Value> {
        self.root.get(key)
    }

    /// Read a path. Returns `None` if any intermediate segment is missing
    /// or is not an object.
    pub fn get(&self, path: &str) -> Option<&Value> {
        let segs = split(path);
        if segs.is_empty() {
            return None;
        }
        let mut cur = self.root.get(segs[0])?;
        for seg in &segs[1..] {
            cur = cur.as_object()?.get(*seg)?;
        }
        Some(cur)
    }

    /// Resolve a single `*` wildcard segment at `depth` (0-indexed) against
    /// the live tree, returning the concrete paths it expands to. Only a
    /// single wildcard segment is supported, matching the only place the
    /// command surface accepts one (§4.1).
    pub fn resolve_wildcard(&self, segs: &[&str]) -> Vec<String> {
        let wpos = match segs.iter().position(|s| *s == "*") {
            Some(p) => p,
            None => return vec![segs.join(":")],
        };
        let prefix = &segs[..wpos];
        let suffix = &segs[wpos + 1..];
        let base_obj: Option<IndexMap<String, Value>> = if prefix.is_empty() {
            Some(self.root.clone())
        } else {
            match self.get(&prefix.join(":")) {
                Some(Value::Object(m)) => Some(m.clone()),
                _ => None,
            }
        };
        let base_obj = match base_obj {
            Some(m) => m,
            None => return vec![],
        };
        base_obj
            .keys()
            .map(|k| {
                let mut full: Vec<&str> = prefix.to_vec();
                full.push(k.as_str());
                full.extend_from_slice(suffix);
                full.join(":")
            })
            .collect()
    }

    /// Write a leaf value, creating intermediate objects as needed. Returns
    /// the previous value at that path, if any (used by the caller to drive
    /// `index.on_remove` before `index.on_add`).
    pub fn set(&mut self, path: &str, value: Value) -> Result<Option<Value>> {
        let segs = split(path);
        if segs.is_empty() {
            return Err(err("Empty path"));
        }
        Self::set_at(&mut self.root, &segs, value)
    }

    fn set_at(obj: &mut IndexMap<String, Value>, segs: &[&str], value: Value) -> Result<Option<Value>> {
        if segs.len() == 1 {
            return Ok(obj.insert(segs[0].to_string(), value));
        }
        let child = obj
            .entry(segs[0].to_string())
            .or_insert_with(Value::object);
        if !child.is_object() {
            *child = Value::object();
        }
        let child_map = child.as_object_mut().expect("just made an object");
        Self::set_at(child_map, &segs[1..], value)
    }

    /// Remove the leaf at `path`. Returns the removed value, or `None` if
    /// the path did not exist. Does not prune empty ancestors; callers that
    /// want pruning call `prune_ancestors` afterward.
    pub fn delete(&mut self, path: &str) -> Option<Value> {
        let segs = split(path);
        if segs.is_empty() {
            return None;
        }
        Self::delete_at(&mut self.root, &segs)
    }

    fn delete_at(obj: &mut IndexMap<String, Value>, segs: &[&str]) -> Option<Value> {
        if segs.len() == 1 {
            return obj.shift_remove(segs[0]);
        }
        let child = obj.get_mut(segs[0])?;
        let child_map = child.as_object_mut()?;
        Self::delete_at(child_map, &segs[1..])
    }

    /// After deleting a leaf, remove every ancestor object that is now
    /// empty, walking from the immediate parent up to (but not including)
    /// the top level's container itself.
    pub fn prune_ancestors(&mut self, path: &str) {
        let mut segs = split(path).into_iter().map(str::to_string).collect::<Vec<_>>();
        while segs.len() > 1 {
            segs.pop();
            let joined = segs.join(":");
            let empty = matches!(self.get(&joined), Some(Value::Object(m)) if m.is_empty());
            if empty {
                self.delete(&joined);
            } else {
                break;
            }
        }
    }

    /// Remove every key in the tree named `last_key` at any depth under
    /// `base_path` (including `base_path` itself if it has no further
    /// descent). Matches the original's actual recursive-match wildcard DEL
    /// behavior (unbounded depth), not a single-level match.
    pub fn delete_recursive(&mut self, base_path: &str, last_key: &str) -> usize {
        fn walk(obj: &mut IndexMap<String, Value>, last_key: &str, count: &mut usize) {
            if obj.shift_remove(last_key).is_some() {
                *count += 1;
            }
            for v in obj.values_mut() {
                if let Value::Object(m) = v {
                    walk(m, last_key, count);
                }
            }
        }
        let mut count = 0;
        match self.get_mut(base_path) {
            Some(Value::Object(m)) => walk(m, last_key, &mut count),
            _ => {}
        }
        count
    }

    fn get_mut(&mut self, path: &str) -> Option<&mut Value> {
        let segs = split(path);
        if segs.is_empty() {
            return None;
        }
        let mut cur = self.root.get_mut(segs[0])?;
        for seg in &segs[1..] {
            cur = cur.as_object_mut()?.get_mut(*seg)?;
        }
        Some(cur)
    }

    pub fn rename(&mut self, path: &str, new_last: &str) -> Result<()> {
        let segs = split(path);
        if segs.is_empty() {
            return Err(err("Empty path"));
        }
        let parent_segs = &segs[..segs.len() - 1];
        let old_last = segs[segs.len() - 1];
        let parent = if parent_segs.is_empty() {
            &mut self.root
        } else {
            let parent_path = parent_segs.join(":");
            match self.get_mut(&parent_path) {
                Some(Value::Object(m)) => m,
                _ => return Err(err("Key does not exist")),
            }
        };
        let value = parent
            .shift_remove(old_last)
            .ok_or_else(|| err("Key does not exist"))?;
        parent.insert(new_last.to_string(), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_creates_intermediate_objects() {
        let mut ds = DataStore::new();
        ds.set("user:1:name", Value::Str("Ana".into())).unwrap();
        assert_eq!(ds.get("user:1:name"), Some(&Value::Str("Ana".into())));
        assert!(matches!(ds.get("user:1"), Some(Value::Object(_))));
    }

    #[test]
    fn delete_and_prune_removes_empty_ancestors() {
        let mut ds = DataStore::new();
        ds.set("user:1:name", Value::Str("Ana".into())).unwrap();
        ds.delete("user:1:name");
        ds.prune_ancestors("user:1:name");
        assert_eq!(ds.get("user:1"), None);
        assert_eq!(ds.get("user"), None);
    }

    #[test]
    fn wildcard_resolves_every_sibling() {
        let mut ds = DataStore::new();
        ds.set("user:1:name", Value::Str("Ana".into())).unwrap();
        ds.set("user:2:name", Value::Str("Bo".into())).unwrap();
        let mut paths = ds.resolve_wildcard(&["user", "*", "name"]);
        paths.sort();
        assert_eq!(paths, vec!["user:1:name".to_string(), "user:2:name".to_string()]);
    }

    #[test]
    fn rename_moves_field_within_parent() {
        let mut ds = DataStore::new();
        ds.set("user:1:name", Value::Str("Ana".into())).unwrap();
        ds.rename("user:1:name", "full_name").unwrap();
        assert_eq!(ds.get("user:1:name"), None);
        assert_eq!(ds.get("user:1:full_name"), Some(&Value::Str("Ana".into())));
    }

    #[test]
    fn delete_recursive_matches_any_depth() {
        let mut ds = DataStore::new();
        ds.set("user:1:tags:0", Value::Str("x".into())).unwrap();
        ds.set("user:2:tags:0", Value::Str("y".into())).unwrap();
        let n = ds.delete_recursive("user", "tags");
        assert_eq!(n, 2);
        assert_eq!(ds.get("user:1:tags"), None);
    }
}
