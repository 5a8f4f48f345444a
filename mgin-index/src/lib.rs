// Secondary indices over the document tree. An index tree mirrors the
// document tree's shape down to the indexed field, where a leaf holds a
// descriptor (`{type, values}`) instead of document data. The engine never
// reads or writes document data directly — it is a derived materialization
// driven by `on_add`/`on_remove` calls the caller makes alongside every
// document mutation.

use indexmap::{IndexMap, IndexSet};
use mgin_base::{err, split, Result, Value};
use mgin_store::DataStore;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexKind {
    String,
    Set,
}

impl IndexKind {
    pub fn parse(s: &str) -> Option<IndexKind> {
        match s {
            "string" => Some(IndexKind::String),
            "set" => Some(IndexKind::Set),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IndexKind::String => "string",
            IndexKind::Set => "set",
        }
    }
}

#[derive(Clone, Debug)]
pub enum IndexValues {
    Strings(IndexMap<String, String>),
    Sets(IndexMap<String, IndexSet<String>>),
}

#[derive(Clone, Debug)]
pub struct IndexDescriptor {
    pub kind: IndexKind,
    pub values: IndexValues,
}

impl IndexDescriptor {
    fn new(kind: IndexKind) -> Self {
        let values = match kind {
            IndexKind::String => IndexValues::Strings(IndexMap::new()),
            IndexKind::Set => IndexValues::Sets(IndexMap::new()),
        };
        IndexDescriptor { kind, values }
    }

    fn is_empty(&self) -> bool {
        match &self.values {
            IndexValues::Strings(m) => m.is_empty(),
            IndexValues::Sets(m) => m.is_empty(),
        }
    }
}

#[derive(Clone, Debug)]
pub enum IndexNode {
    Nested(IndexMap<String, IndexNode>),
    Leaf(IndexDescriptor),
}

impl IndexNode {
    fn as_nested_mut(&mut self) -> Option<&mut IndexMap<String, IndexNode>> {
        match self {
            IndexNode::Nested(m) => Some(m),
            _ => None,
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            IndexNode::Nested(m) => m.is_empty(),
            IndexNode::Leaf(d) => d.is_empty(),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct IndexEngine {
    root: IndexMap<String, IndexNode>,
}

impl IndexEngine {
    pub fn new() -> Self {
        IndexEngine::default()
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// Tolerant descent matching `construct_index_parts`: at each step,
    /// descend into a child named by the current segment if one exists;
    /// otherwise stay at the same level and try the next segment. This is
    /// what lets an index created at `user:age` be located and updated by a
    /// mutation at `user:1:age` — the entity id segment isn't part of the
    /// index tree and gets skipped. Returns the key path actually matched,
    /// ending at a leaf, or `None` if no leaf was reached.
    fn match_path(&self, segs: &[&str]) -> Option<Vec<String>> {
        let mut map = &self.root;
        let mut idx = 0;
        let mut matched = Vec::new();
        while idx < segs.len() {
            match map.get(segs[idx]) {
                Some(IndexNode::Leaf(_)) => {
                    matched.push(segs[idx].to_string());
                    return Some(matched);
                }
                Some(IndexNode::Nested(m)) => {
                    matched.push(segs[idx].to_string());
                    map = m;
                    idx += 1;
                }
                None => idx += 1,
            }
        }
        None
    }

    fn leaf_at(&self, matched: &[String]) -> Option<&IndexDescriptor> {
        let mut map = &self.root;
        for (i, key) in matched.iter().enumerate() {
            match map.get(key)? {
                IndexNode::Leaf(d) if i == matched.len() - 1 => return Some(d),
                IndexNode::Nested(m) => map = m,
                _ => return None,
            }
        }
        None
    }

    fn leaf_at_mut(&mut self, matched: &[String]) -> Option<&mut IndexDescriptor> {
        let mut map = &mut self.root;
        for (i, key) in matched.iter().enumerate() {
            let last = i == matched.len() - 1;
            match map.get_mut(key)? {
                IndexNode::Leaf(d) if last => return Some(d),
                IndexNode::Nested(m) => map = m,
                _ => return None,
            }
        }
        None
    }

    /// Remove every now-empty map along `matched`, from the leaf upward.
    fn prune_matched(&mut self, matched: &[String]) {
        fn rec(map: &mut IndexMap<String, IndexNode>, matched: &[String]) {
            if matched.is_empty() {
                return;
            }
            let key = &matched[0];
            let remove = match map.get_mut(key) {
                Some(IndexNode::Nested(inner)) => {
                    rec(inner, &matched[1..]);
                    inner.is_empty()
                }
                Some(IndexNode::Leaf(d)) => d.is_empty(),
                None => false,
            };
            if remove {
                map.shift_remove(key);
            }
        }
        rec(&mut self.root, matched);
    }

    /// Create an index at `path` (colon-joined index field path, e.g.
    /// `user:age`), backfilling it from the current contents of the
    /// top-level collection named by the path's first segment.
    pub fn create(&mut self, path: &str, kind: IndexKind, data: &DataStore) -> Result<()> {
        let segs = split(path);
        if segs.is_empty() {
            return Err(err("Missing index path"));
        }
        let mut map = &mut self.root;
        for seg in &segs[..segs.len() - 1] {
            map = map
                .entry(seg.to_string())
                .or_insert_with(|| IndexNode::Nested(IndexMap::new()))
                .as_nested_mut()
                .ok_or_else(|| err("Index path collides with an existing leaf"))?;
        }
        let last = segs[segs.len() - 1];
        if map.contains_key(last) {
            return Err(err("Index already exists"));
        }
        let mut descriptor = IndexDescriptor::new(kind);

        let top = segs[0];
        let field_path = &segs[1..];
        if let Some(Value::Object(entities)) = data.top_level(top) {
            for (entity_id, entity) in entities {
                if let Some(value) = nested_get(entity, field_path) {
                    let entity_key = format!("{top}:{entity_id}");
                    apply_add(&mut descriptor, value, &entity_key);
                }
            }
        }
        map.insert(last.to_string(), IndexNode::Leaf(descriptor));
        Ok(())
    }

    /// Called after a document field at `mutation_path` is written with
    /// `value`, for the entity identified by `entity_key` (`"<top>:<id>"`).
    pub fn on_add(&mut self, mutation_path: &str, value: &Value, entity_key: &str) {
        let segs = split(mutation_path);
        if let Some(matched) = self.match_path(&segs) {
            if let Some(descriptor) = self.leaf_at_mut(&matched) {
                apply_add(descriptor, value, entity_key);
            }
        }
    }

    /// Mirror of `on_add`: called before a document field is overwritten or
    /// removed, with the value it used to hold.
    pub fn on_remove(&mut self, mutation_path: &str, old_value: &Value, entity_key: &str) {
        let segs = split(mutation_path);
        if let Some(matched) = self.match_path(&segs) {
            if let Some(descriptor) = self.leaf_at_mut(&matched) {
                apply_remove(descriptor, old_value, entity_key);
            }
            self.prune_matched(&matched);
        }
    }

    /// Strip every indexed field of an entity being deleted wholesale (DEL
    /// on an object leaf). `entity` is the object that was removed.
    pub fn remove_entity(&mut self, entity_path: &str, _entity: &Value) {
        let segs = split(entity_path);
        if segs.is_empty() {
            return;
        }
        let top = segs[0];
        let entity_key = segs.join(":");
        let fields = match self.root.get(top) {
            Some(IndexNode::Nested(m)) => m.keys().cloned().collect::<Vec<_>>(),
            _ => return,
        };
        for field in fields {
            if let Some(IndexNode::Leaf(descriptor)) = self
                .root
                .get_mut(top)
                .and_then(|n| n.as_nested_mut())
                .and_then(|m| m.get_mut(&field))
            {
                match &mut descriptor.values {
                    IndexValues::Sets(m) => {
                        for bucket in m.values_mut() {
                            bucket.shift_remove(&entity_key);
                        }
                        m.retain(|_, b| !b.is_empty());
                    }
                    IndexValues::Strings(m) => {
                        m.retain(|_, v| v != &entity_key);
                    }
                }
            }
            self.prune_matched(&[top.to_string(), field]);
        }
    }

    /// Remove a single field value from its index (DEL on a non-object
    /// leaf). `parent_path` is the field's parent path; `field` its name.
    pub fn remove_field(&mut self, parent_path: &str, field: &str, value: &Value) {
        let mut segs: Vec<&str> = split(parent_path);
        let entity_key = segs.join(":");
        segs.push(field);
        if let Some(matched) = self.match_path(&segs) {
            if let Some(descriptor) = self.leaf_at_mut(&matched) {
                apply_remove(descriptor, value, &entity_key);
            }
            self.prune_matched(&matched);
        }
    }

    pub fn del(&mut self, path: &str, value: &str) -> Result<()> {
        let segs = split(path);
        let matched = self
            .match_path(&segs)
            .ok_or_else(|| err(format!("Index '{path}' not found")))?;
        let descriptor = self
            .leaf_at_mut(&matched)
            .ok_or_else(|| err(format!("Index '{path}' not found")))?;
        let removed = match &mut descriptor.values {
            IndexValues::Strings(m) => m.shift_remove(value).is_some(),
            IndexValues::Sets(m) => m.shift_remove(value).is_some(),
        };
        if !removed {
            return Err(err(format!("Value {value} not found under index {path}")));
        }
        self.prune_matched(&matched);
        Ok(())
    }

    pub fn flush(&mut self, path: &str) -> Result<()> {
        let segs = split(path);
        if segs.is_empty() {
            return Err(err("Missing index path"));
        }
        if segs.len() == 1 {
            if self.root.shift_remove(segs[0]).is_none() {
                return Err(err(format!("Index '{}' not found", segs[0])));
            }
            return Ok(());
        }
        let mut map = match self.root.get_mut(segs[0]) {
            Some(IndexNode::Nested(m)) => m,
            _ => return Err(err(format!("Index '{}' not found", segs[0]))),
        };
        for seg in &segs[1..segs.len() - 1] {
            map = match map.get_mut(*seg) {
                Some(IndexNode::Nested(m)) => m,
                _ => return Err(err(format!("Sub-key '{seg}' not found"))),
            };
        }
        let last = segs[segs.len() - 1];
        if map.shift_remove(last).is_none() {
            return Err(err(format!("Sub-key '{last}' not found in index")));
        }
        let prefix: Vec<String> = segs[..segs.len() - 1].iter().map(|s| s.to_string()).collect();
        self.prune_matched(&prefix);
        Ok(())
    }

    pub fn get(&self, path: &str) -> Option<&IndexDescriptor> {
        let segs = split(path);
        let matched = self.match_path(&segs)?;
        self.leaf_at(&matched)
    }

    /// `INDICES LIST`: just the shape (type + field names), no values.
    pub fn list_structure(&self) -> Value {
        fn walk(m: &IndexMap<String, IndexNode>) -> Value {
            let mut out = IndexMap::new();
            for (k, v) in m {
                match v {
                    IndexNode::Leaf(d) => {
                        out.insert(k.clone(), Value::Str(d.kind.as_str().to_string()));
                    }
                    IndexNode::Nested(m) => {
                        out.insert(k.clone(), walk(m));
                    }
                }
            }
            Value::Object(out)
        }
        walk(&self.root)
    }

    /// Rebuild a fresh engine entirely from the live data tree, descending
    /// the existing index shape to know which fields to index. Used by the
    /// index/data-consistency property check.
    pub fn rebuild_from(&self, data: &DataStore) -> IndexEngine {
        fn walk(node: &IndexNode, prefix: &[String], data: &DataStore, out: &mut IndexEngine) {
            match node {
                IndexNode::Leaf(d) => {
                    let path = prefix.join(":");
                    let _ = out.create(&path, d.kind, data);
                }
                IndexNode::Nested(m) => {
                    for (k, v) in m {
                        let mut next = prefix.to_vec();
                        next.push(k.clone());
                        walk(v, &next, data, out);
                    }
                }
            }
        }
        let mut out = IndexEngine::new();
        for (k, v) in &self.root {
            walk(v, &[k.clone()], data, &mut out);
        }
        out
    }

    pub fn to_value(&self) -> Value {
        fn walk(m: &IndexMap<String, IndexNode>) -> Value {
            let mut out = IndexMap::new();
            for (k, v) in m {
                match v {
                    IndexNode::Leaf(d) => {
                        let mut inner = IndexMap::new();
                        inner.insert("type".to_string(), Value::Str(d.kind.as_str().to_string()));
                        let values = match &d.values {
                            IndexValues::Strings(sm) => {
                                let mut vm = IndexMap::new();
                                for (vk, vv) in sm {
                                    vm.insert(vk.clone(), Value::Str(vv.clone()));
                                }
                                Value::Object(vm)
                            }
                            IndexValues::Sets(sm) => {
                                let mut vm = IndexMap::new();
                                for (vk, vv) in sm {
                                    vm.insert(
                                        vk.clone(),
                                        Value::List(vv.iter().map(|s| Value::Str(s.clone())).collect()),
                                    );
                                }
                                Value::Object(vm)
                            }
                        };
                        inner.insert("values".to_string(), values);
                        out.insert(k.clone(), Value::Object(inner));
                    }
                    IndexNode::Nested(m) => {
                        out.insert(k.clone(), walk(m));
                    }
                }
            }
            Value::Object(out)
        }
        walk(&self.root)
    }

    pub fn from_value(v: &Value) -> IndexEngine {
        fn walk(v: &Value) -> IndexMap<String, IndexNode> {
            let mut out = IndexMap::new();
            if let Value::Object(m) = v {
                for (k, inner) in m {
                    if let Value::Object(o) = inner {
                        if let (Some(Value::Str(kind)), Some(values)) =
                            (o.get("type"), o.get("values"))
                        {
                            if let Some(kind) = IndexKind::parse(kind) {
                                let descriptor = match kind {
                                    IndexKind::String => {
                                        let mut sm = IndexMap::new();
                                        if let Value::Object(vm) = values {
                                            for (vk, vv) in vm {
                                                sm.insert(vk.clone(), vv.stringify());
                                            }
                                        }
                                        IndexDescriptor { kind, values: IndexValues::Strings(sm) }
                                    }
                                    IndexKind::Set => {
                                        let mut sm = IndexMap::new();
                                        if let Value::Object(vm) = values {
                                            for (vk, vv) in vm {
                                                let set: IndexSet<String> = match vv {
                                                    Value::List(l) => {
                                                        l.iter().map(Value::stringify).collect()
                                                    }
                                                    other => {
                                                        [other.stringify()].into_iter().collect()
                                                    }
                                                };
                                                sm.insert(vk.clone(), set);
                                            }
                                        }
                                        IndexDescriptor { kind, values: IndexValues::Sets(sm) }
                                    }
                                };
                                out.insert(k.clone(), IndexNode::Leaf(descriptor));
                                continue;
                            }
                        }
                    }
                    out.insert(k.clone(), IndexNode::Nested(walk(inner)));
                }
            }
            out
        }
        IndexEngine { root: walk(v) }
    }
}

fn apply_add(descriptor: &mut IndexDescriptor, value: &Value, entity_key: &str) {
    match &mut descriptor.values {
        IndexValues::Sets(m) => {
            let items: Vec<Value> = match value {
                Value::List(l) => l.clone(),
                other => vec![other.clone()],
            };
            for item in items {
                m.entry(item.stringify())
                    .or_insert_with(IndexSet::new)
                    .insert(entity_key.to_string());
            }
        }
        IndexValues::Strings(m) => {
            m.insert(value.stringify(), entity_key.to_string());
        }
    }
}

fn apply_remove(descriptor: &mut IndexDescriptor, old_value: &Value, entity_key: &str) {
    match &mut descriptor.values {
        IndexValues::Sets(m) => {
            let items: Vec<Value> = match old_value {
                Value::List(l) => l.clone(),
                other => vec![other.clone()],
            };
            for item in items {
                let key = item.stringify();
                if let Some(bucket) = m.get_mut(&key) {
                    bucket.shift_remove(entity_key);
                    if bucket.is_empty() {
                        m.shift_remove(&key);
                    }
                }
            }
        }
        IndexValues::Strings(m) => {
            // The original scans every value in the bucket for a match to
            // the removed entity id rather than looking the old value up
            // directly — preserved here (see SPEC_FULL.md §4.6).
            m.retain(|_, v| v != entity_key);
        }
    }
}

fn nested_get<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    let mut cur = value;
    for seg in path {
        cur = cur.as_object()?.get(*seg)?;
    }
    Some(cur)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mgin_store::DataStore;

    fn sample_data() -> DataStore {
        let mut ds = DataStore::new();
        ds.set("user:1:name", Value::Str("Ana".into())).unwrap();
        ds.set("user:1:age", Value::Int(30)).unwrap();
        ds.set("user:2:name", Value::Str("Bo".into())).unwrap();
        ds.set("user:2:age", Value::Int(20)).unwrap();
        ds
    }

    #[test]
    fn create_backfills_string_index() {
        let data = sample_data();
        let mut engine = IndexEngine::new();
        engine.create("user:age", IndexKind::String, &data).unwrap();
        let descriptor = engine.get("user:age").unwrap();
        match &descriptor.values {
            IndexValues::Strings(m) => {
                assert_eq!(m.get("30"), Some(&"user:1".to_string()));
                assert_eq!(m.get("20"), Some(&"user:2".to_string()));
            }
            _ => panic!("expected string index"),
        }
    }

    #[test]
    fn create_refuses_duplicate() {
        let data = sample_data();
        let mut engine = IndexEngine::new();
        engine.create("user:age", IndexKind::String, &data).unwrap();
        assert!(engine.create("user:age", IndexKind::String, &data).is_err());
    }

    #[test]
    fn on_add_and_remove_keep_set_index_consistent() {
        let mut data = DataStore::new();
        data.set("user:1:tags", Value::List(vec![Value::Str("x".into()), Value::Str("y".into())]))
            .unwrap();
        let mut engine = IndexEngine::new();
        engine.create("user:tags", IndexKind::Set, &data).unwrap();

        engine.on_remove(
            "user:1:tags",
            &Value::List(vec![Value::Str("x".into()), Value::Str("y".into())]),
            "user:1",
        );
        assert!(engine.get("user:tags").is_none());

        engine.on_add("user:1:tags", &Value::List(vec![Value::Str("x".into())]), "user:1");
        match &engine.get("user:tags").unwrap().values {
            IndexValues::Sets(m) => assert!(m.get("x").unwrap().contains("user:1")),
            _ => panic!(),
        }
    }

    #[test]
    fn remove_entity_strips_every_indexed_field() {
        let data = sample_data();
        let mut engine = IndexEngine::new();
        engine.create("user:age", IndexKind::String, &data).unwrap();
        let mut entity = IndexMap::new();
        entity.insert("name".to_string(), Value::Str("Ana".into()));
        entity.insert("age".to_string(), Value::Int(30));
        engine.remove_entity("user:1", &Value::Object(entity));
        match &engine.get("user:age").unwrap().values {
            IndexValues::Strings(m) => assert!(!m.values().any(|v| v == "user:1")),
            _ => panic!(),
        }
    }

    #[test]
    fn remove_field_scans_for_matching_entity_on_string_index() {
        let data = sample_data();
        let mut engine = IndexEngine::new();
        engine.create("user:age", IndexKind::String, &data).unwrap();
        // Removing with a value that no longer matches the live bucket
        // still clears the entry, because string-index removal matches by
        // entity id rather than by the passed-in old value.
        engine.remove_field("user:1", "age", &Value::Int(999));
        match &engine.get("user:age").unwrap().values {
            IndexValues::Strings(m) => assert!(!m.values().any(|v| v == "user:1")),
            _ => panic!(),
        }
    }

    #[test]
    fn rebuild_from_matches_live_index() {
        let data = sample_data();
        let mut engine = IndexEngine::new();
        engine.create("user:age", IndexKind::String, &data).unwrap();
        let rebuilt = engine.rebuild_from(&data);
        assert_eq!(rebuilt.to_value().canonical_json(), engine.to_value().canonical_json());
    }

    #[test]
    fn flush_removes_whole_index_subtree() {
        let data = sample_data();
        let mut engine = IndexEngine::new();
        engine.create("user:age", IndexKind::String, &data).unwrap();
        engine.flush("user:age").unwrap();
        assert!(engine.get("user:age").is_none());
        assert!(engine.is_empty());
    }
}
