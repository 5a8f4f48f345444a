// The QUERY/COUNT evaluation pipeline (§4.7): resolves a parsed
// `QueryCommand` against the document tree and the secondary index
// engine, in the order the specification lists — entity fetch, or
// index-backed/full-scan filtering, then JOIN, then GROUPBY/ORDERBY/
// LIMIT, then INCLUDE/EXCLUDE projection.
//
// This crate never mutates either store; sharding's peer fan-out (which
// needs to concatenate remote rows with local ones before the
// post-aggregation modifiers run) is why `filter_and_join` and
// `finalize` are exposed separately instead of folded into one
// function.

mod filter;
mod modifiers;

use indexmap::IndexMap;
use mgin_base::{split, Result, Value};
use mgin_index::IndexEngine;
use mgin_query::condition::compare;
use mgin_query::{eval_entry, JoinClause, QueryCommand};
use mgin_store::DataStore;

/// Run a full `QUERY`, returning the shape it caches and sends back over
/// the wire: a flat row list, or (when GROUPBY is present) a two-element
/// `[groups, flat]` pair.
pub fn evaluate(data: &DataStore, index: &IndexEngine, q: &QueryCommand) -> Result<Value> {
    let segs = split(&q.path);
    if segs.is_empty() {
        return Ok(Value::List(vec![]));
    }

    if segs.len() >= 2 {
        return evaluate_entity(data, index, q, &segs);
    }

    let rows = filter_and_join(data, index, q)?;
    Ok(finalize(rows, q))
}

/// `COUNT` reuses the filter+join stage only; GROUPBY/ORDERBY/LIMIT and
/// projection never change the number of matching rows.
pub fn count(data: &DataStore, index: &IndexEngine, q: &QueryCommand) -> Result<usize> {
    let segs = split(&q.path);
    if segs.is_empty() {
        return Ok(0);
    }
    if segs.len() >= 2 {
        return Ok(if data.get(&q.path).is_some() { 1 } else { 0 });
    }
    Ok(filter_and_join(data, index, q)?.len())
}

fn evaluate_entity(data: &DataStore, index: &IndexEngine, q: &QueryCommand, segs: &[&str]) -> Result<Value> {
    let entity_id = segs[1];
    let entity = match data.get(&q.path) {
        Some(v) => v,
        None => return Ok(Value::List(vec![])),
    };
    let mut row = row_from_entity(entity_id, entity);
    for join in &q.joins {
        apply_join_no_fallback(&mut row, join, data, index);
    }
    let projected = filter::project(&row, &q.include, &q.exclude);
    Ok(Value::List(vec![projected]))
}

/// WHERE-filtering plus JOIN, before any GROUPBY/ORDERBY/LIMIT/
/// projection. Exposed for sharding's peer-result concatenation.
pub fn filter_and_join(data: &DataStore, index: &IndexEngine, q: &QueryCommand) -> Result<Vec<Value>> {
    let segs = split(&q.path);
    let top = segs[0];

    let mut rows = if q.conditions.is_empty() {
        full_scan_all(data, top)
    } else {
        match index_backed_ids(top, q, index) {
            Some(ids) => ids
                .into_iter()
                .filter_map(|id| entity_at(data, top, &id).map(|e| row_from_entity(&id, e)))
                .collect(),
            None => full_scan_filtered(data, top, q),
        }
    };

    for join in &q.joins {
        apply_join_with_fallback(&mut rows, join, data, index);
    }

    Ok(rows)
}

/// Apply GROUPBY/ORDERBY/LIMIT then INCLUDE/EXCLUDE to an already
/// filtered+joined row list.
pub fn finalize(rows: Vec<Value>, q: &QueryCommand) -> Value {
    match modifiers::apply(rows, q) {
        modifiers::Outcome::Flat(rows) => {
            Value::List(rows.into_iter().map(|r| filter::project(&r, &q.include, &q.exclude)).collect())
        }
        modifiers::Outcome::Grouped { groups, flat } => {
            let grouped_value = Value::Object(
                groups
                    .into_iter()
                    .map(|(k, v)| {
                        (
                            k,
                            Value::List(v.into_iter().map(|r| filter::project(&r, &q.include, &q.exclude)).collect()),
                        )
                    })
                    .collect(),
            );
            let flat_value = Value::List(flat.into_iter().map(|r| filter::project(&r, &q.include, &q.exclude)).collect());
            Value::List(vec![grouped_value, flat_value])
        }
    }
}

fn entity_at<'a>(data: &'a DataStore, top: &str, id: &str) -> Option<&'a Value> {
    data.top_level(top)?.as_object()?.get(id)
}

/// Wrap an entity object (or scalar) as a single result row with its id
/// injected under `key`, matching `format_as_list`'s per-entry shape.
fn row_from_entity(id: &str, entity: &Value) -> Value {
    let mut row = IndexMap::new();
    row.insert("key".to_string(), Value::Str(id.to_string()));
    match entity {
        Value::Object(m) => {
            for (k, v) in m {
                if k != "key" {
                    row.insert(k.clone(), v.clone());
                }
            }
        }
        other => {
            row.insert("value".to_string(), other.clone());
        }
    }
    Value::Object(row)
}

fn full_scan_all(data: &DataStore, top: &str) -> Vec<Value> {
    match data.top_level(top) {
        Some(Value::Object(entities)) => entities.iter().map(|(id, e)| row_from_entity(id, e)).collect(),
        _ => vec![],
    }
}

fn full_scan_filtered(data: &DataStore, top: &str, q: &QueryCommand) -> Vec<Value> {
    match data.top_level(top) {
        Some(Value::Object(entities)) => entities
            .iter()
            .filter(|(_, e)| eval_entry(e, &q.conditions))
            .map(|(id, e)| row_from_entity(id, e))
            .collect(),
        _ => vec![],
    }
}

/// Attempt to resolve every condition term via its secondary index,
/// combining candidate id sets left to right with AND=intersection,
/// OR=union. Returns `None` (triggering a full scan instead) the moment
/// any term's field has no index at all.
fn index_backed_ids(top: &str, q: &QueryCommand, index: &IndexEngine) -> Option<Vec<String>> {
    use indexmap::IndexSet;

    let mut current: Option<IndexSet<String>> = None;
    for (conn, term) in &q.conditions {
        let path = format!("{top}:{}", term.field);
        let descriptor = index.get(&path)?;
        let matched = matching_ids(descriptor, term);
        current = Some(match (current, conn) {
            (None, _) => matched,
            (Some(existing), Some(mgin_query::Connector::Or)) => existing.union(&matched).cloned().collect(),
            (Some(existing), _) => existing.intersection(&matched).cloned().collect(),
        });
    }
    Some(current.map(|s| s.into_iter().collect()).unwrap_or_default())
}

/// Candidate entity ids whose indexed value satisfies `term`, found by
/// applying the same comparison used for a full scan to each distinct
/// indexed value (the bucket label) rather than to every document.
fn matching_ids(descriptor: &mgin_index::IndexDescriptor, term: &mgin_query::Term) -> indexmap::IndexSet<String> {
    use mgin_index::IndexValues;

    let mut ids = indexmap::IndexSet::new();
    match &descriptor.values {
        IndexValues::Strings(m) => {
            for (bucket, entity_key) in m {
                if compare(&Value::Str(bucket.clone()), term.op, &term.literal) {
                    ids.insert(strip_top(entity_key));
                }
            }
        }
        IndexValues::Sets(m) => {
            for (bucket, entity_keys) in m {
                if compare(&Value::Str(bucket.clone()), term.op, &term.literal) {
                    for entity_key in entity_keys {
                        ids.insert(strip_top(entity_key));
                    }
                }
            }
        }
    }
    ids
}

/// Entity keys in the index are `"<top>:<id>"`; strip the top-level
/// prefix back off to get the bare id `row_from_entity` expects.
fn strip_top(entity_key: &str) -> String {
    entity_key.split_once(':').map(|(_, id)| id.to_string()).unwrap_or_else(|| entity_key.to_string())
}

/// General JOIN path (§4.7 step 4): look up the foreign collection by the
/// join field's value, via the foreign index if present, else by
/// scanning the foreign collection directly.
fn apply_join_with_fallback(rows: &mut [Value], join: &JoinClause, data: &DataStore, index: &IndexEngine) {
    for row in rows.iter_mut() {
        let joined = join_values(row, join).into_iter().flat_map(|value| {
            let path = format!("{}:{}", join.table, join.field);
            match index.get(&path) {
                Some(descriptor) => lookup_ids_for_value(descriptor, &value),
                None => scan_for_value(data, &join.table, &join.field, &value),
            }
        });
        attach_join(row, join, joined, data);
    }
}

/// Entity-specific JOIN path (§4.7 step 1): index lookup only, no scan
/// fallback when the join's index is missing, matching the original's
/// asymmetry between the two JOIN code paths.
fn apply_join_no_fallback(row: &mut Value, join: &JoinClause, data: &DataStore, index: &IndexEngine) {
    let joined = join_values(row, join).into_iter().flat_map(|value| {
        let path = format!("{}:{}", join.table, join.field);
        match index.get(&path) {
            Some(descriptor) => lookup_ids_for_value(descriptor, &value),
            None => vec![],
        }
    });
    attach_join(row, join, joined, data);
}

fn join_values(row: &Value, join: &JoinClause) -> Vec<String> {
    match row.as_object().and_then(|o| o.get(&join.field)) {
        Some(Value::List(items)) => items.iter().map(Value::stringify).collect(),
        Some(Value::Null) | None => vec![],
        Some(other) => vec![other.stringify()],
    }
}

fn lookup_ids_for_value(descriptor: &mgin_index::IndexDescriptor, value: &str) -> Vec<String> {
    use mgin_index::IndexValues;
    match &descriptor.values {
        IndexValues::Strings(m) => m.get(value).map(|k| vec![strip_top(k)]).unwrap_or_default(),
        IndexValues::Sets(m) => m.get(value).map(|s| s.iter().map(|k| strip_top(k)).collect()).unwrap_or_default(),
    }
}

fn scan_for_value(data: &DataStore, top: &str, field: &str, value: &str) -> Vec<String> {
    match data.top_level(top) {
        Some(Value::Object(entities)) => entities
            .iter()
            .filter(|(_, e)| e.as_object().and_then(|o| o.get(field)).map(|v| v.stringify()) == Some(value.to_string()))
            .map(|(id, _)| id.clone())
            .collect(),
        _ => vec![],
    }
}

fn attach_join(row: &mut Value, join: &JoinClause, ids: impl Iterator<Item = String>, data: &DataStore) {
    let mut seen = indexmap::IndexSet::new();
    let mut joined_rows = Vec::new();
    for id in ids {
        if seen.insert(id.clone()) {
            if let Some(entity) = entity_at(data, &join.table, &id) {
                joined_rows.push(row_from_entity(&id, entity));
            }
        }
    }
    if let Value::Object(m) = row {
        m.insert(join.table.clone(), Value::List(joined_rows));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mgin_index::IndexKind;
    use mgin_query::parse_query;

    fn store_with_users() -> DataStore {
        let mut data = DataStore::new();
        data.set("user:1:name", Value::Str("Ana".into())).unwrap();
        data.set("user:1:age", Value::Int(30)).unwrap();
        data.set("user:2:name", Value::Str("Bo".into())).unwrap();
        data.set("user:2:age", Value::Int(20)).unwrap();
        data
    }

    #[test]
    fn full_scan_filters_by_condition() {
        let data = store_with_users();
        let index = IndexEngine::new();
        let q = parse_query("user WHERE age > 25").unwrap();
        let out = evaluate(&data, &index, &q).unwrap();
        let rows = out.as_list().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].as_object().unwrap().get("name"), Some(&Value::Str("Ana".into())));
    }

    #[test]
    fn index_backed_path_matches_full_scan() {
        let data = store_with_users();
        let mut index = IndexEngine::new();
        index.create("user:age", IndexKind::String, &data).unwrap();
        let q = parse_query("user WHERE age > 25").unwrap();
        let out = evaluate(&data, &index, &q).unwrap();
        let rows = out.as_list().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].as_object().unwrap().get("name"), Some(&Value::Str("Ana".into())));
    }

    #[test]
    fn missing_index_falls_back_to_full_scan() {
        let data = store_with_users();
        let index = IndexEngine::new();
        let q = parse_query("user WHERE age > 25 AND name = Ana").unwrap();
        let out = evaluate(&data, &index, &q).unwrap();
        assert_eq!(out.as_list().unwrap().len(), 1);
    }

    #[test]
    fn entity_path_returns_single_row() {
        let data = store_with_users();
        let index = IndexEngine::new();
        let q = parse_query("user:1").unwrap();
        let out = evaluate(&data, &index, &q).unwrap();
        let rows = out.as_list().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].as_object().unwrap().get("key"), Some(&Value::Str("1".into())));
    }

    #[test]
    fn missing_entity_path_returns_empty_list() {
        let data = store_with_users();
        let index = IndexEngine::new();
        let q = parse_query("user:99").unwrap();
        let out = evaluate(&data, &index, &q).unwrap();
        assert_eq!(out.as_list().unwrap().len(), 0);
    }

    #[test]
    fn join_attaches_matching_foreign_rows() {
        let mut data = store_with_users();
        data.set("order:10:user_id", Value::Str("1".into())).unwrap();
        let mut index = IndexEngine::new();
        index.create("order:user_id", IndexKind::Set, &data).unwrap();
        let q = parse_query("user WHERE age > 25 JOIN(order,user_id)").unwrap();
        let out = evaluate(&data, &index, &q).unwrap();
        let rows = out.as_list().unwrap();
        let joined = rows[0].as_object().unwrap().get("order").unwrap().as_list().unwrap();
        assert_eq!(joined.len(), 1);
    }

    #[test]
    fn join_without_index_falls_back_to_scan_on_general_path() {
        let mut data = store_with_users();
        data.set("order:10:user_id", Value::Str("1".into())).unwrap();
        let index = IndexEngine::new();
        let q = parse_query("user WHERE age > 25 JOIN(order,user_id)").unwrap();
        let out = evaluate(&data, &index, &q).unwrap();
        let rows = out.as_list().unwrap();
        let joined = rows[0].as_object().unwrap().get("order").unwrap().as_list().unwrap();
        assert_eq!(joined.len(), 1);
    }

    #[test]
    fn join_without_index_on_entity_path_attaches_nothing() {
        let mut data = store_with_users();
        data.set("order:10:user_id", Value::Str("1".into())).unwrap();
        let index = IndexEngine::new();
        let q = parse_query("user:1 JOIN(order,user_id)").unwrap();
        let out = evaluate(&data, &index, &q).unwrap();
        let rows = out.as_list().unwrap();
        let joined = rows[0].as_object().unwrap().get("order").unwrap().as_list().unwrap();
        assert_eq!(joined.len(), 0);
    }

    #[test]
    fn groupby_returns_groups_and_flat_pair() {
        let data = store_with_users();
        let index = IndexEngine::new();
        let q = parse_query("user GROUPBY(age)").unwrap();
        let out = evaluate(&data, &index, &q).unwrap();
        let pair = out.as_list().unwrap();
        assert_eq!(pair.len(), 2);
        assert!(pair[0].is_object());
        assert_eq!(pair[1].as_list().unwrap().len(), 2);
    }

    #[test]
    fn include_projects_result_rows() {
        let data = store_with_users();
        let index = IndexEngine::new();
        let q = parse_query("user INCLUDE(name)").unwrap();
        let out = evaluate(&data, &index, &q).unwrap();
        for row in out.as_list().unwrap() {
            let obj = row.as_object().unwrap();
            assert!(obj.contains_key("name"));
            assert!(!obj.contains_key("age"));
        }
    }

    #[test]
    fn count_matches_filtered_row_count() {
        let data = store_with_users();
        let index = IndexEngine::new();
        let q = parse_query("user WHERE age > 15").unwrap();
        assert_eq!(count(&data, &index, &q).unwrap(), 2);
    }
}
