// GROUPBY/ORDERBY/LIMIT (§4.7 step 5). Mirrors `apply_query_modifiers` /
// `custom_sort_key`: GROUPBY buckets first, ORDERBY then sorts within each
// bucket (or the flat list when ungrouped), and LIMIT slices both the flat
// list and every bucket independently. A row whose group-by field is
// missing or null is dropped from the grouping, matching the original's
// truthiness check on the group key.

use indexmap::IndexMap;
use mgin_base::Value;
use mgin_query::{Limit, OrderDir, QueryCommand};

/// The shape `apply_query_modifiers` hands back: either a plain row list,
/// or (when GROUPBY is present) the bucketed groups alongside the flat,
/// equally-sliced list the original returns as a two-element pair.
pub enum Outcome {
    Flat(Vec<Value>),
    Grouped { groups: IndexMap<String, Vec<Value>>, flat: Vec<Value> },
}

pub fn apply(rows: Vec<Value>, q: &QueryCommand) -> Outcome {
    let mut flat = rows;
    let mut groups = q.group_by.as_ref().map(|field| group_by(&flat, field));

    if let Some((field, dir)) = &q.order_by {
        if let Some(g) = groups.as_mut() {
            for bucket in g.values_mut() {
                sort_rows(bucket, field, *dir);
            }
        } else {
            sort_rows(&mut flat, field, *dir);
        }
    }

    if let Some(limit) = &q.limit {
        if let Some(g) = groups.as_mut() {
            for bucket in g.values_mut() {
                *bucket = slice(bucket, limit);
            }
        }
        flat = slice(&flat, limit);
    }

    match groups {
        Some(groups) => Outcome::Grouped { groups, flat },
        None => Outcome::Flat(flat),
    }
}

fn group_by(rows: &[Value], field: &str) -> IndexMap<String, Vec<Value>> {
    let mut groups: IndexMap<String, Vec<Value>> = IndexMap::new();
    for row in rows {
        let key_value = row.as_object().and_then(|o| o.get(field));
        let is_truthy = match key_value {
            None => false,
            Some(Value::Null) => false,
            Some(Value::Str(s)) => !s.is_empty(),
            Some(Value::Int(i)) => *i != 0,
            Some(Value::Float(f)) => *f != 0.0,
            Some(Value::Bool(b)) => *b,
            Some(_) => true,
        };
        if !is_truthy {
            continue;
        }
        let key = key_value.unwrap().stringify();
        groups.entry(key).or_default().push(row.clone());
    }
    groups
}

fn sort_rows(rows: &mut [Value], field: &str, dir: OrderDir) {
    rows.sort_by(|a, b| {
        let ka = a.as_object().and_then(|o| o.get(field)).map(Value::order_key).unwrap_or(mgin_base::OrderKey::Missing);
        let kb = b.as_object().and_then(|o| o.get(field)).map(Value::order_key).unwrap_or(mgin_base::OrderKey::Missing);
        ka.cmp(&kb)
    });
    if dir == OrderDir::Desc {
        rows.reverse();
    }
}

fn slice(rows: &[Value], limit: &Limit) -> Vec<Value> {
    rows.iter().skip(limit.start).take(limit.count).cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mgin_query::parse_query;

    fn row(key: &str, age: i64) -> Value {
        let mut m = IndexMap::new();
        m.insert("key".to_string(), Value::Str(key.to_string()));
        m.insert("age".to_string(), Value::Int(age));
        Value::Object(m)
    }

    #[test]
    fn orderby_sorts_ascending_by_default() {
        let q = parse_query("user ORDERBY(age)").unwrap();
        let rows = vec![row("a", 30), row("b", 10), row("c", 20)];
        match apply(rows, &q) {
            Outcome::Flat(out) => {
                let ages: Vec<i64> = out.iter().map(|r| r.as_object().unwrap().get("age").unwrap().as_i64().unwrap()).collect();
                assert_eq!(ages, vec![10, 20, 30]);
            }
            _ => panic!("expected flat outcome"),
        }
    }

    #[test]
    fn limit_slices_flat_results() {
        let q = parse_query("user LIMIT(1,2)").unwrap();
        let rows = vec![row("a", 1), row("b", 2), row("c", 3)];
        match apply(rows, &q) {
            Outcome::Flat(out) => {
                let keys: Vec<String> = out.iter().map(|r| r.as_object().unwrap().get("key").unwrap().stringify()).collect();
                assert_eq!(keys, vec!["b".to_string(), "c".to_string()]);
            }
            _ => panic!("expected flat outcome"),
        }
    }

    #[test]
    fn groupby_buckets_by_field_and_drops_falsy_keys() {
        let q = parse_query("user GROUPBY(age)").unwrap();
        let mut m = IndexMap::new();
        m.insert("key".to_string(), Value::Str("d".to_string()));
        m.insert("age".to_string(), Value::Int(0));
        let falsy_row = Value::Object(m);
        let rows = vec![row("a", 10), row("b", 10), row("c", 20), falsy_row];
        match apply(rows, &q) {
            Outcome::Grouped { groups, flat } => {
                assert_eq!(groups.get("10").map(|v| v.len()), Some(2));
                assert_eq!(groups.get("20").map(|v| v.len()), Some(1));
                assert!(!groups.contains_key("0"));
                assert_eq!(flat.len(), 4);
            }
            _ => panic!("expected grouped outcome"),
        }
    }
}
