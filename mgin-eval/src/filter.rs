// INCLUDE/EXCLUDE projection (§4.7 step 6). Field lists are colon-paths
// that may contain a single `*` wildcard segment matching every key at
// that depth; INCLUDE keeps only the named paths, EXCLUDE removes them
// and keeps everything else.

use indexmap::IndexMap;
use mgin_base::Value;

pub fn project(row: &Value, include: &Option<Vec<String>>, exclude: &Option<Vec<String>>) -> Value {
    if let Some(fields) = include {
        return project_include(row, fields);
    }
    if let Some(fields) = exclude {
        return project_exclude(row, fields);
    }
    row.clone()
}

fn project_include(row: &Value, fields: &[String]) -> Value {
    let obj = match row.as_object() {
        Some(o) => o,
        None => return row.clone(),
    };
    let mut result = IndexMap::new();
    for f in fields {
        let segs: Vec<&str> = f.split(':').collect();
        include_path(obj, &mut result, &segs);
    }
    Value::Object(result)
}

fn include_path(source: &IndexMap<String, Value>, dest: &mut IndexMap<String, Value>, segs: &[&str]) {
    if segs.is_empty() {
        return;
    }
    let seg = segs[0];
    if seg == "*" {
        for (k, v) in source.iter() {
            if segs.len() == 1 {
                dest.insert(k.clone(), v.clone());
            } else if let Value::Object(sub) = v {
                let entry = dest.entry(k.clone()).or_insert_with(Value::object);
                if let Value::Object(sub_dest) = entry {
                    include_path(sub, sub_dest, &segs[1..]);
                }
            }
        }
        return;
    }
    let Some(v) = source.get(seg) else { return };
    if segs.len() == 1 {
        dest.insert(seg.to_string(), v.clone());
    } else if let Value::Object(sub) = v {
        let entry = dest.entry(seg.to_string()).or_insert_with(Value::object);
        if let Value::Object(sub_dest) = entry {
            include_path(sub, sub_dest, &segs[1..]);
        }
    }
}

fn project_exclude(row: &Value, fields: &[String]) -> Value {
    let obj = match row.as_object() {
        Some(o) => o.clone(),
        None => return row.clone(),
    };
    let mut cur = obj;
    for f in fields {
        let segs: Vec<&str> = f.split(':').collect();
        cur = exclude_path(&cur, &segs);
    }
    Value::Object(cur)
}

fn exclude_path(source: &IndexMap<String, Value>, segs: &[&str]) -> IndexMap<String, Value> {
    let mut result = source.clone();
    if segs.is_empty() {
        return result;
    }
    let seg = segs[0];
    if seg == "*" {
        if segs.len() == 1 {
            result.clear();
        } else {
            for (k, v) in source.iter() {
                if let Value::Object(sub) = v {
                    result.insert(k.clone(), Value::Object(exclude_path(sub, &segs[1..])));
                }
            }
        }
        return result;
    }
    if segs.len() == 1 {
        result.shift_remove(seg);
    } else if let Some(Value::Object(sub)) = source.get(seg) {
        result.insert(seg.to_string(), Value::Object(exclude_path(sub, &segs[1..])));
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> Value {
        let mut inner = IndexMap::new();
        inner.insert("city".to_string(), Value::Str("Rio".into()));
        inner.insert("zip".to_string(), Value::Str("20000".into()));
        let mut m = IndexMap::new();
        m.insert("key".to_string(), Value::Str("1".into()));
        m.insert("name".to_string(), Value::Str("Ana".into()));
        m.insert("age".to_string(), Value::Int(30));
        m.insert("address".to_string(), Value::Object(inner));
        Value::Object(m)
    }

    #[test]
    fn include_keeps_only_named_top_level_fields() {
        let out = project_include(&row(), &["name".to_string(), "age".to_string()]);
        let obj = out.as_object().unwrap();
        assert_eq!(obj.len(), 2);
        assert_eq!(obj.get("name"), Some(&Value::Str("Ana".into())));
    }

    #[test]
    fn include_descends_into_nested_field() {
        let out = project_include(&row(), &["address:city".to_string()]);
        let obj = out.as_object().unwrap();
        let addr = obj.get("address").unwrap().as_object().unwrap();
        assert_eq!(addr.len(), 1);
        assert_eq!(addr.get("city"), Some(&Value::Str("Rio".into())));
    }

    #[test]
    fn exclude_removes_named_field_and_keeps_rest() {
        let out = project_exclude(&row(), &["age".to_string()]);
        let obj = out.as_object().unwrap();
        assert!(!obj.contains_key("age"));
        assert!(obj.contains_key("name"));
    }

    #[test]
    fn exclude_nested_field_keeps_siblings() {
        let out = project_exclude(&row(), &["address:zip".to_string()]);
        let obj = out.as_object().unwrap();
        let addr = obj.get("address").unwrap().as_object().unwrap();
        assert!(!addr.contains_key("zip"));
        assert!(addr.contains_key("city"));
    }

    #[test]
    fn wildcard_include_expands_every_sibling() {
        let mut a = IndexMap::new();
        a.insert("x".to_string(), Value::Int(1));
        let mut b = IndexMap::new();
        b.insert("x".to_string(), Value::Int(2));
        let mut m = IndexMap::new();
        m.insert("a".to_string(), Value::Object(a));
        m.insert("b".to_string(), Value::Object(b));
        let row = Value::Object(m);
        let out = project_include(&row, &["*:x".to_string()]);
        let obj = out.as_object().unwrap();
        assert_eq!(obj.get("a").unwrap().as_object().unwrap().get("x"), Some(&Value::Int(1)));
        assert_eq!(obj.get("b").unwrap().as_object().unwrap().get("x"), Some(&Value::Int(2)));
    }
}
