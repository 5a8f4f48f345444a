// The source conflates strings, integers, and parsed JSON blobs as the value
// of a document field depending on which code path produced it. Everything in
// this port funnels through this single tagged variant instead, so that the
// canonical serializer below is the only place a txid/checksum hash is ever
// computed from.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Object(IndexMap<String, Value>),
}

impl Value {
    pub fn object() -> Value {
        Value::Object(IndexMap::new())
    }

    pub fn is_object(&self) -> bool {
        matches!(self, Value::Object(_))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_object(&self) -> Option<&IndexMap<String, Value>> {
        match self {
            Value::Object(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_object_mut(&mut self) -> Option<&mut IndexMap<String, Value>> {
        match self {
            Value::Object(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn is_int_like(&self) -> bool {
        matches!(self, Value::Int(_))
    }

    /// The stringified form used as an index bucket key, a field-lookup
    /// comparand, and everywhere else the original treats a value as text.
    pub fn stringify(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => {
                if f.fract() == 0.0 && f.is_finite() {
                    format!("{:.1}", f)
                } else {
                    f.to_string()
                }
            }
            Value::Str(s) => s.clone(),
            Value::List(l) => l.iter().map(Value::stringify).collect::<Vec<_>>().join(","),
            Value::Object(_) => self.canonical_json(),
        }
    }

    /// Parse a bare literal the way a SET right-hand-side or a QUERY literal
    /// is parsed: integers and floats recognized, everything else a string.
    pub fn parse_literal(s: &str) -> Value {
        let s = s.trim();
        if s.eq_ignore_ascii_case("true") {
            return Value::Bool(true);
        }
        if s.eq_ignore_ascii_case("false") {
            return Value::Bool(false);
        }
        if let Ok(i) = s.parse::<i64>() {
            return Value::Int(i);
        }
        if let Ok(f) = s.parse::<f64>() {
            return Value::Float(f);
        }
        Value::Str(s.to_string())
    }

    /// Canonical serialization used for cache keys and every hash computed
    /// over a Value (transaction txids/checksums in the blockchain variant).
    /// Object keys are sorted so two Values built through different
    /// insertion orders still hash identically.
    pub fn canonical_json(&self) -> String {
        let mut out = String::new();
        self.write_canonical(&mut out);
        out
    }

    fn write_canonical(&self, out: &mut String) {
        match self {
            Value::Null => out.push_str("null"),
            Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
            Value::Int(i) => out.push_str(&i.to_string()),
            Value::Float(f) => out.push_str(&f.to_string()),
            Value::Str(s) => {
                out.push('"');
                for c in s.chars() {
                    match c {
                        '"' => out.push_str("\\\""),
                        '\\' => out.push_str("\\\\"),
                        '\n' => out.push_str("\\n"),
                        _ => out.push(c),
                    }
                }
                out.push('"');
            }
            Value::List(l) => {
                out.push('[');
                for (i, v) in l.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    v.write_canonical(out);
                }
                out.push(']');
            }
            Value::Object(m) => {
                let mut keys: Vec<&String> = m.keys().collect();
                keys.sort();
                out.push('{');
                for (i, k) in keys.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push('"');
                    out.push_str(k);
                    out.push('"');
                    out.push(':');
                    m[*k].write_canonical(out);
                }
                out.push('}');
            }
        }
    }

    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => Value::Str(s.clone()),
            serde_json::Value::Array(a) => Value::List(a.iter().map(Value::from_json).collect()),
            serde_json::Value::Object(o) => {
                let mut m = IndexMap::new();
                for (k, v) in o {
                    m.insert(k.clone(), Value::from_json(v));
                }
                Value::Object(m)
            }
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Str(s) => serde_json::Value::String(s.clone()),
            Value::List(l) => serde_json::Value::Array(l.iter().map(Value::to_json).collect()),
            Value::Object(m) => {
                let mut o = serde_json::Map::new();
                for (k, v) in m {
                    o.insert(k.clone(), v.to_json());
                }
                serde_json::Value::Object(o)
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.stringify())
    }
}

/// Ordering for ORDERBY: strings compare lower-cased, numerics compare
/// naturally, missing/incomparable values sort last.
impl Value {
    pub fn order_key(&self) -> OrderKey {
        match self {
            Value::Null => OrderKey::Missing,
            Value::Int(i) => OrderKey::Num(*i as f64),
            Value::Float(f) => OrderKey::Num(*f),
            Value::Bool(b) => OrderKey::Num(if *b { 1.0 } else { 0.0 }),
            Value::Str(s) => OrderKey::Str(s.to_lowercase()),
            other => OrderKey::Str(other.stringify().to_lowercase()),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum OrderKey {
    Missing,
    Num(f64),
    Str(String),
}

impl Eq for OrderKey {}

impl PartialOrd for OrderKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (OrderKey::Missing, OrderKey::Missing) => Ordering::Equal,
            (OrderKey::Missing, _) => Ordering::Greater,
            (_, OrderKey::Missing) => Ordering::Less,
            (OrderKey::Num(a), OrderKey::Num(b)) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
            (OrderKey::Str(a), OrderKey::Str(b)) => a.cmp(b),
            (OrderKey::Num(a), OrderKey::Str(b)) => a.to_string().cmp(b),
            (OrderKey::Str(a), OrderKey::Num(b)) => a.cmp(&b.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stringify_matches_display() {
        assert_eq!(Value::Int(5).stringify(), "5");
        assert_eq!(Value::Float(5.0).stringify(), "5.0");
        assert_eq!(Value::Str("x".into()).stringify(), "x");
    }

    #[test]
    fn canonical_json_sorts_object_keys() {
        let mut a = IndexMap::new();
        a.insert("b".to_string(), Value::Int(1));
        a.insert("a".to_string(), Value::Int(2));
        let mut b = IndexMap::new();
        b.insert("a".to_string(), Value::Int(2));
        b.insert("b".to_string(), Value::Int(1));
        assert_eq!(
            Value::Object(a).canonical_json(),
            Value::Object(b).canonical_json()
        );
    }

    #[test]
    fn parse_literal_recognizes_numbers() {
        assert_eq!(Value::parse_literal("30"), Value::Int(30));
        assert_eq!(Value::parse_literal("30.5"), Value::Float(30.5));
        assert_eq!(Value::parse_literal("Ana"), Value::Str("Ana".into()));
    }

    #[test]
    fn order_key_puts_missing_last() {
        let mut keys = vec![OrderKey::Num(2.0), OrderKey::Missing, OrderKey::Num(1.0)];
        keys.sort();
        assert_eq!(keys, vec![OrderKey::Num(1.0), OrderKey::Num(2.0), OrderKey::Missing]);
    }
}
