// The condition grammar: `<term> (AND|OR <term>)*`, evaluated left to
// right with no operator precedence — matching the wire grammar this
// parses, not a boolean-algebra grammar.

use mgin_base::{err, split, Result, Value};
use regex::Regex;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Op {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Like,
    Between,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Literal {
    Text(String),
    Between(f64, f64),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Connector {
    And,
    Or,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Term {
    pub field: String,
    pub op: Op,
    pub literal: Literal,
}

pub type ConditionList = Vec<(Option<Connector>, Term)>;

pub fn parse_conditions(input: &str) -> Result<ConditionList> {
    let connector_re = Regex::new(r"(?i)\s+(AND|OR)\s+").unwrap();
    let mut out = Vec::new();
    let mut last = 0;
    let mut pending: Option<Connector> = None;
    for m in connector_re.find_iter(input) {
        let piece = input[last..m.start()].trim();
        if !piece.is_empty() {
            out.push((pending.take(), parse_term(piece)?));
        }
        pending = Some(if m.as_str().trim().eq_ignore_ascii_case("AND") {
            Connector::And
        } else {
            Connector::Or
        });
        last = m.end();
    }
    let tail = input[last..].trim();
    if !tail.is_empty() {
        out.push((pending.take(), parse_term(tail)?));
    }
    Ok(out)
}

pub fn parse_term(s: &str) -> Result<Term> {
    let s = s.trim();
    if let Some(pos) = s.to_uppercase().find("BETWEEN") {
        let field = s[..pos].trim().to_string();
        let rest = &s[pos + "BETWEEN".len()..];
        let (lo, hi) = rest
            .split_once(',')
            .ok_or_else(|| err("Invalid BETWEEN syntax"))?;
        let lo: f64 = lo
            .trim()
            .parse()
            .map_err(|_| err("Invalid BETWEEN lower bound"))?;
        let hi: f64 = hi
            .trim()
            .parse()
            .map_err(|_| err("Invalid BETWEEN upper bound"))?;
        return Ok(Term { field, op: Op::Between, literal: Literal::Between(lo, hi) });
    }

    let re = Regex::new(r#"(?i)^([a-zA-Z0-9_:\[\]]+)\s*(!=|>=|<=|=|>|<|LIKE)\s*['"]?(.*?)['"]?$"#)
        .unwrap();
    let caps = re
        .captures(s)
        .ok_or_else(|| err(format!("Invalid condition syntax: {s}")))?;
    let field = caps[1].to_string();
    let op = match caps[2].to_uppercase().as_str() {
        "=" => Op::Eq,
        "!=" => Op::Ne,
        ">" => Op::Gt,
        ">=" => Op::Ge,
        "<" => Op::Lt,
        "<=" => Op::Le,
        "LIKE" => Op::Like,
        other => return Err(err(format!("Unsupported operator {other}"))),
    };
    Ok(Term { field, op, literal: Literal::Text(caps[3].to_string()) })
}

/// Mirrors `compare_values`: `=`/`!=` always compare as strings (the
/// original's literal operand is always text, so its "compare as strings if
/// either side is a string" branch is always taken); ordering operators
/// coerce both sides to float and fail closed on a parse error.
pub fn compare(value: &Value, op: Op, literal: &Literal) -> bool {
    match (op, literal) {
        (Op::Between, Literal::Between(lo, hi)) => match value.as_f64() {
            Some(v) => *lo <= v && v <= *hi,
            None => false,
        },
        (Op::Eq, Literal::Text(t)) => value.stringify() == *t,
        (Op::Ne, Literal::Text(t)) => value.stringify() != *t,
        (Op::Gt, Literal::Text(t)) | (Op::Ge, Literal::Text(t)) | (Op::Lt, Literal::Text(t)) | (Op::Le, Literal::Text(t)) => {
            match (value.as_f64(), t.parse::<f64>()) {
                (Some(v), Ok(e)) => match op {
                    Op::Gt => v > e,
                    Op::Ge => v >= e,
                    Op::Lt => v < e,
                    Op::Le => v <= e,
                    _ => unreachable!(),
                },
                _ => false,
            }
        }
        (Op::Like, Literal::Text(t)) => {
            let value_s = value.stringify().to_lowercase();
            let pattern = format!("^{}$", t.to_lowercase().replace('%', ".*"));
            Regex::new(&pattern).map(|re| re.is_match(&value_s)).unwrap_or(false)
        }
        _ => false,
    }
}

fn nested_field<'a>(entry: &'a Value, field: &str) -> Option<&'a Value> {
    let mut cur = entry;
    for seg in split(field) {
        cur = cur.as_object()?.get(seg)?;
    }
    Some(cur)
}

/// Evaluate a parsed condition list against one entry, combining term
/// results left to right exactly in list order (no AND-before-OR
/// precedence).
pub fn eval_entry(entry: &Value, conds: &ConditionList) -> bool {
    let mut result: Option<bool> = None;
    for (conn, term) in conds {
        let field_value = nested_field(entry, &term.field).unwrap_or(&Value::Null);
        let term_result = compare(field_value, term.op, &term.literal);
        result = Some(match (result, conn) {
            (None, _) => term_result,
            (Some(r), Some(Connector::Or)) => r || term_result,
            (Some(r), _) => r && term_result,
        });
    }
    result.unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;

    fn entry(pairs: &[(&str, Value)]) -> Value {
        let mut m = IndexMap::new();
        for (k, v) in pairs {
            m.insert(k.to_string(), v.clone());
        }
        Value::Object(m)
    }

    #[test]
    fn parses_simple_equality() {
        let conds = parse_conditions("age = 30").unwrap();
        assert_eq!(conds.len(), 1);
        assert_eq!(conds[0].1.op, Op::Eq);
    }

    #[test]
    fn combines_and_or_left_to_right() {
        let conds = parse_conditions("age > 20 AND age < 40 OR name = Bo").unwrap();
        let e = entry(&[("age", Value::Int(50)), ("name", Value::Str("Bo".into()))]);
        assert!(eval_entry(&e, &conds));
        let e2 = entry(&[("age", Value::Int(50)), ("name", Value::Str("Ana".into()))]);
        assert!(!eval_entry(&e2, &conds));
    }

    #[test]
    fn between_is_inclusive() {
        let conds = parse_conditions("age BETWEEN 10,20").unwrap();
        assert!(eval_entry(&entry(&[("age", Value::Int(20))]), &conds));
        assert!(!eval_entry(&entry(&[("age", Value::Int(21))]), &conds));
    }

    #[test]
    fn like_translates_percent_to_wildcard() {
        let conds = parse_conditions("name LIKE An%").unwrap();
        assert!(eval_entry(&entry(&[("name", Value::Str("Ana".into()))]), &conds));
        assert!(!eval_entry(&entry(&[("name", Value::Str("Bo".into()))]), &conds));
    }
}
