// The `QUERY`/`COUNT` command surface (§4.7): modifier extraction,
// INCLUDE/EXCLUDE projection lists, JOIN clauses, and the condition
// grammar the evaluator (`mgin-eval`) walks against the document tree.
// This crate only parses; it never touches `mgin-store` or `mgin-index`.

pub mod condition;
pub mod expr;

pub use condition::{compare, eval_entry, parse_conditions, Connector, ConditionList, Literal, Op, Term};

use mgin_base::{err, Result};
use regex::Regex;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OrderDir {
    Asc,
    Desc,
}

#[derive(Clone, Debug, PartialEq)]
pub struct JoinClause {
    pub table: String,
    pub field: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Limit {
    pub start: usize,
    pub count: usize,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryCommand {
    pub path: String,
    pub conditions: ConditionList,
    pub include: Option<Vec<String>>,
    pub exclude: Option<Vec<String>>,
    pub joins: Vec<JoinClause>,
    pub group_by: Option<String>,
    pub order_by: Option<(String, OrderDir)>,
    pub limit: Option<Limit>,
}

/// Parse the remainder of a `QUERY`/`COUNT` command (everything after the
/// verb). Modifiers are extracted by regex regardless of where they
/// appear in the line, in the order the specification lists them; what
/// is left over is `<path> [WHERE <conditions>]`.
pub fn parse_query(input: &str) -> Result<QueryCommand> {
    let mut rest = input.trim().to_string();

    let group_by = extract_call(&mut rest, "GROUPBY").map(|args| args.trim().to_string());
    let order_by = extract_call(&mut rest, "ORDERBY").map(|args| {
        let parts: Vec<&str> = args.splitn(2, ',').map(str::trim).collect();
        let field = parts[0].to_string();
        let dir = match parts.get(1).map(|s| s.to_uppercase()) {
            Some(ref d) if d == "DESC" => OrderDir::Desc,
            _ => OrderDir::Asc,
        };
        (field, dir)
    });
    let limit = extract_call(&mut rest, "LIMIT")
        .map(|args| parse_limit(&args))
        .transpose()?;
    let include = extract_call(&mut rest, "INCLUDE").map(|args| split_fields(&args));
    let exclude = extract_call(&mut rest, "EXCLUDE").map(|args| split_fields(&args));
    let joins = extract_joins(&mut rest)?;

    let rest = rest.trim();
    let (path, cond_str) = split_where(rest);
    if path.is_empty() {
        return Err(err("QUERY requires a path"));
    }
    let conditions = match cond_str {
        Some(c) if !c.trim().is_empty() => parse_conditions(c.trim())?,
        _ => Vec::new(),
    };

    Ok(QueryCommand {
        path: path.to_string(),
        conditions,
        include,
        exclude,
        joins,
        group_by,
        order_by,
        limit,
    })
}

fn parse_limit(args: &str) -> Result<Limit> {
    let parts: Vec<&str> = args.split(',').map(str::trim).collect();
    match parts.as_slice() {
        [n] => {
            let count: usize = n.parse().map_err(|_| err("Invalid LIMIT argument"))?;
            Ok(Limit { start: 0, count })
        }
        [a, b] => {
            let start: usize = a.parse().map_err(|_| err("Invalid LIMIT start"))?;
            let count: usize = b.parse().map_err(|_| err("Invalid LIMIT count"))?;
            Ok(Limit { start, count })
        }
        _ => Err(err("LIMIT takes one or two arguments")),
    }
}

fn split_fields(args: &str) -> Vec<String> {
    args.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect()
}

/// Remove and return the arguments of the first `NAME(...)` call found in
/// `rest`, case-insensitively. Calls do not nest (none of GROUPBY/ORDERBY/
/// LIMIT/INCLUDE/EXCLUDE ever contain a parenthesized sub-call), so a
/// single non-nested-paren capture suffices.
fn extract_call(rest: &mut String, name: &str) -> Option<String> {
    let re = Regex::new(&format!(r"(?i){name}\(([^)]*)\)")).unwrap();
    let caps = re.captures(rest)?;
    let args = caps[1].to_string();
    let whole = caps.get(0).unwrap().range();
    rest.replace_range(whole, "");
    Some(args)
}

/// `JOIN(table,field)` may appear more than once; collect every
/// occurrence and strip them all from `rest`.
fn extract_joins(rest: &mut String) -> Result<Vec<JoinClause>> {
    let re = Regex::new(r"(?i)JOIN\(([^)]*)\)").unwrap();
    let mut joins = Vec::new();
    loop {
        let caps = match re.captures(rest.as_str()) {
            Some(c) => c,
            None => break,
        };
        let args = caps[1].to_string();
        let parts: Vec<&str> = args.split(',').map(str::trim).collect();
        if parts.len() != 2 {
            return Err(err("JOIN requires table,field"));
        }
        joins.push(JoinClause { table: parts[0].to_string(), field: parts[1].to_string() });
        let whole = caps.get(0).unwrap().range();
        rest.replace_range(whole, "");
    }
    Ok(joins)
}

fn split_where(rest: &str) -> (&str, Option<&str>) {
    let upper = rest.to_uppercase();
    match upper.find("WHERE") {
        Some(pos) => {
            let boundary_ok = pos == 0 || rest.as_bytes()[pos - 1] == b' ';
            if boundary_ok {
                (rest[..pos].trim(), Some(&rest[pos + "WHERE".len()..]))
            } else {
                (rest.trim(), None)
            }
        }
        None => (rest.trim(), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_path_and_where() {
        let q = parse_query("user WHERE age > 25").unwrap();
        assert_eq!(q.path, "user");
        assert_eq!(q.conditions.len(), 1);
    }

    #[test]
    fn parses_modifiers_in_any_position() {
        let q = parse_query("user LIMIT(10) WHERE age > 25 ORDERBY(age,DESC)").unwrap();
        assert_eq!(q.path, "user");
        assert_eq!(q.limit, Some(Limit { start: 0, count: 10 }));
        assert_eq!(q.order_by, Some(("age".to_string(), OrderDir::Desc)));
    }

    #[test]
    fn parses_limit_with_start_and_count() {
        let q = parse_query("user LIMIT(5,10)").unwrap();
        assert_eq!(q.limit, Some(Limit { start: 5, count: 10 }));
    }

    #[test]
    fn parses_include_exclude_and_join() {
        let q = parse_query("user INCLUDE(name,age) JOIN(order,user_id)").unwrap();
        assert_eq!(q.include, Some(vec!["name".to_string(), "age".to_string()]));
        assert_eq!(q.joins, vec![JoinClause { table: "order".to_string(), field: "user_id".to_string() }]);
    }

    #[test]
    fn path_only_has_no_conditions() {
        let q = parse_query("user").unwrap();
        assert_eq!(q.path, "user");
        assert!(q.conditions.is_empty());
    }
}
