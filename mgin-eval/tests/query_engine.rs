// End-to-end coverage of the query engine (§4.7, §8): build a small document
// tree and index set by hand, run full `QUERY`/`COUNT` pipelines against it,
// and check the concrete scenarios SPEC_FULL.md §8 calls out.

use mgin_base::Value;
use mgin_index::{IndexEngine, IndexKind};
use mgin_store::DataStore;
use test_log::test;

fn field<'a>(v: &'a Value, name: &str) -> Option<&'a Value> {
    v.as_object()?.get(name)
}

fn user_store() -> DataStore {
    let mut data = DataStore::new();
    data.set("user:1:name", Value::Str("Ana".into())).unwrap();
    data.set("user:1:age", Value::Int(30)).unwrap();
    data.set("user:2:name", Value::Str("Bo".into())).unwrap();
    data.set("user:2:age", Value::Int(20)).unwrap();
    data
}

#[test]
fn query_full_scan_where_greater_than() {
    let data = user_store();
    let index = IndexEngine::new();
    let q = mgin_query::parse_query("user WHERE age > 25").unwrap();
    let rows = mgin_eval::filter_and_join(&data, &index, &q).unwrap();
    let result = mgin_eval::finalize(rows, &q);
    let list = result.as_list().unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(field(&list[0], "key"), Some(&Value::Str("1".into())));
    assert_eq!(field(&list[0], "name"), Some(&Value::Str("Ana".into())));
}

#[test]
fn query_index_backed_equality_matches_full_scan() {
    let data = user_store();
    let mut index = IndexEngine::new();
    index.create("user:age", IndexKind::String, &data).unwrap();

    let q = mgin_query::parse_query("user WHERE age = 30").unwrap();
    let indexed_rows = mgin_eval::filter_and_join(&data, &index, &q).unwrap();
    let indexed = mgin_eval::finalize(indexed_rows, &q);

    let empty_index = IndexEngine::new();
    let scanned_rows = mgin_eval::filter_and_join(&data, &empty_index, &q).unwrap();
    let scanned = mgin_eval::finalize(scanned_rows, &q);

    assert_eq!(indexed, scanned);
    assert_eq!(indexed.as_list().unwrap().len(), 1);
    assert_eq!(field(&indexed.as_list().unwrap()[0], "name"), Some(&Value::Str("Ana".into())));
}

#[test]
fn query_set_index_on_multivalued_field() {
    let mut data = DataStore::new();
    data.set("user:1:tags", Value::List(vec![Value::Str("x".into()), Value::Str("y".into())])).unwrap();
    let mut index = IndexEngine::new();
    index.create("user:tags", IndexKind::Set, &data).unwrap();

    let q = mgin_query::parse_query("user WHERE tags = \"x\"").unwrap();
    let rows = mgin_eval::filter_and_join(&data, &index, &q).unwrap();
    let result = mgin_eval::finalize(rows, &q);
    let list = result.as_list().unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(field(&list[0], "key"), Some(&Value::Str("1".into())));
}

#[test]
fn count_reuses_the_same_filter_pipeline() {
    let data = user_store();
    let index = IndexEngine::new();
    let q = mgin_query::parse_query("user WHERE age > 10").unwrap();
    assert_eq!(mgin_eval::count(&data, &index, &q).unwrap(), 2);
}

#[test]
fn query_entity_path_returns_single_element() {
    let data = user_store();
    let index = IndexEngine::new();
    let q = mgin_query::parse_query("user:1").unwrap();
    let result = mgin_eval::evaluate(&data, &index, &q).unwrap();
    let list = result.as_list().unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(field(&list[0], "name"), Some(&Value::Str("Ana".into())));
}

#[test]
fn query_orderby_and_limit() {
    let data = user_store();
    let index = IndexEngine::new();
    let q = mgin_query::parse_query("user ORDERBY(age,DESC) LIMIT(1)").unwrap();
    let rows = mgin_eval::filter_and_join(&data, &index, &q).unwrap();
    let result = mgin_eval::finalize(rows, &q);
    let list = result.as_list().unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(field(&list[0], "name"), Some(&Value::Str("Ana".into())));
}

#[test]
fn query_join_attaches_foreign_rows() {
    let mut data = user_store();
    data.set("order:10:user_id", Value::Str("1".into())).unwrap();
    data.set("order:10:total", Value::Int(42)).unwrap();
    let index = IndexEngine::new();

    let q = mgin_query::parse_query("order JOIN(user,user_id)").unwrap();
    let rows = mgin_eval::filter_and_join(&data, &index, &q).unwrap();
    let result = mgin_eval::finalize(rows, &q);
    let list = result.as_list().unwrap();
    assert_eq!(list.len(), 1);
    let joined = field(&list[0], "user").expect("joined user attached");
    assert!(joined.as_list().is_some());
}
