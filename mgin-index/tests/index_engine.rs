// Index/data consistency (§8 property 1): every mutation sequence must leave
// the live index equal to what `rebuild_from` would produce from scratch,
// and an emptied bucket must disappear entirely rather than linger as an
// empty entry (§3.3).

use mgin_base::Value;
use mgin_index::{IndexEngine, IndexKind};
use mgin_store::DataStore;
use test_log::test;

fn entity_key(top: &str, id: &str) -> String {
    format!("{top}:{id}")
}

#[test]
fn string_index_tracks_set_then_overwrite_then_delete() {
    let mut data = DataStore::new();
    let mut index = IndexEngine::new();
    index.create("user:age", IndexKind::String, &data).unwrap();

    data.set("user:1:age", Value::Int(30)).unwrap();
    index.on_add("user:1:age", &Value::Int(30), &entity_key("user", "1"));
    assert_eq!(index.to_value(), index.rebuild_from(&data).to_value());

    // Overwriting must remove the stale bucket before adding the new one.
    index.on_remove("user:1:age", &Value::Int(30), &entity_key("user", "1"));
    data.set("user:1:age", Value::Int(31)).unwrap();
    index.on_add("user:1:age", &Value::Int(31), &entity_key("user", "1"));
    assert_eq!(index.to_value(), index.rebuild_from(&data).to_value());
    assert!(index.get("user:age").is_some());

    let descriptor = index.get("user:age").unwrap();
    match &descriptor.values {
        mgin_index::IndexValues::Strings(m) => {
            assert!(!m.contains_key("30"), "stale bucket must be gone after overwrite");
            assert_eq!(m.get("31"), Some(&"user:1".to_string()));
        }
        other => panic!("expected a string index, got {other:?}"),
    }

    // Deleting the last entity under an indexed field empties its bucket,
    // which in turn prunes the now-empty descriptor itself (§3.3, §4.6).
    let removed = data.delete("user:1:age").unwrap();
    index.remove_field("user:1", "age", &removed);
    assert_eq!(index.to_value(), index.rebuild_from(&data).to_value());
    assert!(index.get("user:age").is_none(), "an emptied index descriptor is pruned, not left dangling");
}

#[test]
fn set_index_bucket_is_removed_once_last_member_leaves() {
    let mut data = DataStore::new();
    data.set("user:1:tags", Value::List(vec![Value::Str("x".into())])).unwrap();
    let mut index = IndexEngine::new();
    index.create("user:tags", IndexKind::Set, &data).unwrap();

    assert_eq!(index.to_value(), index.rebuild_from(&data).to_value());

    let removed = data.delete("user:1:tags").unwrap();
    index.remove_field("user:1", "tags", &removed);

    // The last member leaving empties the bucket, which in turn prunes the
    // whole descriptor since nothing under `user:tags` is indexed anymore.
    assert!(index.get("user:tags").is_none(), "an emptied index descriptor is pruned, not left dangling");
    assert_eq!(index.to_value(), index.rebuild_from(&data).to_value());
}

#[test]
fn remove_entity_strips_every_indexed_field() {
    let mut data = DataStore::new();
    data.set("user:1:age", Value::Int(30)).unwrap();
    data.set("user:1:name", Value::Str("Ana".into())).unwrap();
    let mut index = IndexEngine::new();
    index.create("user:age", IndexKind::String, &data).unwrap();
    index.create("user:name", IndexKind::String, &data).unwrap();
    assert_eq!(index.to_value(), index.rebuild_from(&data).to_value());

    let entity = data.delete("user:1").unwrap();
    index.remove_entity("user:1", &entity);
    data.prune_ancestors("user:1");

    // User 1 was the only entity, so both fields' descriptors are pruned
    // away entirely rather than left behind empty.
    assert!(index.get("user:age").is_none());
    assert!(index.get("user:name").is_none());
    assert_eq!(index.to_value(), index.rebuild_from(&data).to_value());
}

#[test]
fn round_trip_through_json_preserves_set_membership() {
    let mut data = DataStore::new();
    data.set("user:1:tags", Value::List(vec![Value::Str("x".into()), Value::Str("y".into())])).unwrap();
    data.set("user:2:tags", Value::List(vec![Value::Str("x".into())])).unwrap();
    let mut index = IndexEngine::new();
    index.create("user:tags", IndexKind::Set, &data).unwrap();

    let dumped = index.to_value();
    let restored = IndexEngine::from_value(&dumped);
    assert_eq!(restored.to_value(), dumped);

    let descriptor = restored.get("user:tags").unwrap();
    match &descriptor.values {
        mgin_index::IndexValues::Sets(m) => {
            let x_members = m.get("x").expect("bucket for 'x' survives the round trip");
            assert_eq!(x_members.len(), 2);
        }
        other => panic!("expected a set index, got {other:?}"),
    }
}
