// Key-space sharding (§4.11). Routing is a SHA-256 hash of the top-level
// key mod the configured shard count; wildcards are refused outright once
// sharding is on, since a wildcard mutation or delete has no single shard
// to route to. `plan_reshard`/`merge_value` compute the redistribution a
// shard-count change requires; the actual peer-to-peer chunk transfer is
// driven by `mgin-net`, which owns every outbound WebSocket connection.

use futures_util::{SinkExt, StreamExt};
use indexmap::IndexMap;
use mgin_base::{contains_wildcard, err, top_level, Result, Value};
use mgin_store::DataStore;
use sha2::{Digest, Sha256};
use tokio_tungstenite::tungstenite::Message;

/// Map a top-level key to a shard index in `[0, shard_count)`.
pub fn get_shard(key: &str, shard_count: usize) -> Result<usize> {
    if shard_count == 0 {
        return Err(err("No shards configured"));
    }
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    let digest = hasher.finalize();
    let n = u64::from_be_bytes(digest[0..8].try_into().expect("8-byte slice"));
    Ok((n % shard_count as u64) as usize)
}

/// Sharding forbids any command whose path contains a wildcard segment;
/// there is no single shard a wildcard mutation or delete could route to.
pub fn reject_wildcard(path: &str) -> Result<()> {
    if contains_wildcard(path) {
        return Err(err("Wildcard paths are not allowed while sharding is enabled"));
    }
    Ok(())
}

/// Which shard index a command's path routes to, given the configured
/// shard URLs. The caller compares this against its own position in
/// `shards` to decide whether to handle the command locally or forward
/// it with `forward_command`.
pub fn route(path: &str, shards: &[String]) -> Result<usize> {
    reject_wildcard(path)?;
    let key = top_level(path).ok_or_else(|| err("Empty path has no shard"))?;
    get_shard(key, shards.len())
}

/// A single top-level key's reshard move: which shard it currently sits
/// on (by position in `shards`) and which shard it must move to under the
/// new shard count.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Move {
    pub key: String,
    pub from: usize,
    pub to: usize,
}

/// Compute every key in `data` whose shard assignment changes between
/// `old_count` (this node's current view) and `new_count` (the proposed
/// count after RESHARD).
pub fn plan_reshard(data: &DataStore, old_count: usize, new_count: usize) -> Result<Vec<Move>> {
    let mut moves = Vec::new();
    for key in data.top_level_keys() {
        let from = get_shard(&key, old_count)?;
        let to = get_shard(&key, new_count)?;
        if from != to {
            moves.push(Move { key, from, to });
        }
    }
    Ok(moves)
}

/// Batch `moves` into chunks of at most `batch_size`, matching
/// `SHARDING_BATCH_SIZE` so a reshard never floods a peer with every key
/// in one frame.
pub fn batch(moves: &[Move], batch_size: usize) -> Vec<&[Move]> {
    if batch_size == 0 {
        return vec![moves];
    }
    moves.chunks(batch_size.max(1)).collect()
}

/// Merge an incoming value into an existing one during redistribution:
/// objects merge key-by-key (recursively), lists concatenate with
/// duplicates of scalar values dropped, and anything else is replaced
/// outright by the incoming value.
pub fn merge_value(existing: &Value, incoming: &Value) -> Value {
    match (existing, incoming) {
        (Value::Object(a), Value::Object(b)) => {
            let mut merged = a.clone();
            for (k, v) in b {
                let next = match merged.get(k) {
                    Some(existing_v) => merge_value(existing_v, v),
                    None => v.clone(),
                };
                merged.insert(k.clone(), next);
            }
            Value::Object(merged)
        }
        (Value::List(a), Value::List(b)) => {
            let mut merged = a.clone();
            for item in b {
                if !merged.contains(item) {
                    merged.push(item.clone());
                }
            }
            Value::List(merged)
        }
        (_, incoming) => incoming.clone(),
    }
}

/// Connect to a peer shard's WebSocket endpoint and issue a single
/// command, returning its raw text reply. Used for both bulk RESHARD
/// transfer and ordinary cross-shard forwarding of a routed command.
pub async fn forward_command(url: &str, command: &str) -> Result<String> {
    let (mut socket, _) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| err(format!("Could not reach shard at {url}: {e}")))?;
    socket
        .send(Message::Text(command.to_string()))
        .await
        .map_err(|e| err(format!("Failed sending to shard {url}: {e}")))?;
    while let Some(msg) = socket.next().await {
        match msg.map_err(|e| err(format!("Shard {url} connection error: {e}")))? {
            Message::Text(text) => return Ok(text),
            Message::Close(_) => break,
            _ => continue,
        }
    }
    Err(err(format!("Shard {url} closed connection without replying")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap as Map;

    #[test]
    fn same_key_always_hashes_to_same_shard() {
        let a = get_shard("user:1", 4).unwrap();
        let b = get_shard("user:1", 4).unwrap();
        assert_eq!(a, b);
        assert!(a < 4);
    }

    #[test]
    fn zero_shards_is_an_error() {
        assert!(get_shard("user:1", 0).is_err());
    }

    #[test]
    fn wildcard_paths_are_rejected() {
        assert!(reject_wildcard("user:*:name").is_err());
        assert!(reject_wildcard("user:1:name").is_ok());
    }

    #[test]
    fn reshard_plan_only_moves_keys_that_change_shard() {
        let mut data = DataStore::new();
        for i in 0..20 {
            data.set(&format!("key{i}:v"), Value::Int(i)).unwrap();
        }
        let moves = plan_reshard(&data, 2, 4).unwrap();
        for m in &moves {
            assert_eq!(get_shard(&m.key, 2).unwrap(), m.from);
            assert_eq!(get_shard(&m.key, 4).unwrap(), m.to);
        }
    }

    #[test]
    fn batch_splits_moves_into_bounded_chunks() {
        let moves: Vec<Move> = (0..10).map(|i| Move { key: i.to_string(), from: 0, to: 1 }).collect();
        let batches = batch(&moves, 3);
        assert_eq!(batches.len(), 4);
        assert_eq!(batches[0].len(), 3);
        assert_eq!(batches[3].len(), 1);
    }

    #[test]
    fn merge_value_combines_objects_recursively() {
        let mut a = Map::new();
        a.insert("name".to_string(), Value::Str("a".into()));
        let mut b = Map::new();
        b.insert("age".to_string(), Value::Int(1));
        let merged = merge_value(&Value::Object(a), &Value::Object(b));
        let obj = merged.as_object().unwrap();
        assert_eq!(obj.get("name"), Some(&Value::Str("a".into())));
        assert_eq!(obj.get("age"), Some(&Value::Int(1)));
    }

    #[test]
    fn merge_value_concatenates_lists_without_duplicates() {
        let a = Value::List(vec![Value::Int(1), Value::Int(2)]);
        let b = Value::List(vec![Value::Int(2), Value::Int(3)]);
        let merged = merge_value(&a, &b);
        assert_eq!(merged, Value::List(vec![Value::Int(1), Value::Int(2), Value::Int(3)]));
    }
}
