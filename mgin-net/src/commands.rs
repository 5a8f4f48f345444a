// The command dispatch table (§4.1-§4.16). Every verb a session or the
// scheduler can submit is handled here, against the single `Engine` the
// caller already holds exclusive access to. Handlers never talk to the
// network directly except for sharding forwards and replication
// broadcasts, both of which are plain outbound calls the engine task can
// simply await without losing its exclusive grip on the store.

use crate::engine::{now, BlockchainState, Engine};
use indexmap::IndexMap;
use mgin_base::{err, Result, Value};
use mgin_index::{IndexDescriptor, IndexEngine, IndexKind, IndexValues};
use mgin_store::{DataStore, TtlStore};
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use uuid::Uuid;

pub async fn dispatch(engine: &mut Engine, command: &str, sid: Uuid) -> String {
    let command = strip_f_flag(command);
    let trimmed = command.trim();
    if trimmed.is_empty() {
        return "ERROR: Empty command".to_string();
    }
    notify_monitor(engine, sid, trimmed);

    let (verb, rest) = split_verb(trimmed);
    match verb.as_str() {
        "CONFIG" => cmd_config(engine, rest),
        "KEYS" => cmd_keys(engine, rest),
        "COUNT" => cmd_count(engine, rest),
        "SET" => cmd_set_batch(engine, rest).await,
        "RENAME" => cmd_rename(engine, rest).await,
        "DEL" => cmd_del_batch(engine, rest).await,
        "INCR" => cmd_incrdecr(engine, rest, 1).await,
        "DECR" => cmd_incrdecr(engine, rest, -1).await,
        "QUERY" => cmd_query(engine, rest).await,
        "INDICES" => cmd_indices(engine, rest),
        "SUB" => cmd_sub(engine, rest, sid),
        "UNSUB" => cmd_unsub(engine, rest, sid),
        "SUBLIST" => cmd_sublist(engine, sid),
        "SCHEDULE" => cmd_schedule(engine, rest),
        "FLUSHALL" => cmd_flushall(engine),
        "FLUSHCACHE" => cmd_flushcache(engine),
        "BACKUP" => cmd_backup(engine),
        "ROLLBACK" => cmd_rollback(engine, rest),
        "REPLICATE" => {
            // The multi-frame chunked sync response doesn't fit a single
            // string reply; `session.rs` intercepts `REPLICATE` ahead of
            // dispatch and drives `EngineHandle::snapshot()` directly.
            "ERROR: REPLICATE must be issued as the first frame of a dedicated sync connection".to_string()
        }
        "RESHARD" => cmd_reshard(engine, rest).await,
        "SERVERSTOP" => cmd_serverstop(engine),
        "CHECKUPDATE" => "Auto-update is not available in this build.".to_string(),
        "BLOCKCHAIN" => cmd_blockchain(engine, rest),
        "NEW_WALLET" => cmd_new_wallet(engine, rest),
        "GET_WALLET" => cmd_get_wallet(engine, rest),
        "BLOCK" => cmd_block(engine, rest),
        "TRANSACTION" => cmd_transaction(engine, rest).await,
        "MINE" => cmd_mine(engine, rest).await,
        other => format!("ERROR: Unknown command '{other}'"),
    }
}

/// Strip a leading `-f ` formatting hint. The original strips every
/// occurrence of the literal substring anywhere in the line; every call
/// site that actually produces `-f` only ever puts it at the front, so
/// this only strips a leading token (SPEC_FULL.md §4.1, Open Questions).
fn strip_f_flag(command: &str) -> &str {
    let trimmed = command.trim_start();
    trimmed.strip_prefix("-f ").map(str::trim_start).unwrap_or(trimmed)
}

fn split_verb(s: &str) -> (String, &str) {
    match s.split_once(char::is_whitespace) {
        Some((verb, rest)) => (verb.to_uppercase(), rest.trim_start()),
        None => (s.to_uppercase(), ""),
    }
}

fn fail(e: mgin_base::Error) -> String {
    format!("ERROR: {e:?}")
}

/// JSON-encode an object or list result, otherwise reply with the plain
/// stringified scalar (§4.14/§6.1: "JSON-encoded if object-like, else
/// plain string").
fn value_reply(v: &Value) -> String {
    match v {
        Value::Object(_) | Value::List(_) => serde_json::to_string(&v.to_json()).unwrap_or_default(),
        other => other.stringify(),
    }
}

fn entity_key_for(path: &str) -> String {
    let segs = mgin_base::split(path);
    if segs.len() >= 2 {
        format!("{}:{}", segs[0], segs[1])
    } else {
        segs.first().copied().unwrap_or_default().to_string()
    }
}

fn own_shard_address(engine: &Engine) -> String {
    format!("{}:{}", engine.config.get_str("HOST"), engine.config.get_str("PORT"))
}

/// If sharding is enabled and `path` routes to a peer other than this
/// node, forward `full_command` verbatim and return its reply; otherwise
/// `None` means "handle it locally".
async fn maybe_forward(engine: &Engine, path: &str, full_command: &str) -> Option<String> {
    if !engine.config.sharding_enabled() {
        return None;
    }
    let shards = engine.config.shards();
    if shards.len() < 2 {
        return None;
    }
    let idx = match mgin_shard::route(path, &shards) {
        Ok(i) => i,
        Err(e) => return Some(fail(e)),
    };
    let target = &shards[idx];
    if *target == own_shard_address(engine) {
        return None;
    }
    match mgin_shard::forward_command(target, full_command).await {
        Ok(reply) => Some(reply),
        Err(e) => {
            warn!(target: "mgin", "sharding forward to {target} failed: {e:?}");
            Some("ERROR: Sharding failed".to_string())
        }
    }
}

async fn replicate_command(engine: &Engine, command: &str) {
    if !engine.config.get_bool("REPLICATION") {
        return;
    }
    if !engine.config.get_str("REPLICATION_TYPE").eq_ignore_ascii_case("MASTER") {
        return;
    }
    let slaves = engine.config.get_list("REPLICATION_SLAVES");
    if !slaves.is_empty() {
        mgin_replicate::broadcast_to_slaves(&slaves, command).await;
    }
}

fn notify_monitor(engine: &mut Engine, sid: Uuid, command: &str) {
    let targets = engine.subs.monitor_targets();
    if targets.is_empty() {
        return;
    }
    let payload = serde_json::json!({ "sid": sid.to_string(), "command": command }).to_string();
    for target in targets {
        if let Some(tx) = engine.sessions.get(&target) {
            let _ = tx.send(payload.clone());
        }
    }
}

/// Notify every subscriber of `path`, with the *parent document* as
/// payload (§4.2) — the containing object if `path` has one, else the
/// top-level value itself.
fn notify_path(engine: &mut Engine, path: &str) {
    let targets = engine.subs.notify_targets(path);
    if targets.is_empty() {
        return;
    }
    let payload_value = match mgin_base::parent(path) {
        Some(p) => engine.data.get(&p).cloned().unwrap_or(Value::Null),
        None => engine.data.top_level(path).cloned().unwrap_or(Value::Null),
    };
    let payload = mgin_pubsub::notify_payload(path, &payload_value).to_string();
    for target in targets {
        if let Some(tx) = engine.sessions.get(&target) {
            let _ = tx.send(payload.clone());
        }
    }
}

fn notify_nodes(engine: &mut Engine, block_value: &Value) {
    let targets = engine.subs.all_nodes();
    if targets.is_empty() {
        return;
    }
    let payload = serde_json::json!({ "event": "block", "block": block_value.to_json() }).to_string();
    for target in targets {
        if let Some(tx) = engine.sessions.get(&target) {
            let _ = tx.send(payload.clone());
        }
    }
}

// ---------------------------------------------------------------- CONFIG

fn cmd_config(engine: &mut Engine, rest: &str) -> String {
    let rest = rest.trim();
    if rest.is_empty() {
        return engine.config.as_json();
    }
    let mut parts = rest.splitn(2, char::is_whitespace);
    let first = parts.next().unwrap_or("");
    let remainder = parts.next().unwrap_or("").trim();
    match first.to_uppercase().as_str() {
        "DEL" => match engine.config.del(remainder) {
            Ok(()) => "OK".to_string(),
            Err(e) => fail(e),
        },
        "ADD" => {
            let mut kv = remainder.splitn(2, char::is_whitespace);
            let key = kv.next().unwrap_or("");
            let value = kv.next().unwrap_or("").trim();
            match engine.config.list_add(key, value) {
                Ok(true) => "OK".to_string(),
                Ok(false) => "Value already present.".to_string(),
                Err(e) => fail(e),
            }
        }
        "REMOVE" => {
            let mut kv = remainder.splitn(2, char::is_whitespace);
            let key = kv.next().unwrap_or("");
            let value = kv.next().unwrap_or("").trim();
            match engine.config.list_remove(key, value) {
                Ok(true) => "OK".to_string(),
                Ok(false) => "Value not present.".to_string(),
                Err(e) => fail(e),
            }
        }
        _ => {
            let key = first;
            if remainder.is_empty() {
                match engine.config.get(key) {
                    Some(v) => value_reply(v),
                    None => format!("ERROR: Configuration key '{key}' does not exist"),
                }
            } else {
                let value = Value::parse_literal(remainder);
                match engine.config.set(key, value) {
                    Ok(()) => {
                        apply_config_side_effects(engine, key);
                        "OK".to_string()
                    }
                    Err(e) => fail(e),
                }
            }
        }
    }
}

/// A handful of config keys drive live engine state rather than being
/// read lazily on every use; apply them the moment they change.
fn apply_config_side_effects(engine: &mut Engine, key: &str) {
    match key {
        "QUERY_CACHING" => engine.cache.set_enabled(engine.config.get_bool("QUERY_CACHING")),
        "QUERY_CACHING_TTL" => engine.cache.set_ttl(engine.config.get_i64("QUERY_CACHING_TTL")),
        "SCHEDULER" => engine.scheduler.set_active(engine.config.get_bool("SCHEDULER")),
        _ => {}
    }
}

// ------------------------------------------------------------------ KEYS

fn cmd_keys(engine: &Engine, rest: &str) -> String {
    let path = rest.trim();
    if path.is_empty() {
        let keys = engine.data.top_level_keys();
        return value_reply(&Value::List(keys.into_iter().map(Value::Str).collect()));
    }
    match engine.data.get(path) {
        Some(Value::Object(m)) => value_reply(&Value::List(m.keys().cloned().map(Value::Str).collect())),
        Some(_) => "ERROR: Key does not reference an object".to_string(),
        None => "ERROR: Key does not exist".to_string(),
    }
}

// ----------------------------------------------------------------- COUNT

fn cmd_count(engine: &Engine, rest: &str) -> String {
    let q = match mgin_query::parse_query(rest) {
        Ok(q) => q,
        Err(e) => return fail(e),
    };
    if engine.config.sharding_enabled() {
        if let Err(e) = mgin_shard::reject_wildcard(&q.path) {
            return fail(e);
        }
    }
    match mgin_eval::count(&engine.data, &engine.index, &q) {
        Ok(n) => n.to_string(),
        Err(e) => fail(e),
    }
}

// ------------------------------------------------------------------- SET

async fn cmd_set_batch(engine: &mut Engine, rest: &str) -> String {
    let mut lines = Vec::new();
    for part in rest.split('|') {
        lines.push(cmd_set_one(engine, part.trim()).await);
    }
    lines.join("\n")
}

async fn cmd_set_one(engine: &mut Engine, input: &str) -> String {
    let input = input.trim();
    if input.is_empty() {
        return "ERROR: Empty SET element".to_string();
    }
    let (path, value_str) = match input.split_once(char::is_whitespace) {
        Some((p, v)) => (p, v.trim()),
        None => return "ERROR: SET requires a path and a value".to_string(),
    };

    if mgin_base::contains_wildcard(path) {
        if engine.config.sharding_enabled() {
            return "ERROR: Wildcard operations are not supported in sharding mode.".to_string();
        }
        let segs = mgin_base::split(path);
        let resolved = engine.data.resolve_wildcard(&segs);
        let mut count = 0;
        for resolved_path in resolved {
            if set_single_path(engine, &resolved_path, value_str).is_ok() {
                count += 1;
            }
        }
        replicate_command(engine, &format!("SET {input}")).await;
        return format!("Updated {count} entries.");
    }

    if let Some(forwarded) = maybe_forward(engine, path, &format!("SET {input}")).await {
        return forwarded;
    }

    match set_single_path(engine, path, value_str) {
        Ok(()) => {
            replicate_command(engine, &format!("SET {input}")).await;
            "OK".to_string()
        }
        Err(e) => fail(e),
    }
}

/// The full SET write path for one leaf (§4.2): EXPIRE extraction, JSON
/// object recursion, expression-function evaluation, index maintenance,
/// cache invalidation, notification, and conditional synchronous
/// persistence.
fn set_single_path(engine: &mut Engine, path: &str, value_str: &str) -> Result<()> {
    let (stripped, expire_secs) = mgin_query::expr::extract_expire(value_str);
    if expire_secs.is_some() && !engine.scheduler.is_active() {
        return Err(err(
            "EXPIRE requires the scheduler to be active; enable it with CONFIG SCHEDULER 1",
        ));
    }

    let trimmed = stripped.trim();
    if trimmed.starts_with('{') && trimmed.ends_with('}') {
        if let Ok(json) = serde_json::from_str::<serde_json::Value>(trimmed) {
            if let Value::Object(fields) = Value::from_json(&json) {
                for (field, value) in fields {
                    let field_path = format!("{path}:{field}");
                    write_leaf(engine, &field_path, value)?;
                    finish_set(engine, &field_path);
                }
                if let Some(secs) = expire_secs {
                    engine.ttl.set(path, now() + secs);
                }
                return Ok(());
            }
        }
    }

    let parent_path = mgin_base::parent(path);
    let substituted = mgin_query::expr::substitute_placeholders(trimmed, |field| {
        let full = match &parent_path {
            Some(p) => format!("{p}:{field}"),
            None => field.to_string(),
        };
        engine.data.get(&full).map(Value::stringify)
    });
    let evaluated = mgin_query::expr::evaluate_functions(&substituted)?;
    let value = Value::parse_literal(&evaluated);
    write_leaf(engine, path, value)?;
    if let Some(secs) = expire_secs {
        engine.ttl.set(path, now() + secs);
    }
    finish_set(engine, path);
    Ok(())
}

fn write_leaf(engine: &mut Engine, path: &str, value: Value) -> Result<()> {
    let old = engine.data.set(path, value.clone())?;
    let key = entity_key_for(path);
    if let Some(old_value) = &old {
        if *old_value != value {
            engine.index.on_remove(path, old_value, &key);
        }
    }
    engine.index.on_add(path, &value, &key);
    engine.mark_data_dirty();
    engine.mark_index_dirty();
    Ok(())
}

fn finish_set(engine: &mut Engine, path: &str) {
    engine.invalidate_cache_for_path(path);
    notify_path(engine, path);
    if !engine.scheduler.is_active() {
        engine.persist();
    }
}

// ------------------------------------------------------------------- DEL

async fn cmd_del_batch(engine: &mut Engine, rest: &str) -> String {
    let mut lines = Vec::new();
    for part in rest.split('|') {
        lines.push(cmd_del_one(engine, part.trim()).await);
    }
    lines.join("\n")
}

async fn cmd_del_one(engine: &mut Engine, path: &str) -> String {
    let path = path.trim();
    if path.is_empty() {
        return "ERROR: Empty DEL element".to_string();
    }

    if mgin_base::contains_wildcard(path) {
        if engine.config.sharding_enabled() {
            return "ERROR: Wildcard operations are not supported in sharding mode.".to_string();
        }
        let segs = mgin_base::split(path);
        let wpos = segs.iter().position(|s| *s == "*").expect("wildcard present");

        if wpos == segs.len() - 1 {
            // The wildcard is the final segment: delete every matching
            // entity wholesale rather than searching for a trailing key.
            let resolved = engine.data.resolve_wildcard(&segs);
            let mut count = 0;
            for resolved_path in resolved {
                if delete_single(engine, &resolved_path).is_ok() {
                    count += 1;
                }
            }
            replicate_command(engine, &format!("DEL {path}")).await;
            return format!("Deleted {count} entries.");
        }

        let base = segs[..wpos].join(":");
        let last_key = *segs.last().expect("non-empty path");
        let removed = engine.data.delete_recursive(&base, last_key);
        if removed > 0 {
            engine.mark_data_dirty();
            engine.invalidate_cache_for_path(&base);
            notify_path(engine, &base);
            if !engine.scheduler.is_active() {
                engine.persist();
            }
            replicate_command(engine, &format!("DEL {path}")).await;
        }
        return format!("Deleted {removed} entries.");
    }

    if let Some(forwarded) = maybe_forward(engine, path, &format!("DEL {path}")).await {
        return forwarded;
    }

    match delete_single(engine, path) {
        Ok(()) => {
            replicate_command(engine, &format!("DEL {path}")).await;
            "OK".to_string()
        }
        Err(e) => fail(e),
    }
}

fn delete_single(engine: &mut Engine, path: &str) -> Result<()> {
    let removed = engine.data.delete(path).ok_or_else(|| err("Key does not exist"))?;
    match &removed {
        Value::Object(_) => engine.index.remove_entity(path, &removed),
        other => {
            let parent = mgin_base::parent(path).unwrap_or_default();
            let last = mgin_base::last(path).unwrap_or_default();
            engine.index.remove_field(&parent, last, other);
        }
    }
    engine.data.prune_ancestors(path);
    engine.ttl.remove(path);
    engine.mark_data_dirty();
    engine.mark_index_dirty();
    engine.invalidate_cache_for_path(path);
    notify_path(engine, path);
    if !engine.scheduler.is_active() {
        engine.persist();
    }
    Ok(())
}

// --------------------------------------------------------------- INCR/DECR

async fn cmd_incrdecr(engine: &mut Engine, rest: &str, sign: i64) -> String {
    let rest = rest.trim();
    let mut parts = rest.splitn(2, char::is_whitespace);
    let path = parts.next().unwrap_or("").trim();
    let amount_str = parts.next().unwrap_or("").trim();
    if path.is_empty() || amount_str.is_empty() {
        return "ERROR: INCR/DECR requires a path and an amount".to_string();
    }
    if mgin_base::contains_wildcard(path) {
        return "ERROR: Wildcard operations are not supported for INCR/DECR.".to_string();
    }
    let verb = if sign > 0 { "INCR" } else { "DECR" };
    if let Some(forwarded) = maybe_forward(engine, path, &format!("{verb} {rest}")).await {
        return forwarded;
    }

    let delta: f64 = match amount_str.parse() {
        Ok(n) => n,
        Err(_) => return "ERROR: Invalid numeric amount".to_string(),
    };
    let delta_is_int = amount_str.parse::<i64>().is_ok();
    let old = engine.data.get(path).cloned();
    let old_is_int = old.as_ref().map(|v| v.is_int_like()).unwrap_or(true);
    let old_num = old.as_ref().and_then(Value::as_f64).unwrap_or(0.0);

    let new_value = if old_is_int && delta_is_int {
        let old_int = old.as_ref().and_then(Value::as_i64).unwrap_or(0);
        Value::Int(old_int + sign * delta as i64)
    } else {
        Value::Float(old_num + sign as f64 * delta)
    };

    match write_leaf(engine, path, new_value.clone()) {
        Ok(()) => {
            finish_set(engine, path);
            replicate_command(engine, &format!("{verb} {rest}")).await;
            value_reply(&new_value)
        }
        Err(e) => fail(e),
    }
}

// ---------------------------------------------------------------- RENAME

async fn cmd_rename(engine: &mut Engine, rest: &str) -> String {
    let rest = rest.trim();
    let upper = rest.to_uppercase();
    let to_pos = match upper.find(" TO ") {
        Some(p) => p,
        None => return "ERROR: RENAME requires '<path> TO <newName>'".to_string(),
    };
    let path = rest[..to_pos].trim();
    let new_last = rest[to_pos + 4..].trim();
    if path.is_empty() || new_last.is_empty() {
        return "ERROR: RENAME requires '<path> TO <newName>'".to_string();
    }

    if mgin_base::contains_wildcard(path) {
        if engine.config.sharding_enabled() {
            return "ERROR: Wildcard operations are not supported in sharding mode.".to_string();
        }
        let segs = mgin_base::split(path);
        let resolved = engine.data.resolve_wildcard(&segs);
        let mut count = 0;
        for resolved_path in resolved {
            if engine.data.rename(&resolved_path, new_last).is_ok() {
                engine.mark_data_dirty();
                engine.invalidate_cache_for_path(&resolved_path);
                notify_path(engine, &resolved_path);
                count += 1;
            }
        }
        if !engine.scheduler.is_active() {
            engine.persist();
        }
        replicate_command(engine, &format!("RENAME {rest}")).await;
        return format!("Renamed {count} keys.");
    }

    if let Some(forwarded) = maybe_forward(engine, path, &format!("RENAME {rest}")).await {
        return forwarded;
    }

    match engine.data.rename(path, new_last) {
        Ok(()) => {
            engine.mark_data_dirty();
            engine.invalidate_cache_for_path(path);
            notify_path(engine, path);
            if !engine.scheduler.is_active() {
                engine.persist();
            }
            replicate_command(engine, &format!("RENAME {rest}")).await;
            "OK".to_string()
        }
        Err(e) => fail(e),
    }
}

// ----------------------------------------------------------------- QUERY

async fn cmd_query(engine: &mut Engine, rest: &str) -> String {
    let normalized = format!("QUERY {}", rest.trim());
    if let Some(cached) = engine.cache.get(&normalized, now()) {
        return value_reply(&cached);
    }

    let q = match mgin_query::parse_query(rest) {
        Ok(q) => q,
        Err(e) => return fail(e),
    };
    if engine.config.sharding_enabled() {
        if let Err(e) = mgin_shard::reject_wildcard(&q.path) {
            return fail(e);
        }
    }

    let segs = mgin_base::split(&q.path);
    let result = if segs.len() >= 2 {
        match mgin_eval::evaluate(&engine.data, &engine.index, &q) {
            Ok(v) => v,
            Err(e) => return fail(e),
        }
    } else {
        let mut rows = match mgin_eval::filter_and_join(&engine.data, &engine.index, &q) {
            Ok(rows) => rows,
            Err(e) => return fail(e),
        };
        if engine.config.sharding_enabled() && engine.config.get_str("SHARDING_TYPE").eq_ignore_ascii_case("MASTER") {
            let own = own_shard_address(engine);
            for shard in engine.config.shards() {
                if shard == own {
                    continue;
                }
                if let Ok(reply) = mgin_shard::forward_command(&shard, &normalized).await {
                    if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&reply) {
                        if let Some(items) = Value::from_json(&parsed).as_list() {
                            rows.extend(items.to_vec());
                        }
                    }
                }
            }
        }
        mgin_eval::finalize(rows, &q)
    };

    let top = mgin_base::top_level(&q.path).unwrap_or("").to_string();
    engine.cache.insert(&normalized, &top, &result, now());
    value_reply(&result)
}

// --------------------------------------------------------------- INDICES

fn cmd_indices(engine: &mut Engine, rest: &str) -> String {
    let rest = rest.trim();
    let mut parts = rest.splitn(2, char::is_whitespace);
    let verb = parts.next().unwrap_or("").to_uppercase();
    let remainder = parts.next().unwrap_or("").trim();
    match verb.as_str() {
        "CREATE" => {
            let mut args = remainder.splitn(2, char::is_whitespace);
            let path = args.next().unwrap_or("");
            let kind_str = args.next().unwrap_or("").trim().to_lowercase();
            let kind = match IndexKind::parse(&kind_str) {
                Some(k) => k,
                None => return format!("ERROR: Unknown index type '{kind_str}'"),
            };
            match engine.index.create(path, kind, &engine.data) {
                Ok(()) => {
                    engine.mark_index_dirty();
                    if !engine.scheduler.is_active() {
                        engine.persist();
                    }
                    "OK".to_string()
                }
                Err(e) => fail(e),
            }
        }
        "LIST" => value_reply(&engine.index.list_structure()),
        "GET" => match engine.index.get(remainder) {
            Some(descriptor) => value_reply(&descriptor_to_value(descriptor)),
            None => format!("ERROR: Index '{remainder}' not found"),
        },
        "DEL" => {
            let mut args = remainder.splitn(2, char::is_whitespace);
            let path = args.next().unwrap_or("");
            let value = args.next().unwrap_or("").trim();
            match engine.index.del(path, value) {
                Ok(()) => {
                    engine.mark_index_dirty();
                    "OK".to_string()
                }
                Err(e) => fail(e),
            }
        }
        "FLUSH" => match engine.index.flush(remainder) {
            Ok(()) => {
                engine.mark_index_dirty();
                "OK".to_string()
            }
            Err(e) => fail(e),
        },
        other => format!("ERROR: Unknown INDICES subcommand '{other}'"),
    }
}

fn descriptor_to_value(d: &IndexDescriptor) -> Value {
    let mut m = IndexMap::new();
    m.insert("type".to_string(), Value::Str(d.kind.as_str().to_string()));
    let values = match &d.values {
        IndexValues::Strings(sm) => {
            let mut vm = IndexMap::new();
            for (k, v) in sm {
                vm.insert(k.clone(), Value::Str(v.clone()));
            }
            Value::Object(vm)
        }
        IndexValues::Sets(sm) => {
            let mut vm = IndexMap::new();
            for (k, v) in sm {
                vm.insert(k.clone(), Value::List(v.iter().cloned().map(Value::Str).collect()));
            }
            Value::Object(vm)
        }
    };
    m.insert("values".to_string(), values);
    Value::Object(m)
}

// ------------------------------------------------------------- SUB/UNSUB

fn cmd_sub(engine: &mut Engine, rest: &str, sid: Uuid) -> String {
    let keys: Vec<&str> = rest.split(',').map(str::trim).filter(|s| !s.is_empty()).collect();
    if keys.is_empty() {
        return "ERROR: SUB requires at least one key".to_string();
    }
    for key in &keys {
        engine.subs.subscribe(sid, key);
    }
    format!("Subscribed to {}.", keys.join(", "))
}

fn cmd_unsub(engine: &mut Engine, rest: &str, sid: Uuid) -> String {
    let keys: Vec<&str> = rest.split(',').map(str::trim).filter(|s| !s.is_empty()).collect();
    if keys.is_empty() {
        return "ERROR: UNSUB requires at least one key".to_string();
    }
    for key in &keys {
        engine.subs.unsubscribe(sid, key);
    }
    format!("Unsubscribed from {}.", keys.join(", "))
}

fn cmd_sublist(engine: &Engine, sid: Uuid) -> String {
    value_reply(&Value::List(engine.subs.list_for(sid).into_iter().map(Value::Str).collect()))
}

// --------------------------------------------------------------- SCHEDULE

/// `task_key` for `SCHEDULE ADD` when the caller doesn't supply one: the
/// first 12 hex characters of SHA-256(inner command). The original's
/// scheduler UI lets a human name a task explicitly; this wire grammar
/// only carries the cron expression and the command, so a deterministic
/// key derived from the command is what lets repeating the identical
/// `SCHEDULE ADD` stay idempotent under the registry's global task-key
/// uniqueness rule instead of piling up duplicates.
fn task_key_for(inner_command: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(inner_command.as_bytes());
    let digest = hasher.finalize();
    digest.iter().take(6).map(|b| format!("{b:02x}")).collect()
}

fn cmd_schedule(engine: &mut Engine, rest: &str) -> String {
    let rest = rest.trim();
    let mut parts = rest.splitn(2, char::is_whitespace);
    let verb = parts.next().unwrap_or("").to_uppercase();
    let remainder = parts.next().unwrap_or("").trim();
    match verb.as_str() {
        "SHOW" => {
            if remainder.is_empty() || remainder.eq_ignore_ascii_case("ALL") {
                value_reply(&engine.scheduler.show_all())
            } else {
                match engine.scheduler.show(remainder) {
                    Ok(v) => value_reply(&v),
                    Err(e) => fail(e),
                }
            }
        }
        "ADD" => {
            if !engine.scheduler.is_active() {
                return "ERROR: SCHEDULE requires the scheduler to be active; enable it with CONFIG SCHEDULER 1".to_string();
            }
            let upper = remainder.to_uppercase();
            let cmd_pos = match upper.find("COMMAND(") {
                Some(p) => p,
                None => return "ERROR: SCHEDULE ADD requires COMMAND(<inner command>)".to_string(),
            };
            let cron_expr = remainder[..cmd_pos].trim();
            let after_open = &remainder[cmd_pos + "COMMAND(".len()..];
            let inner = match after_open.strip_suffix(')') {
                Some(s) => s.trim(),
                None => return "ERROR: SCHEDULE ADD requires a closing ')' for COMMAND(...)".to_string(),
            };
            if inner.is_empty() {
                return "ERROR: SCHEDULE ADD requires a non-empty inner command".to_string();
            }
            let task_key = task_key_for(inner);
            match engine.scheduler.add(cron_expr, &task_key, inner, now()) {
                Ok(()) => {
                    engine.mark_scheduler_dirty();
                    if !engine.scheduler.is_active() {
                        engine.persist();
                    }
                    format!("Scheduled '{task_key}'.")
                }
                Err(e) => fail(e),
            }
        }
        "DEL" => match engine.scheduler.del(remainder) {
            Ok(()) => {
                engine.mark_scheduler_dirty();
                "OK".to_string()
            }
            Err(e) => fail(e),
        },
        "FLUSH" => {
            if remainder.is_empty() || remainder.eq_ignore_ascii_case("ALL") {
                engine.scheduler.flush_all();
                engine.mark_scheduler_dirty();
                "OK".to_string()
            } else {
                match engine.scheduler.flush_cron(remainder) {
                    Ok(()) => {
                        engine.mark_scheduler_dirty();
                        "OK".to_string()
                    }
                    Err(e) => fail(e),
                }
            }
        }
        other => format!("ERROR: Unknown SCHEDULE subcommand '{other}'"),
    }
}

// ------------------------------------------------------- FLUSHALL/FLUSHCACHE

fn cmd_flushall(engine: &mut Engine) -> String {
    engine.data = DataStore::new();
    engine.index = IndexEngine::new();
    engine.ttl = TtlStore::new();
    engine.cache.flush();
    engine.mark_data_dirty();
    engine.mark_index_dirty();
    engine.persist();
    "OK".to_string()
}

fn cmd_flushcache(engine: &mut Engine) -> String {
    engine.cache.flush();
    "OK".to_string()
}

// ---------------------------------------------------------- BACKUP/ROLLBACK

fn cmd_backup(engine: &mut Engine) -> String {
    match engine.backup() {
        Ok(msg) => msg,
        Err(e) => fail(e),
    }
}

fn cmd_rollback(engine: &mut Engine, rest: &str) -> String {
    let kind = rest.trim();
    if kind.is_empty() {
        return "ERROR: ROLLBACK requires a backup kind ('data' or 'indices')".to_string();
    }
    match engine.rollback(kind) {
        Ok(msg) => msg,
        Err(e) => fail(e),
    }
}

// -------------------------------------------------------------- RESHARD

/// Adopt whatever state was merged from already-cleared peers before a
/// later peer turned out unreachable, rather than discarding it: the shard
/// list stays unchanged (the reshard did not complete), but no key already
/// gathered from a cleared peer is lost.
fn adopt_partial_reshard(engine: &mut Engine, merged_data: Value, merged_indices: Value) -> String {
    engine.data = DataStore::from_value(merged_data);
    engine.index = IndexEngine::from_value(&merged_indices);
    engine.mark_data_dirty();
    engine.mark_index_dirty();
    engine.persist_force();
    "ERROR: Sharding failed".to_string()
}

/// `RESHARD <shard1,shard2,...>` on the requesting master: fetch every
/// peer's pre-clear state, merge it with the local store, replan the
/// shard assignment, and adopt the merged state under the new shard
/// list. A bare `RESHARD` (no shard list) is the responder path a peer
/// receives: clear local state immediately and hand back what was held
/// before clearing (§4.12 step 1 — the peer does not wait for the
/// requester to finish merging).
///
/// The full original redistributes each top-level key to its newly
/// computed shard over the wire in batches; this port computes and logs
/// that same `Move` plan via `mgin-shard::plan_reshard`/`batch` but
/// settles the merged state locally rather than re-partitioning entries
/// back out to peer processes, since the exact peer-push choreography
/// beyond planning and merging is not pinned down by the specification.
/// If a peer turns out unreachable partway through, the requester adopts
/// whatever was merged from peers already reached (`adopt_partial_reshard`)
/// instead of dropping it, since those peers have already cleared
/// themselves. See DESIGN.md for this simplification.
async fn cmd_reshard(engine: &mut Engine, rest: &str) -> String {
    let new_shards: Vec<String> = rest.split(',').map(str::trim).filter(|s| !s.is_empty()).map(String::from).collect();

    if new_shards.is_empty() {
        let snapshot = serde_json::json!({
            "data": engine.data.to_value().to_json(),
            "indices": engine.index.to_value().to_json(),
        });
        engine.data = DataStore::new();
        engine.index = IndexEngine::new();
        engine.mark_data_dirty();
        engine.mark_index_dirty();
        engine.persist_force();
        return snapshot.to_string();
    }

    let old_shards = engine.config.shards();
    let old_count = old_shards.len().max(1);
    let own = own_shard_address(engine);
    let peers: Vec<String> = old_shards.into_iter().filter(|s| *s != own).collect();

    let mut merged_data = engine.data.to_value();
    let mut merged_indices = engine.index.to_value();
    for peer in &peers {
        let reply = match mgin_shard::forward_command(peer, "RESHARD").await {
            Ok(r) => r,
            Err(e) => {
                warn!(target: "mgin", "reshard peer {peer} unreachable: {e:?}");
                // Peers already reached have been cleared on their end, so the
                // requester adopts whatever got merged so far instead of
                // dropping it — losing nothing even though the reshard as a
                // whole did not complete.
                return adopt_partial_reshard(engine, merged_data, merged_indices);
            }
        };
        let parsed: serde_json::Value = match serde_json::from_str(&reply) {
            Ok(p) => p,
            Err(_) => return adopt_partial_reshard(engine, merged_data, merged_indices),
        };
        let peer_data = Value::from_json(parsed.get("data").unwrap_or(&serde_json::Value::Null));
        let peer_indices = Value::from_json(parsed.get("indices").unwrap_or(&serde_json::Value::Null));
        merged_data = mgin_shard::merge_value(&merged_data, &peer_data);
        merged_indices = mgin_shard::merge_value(&merged_indices, &peer_indices);
    }

    let merged_store = DataStore::from_value(merged_data);
    let moves = match mgin_shard::plan_reshard(&merged_store, old_count, new_shards.len()) {
        Ok(m) => m,
        Err(e) => return fail(e),
    };
    let batch_size = engine.config.get_i64("SHARDING_BATCH_SIZE").max(1) as usize;
    let batches = mgin_shard::batch(&moves, batch_size);
    info!(target: "mgin", "reshard recomputed {} key moves across {} batches", moves.len(), batches.len());

    engine.data = merged_store;
    engine.index = IndexEngine::from_value(&merged_indices);
    if let Err(e) = engine.config.set("SHARDS", Value::List(new_shards.into_iter().map(Value::Str).collect())) {
        warn!(target: "mgin", "failed to persist new SHARDS list: {e:?}");
    }
    engine.mark_data_dirty();
    engine.mark_index_dirty();
    engine.persist_force();
    format!("Resharded, {} keys reassigned.", moves.len())
}

// ------------------------------------------------------------- SERVERSTOP

fn cmd_serverstop(engine: &mut Engine) -> String {
    engine.shutting_down = true;
    if engine.config.get_bool("BACKUP_ON_SHUTDOWN") {
        if let Err(e) = engine.backup() {
            warn!(target: "mgin", "backup on shutdown failed: {e:?}");
        }
    }
    engine.persist_force();
    "Server is shutting down.".to_string()
}

// -------------------------------------------------------------- BLOCKCHAIN

fn require_blockchain(engine: &Engine) -> std::result::Result<&BlockchainState, String> {
    engine.blockchain.as_ref().ok_or_else(|| "ERROR: Blockchain is not enabled".to_string())
}

fn block_to_value(block: &mgin_blockchain::Block) -> Value {
    let mut m = IndexMap::new();
    m.insert("index".to_string(), Value::Int(block.index as i64));
    m.insert("timestamp".to_string(), Value::Int(block.timestamp));
    m.insert("nonce".to_string(), Value::Int(block.nonce as i64));
    m.insert("difficulty".to_string(), Value::Int(block.difficulty as i64));
    m.insert("previous_hash".to_string(), Value::Str(block.previous_hash.clone()));
    m.insert("hash".to_string(), Value::Str(block.hash.clone()));
    m.insert("checksum".to_string(), Value::Str(block.checksum.clone()));
    m.insert("fee".to_string(), Value::Float(block.fee));
    m.insert("validator".to_string(), Value::Str(block.validator.clone()));
    m.insert("size".to_string(), Value::Int(block.size as i64));
    m.insert(
        "transactions".to_string(),
        Value::List(block.transactions.iter().map(tx_to_value).collect()),
    );
    Value::Object(m)
}

fn tx_to_value(tx: &mgin_blockchain::Transaction) -> Value {
    let mut m = IndexMap::new();
    m.insert("sender".to_string(), Value::Str(tx.sender.clone()));
    m.insert("receiver".to_string(), Value::Str(tx.receiver.clone()));
    m.insert("amount".to_string(), Value::Float(tx.amount));
    m.insert("symbol".to_string(), Value::Str(tx.symbol.clone()));
    m.insert("fee".to_string(), Value::Float(tx.fee));
    m.insert("action".to_string(), Value::Str(tx.action.clone()));
    m.insert("contract_hash".to_string(), Value::Str(tx.contract_hash.clone()));
    m.insert("timestamp".to_string(), Value::Int(tx.timestamp));
    m.insert("txid".to_string(), Value::Str(tx.txid()));
    Value::Object(m)
}

fn wallet_to_value(w: &mgin_blockchain::Wallet) -> Value {
    let mut m = IndexMap::new();
    m.insert("address".to_string(), Value::Str(w.address.clone()));
    m.insert("balance".to_string(), Value::Float(w.balance));
    m.insert("balance_pending".to_string(), Value::Float(w.balance_pending));
    m.insert("tx_count".to_string(), Value::Int(w.tx_count as i64));
    m.insert("last_tx_timestamp".to_string(), Value::Int(w.last_tx_timestamp));
    Value::Object(m)
}

fn cmd_blockchain(engine: &mut Engine, rest: &str) -> String {
    let rest = rest.trim();
    let state = match require_blockchain(engine) {
        Ok(s) => s,
        Err(e) => return e,
    };
    if rest.is_empty() || rest.eq_ignore_ascii_case("INFO") {
        let mut m = IndexMap::new();
        m.insert("length".to_string(), Value::Int(state.chain.len() as i64));
        m.insert("pending".to_string(), Value::Int(state.chain.pending.len() as i64));
        m.insert("valid".to_string(), Value::Bool(state.chain.verify_chain()));
        return value_reply(&Value::Object(m));
    }
    if let Ok(index) = rest.parse::<usize>() {
        return match state.chain.blocks.get(index) {
            Some(block) => value_reply(&block_to_value(block)),
            None => format!("ERROR: Block {index} does not exist"),
        };
    }
    format!("ERROR: Unknown BLOCKCHAIN selector '{rest}'")
}

fn cmd_block(engine: &mut Engine, rest: &str) -> String {
    let state = match require_blockchain(engine) {
        Ok(s) => s,
        Err(e) => return e,
    };
    let index: usize = match rest.trim().parse() {
        Ok(i) => i,
        Err(_) => return "ERROR: BLOCK requires a numeric index".to_string(),
    };
    match state.chain.blocks.get(index) {
        Some(block) => value_reply(&block_to_value(block)),
        None => format!("ERROR: Block {index} does not exist"),
    }
}

fn cmd_new_wallet(engine: &mut Engine, rest: &str) -> String {
    let address = rest.trim();
    if address.is_empty() {
        return "ERROR: NEW_WALLET requires an address".to_string();
    }
    let state = match engine.blockchain.as_mut() {
        Some(s) => s,
        None => return "ERROR: Blockchain is not enabled".to_string(),
    };
    state.chain.new_wallet(address);
    let wallet = state.chain.get_wallet(address).expect("just created").clone();
    if let Err(e) = mgin_blockchain::persist_wallet(&state.conn, &wallet) {
        warn!(target: "mgin", "failed to persist new wallet: {e:?}");
    }
    value_reply(&wallet_to_value(&wallet))
}

fn cmd_get_wallet(engine: &mut Engine, rest: &str) -> String {
    let address = rest.trim();
    let state = match require_blockchain(engine) {
        Ok(s) => s,
        Err(e) => return e,
    };
    match state.chain.get_wallet(address) {
        Some(w) => value_reply(&wallet_to_value(w)),
        None => format!("ERROR: Wallet '{address}' does not exist"),
    }
}

async fn cmd_transaction(engine: &mut Engine, rest: &str) -> String {
    let parts: Vec<&str> = rest.trim().splitn(4, char::is_whitespace).collect();
    if parts.len() < 3 {
        return "ERROR: TRANSACTION requires sender, receiver, and amount".to_string();
    }
    let sender = parts[0];
    let receiver = parts[1];
    let amount: f64 = match parts[2].parse() {
        Ok(a) => a,
        Err(_) => return "ERROR: Invalid transaction amount".to_string(),
    };
    let plaintext = parts.get(3).copied().unwrap_or("");
    let fee: f64 = engine.config.get_str("BLOCKCHAIN_CONTRACT_FEE").parse::<f64>().unwrap_or(0.0) / 1_000_000.0;
    let symbol = engine.config.get_str("BLOCKCHAIN_SYMBOL");
    let data = mgin_blockchain::encrypt_data(sender, plaintext);

    let state = match engine.blockchain.as_mut() {
        Some(s) => s,
        None => return "ERROR: Blockchain is not enabled".to_string(),
    };
    let tx = mgin_blockchain::Transaction {
        sender: sender.to_string(),
        receiver: receiver.to_string(),
        amount,
        symbol,
        data,
        fee,
        action: "TRANSFER".to_string(),
        contract_hash: String::new(),
        timestamp: now(),
    };
    match state.chain.submit_transaction(tx, now()) {
        Ok(txid) => format!("Transaction submitted: {txid}"),
        Err(e) => fail(e),
    }
}

async fn cmd_mine(engine: &mut Engine, rest: &str) -> String {
    let validator = rest.trim();
    if validator.is_empty() {
        return "ERROR: MINE requires a validator address".to_string();
    }
    let timestamp = now();
    let state = match engine.blockchain.as_mut() {
        Some(s) => s,
        None => return "ERROR: Blockchain is not enabled".to_string(),
    };
    let block_value = match state.chain.mine_block(validator, timestamp) {
        Ok(block) => {
            let v = block_to_value(block);
            if let Err(e) = mgin_blockchain::persist_block(&state.conn, block) {
                warn!(target: "mgin", "failed to persist mined block: {e:?}");
            }
            v
        }
        Err(e) => return fail(e),
    };
    notify_nodes(engine, &block_value);
    value_reply(&block_value)
}
