// Subscriber fan-out (§4.9, §3.5). This crate only tracks *interest* — the
// set of session ids subscribed to a key, to `MONITOR`, and to the
// blockchain `NODE`/`NODE_LITE` roles — and computes which sids a given
// mutation path should notify. `mgin-net` owns the actual per-session send
// handles and does the JSON payload delivery.

use indexmap::{IndexMap, IndexSet};
use mgin_base::{split, Value};
use serde_json::json;
use uuid::Uuid;

pub const MONITOR_KEY: &str = "MONITOR";
pub const NODE_KEY: &str = "NODE";
pub const NODE_LITE_KEY: &str = "NODE_LITE";

#[derive(Clone, Debug, Default)]
pub struct SubscriberRegistry {
    sub_pub: IndexMap<String, IndexSet<Uuid>>,
    monitor_subscribers: IndexSet<Uuid>,
    node_subscribers: IndexSet<Uuid>,
    node_lite_subscribers: IndexSet<Uuid>,
    /// Round-robin cursor into `node_subscribers` for `notify_node`.
    node_cursor: usize,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        SubscriberRegistry::default()
    }

    /// `SUB k1,k2,...`. Special keys route to the monitor/node sets instead
    /// of the ordinary `sub_pub` map.
    pub fn subscribe(&mut self, sid: Uuid, key: &str) {
        match key {
            MONITOR_KEY => {
                self.monitor_subscribers.insert(sid);
            }
            NODE_KEY => {
                self.node_subscribers.insert(sid);
            }
            NODE_LITE_KEY => {
                self.node_lite_subscribers.insert(sid);
            }
            _ => {
                self.sub_pub.entry(key.to_string()).or_default().insert(sid);
            }
        }
    }

    pub fn unsubscribe(&mut self, sid: Uuid, key: &str) {
        match key {
            MONITOR_KEY => {
                self.monitor_subscribers.shift_remove(&sid);
            }
            NODE_KEY => {
                self.node_subscribers.shift_remove(&sid);
            }
            NODE_LITE_KEY => {
                self.node_lite_subscribers.shift_remove(&sid);
            }
            _ => {
                if let Some(set) = self.sub_pub.get_mut(key) {
                    set.shift_remove(&sid);
                    if set.is_empty() {
                        self.sub_pub.shift_remove(key);
                    }
                }
            }
        }
    }

    /// `SUBLIST`: every key this session is subscribed to, including the
    /// special roles it holds.
    pub fn list_for(&self, sid: Uuid) -> Vec<String> {
        let mut out: Vec<String> = self
            .sub_pub
            .iter()
            .filter(|(_, set)| set.contains(&sid))
            .map(|(k, _)| k.clone())
            .collect();
        if self.monitor_subscribers.contains(&sid) {
            out.push(MONITOR_KEY.to_string());
        }
        if self.node_subscribers.contains(&sid) {
            out.push(NODE_KEY.to_string());
        }
        if self.node_lite_subscribers.contains(&sid) {
            out.push(NODE_LITE_KEY.to_string());
        }
        out
    }

    /// Disconnect cleanup: drop `sid` from every set it could possibly be
    /// in, `node_lite_subscribers` included (the original's `clean_up`
    /// omitted that one; SPEC_FULL.md §3.5 treats that as a bug, not a
    /// quirk worth preserving).
    pub fn remove_session(&mut self, sid: Uuid) {
        self.monitor_subscribers.shift_remove(&sid);
        self.node_subscribers.shift_remove(&sid);
        self.node_lite_subscribers.shift_remove(&sid);
        let mut drained = Vec::new();
        for (key, set) in self.sub_pub.iter_mut() {
            set.shift_remove(&sid);
            if set.is_empty() {
                drained.push(key.clone());
            }
        }
        for key in drained {
            self.sub_pub.shift_remove(&key);
        }
    }

    /// Every sid subscribed to `path` itself, or to any wildcard prefix of
    /// it: `a:*`, `a:b:*`, ..., plus every two-deep wildcard `a:*:*` etc.
    /// (§4.9). Returns the sids paired with nothing else — the caller
    /// builds the `{key, data}` JSON payload once and sends it to each.
    pub fn notify_targets(&self, path: &str) -> IndexSet<Uuid> {
        let mut targets = IndexSet::new();
        for key in notify_keys(path) {
            if let Some(set) = self.sub_pub.get(&key) {
                targets.extend(set.iter().copied());
            }
        }
        targets
    }

    pub fn monitor_targets(&self) -> IndexSet<Uuid> {
        self.monitor_subscribers.clone()
    }

    /// `notify_node`: round-robins among `NODE` subscribers, one sid per
    /// call, wrapping the cursor.
    pub fn next_node(&mut self) -> Option<Uuid> {
        if self.node_subscribers.is_empty() {
            return None;
        }
        if self.node_cursor >= self.node_subscribers.len() {
            self.node_cursor = 0;
        }
        let sid = *self.node_subscribers.get_index(self.node_cursor)?;
        self.node_cursor += 1;
        Some(sid)
    }

    /// `notify_nodes`: every `NODE` and `NODE_LITE` subscriber.
    pub fn all_nodes(&self) -> IndexSet<Uuid> {
        self.node_subscribers.union(&self.node_lite_subscribers).copied().collect()
    }
}

/// Build the exact path, wildcard, and two-deep-wildcard keys a mutation
/// at `path` notifies on (§4.9): the literal path, every single-segment
/// wildcard prefix, and every two-segment wildcard prefix.
fn notify_keys(path: &str) -> Vec<String> {
    let segs = split(path);
    let mut keys = vec![path.to_string()];
    for depth in 1..segs.len() {
        let mut prefix: Vec<&str> = segs[..depth].to_vec();
        prefix.push("*");
        keys.push(prefix.join(":"));
    }
    for depth in 1..segs.len().saturating_sub(1) {
        let mut prefix: Vec<&str> = segs[..depth].to_vec();
        prefix.push("*");
        prefix.push("*");
        keys.push(prefix.join(":"));
    }
    keys
}

/// The `{key, data}` JSON payload sent to every notified subscriber.
pub fn notify_payload(key: &str, data: &Value) -> serde_json::Value {
    json!({ "key": key, "data": data.to_json() })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_and_notify_exact_key() {
        let mut reg = SubscriberRegistry::new();
        let sid = Uuid::new_v4();
        reg.subscribe(sid, "user:1:name");
        assert!(reg.notify_targets("user:1:name").contains(&sid));
    }

    #[test]
    fn notify_reaches_wildcard_prefix_subscribers() {
        let mut reg = SubscriberRegistry::new();
        let sid = Uuid::new_v4();
        reg.subscribe(sid, "user:*");
        assert!(reg.notify_targets("user:1:name").contains(&sid));
    }

    #[test]
    fn notify_reaches_two_deep_wildcard_subscribers() {
        let mut reg = SubscriberRegistry::new();
        let sid = Uuid::new_v4();
        reg.subscribe(sid, "user:*:*");
        assert!(reg.notify_targets("user:1:name").contains(&sid));
    }

    #[test]
    fn monitor_and_node_keys_route_to_dedicated_sets() {
        let mut reg = SubscriberRegistry::new();
        let sid = Uuid::new_v4();
        reg.subscribe(sid, MONITOR_KEY);
        assert!(reg.monitor_targets().contains(&sid));
        assert!(reg.sub_pub.is_empty());
    }

    #[test]
    fn remove_session_clears_every_set_including_node_lite() {
        let mut reg = SubscriberRegistry::new();
        let sid = Uuid::new_v4();
        reg.subscribe(sid, NODE_LITE_KEY);
        reg.subscribe(sid, "user:1");
        reg.remove_session(sid);
        assert!(!reg.all_nodes().contains(&sid));
        assert!(reg.notify_targets("user:1").is_empty());
    }

    #[test]
    fn node_round_robin_cycles_through_subscribers() {
        let mut reg = SubscriberRegistry::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        reg.subscribe(a, NODE_KEY);
        reg.subscribe(b, NODE_KEY);
        let first = reg.next_node().unwrap();
        let second = reg.next_node().unwrap();
        assert_ne!(first, second);
        let third = reg.next_node().unwrap();
        assert_eq!(first, third);
    }

    #[test]
    fn sublist_reports_every_membership() {
        let mut reg = SubscriberRegistry::new();
        let sid = Uuid::new_v4();
        reg.subscribe(sid, "user:1");
        reg.subscribe(sid, MONITOR_KEY);
        let mut list = reg.list_for(sid);
        list.sort();
        assert_eq!(list, vec![MONITOR_KEY.to_string(), "user:1".to_string()]);
    }
}
