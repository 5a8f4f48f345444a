// The cron-driven task registry (§4.10, §3.6). This crate only owns the
// registry and the cron arithmetic; the actual 1-second tick loop, the
// TTL/cache sweep, and the snapshot-flush cadence live in the `mgin`
// binary and `mgin-net`'s engine, which call `tick` once per second and
// dispatch the returned commands back through the command processor (a
// dependency this crate cannot take without a cycle — see SPEC_FULL.md
// design notes on `SchedulerProbe`).

use chrono::{TimeZone, Utc};
use cron::Schedule;
use indexmap::IndexMap;
use mgin_base::{err, Result, Value};
use regex::Regex;
use std::str::FromStr;

#[derive(Clone, Debug)]
pub struct Task {
    pub command: String,
    pub last_run: Option<i64>,
    pub next_run: i64,
}

#[derive(Clone, Debug, Default)]
pub struct Scheduler {
    /// cron expression -> task_key -> task. Exactly one entry per
    /// task_key globally (§3.6): `add` removes any existing task with the
    /// same key under a different cron expression before inserting.
    registry: IndexMap<String, IndexMap<String, Task>>,
    active: bool,
}

impl Scheduler {
    pub fn new(active: bool) -> Self {
        Scheduler { registry: IndexMap::new(), active }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    pub fn add(&mut self, cron_expr: &str, task_key: &str, command: &str, now: i64) -> Result<()> {
        if !is_cron_format(cron_expr) {
            return Err(err(format!("'{cron_expr}' is not a valid cron expression")));
        }
        let next_run = next_run_after(cron_expr, now)?;
        self.remove_key(task_key);
        self.registry
            .entry(cron_expr.to_string())
            .or_default()
            .insert(task_key.to_string(), Task { command: command.to_string(), last_run: None, next_run });
        Ok(())
    }

    fn remove_key(&mut self, task_key: &str) {
        let mut drained = Vec::new();
        for (cron_expr, tasks) in self.registry.iter_mut() {
            tasks.shift_remove(task_key);
            if tasks.is_empty() {
                drained.push(cron_expr.clone());
            }
        }
        for cron_expr in drained {
            self.registry.shift_remove(&cron_expr);
        }
    }

    pub fn del(&mut self, task_key: &str) -> Result<()> {
        let existed = self.registry.values().any(|tasks| tasks.contains_key(task_key));
        if !existed {
            return Err(err(format!("Scheduled task '{task_key}' not found")));
        }
        self.remove_key(task_key);
        Ok(())
    }

    pub fn flush_all(&mut self) {
        self.registry.clear();
    }

    pub fn flush_cron(&mut self, cron_expr: &str) -> Result<()> {
        if self.registry.shift_remove(cron_expr).is_none() {
            return Err(err(format!("No tasks scheduled under '{cron_expr}'")));
        }
        Ok(())
    }

    /// `SCHEDULE SHOW ALL`.
    pub fn show_all(&self) -> Value {
        let mut out = IndexMap::new();
        for (cron_expr, tasks) in &self.registry {
            out.insert(cron_expr.clone(), tasks_to_value(tasks));
        }
        Value::Object(out)
    }

    /// `SCHEDULE SHOW <cron>` or `SCHEDULE SHOW <task_key>`, whichever
    /// matches: an exact cron expression first, then a task key across
    /// every cron bucket.
    pub fn show(&self, selector: &str) -> Result<Value> {
        if let Some(tasks) = self.registry.get(selector) {
            return Ok(tasks_to_value(tasks));
        }
        for tasks in self.registry.values() {
            if let Some(task) = tasks.get(selector) {
                return Ok(task_to_value(task));
            }
        }
        Err(err(format!("'{selector}' matches no scheduled cron expression or task")))
    }

    /// One scheduler tick: every task whose `next_run <= now` is returned
    /// (key, command) and has `last_run`/`next_run` advanced in place.
    pub fn tick(&mut self, now: i64) -> Vec<(String, String)> {
        let mut due = Vec::new();
        for (cron_expr, tasks) in self.registry.iter_mut() {
            for (key, task) in tasks.iter_mut() {
                if task.next_run <= now {
                    due.push((key.clone(), task.command.clone()));
                    task.last_run = Some(now);
                    if let Ok(next) = next_run_after(cron_expr, now) {
                        task.next_run = next;
                    }
                }
            }
        }
        due
    }

    pub fn to_value(&self) -> Value {
        self.show_all()
    }

    pub fn from_value(v: &Value, now: i64) -> Scheduler {
        let mut scheduler = Scheduler::new(true);
        if let Value::Object(crons) = v {
            for (cron_expr, tasks) in crons {
                if !is_cron_format(cron_expr) {
                    continue;
                }
                if let Value::Object(tasks) = tasks {
                    for (key, task) in tasks {
                        if let Value::Object(fields) = task {
                            let command = fields.get("command").map(Value::stringify).unwrap_or_default();
                            let next_run = fields
                                .get("next_run")
                                .and_then(Value::as_i64)
                                .unwrap_or_else(|| next_run_after(cron_expr, now).unwrap_or(now));
                            let last_run = fields.get("last_run").and_then(Value::as_i64);
                            scheduler
                                .registry
                                .entry(cron_expr.clone())
                                .or_default()
                                .insert(key.clone(), Task { command, last_run, next_run });
                        }
                    }
                }
            }
        }
        scheduler
    }
}

fn tasks_to_value(tasks: &IndexMap<String, Task>) -> Value {
    let mut out = IndexMap::new();
    for (key, task) in tasks {
        out.insert(key.clone(), task_to_value(task));
    }
    Value::Object(out)
}

fn task_to_value(task: &Task) -> Value {
    let mut out = IndexMap::new();
    out.insert("command".to_string(), Value::Str(task.command.clone()));
    out.insert("last_run".to_string(), task.last_run.map(Value::Int).unwrap_or(Value::Null));
    out.insert("next_run".to_string(), Value::Int(task.next_run));
    Value::Object(out)
}

/// Standard 5-field cron (minute hour day month weekday), optionally
/// followed by a 4-digit year — matching the original's detector regex
/// (SPEC_FULL.md §4.10).
pub fn is_cron_format(s: &str) -> bool {
    let re = Regex::new(r"^(\S+\s+){4}\S+(\s+\d{4})?$").unwrap();
    re.is_match(s.trim())
}

/// Compute the next run timestamp strictly after `after`, by handing the
/// 5/6-field expression to the `cron` crate with a synthetic leading
/// seconds field of `0` (that crate requires 6 or 7 fields: sec min hour
/// day month dow [year]).
fn next_run_after(cron_expr: &str, after: i64) -> Result<i64> {
    let schedule_str = format!("0 {}", cron_expr.trim());
    let schedule = Schedule::from_str(&schedule_str).map_err(|e| err(format!("Invalid cron expression: {e}")))?;
    let after_dt = Utc
        .timestamp_opt(after, 0)
        .single()
        .ok_or_else(|| err("Invalid timestamp"))?;
    schedule
        .after(&after_dt)
        .next()
        .map(|dt| dt.timestamp())
        .ok_or_else(|| err("Cron expression has no future occurrence"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_five_field_cron() {
        assert!(is_cron_format("* * * * *"));
        assert!(is_cron_format("0 0 * * 1 2030"));
        assert!(!is_cron_format("not a cron"));
    }

    #[test]
    fn add_computes_next_run_in_the_future() {
        let mut s = Scheduler::new(true);
        s.add("* * * * *", "sweep", "FLUSHCACHE", 1_000).unwrap();
        let shown = s.show("sweep").unwrap();
        let next = shown.as_object().unwrap().get("next_run").unwrap().as_i64().unwrap();
        assert!(next > 1_000);
    }

    #[test]
    fn add_enforces_global_task_key_uniqueness() {
        let mut s = Scheduler::new(true);
        s.add("* * * * *", "sweep", "FLUSHCACHE", 1_000).unwrap();
        s.add("0 * * * *", "sweep", "FLUSHALL", 1_000).unwrap();
        assert_eq!(s.registry.len(), 1);
        let shown = s.show("sweep").unwrap();
        assert_eq!(shown.as_object().unwrap().get("command"), Some(&Value::Str("FLUSHALL".into())));
    }

    #[test]
    fn tick_fires_due_tasks_and_advances_next_run() {
        let mut s = Scheduler::new(true);
        s.add("* * * * *", "sweep", "FLUSHCACHE", 0).unwrap();
        s.registry.get_mut("* * * * *").unwrap().get_mut("sweep").unwrap().next_run = 500;
        let due = s.tick(500);
        assert_eq!(due, vec![("sweep".to_string(), "FLUSHCACHE".to_string())]);
        let shown = s.show("sweep").unwrap();
        assert_eq!(shown.as_object().unwrap().get("last_run"), Some(&Value::Int(500)));
    }

    #[test]
    fn del_removes_task_from_its_cron_bucket() {
        let mut s = Scheduler::new(true);
        s.add("* * * * *", "sweep", "FLUSHCACHE", 0).unwrap();
        s.del("sweep").unwrap();
        assert!(s.show("sweep").is_err());
        assert!(s.registry.is_empty());
    }
}
