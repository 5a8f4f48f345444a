// The `Engine` value (§3.7, §5): the single place every process-wide
// store lives. Nothing outside the single-writer task this module's
// `spawn_engine` starts ever touches these fields directly — every other
// task talks to it over an `EngineHandle`'s channel, the direct analogue
// of the source's single cooperative event loop.

use indexmap::IndexMap;
use mgin_base::{Result, Value};
use mgin_blockchain::Blockchain;
use mgin_cache::QueryCache;
use mgin_config::Config;
use mgin_index::IndexEngine;
use mgin_pubsub::SubscriberRegistry;
use mgin_scheduler::Scheduler;
use mgin_store::{DataStore, TtlStore};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};
use uuid::Uuid;

/// Held for the blockchain variant only; absent when `BLOCKCHAIN` is `0`.
pub struct BlockchainState {
    pub chain: Blockchain,
    pub conn: rusqlite::Connection,
}

pub struct Engine {
    pub config: Config,
    pub data: DataStore,
    pub index: IndexEngine,
    pub ttl: TtlStore,
    pub cache: QueryCache,
    pub subs: SubscriberRegistry,
    pub scheduler: Scheduler,
    pub blockchain: Option<BlockchainState>,
    pub base_dir: PathBuf,
    /// Outbound text frame per live session, registered by `session.rs` on
    /// connect and dropped on disconnect. A plain `mpsc` send is
    /// synchronous, so `Engine` can push notifications without an `.await`.
    pub sessions: IndexMap<Uuid, mpsc::UnboundedSender<String>>,
    data_dirty: bool,
    index_dirty: bool,
    scheduler_dirty: bool,
    ticks_since_save: u64,
    pub shutting_down: bool,
}

pub fn now() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).expect("system clock before epoch").as_secs() as i64
}

impl Engine {
    pub fn data_path(&self) -> PathBuf {
        self.base_dir.join("data/data.json")
    }
    pub fn indices_path(&self) -> PathBuf {
        self.base_dir.join("data/indices.json")
    }
    pub fn scheduler_path(&self) -> PathBuf {
        self.base_dir.join("data/scheduler.json")
    }
    pub fn blockchain_path(&self) -> PathBuf {
        self.base_dir.join("data/blockchain.db")
    }
    pub fn backup_dir(&self) -> PathBuf {
        self.base_dir.join("backup")
    }

    pub fn load(config: Config, base_dir: PathBuf) -> Result<Engine> {
        let now = now();
        let data = DataStore::from_value(mgin_store::load_snapshot(
            base_dir.join("data/data.json"),
            Value::object(),
        ));
        let indices = mgin_store::load_snapshot(base_dir.join("data/indices.json"), Value::object());
        let index = IndexEngine::from_value(&indices);
        let scheduler_snapshot = mgin_store::load_snapshot(base_dir.join("data/scheduler.json"), Value::object());
        let scheduler_active = config.get_bool("SCHEDULER");
        let scheduler = if scheduler_active {
            Scheduler::from_value(&scheduler_snapshot, now)
        } else {
            Scheduler::new(false)
        };
        let cache = QueryCache::new(config.get_bool("QUERY_CACHING"), config.get_i64("QUERY_CACHING_TTL"));

        let blockchain = if config.get_bool("BLOCKCHAIN") {
            let block_max_size = config.get_i64("BLOCKCHAIN_BLOCK_MAX_SIZE").max(1) as usize;
            let validator_reward: f64 = config.get_str("BLOCKCHAIN_VALIDATOR_REWARD").parse().unwrap_or(0.0);
            match mgin_blockchain::open_db(base_dir.join("data/blockchain.db")) {
                Ok(conn) => {
                    let chain = mgin_blockchain::load_blockchain(&conn, block_max_size, validator_reward)
                        .unwrap_or_else(|_| Blockchain::genesis(block_max_size, validator_reward, now));
                    Some(BlockchainState { chain, conn })
                }
                Err(e) => {
                    warn!(target: "mgin", "could not open blockchain database: {e}");
                    None
                }
            }
        } else {
            None
        };

        Ok(Engine {
            config,
            data,
            index,
            ttl: TtlStore::new(),
            cache,
            subs: SubscriberRegistry::new(),
            scheduler,
            blockchain,
            base_dir,
            sessions: IndexMap::new(),
            data_dirty: false,
            index_dirty: false,
            scheduler_dirty: false,
            ticks_since_save: 0,
            shutting_down: false,
        })
    }

    pub fn mark_data_dirty(&mut self) {
        self.data_dirty = true;
    }
    pub fn mark_index_dirty(&mut self) {
        self.index_dirty = true;
    }
    pub fn mark_scheduler_dirty(&mut self) {
        self.scheduler_dirty = true;
    }

    /// Write every dirty store to its snapshot file. Called on the save
    /// interval, on an explicit `BACKUP`/shutdown, and synchronously after
    /// a mutation when the scheduler is inactive (§4.2).
    pub fn persist(&mut self) {
        if self.data_dirty {
            match mgin_store::save_snapshot(self.data_path(), &self.data.to_value()) {
                Ok(()) => self.data_dirty = false,
                Err(e) => warn!(target: "mgin", "failed to persist data snapshot: {e}"),
            }
        }
        if self.index_dirty {
            match mgin_store::save_snapshot(self.indices_path(), &self.index.to_value()) {
                Ok(()) => self.index_dirty = false,
                Err(e) => warn!(target: "mgin", "failed to persist index snapshot: {e}"),
            }
        }
        if self.scheduler_dirty {
            match mgin_store::save_snapshot(self.scheduler_path(), &self.scheduler.to_value()) {
                Ok(()) => self.scheduler_dirty = false,
                Err(e) => warn!(target: "mgin", "failed to persist scheduler snapshot: {e}"),
            }
        }
    }

    /// Persist immediately regardless of dirty flags, used for `BACKUP` and
    /// orderly shutdown.
    pub fn persist_force(&mut self) {
        self.data_dirty = true;
        self.index_dirty = true;
        self.scheduler_dirty = true;
        self.persist();
    }

    pub fn backup(&mut self) -> Result<String> {
        use std::fs;
        self.persist_force();
        let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S").to_string();
        fs::create_dir_all(self.backup_dir())?;
        let mut names = Vec::new();
        for (kind, path) in [("data", self.data_path()), ("indices", self.indices_path())] {
            let dest = self.backup_dir().join(format!("{kind}_{stamp}.backup"));
            if path.exists() {
                fs::copy(&path, &dest)?;
                names.push(dest.display().to_string());
            }
        }
        info!(target: "mgin", "backup written: {names:?}");
        Ok(format!("Backup created: {}", names.join(", ")))
    }

    pub fn rollback(&mut self, kind: &str) -> Result<String> {
        use std::fs;
        let mut candidates: Vec<_> = fs::read_dir(self.backup_dir())
            .into_iter()
            .flatten()
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.file_name().and_then(|n| n.to_str()).is_some_and(|n| n.starts_with(&format!("{kind}_"))))
            .collect();
        candidates.sort();
        let latest = candidates.pop().ok_or_else(|| mgin_base::err(format!("No backup found for '{kind}'")))?;
        let target = match kind {
            "data" => self.data_path(),
            "indices" => self.indices_path(),
            other => return Err(mgin_base::err(format!("Unknown rollback kind '{other}'"))),
        };
        fs::copy(&latest, &target)?;
        match kind {
            "data" => {
                self.data = DataStore::from_value(mgin_store::load_snapshot(target, Value::object()));
            }
            "indices" => {
                let v = mgin_store::load_snapshot(target, Value::object());
                self.index = IndexEngine::from_value(&v);
            }
            _ => unreachable!(),
        }
        Ok(format!("Restored {kind} from {}", latest.display()))
    }

    /// One scheduler tick (§4.10): fire due cron tasks, sweep expired TTLs
    /// and cache entries, and persist on the configured interval.
    ///
    /// Due tasks are dispatched directly, in-task, rather than resubmitted
    /// through the engine's own request channel: this task already holds
    /// exclusive `&mut Engine` access as the sole writer (§5), so routing a
    /// scheduler-fired command back through the channel it is currently
    /// blocked draining would never be able to observe its own reply.
    pub async fn tick(&mut self) {
        let now = now();
        if self.scheduler.is_active() {
            let due = self.scheduler.tick(now);
            if !due.is_empty() {
                self.mark_scheduler_dirty();
            }
            for (key, command) in due {
                info!(target: "mgin", "scheduler firing task '{key}': {command}");
                let _ = crate::commands::dispatch(self, &command, Uuid::nil()).await;
            }
        }
        let expired = self.ttl.sweep(&mut self.data, now);
        if !expired.is_empty() {
            self.mark_data_dirty();
            for path in &expired {
                self.invalidate_cache_for_path(path);
            }
        }
        self.cache.sweep(now);

        self.ticks_since_save += 1;
        let interval = self.config.get_i64("SAVE_ON_FILE_INTERVAL").max(1) as u64;
        if self.ticks_since_save >= interval {
            self.ticks_since_save = 0;
            self.persist();
        }
    }

    /// Cache invalidation by top-level key, plus the coarse substring match
    /// the original's secondary invalidation performs (§3.4/§4.8).
    pub fn invalidate_cache_for_path(&mut self, path: &str) {
        if let Some(top) = mgin_base::top_level(path) {
            self.cache.invalidate(top);
        }
    }
}

/// A single request handed from a session's reader task to the engine task,
/// with a `oneshot` the engine replies through.
struct Request {
    command: String,
    sid: Uuid,
    reply: oneshot::Sender<String>,
}

/// Internal messages the engine task drains from its single channel:
/// ordinary commands, session bookkeeping, and the scheduler's tick.
/// Everything the engine task does funnels through this one queue so
/// ordering (§5) holds across every kind of request.
enum Control {
    Command(Request),
    Register(Uuid, mpsc::UnboundedSender<String>),
    Disconnect(Uuid),
    Snapshot(oneshot::Sender<(Value, Value)>),
    ConfigSnapshot(oneshot::Sender<Config>),
    Tick,
}

/// The single handle to the engine task, shared by every session and by
/// `main` for shutdown signaling.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<Control>,
    shutdown: tokio::sync::watch::Receiver<bool>,
}

impl EngineHandle {
    /// Submit a command on behalf of `sid` and await its reply.
    pub async fn submit_as(&self, command: String, sid: Uuid) -> String {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(Control::Command(Request { command, sid, reply: reply_tx })).is_err() {
            return "ERROR: Engine has shut down".to_string();
        }
        reply_rx.await.unwrap_or_else(|_| "ERROR: Engine dropped the reply channel".to_string())
    }

    /// Submit a command with no particular session attached.
    pub async fn submit(&self, command: String) -> String {
        self.submit_as(command, Uuid::nil()).await
    }

    pub fn register(&self, sid: Uuid, outbound: mpsc::UnboundedSender<String>) {
        let _ = self.tx.send(Control::Register(sid, outbound));
    }

    pub fn disconnect(&self, sid: Uuid) {
        let _ = self.tx.send(Control::Disconnect(sid));
    }

    /// Fetch a consistent `(data, indices)` snapshot for a `REPLICATE`
    /// responder (§4.13). Bypasses the single-string command reply since
    /// the caller needs the two trees separately to build chunk frames.
    pub async fn snapshot(&self) -> Option<(Value, Value)> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(Control::Snapshot(tx)).ok()?;
        rx.await.ok()
    }

    /// Fetch a `Config` clone for the handshake (§4.14): whether a
    /// username/password is configured, and what it is. Taken fresh on
    /// every connection rather than cached at startup, so a live
    /// `CONFIG SET USERNAME ...` takes effect for the next connection
    /// without restarting the listener.
    pub async fn config_snapshot(&self) -> Option<Config> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(Control::ConfigSnapshot(tx)).ok()?;
        rx.await.ok()
    }

    /// A `watch` receiver that flips to `true` once `SERVERSTOP` has been
    /// processed, so a session's accept loop can close its socket with a
    /// policy close frame instead of waiting for the channel to simply
    /// drop.
    pub fn shutdown_signal(&self) -> tokio::sync::watch::Receiver<bool> {
        self.shutdown.clone()
    }
}

/// Start the single-writer engine task. Returns the handle every session
/// submits requests through, plus the task's `JoinHandle` so the binary can
/// await it on shutdown.
pub fn spawn_engine(mut engine: Engine) -> (EngineHandle, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Control>();
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let handle = EngineHandle { tx: tx.clone(), shutdown: shutdown_rx };

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
        loop {
            interval.tick().await;
            if tx.send(Control::Tick).is_err() {
                break;
            }
        }
    });

    let join = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match msg {
                Control::Command(req) => {
                    let reply = crate::commands::dispatch(&mut engine, &req.command, req.sid).await;
                    let _ = req.reply.send(reply);
                    if engine.shutting_down {
                        engine.persist_force();
                        let _ = shutdown_tx.send(true);
                        break;
                    }
                }
                Control::Register(sid, outbound) => {
                    engine.sessions.insert(sid, outbound);
                }
                Control::Disconnect(sid) => {
                    engine.sessions.shift_remove(&sid);
                    engine.subs.remove_session(sid);
                }
                Control::Snapshot(reply) => {
                    let _ = reply.send((engine.data.to_value(), engine.index.to_value()));
                }
                Control::ConfigSnapshot(reply) => {
                    let _ = reply.send(engine.config.clone());
                }
                Control::Tick => {
                    engine.tick().await;
                }
            }
        }
    });

    (handle, join)
}
