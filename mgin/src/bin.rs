// Process entrypoint: load configuration, bring up the single-writer
// engine (§3.7, §5), sync from a replication master when configured as a
// slave (§4.13), then accept WebSocket connections until a signal or a
// `SERVERSTOP` command asks for an orderly shutdown (§5 "Cancellation").

use mgin_config::Config;
use mgin_net::engine::Engine;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let base_dir: PathBuf = std::env::args().nth(1).map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));
    if let Err(e) = std::fs::create_dir_all(base_dir.join("data")) {
        error!(target: "mgin", "could not create data directory under {}: {e}", base_dir.display());
        std::process::exit(1);
    }

    let config = match Config::load(base_dir.join("conf.json")) {
        Ok(config) => config,
        Err(e) => {
            error!(target: "mgin", "could not load configuration: {e}");
            std::process::exit(1);
        }
    };

    let mut engine = match Engine::load(config, base_dir) {
        Ok(engine) => engine,
        Err(e) => {
            error!(target: "mgin", "could not initialize engine: {e}");
            std::process::exit(1);
        }
    };

    if engine.config.get_bool("REPLICATION") && engine.config.get_str("REPLICATION_TYPE").eq_ignore_ascii_case("SLAVE")
    {
        let master = engine.config.get_str("REPLICATION_MASTER");
        if master.is_empty() {
            warn!(target: "mgin", "REPLICATION_TYPE is SLAVE but REPLICATION_MASTER is unset, starting from local snapshots");
        } else {
            info!(target: "mgin", "syncing initial state from replication master {master}");
            match mgin_replicate::sync_from_master(&master).await {
                Ok((data, indices)) => {
                    engine.data = mgin_store::DataStore::from_value(data);
                    engine.index = mgin_index::IndexEngine::from_value(&indices);
                    engine.mark_data_dirty();
                    engine.mark_index_dirty();
                }
                Err(e) => {
                    warn!(target: "mgin", "initial sync from master failed, starting from local snapshots: {e}");
                }
            }
        }
    }

    let host = engine.config.get_str("HOST");
    let port = engine.config.get_str("PORT");
    let addr = format!("{host}:{port}");

    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(target: "mgin", "could not bind {addr}: {e}");
            std::process::exit(1);
        }
    };
    info!(target: "mgin", "mgin listening on {addr}");

    let (handle, engine_task) = mgin_net::spawn_engine(engine);

    let accept_handle = handle.clone();
    let accept_loop = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let handle = accept_handle.clone();
                    tokio::spawn(async move {
                        mgin_net::handle_connection(stream, peer, handle).await;
                    });
                }
                Err(e) => {
                    warn!(target: "mgin", "accept error: {e}");
                }
            }
        }
    });

    let mut engine_task = engine_task;
    tokio::select! {
        _ = wait_for_shutdown_signal() => {
            info!(target: "mgin", "shutdown signal received, asking the engine to stop");
            let reply = handle.submit("SERVERSTOP".to_string()).await;
            info!(target: "mgin", "{reply}");
            let _ = (&mut engine_task).await;
        }
        result = &mut engine_task => {
            if let Err(e) = result {
                error!(target: "mgin", "engine task ended unexpectedly: {e}");
            }
        }
    }

    accept_loop.abort();
    info!(target: "mgin", "mgin stopped");
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
