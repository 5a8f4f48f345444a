// Per-connection WebSocket session (§4.14). One task per accepted socket:
// a handshake, then a command loop that forwards every subsequent frame to
// the single-writer `Engine` over an `EngineHandle` and writes back
// whatever string it replies with. A dedicated `REPLICATE` connection is
// the one frame type that never reaches `commands::dispatch` at all — it
// is handled entirely here, since its reply is a stream of chunk frames
// rather than a single string.

use crate::engine::EngineHandle;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};
use tracing::{info, warn};
use uuid::Uuid;

/// How many commands a session may have in flight before a slow client
/// stalls its own reader rather than the engine task. Not specified by
/// SPEC_FULL.md §4.14; chosen as a generous but bounded default and
/// recorded in DESIGN.md.
const COMMAND_QUEUE_DEPTH: usize = 256;

const WELCOME: &str = "MginDB server connected... Welcome!";
const AUTH_FAILURE: &str = "Authentication failed: Incorrect username or password.";

/// Accept loop body for one TCP connection: upgrade to WebSocket, run the
/// handshake, then pump frames until the peer disconnects or the server
/// shuts down.
pub async fn handle_connection(stream: TcpStream, peer: std::net::SocketAddr, engine: EngineHandle) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(target: "mgin", "websocket handshake with {peer} failed: {e}");
            return;
        }
    };
    let (mut sink, mut stream) = ws.split();

    // §4.14: the first frame is always read and consumed as the handshake,
    // whether or not a username/password is actually configured.
    let first_frame = match stream.next().await {
        Some(Ok(Message::Text(text))) => Some(text),
        Some(Ok(Message::Close(_))) | None => None,
        Some(Ok(_)) => Some(String::new()),
        Some(Err(e)) => {
            warn!(target: "mgin", "error reading handshake frame from {peer}: {e}");
            None
        }
    };

    let config = match engine.config_snapshot().await {
        Some(config) => config,
        None => return,
    };

    if mgin_auth::auth_required(&config) {
        let authenticated = first_frame
            .as_deref()
            .and_then(|frame| mgin_auth::parse_credentials(frame).ok())
            .map(|creds| mgin_auth::authenticate(&config, &creds).is_ok())
            .unwrap_or(false);
        if !authenticated {
            let close = CloseFrame { code: CloseCode::Policy, reason: AUTH_FAILURE.into() };
            let _ = sink.send(Message::Close(Some(close))).await;
            return;
        }
    }

    let sid = Uuid::new_v4();
    if sink.send(Message::Text(WELCOME.to_string())).await.is_err() {
        return;
    }

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
    engine.register(sid, outbound_tx.clone());
    info!(target: "mgin", "session {sid} connected from {peer}");

    let (queue_tx, mut queue_rx) = mpsc::channel::<String>(COMMAND_QUEUE_DEPTH);
    let mut shutdown = engine.shutdown_signal();

    // The reader: decodes incoming text frames and feeds them into the
    // bounded command queue, applying backpressure to a client that sends
    // faster than the engine can reply. Runs to completion (peer hangs up
    // or errors) independently of the other two tasks, so a command
    // already queued is still processed and answered after the socket's
    // read half is done.
    let reader = tokio::spawn(async move {
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    if queue_tx.send(text).await.is_err() {
                        break;
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    warn!(target: "mgin", "session {sid} read error: {e}");
                    break;
                }
            }
        }
    });

    // The processor: drains the queue one command at a time (so a
    // session's own replies are ordered the way it sent them), handing
    // `REPLICATE` to the dedicated sync responder and everything else to
    // `EngineHandle::submit_as`. Ends once the reader has dropped
    // `queue_tx` and every queued command has been answered.
    let engine_for_processor = engine.clone();
    let processor = tokio::spawn(async move {
        while let Some(command) = queue_rx.recv().await {
            if command.trim().eq_ignore_ascii_case("REPLICATE") {
                if let Some((data, indices)) = engine_for_processor.snapshot().await {
                    for frame in mgin_replicate::sync_response_frames(&data, &indices) {
                        if outbound_tx.send(frame).is_err() {
                            break;
                        }
                    }
                }
                continue;
            }
            let reply = engine_for_processor.submit_as(command, sid).await;
            if outbound_tx.send(reply).is_err() {
                break;
            }
        }
    });

    // The writer: drains both the processor's direct replies and any
    // notification the engine pushes asynchronously (pub/sub, node
    // fan-out) onto the same outbound channel, and writes them to the
    // socket in arrival order. Also watches the shutdown signal so a live
    // connection is closed with a policy frame instead of hanging once the
    // engine task has exited.
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        let close = CloseFrame {
                            code: CloseCode::Away,
                            reason: "Server is shutting down.".into(),
                        };
                        let _ = sink.send(Message::Close(Some(close))).await;
                        break;
                    }
                }
                frame = outbound_rx.recv() => {
                    match frame {
                        Some(text) => {
                            if sink.send(Message::Text(text)).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }
    });

    let _ = tokio::join!(reader, processor, writer);

    engine.disconnect(sid);
    info!(target: "mgin", "session {sid} disconnected");
}
