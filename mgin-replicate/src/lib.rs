// Master/slave replication (§4.13). A master rebroadcasts every
// successful mutation to each configured slave as the literal command
// string it just executed locally. A slave, at startup, opens a channel
// to the master, issues `REPLICATE`, and receives `data_chunks`/
// `indices_chunks` frames — 1000-character slices of the JSON dump of the
// data store and indices, matching the original's wire shape — until a
// `DONE` frame, then replaces its entire local state at once.

use futures_util::{SinkExt, StreamExt};
use mgin_base::{err, Result, Value};
use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::Message;

pub const CHUNK_SIZE: usize = 1000;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Role {
    Master,
    Slave,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Frame {
    DataChunk { chunk: String },
    IndicesChunk { chunk: String },
    Done,
}

/// Split `value`'s JSON dump into `CHUNK_SIZE`-character slices, tagged
/// for the wire as either data or indices chunks, terminated by `Done`.
fn build_frames(data: &Value, indices: &Value) -> Vec<String> {
    let mut frames = Vec::new();
    for chunk in data.to_json().to_string().as_bytes().chunks(CHUNK_SIZE) {
        frames.push(
            serde_json::to_string(&Frame::DataChunk { chunk: String::from_utf8_lossy(chunk).into_owned() })
                .expect("frame serializes"),
        );
    }
    for chunk in indices.to_json().to_string().as_bytes().chunks(CHUNK_SIZE) {
        frames.push(
            serde_json::to_string(&Frame::IndicesChunk { chunk: String::from_utf8_lossy(chunk).into_owned() })
                .expect("frame serializes"),
        );
    }
    frames.push(serde_json::to_string(&Frame::Done).expect("frame serializes"));
    frames
}

/// Every text frame a master's `REPLICATE` responder sends back to a
/// syncing slave, in order, ready to be written to the socket by the
/// caller (`mgin-net` owns the actual session and socket).
pub fn sync_response_frames(data: &Value, indices: &Value) -> Vec<String> {
    build_frames(data, indices)
}

/// Reassemble a full sync from the frames a slave received, in arrival
/// order. Fails if no `Done` frame was seen or the concatenated JSON does
/// not parse.
pub fn parse_sync_frames(frames: &[String]) -> Result<(Value, Value)> {
    let mut data_buf = String::new();
    let mut indices_buf = String::new();
    let mut saw_done = false;
    for raw in frames {
        match serde_json::from_str::<Frame>(raw) {
            Ok(Frame::DataChunk { chunk }) => data_buf.push_str(&chunk),
            Ok(Frame::IndicesChunk { chunk }) => indices_buf.push_str(&chunk),
            Ok(Frame::Done) => {
                saw_done = true;
                break;
            }
            Err(e) => return Err(err(format!("Malformed replication frame: {e}"))),
        }
    }
    if !saw_done {
        return Err(err("Replication stream ended before DONE"));
    }
    let data = parse_json_blob(&data_buf)?;
    let indices = parse_json_blob(&indices_buf)?;
    Ok((data, indices))
}

fn parse_json_blob(text: &str) -> Result<Value> {
    if text.is_empty() {
        return Ok(Value::object());
    }
    let parsed: serde_json::Value =
        serde_json::from_str(text).map_err(|e| err(format!("Invalid replication payload: {e}")))?;
    Ok(Value::from_json(&parsed))
}

/// Connect to `master_url` as a slave, issue `REPLICATE`, and read frames
/// until `DONE`, returning the full data tree and index tree the master
/// sent.
pub async fn sync_from_master(master_url: &str) -> Result<(Value, Value)> {
    let (mut socket, _) = tokio_tungstenite::connect_async(master_url)
        .await
        .map_err(|e| err(format!("Could not reach replication master {master_url}: {e}")))?;
    socket
        .send(Message::Text("REPLICATE".to_string()))
        .await
        .map_err(|e| err(format!("Failed to request replication: {e}")))?;

    let mut frames = Vec::new();
    while let Some(msg) = socket.next().await {
        match msg.map_err(|e| err(format!("Replication master connection error: {e}")))? {
            Message::Text(text) => {
                let is_done = matches!(serde_json::from_str::<Frame>(&text), Ok(Frame::Done));
                frames.push(text);
                if is_done {
                    break;
                }
            }
            Message::Close(_) => break,
            _ => continue,
        }
    }
    parse_sync_frames(&frames)
}

/// Forward a literal mutation command to every configured slave. Each
/// slave is contacted independently; a slave that is unreachable is
/// logged and skipped rather than aborting the others.
pub async fn broadcast_to_slaves(slaves: &[String], command: &str) {
    for slave in slaves {
        if let Err(e) = send_to_slave(slave, command).await {
            tracing::warn!(target: "mgin", "replication to slave {slave} failed: {e}");
        }
    }
}

async fn send_to_slave(slave_url: &str, command: &str) -> Result<()> {
    let (mut socket, _) = tokio_tungstenite::connect_async(slave_url)
        .await
        .map_err(|e| err(format!("Could not reach slave {slave_url}: {e}")))?;
    socket
        .send(Message::Text(command.to_string()))
        .await
        .map_err(|e| err(format!("Failed forwarding to slave {slave_url}: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;

    #[test]
    fn frames_roundtrip_through_parse() {
        let mut m = IndexMap::new();
        m.insert("user".to_string(), Value::Str("Ana".into()));
        let data = Value::Object(m);
        let indices = Value::object();
        let frames = sync_response_frames(&data, &indices);
        let (parsed_data, parsed_indices) = parse_sync_frames(&frames).unwrap();
        assert_eq!(parsed_data, data);
        assert_eq!(parsed_indices, indices);
    }

    #[test]
    fn large_payload_splits_into_multiple_chunks() {
        let mut m = IndexMap::new();
        m.insert("blob".to_string(), Value::Str("x".repeat(5000)));
        let data = Value::Object(m);
        let frames = sync_response_frames(&data, &Value::object());
        let chunk_count = frames
            .iter()
            .filter(|f| {
                serde_json::from_str::<Frame>(f).map(|fr| matches!(fr, Frame::DataChunk { .. })).unwrap_or(false)
            })
            .count();
        assert!(chunk_count > 1);
    }

    #[test]
    fn missing_done_frame_is_an_error() {
        let frames = vec![serde_json::to_string(&Frame::DataChunk { chunk: "{}".into() }).unwrap()];
        assert!(parse_sync_frames(&frames).is_err());
    }
}
