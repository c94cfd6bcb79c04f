//! Realtime change feed over the Phoenix channel protocol.
//!
//! One websocket per subscription. The channel is joined with a
//! `postgres_changes` config, kept alive with heartbeats, and left with
//! `phx_leave` when the owning [`ChangeStream`] is closed or dropped.

use futures::stream::SplitStream;
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ChangeEvent, ChangeFilter, ChangeKind, ChangeStream};
use crate::error::{Error, Result};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type SocketStream = SplitStream<Socket>;

const PROTOCOL_VSN: &str = "1.0.0";
const HEARTBEAT_TOPIC: &str = "phoenix";
const JOIN_REF: &str = "1";
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);
const CHANNEL_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Wire messages
// ---------------------------------------------------------------------------

/// `https://x.supabase.co` becomes `wss://x.supabase.co/realtime/v1/websocket?...`.
pub fn socket_url(base_url: &str, api_key: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    };
    format!("{ws_base}/realtime/v1/websocket?apikey={api_key}&vsn={PROTOCOL_VSN}")
}

pub fn topic_for(filter: &ChangeFilter) -> String {
    format!("realtime:{}", filter.channel)
}

pub fn join_message(filter: &ChangeFilter, access_token: &str) -> Value {
    let events: Vec<&str> = if filter.kinds.is_empty() {
        vec!["*"]
    } else {
        filter.kinds.iter().map(|k| k.as_str()).collect()
    };
    let changes: Vec<Value> = events
        .into_iter()
        .map(|event| {
            let mut entry = json!({
                "event": event,
                "schema": "public",
                "table": filter.table,
            });
            if let Some(expr) = filter.filter_expr() {
                entry["filter"] = Value::String(expr);
            }
            entry
        })
        .collect();

    json!({
        "topic": topic_for(filter),
        "event": "phx_join",
        "payload": {
            "config": {
                "broadcast": { "ack": false, "self": false },
                "presence": { "key": "" },
                "postgres_changes": changes,
            },
            "access_token": access_token,
        },
        "ref": JOIN_REF,
        "join_ref": JOIN_REF,
    })
}

pub fn heartbeat_message(reference: u64) -> Value {
    json!({
        "topic": HEARTBEAT_TOPIC,
        "event": "heartbeat",
        "payload": {},
        "ref": reference.to_string(),
    })
}

pub fn leave_message(topic: &str, reference: u64) -> Value {
    json!({
        "topic": topic,
        "event": "phx_leave",
        "payload": {},
        "ref": reference.to_string(),
        "join_ref": JOIN_REF,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Change(ChangeEvent),
    Reply {
        reference: Option<String>,
        outcome: std::result::Result<(), String>,
    },
    /// The server answered a heartbeat.
    HeartbeatAck(Option<String>),
    Failed(String),
    Closed,
    Ignored,
}

fn reply_ref(msg: &Value) -> Option<String> {
    match msg.get("ref")? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub fn parse_message(text: &str, topic: &str) -> Incoming {
    let msg: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            debug!(error = %e, "ignoring unparseable realtime frame");
            return Incoming::Ignored;
        }
    };
    let event = msg.get("event").and_then(Value::as_str).unwrap_or_default();
    match msg.get("topic").and_then(Value::as_str) {
        Some(HEARTBEAT_TOPIC) if event == "phx_reply" => {
            return Incoming::HeartbeatAck(reply_ref(&msg));
        }
        Some(t) if t == topic => {}
        _ => return Incoming::Ignored,
    }
    let payload = msg.get("payload").cloned().unwrap_or(Value::Null);

    match event {
        "postgres_changes" => {
            let data = payload.get("data").cloned().unwrap_or(Value::Null);
            change_from(&data)
        }
        "INSERT" | "UPDATE" | "DELETE" => {
            let mut data = payload.clone();
            if data.get("type").is_none() {
                data["type"] = Value::String(event.to_string());
            }
            change_from(&data)
        }
        "phx_reply" => {
            let reference = reply_ref(&msg);
            let ok = payload.get("status").and_then(Value::as_str) == Some("ok");
            let outcome = if ok {
                Ok(())
            } else {
                Err(reply_reason(&payload))
            };
            Incoming::Reply { reference, outcome }
        }
        "phx_error" => Incoming::Failed("channel error".to_string()),
        "phx_close" => Incoming::Closed,
        "system" => {
            if payload.get("status").and_then(Value::as_str) == Some("error") {
                Incoming::Failed(reply_reason(&payload))
            } else {
                Incoming::Ignored
            }
        }
        _ => Incoming::Ignored,
    }
}

fn change_from(data: &Value) -> Incoming {
    let Some(kind) = data.get("type").and_then(Value::as_str).and_then(ChangeKind::parse) else {
        return Incoming::Ignored;
    };
    Incoming::Change(ChangeEvent {
        kind,
        table: data
            .get("table")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        new_row: data.get("record").cloned().unwrap_or(Value::Null),
        old_row: data.get("old_record").cloned().unwrap_or(Value::Null),
    })
}

fn reply_reason(payload: &Value) -> String {
    let response = payload.get("response").unwrap_or(payload);
    ["reason", "message"]
        .iter()
        .find_map(|key| response.get(*key).and_then(Value::as_str))
        .or_else(|| payload.get("message").and_then(Value::as_str))
        .unwrap_or("join rejected")
        .to_string()
}

// ---------------------------------------------------------------------------
// Socket task
// ---------------------------------------------------------------------------

pub async fn open(
    base_url: &str,
    api_key: &str,
    filter: ChangeFilter,
    heartbeat: Duration,
) -> Result<ChangeStream> {
    let url = socket_url(base_url, api_key);
    let (socket, _) = timeout(JOIN_TIMEOUT, connect_async(url.as_str()))
        .await
        .map_err(|_| Error::Subscription("timed out connecting to realtime".to_string()))?
        .map_err(|e| Error::Subscription(format!("connect failed: {e}")))?;
    let (mut sink, mut stream) = socket.split();

    let topic = topic_for(&filter);
    sink.send(Message::Text(join_message(&filter, api_key).to_string()))
        .await
        .map_err(|e| Error::Subscription(format!("join send failed: {e}")))?;

    timeout(JOIN_TIMEOUT, await_join(&mut stream, &topic))
        .await
        .map_err(|_| Error::Subscription(format!("no join reply for {topic}")))??;
    info!(channel = %filter.channel, table = %filter.table, "realtime channel joined");

    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let cancel = CancellationToken::new();
    let task = tokio::spawn(run_channel(
        sink,
        stream,
        tx,
        cancel.clone(),
        filter,
        topic,
        heartbeat,
    ));
    Ok(ChangeStream::new(rx, cancel, Some(task)))
}

async fn await_join(stream: &mut SocketStream, topic: &str) -> Result<()> {
    while let Some(frame) = stream.next().await {
        let frame = frame.map_err(|e| Error::Subscription(format!("socket error: {e}")))?;
        let Message::Text(text) = frame else {
            continue;
        };
        match parse_message(&text, topic) {
            Incoming::Reply { reference, outcome } if reference.as_deref() == Some(JOIN_REF) => {
                return outcome.map_err(Error::Subscription);
            }
            Incoming::Failed(reason) => return Err(Error::Subscription(reason)),
            Incoming::Closed => break,
            _ => {}
        }
    }
    Err(Error::Subscription(format!("{topic} closed before join")))
}

/// Pump one joined channel until it is cancelled or the socket gives out.
///
/// A heartbeat still unanswered when the next one is due means the socket is
/// half open; the stream then ends with an error so its owner can fall back.
async fn run_channel<W, R>(
    mut sink: W,
    mut stream: R,
    tx: mpsc::Sender<Result<ChangeEvent>>,
    cancel: CancellationToken,
    filter: ChangeFilter,
    topic: String,
    heartbeat: Duration,
) where
    W: Sink<Message> + Unpin,
    W::Error: std::fmt::Display,
    R: Stream<Item = std::result::Result<Message, WsError>> + Unpin,
{
    let mut ticker = interval_at(Instant::now() + heartbeat, heartbeat);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut next_ref: u64 = 2;
    let mut unanswered: Option<String> = None;

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                let leave = leave_message(&topic, next_ref);
                let _ = sink.send(Message::Text(leave.to_string())).await;
                let _ = sink.close().await;
                info!(channel = %filter.channel, "realtime channel left");
                break;
            }

            _ = ticker.tick() => {
                if let Some(missed) = unanswered.take() {
                    warn!(channel = %filter.channel, heartbeat_ref = %missed, "heartbeat timeout");
                    let _ = tx.send(Err(Error::Subscription("heartbeat timeout".to_string()))).await;
                    let _ = sink.close().await;
                    break;
                }
                let beat = heartbeat_message(next_ref);
                if let Err(e) = sink.send(Message::Text(beat.to_string())).await {
                    warn!(channel = %filter.channel, error = %e, "heartbeat failed");
                    let _ = tx.send(Err(Error::Subscription(format!("heartbeat failed: {e}")))).await;
                    break;
                }
                unanswered = Some(next_ref.to_string());
                next_ref += 1;
            }

            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => match parse_message(&text, &topic) {
                        Incoming::Change(change) if filter.accepts(change.kind) => {
                            if tx.send(Ok(change)).await.is_err() {
                                break;
                            }
                        }
                        Incoming::HeartbeatAck(reference) => {
                            if reference.is_some() && reference == unanswered {
                                unanswered = None;
                            }
                        }
                        Incoming::Failed(reason) => {
                            warn!(channel = %filter.channel, reason = %reason, "realtime channel failed");
                            let _ = tx.send(Err(Error::Subscription(reason))).await;
                            break;
                        }
                        Incoming::Closed => {
                            info!(channel = %filter.channel, "realtime channel closed by server");
                            break;
                        }
                        Incoming::Change(_) | Incoming::Reply { .. } | Incoming::Ignored => {}
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        info!(channel = %filter.channel, "realtime socket closed");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(channel = %filter.channel, error = %e, "realtime socket error");
                        let _ = tx.send(Err(Error::Subscription(e.to_string()))).await;
                        break;
                    }
                }
            }
        }
    }
}
