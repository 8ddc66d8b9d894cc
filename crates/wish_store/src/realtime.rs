//! Supabase Realtime insert notifications over the Phoenix channel protocol

use std::time::Duration;

use entities::WishRow;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
    InsertSubscription, SupabaseConfig, WishStoreError, WishStoreResult, SUBSCRIPTION_CAPACITY,
};

/// Interval between heartbeats on the `phoenix` topic
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);

/// How long to wait for the websocket handshake
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long to wait for the server to accept the channel join
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

const JOIN_REF: &str = "1";

/// A frame of the Phoenix channel protocol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct PhoenixMessage {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(rename = "ref", default, deserialize_with = "lenient_ref")]
    pub msg_ref: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_ref",
        skip_serializing_if = "Option::is_none"
    )]
    pub join_ref: Option<String>,
}

/// What an incoming frame means for the subscription
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum RealtimeEvent {
    /// A row was inserted into the watched table
    Insert(WishRow),
    /// Reply to our join request
    JoinReply { ok: bool, detail: String },
    /// The server closed or errored our channel
    Closed(String),
    /// Heartbeat replies, presence and anything else
    Ignored,
}

fn lenient_ref<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<serde_json::Value>::deserialize(deserializer)? {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Topic name for a channel
pub(crate) fn topic_for(channel: &str) -> String {
    format!("realtime:{channel}")
}

/// Websocket endpoint for a project URL
pub(crate) fn websocket_url(project_url: &str, api_key: &str) -> WishStoreResult<Url> {
    let mut url = Url::parse(project_url)
        .map_err(|e| WishStoreError::Realtime(format!("Invalid project URL: {e}")))?;

    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(WishStoreError::Realtime(format!(
                "Unsupported URL scheme: {other}"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| WishStoreError::Realtime("Failed to set websocket scheme".to_string()))?;

    url.set_path("/realtime/v1/websocket");
    url.query_pairs_mut()
        .clear()
        .append_pair("apikey", api_key)
        .append_pair("vsn", "1.0.0");
    Ok(url)
}

/// Join request subscribing to inserts on `public.<table>`
pub(crate) fn join_message(topic: &str, table: &str, api_key: &str) -> PhoenixMessage {
    PhoenixMessage {
        topic: topic.to_string(),
        event: "phx_join".to_string(),
        payload: json!({
            "config": {
                "broadcast": { "ack": false, "self": false },
                "presence": { "key": "" },
                "postgres_changes": [
                    { "event": "INSERT", "schema": "public", "table": table }
                ]
            },
            "access_token": api_key
        }),
        msg_ref: Some(JOIN_REF.to_string()),
        join_ref: Some(JOIN_REF.to_string()),
    }
}

pub(crate) fn heartbeat_message(msg_ref: u64) -> PhoenixMessage {
    PhoenixMessage {
        topic: "phoenix".to_string(),
        event: "heartbeat".to_string(),
        payload: json!({}),
        msg_ref: Some(msg_ref.to_string()),
        join_ref: None,
    }
}

pub(crate) fn leave_message(topic: &str, msg_ref: u64) -> PhoenixMessage {
    PhoenixMessage {
        topic: topic.to_string(),
        event: "phx_leave".to_string(),
        payload: json!({}),
        msg_ref: Some(msg_ref.to_string()),
        join_ref: Some(JOIN_REF.to_string()),
    }
}

/// Interprets an incoming frame for the channel `topic`
pub(crate) fn classify(message: &PhoenixMessage, topic: &str) -> RealtimeEvent {
    if message.topic != topic {
        return RealtimeEvent::Ignored;
    }

    match message.event.as_str() {
        "postgres_changes" => {
            let data = &message.payload["data"];
            if data["type"].as_str() != Some("INSERT") {
                return RealtimeEvent::Ignored;
            }
            match serde_json::from_value::<WishRow>(data["record"].clone()) {
                Ok(row) => RealtimeEvent::Insert(row),
                Err(e) => {
                    warn!(error = %e, "Skipping malformed insert notification");
                    RealtimeEvent::Ignored
                }
            }
        }
        "phx_reply" if message.msg_ref.as_deref() == Some(JOIN_REF) => {
            let ok = message.payload["status"].as_str() == Some("ok");
            RealtimeEvent::JoinReply {
                ok,
                detail: message.payload["response"].to_string(),
            }
        }
        "phx_close" => RealtimeEvent::Closed("channel closed by server".to_string()),
        "phx_error" => RealtimeEvent::Closed(format!("channel error: {}", message.payload)),
        "system" if message.payload["status"].as_str() == Some("error") => {
            RealtimeEvent::Closed(format!("system error: {}", message.payload["message"]))
        }
        _ => RealtimeEvent::Ignored,
    }
}

fn encode(message: &PhoenixMessage) -> WishStoreResult<Message> {
    Ok(Message::Text(serde_json::to_string(message)?.into()))
}

fn decode(frame: &Message) -> Option<PhoenixMessage> {
    match frame {
        Message::Text(text) => serde_json::from_str(text.as_str()).ok(),
        _ => None,
    }
}

/// Connects, joins the channel and spawns the listener worker
pub(crate) async fn subscribe(config: &SupabaseConfig) -> WishStoreResult<InsertSubscription> {
    let url = websocket_url(&config.url, &config.anon_key)?;
    let topic = topic_for(&config.channel);

    let connect = tokio_tungstenite::connect_async(url.as_str());
    let (socket, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect)
        .await
        .map_err(|_| WishStoreError::Unreachable("Realtime connect timed out".to_string()))?
        .map_err(|e| WishStoreError::Unreachable(format!("Realtime connect failed: {e}")))?;
    let (mut sink, mut stream) = socket.split();

    sink.send(encode(&join_message(&topic, &config.table, &config.anon_key))?)
        .await
        .map_err(|e| WishStoreError::Realtime(e.to_string()))?;

    // Wait for the join to be acknowledged before handing out the handle
    let joined = tokio::time::timeout(JOIN_TIMEOUT, async {
        while let Some(frame) = stream.next().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => return Err(WishStoreError::Realtime(e.to_string())),
            };
            let Some(message) = decode(&frame) else {
                continue;
            };
            match classify(&message, &topic) {
                RealtimeEvent::JoinReply { ok: true, .. } => return Ok(()),
                RealtimeEvent::JoinReply { ok: false, detail } => {
                    return Err(WishStoreError::Realtime(format!("Join refused: {detail}")))
                }
                RealtimeEvent::Closed(reason) => return Err(WishStoreError::Realtime(reason)),
                _ => {}
            }
        }
        Err(WishStoreError::Realtime("Connection closed before join".to_string()))
    })
    .await
    .map_err(|_| WishStoreError::Realtime("Timed out joining channel".to_string()))?;
    joined?;

    info!(topic = %topic, "Subscribed to realtime inserts");

    let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

    let worker = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut next_ref: u64 = 2;

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    if let Ok(frame) = encode(&leave_message(&topic, next_ref)) {
                        let _ = sink.send(frame).await;
                    }
                    let _ = sink.close().await;
                    debug!(topic = %topic, "Left realtime channel");
                    break;
                }
                _ = heartbeat.tick() => {
                    let Ok(frame) = encode(&heartbeat_message(next_ref)) else {
                        continue;
                    };
                    next_ref += 1;
                    if let Err(e) = sink.send(frame).await {
                        error!(error = %e, "Realtime heartbeat failed");
                        break;
                    }
                }
                frame = stream.next() => {
                    let frame = match frame {
                        Some(Ok(frame)) => frame,
                        Some(Err(e)) => {
                            error!(error = %e, "Realtime connection error");
                            break;
                        }
                        None => {
                            warn!("Realtime connection closed");
                            break;
                        }
                    };
                    if let Message::Ping(data) = &frame {
                        let _ = sink.send(Message::Pong(data.clone())).await;
                        continue;
                    }
                    let Some(message) = decode(&frame) else {
                        continue;
                    };
                    match classify(&message, &topic) {
                        RealtimeEvent::Insert(row) => {
                            if tx.send(row).await.is_err() {
                                break;
                            }
                        }
                        RealtimeEvent::Closed(reason) => {
                            warn!(reason = %reason, "Realtime channel closed");
                            break;
                        }
                        _ => {}
                    }
                }
            }
        }
    });

    Ok(InsertSubscription::new(rx, shutdown_tx, worker))
}
