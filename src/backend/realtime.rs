//! Supabase Realtime client (Phoenix channels over websocket)
//!
//! One socket per subscribed topic. The socket task joins the channel, sends
//! heartbeats, forwards broadcasts, and reconnects after a drop until the
//! topic is unsubscribed or the process shuts down.

use super::{BroadcastMessage, RealtimeTransport};
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const CHANNEL_CAPACITY: usize = 64;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct ChannelHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

enum PumpExit {
    Cancelled,
    ReceiverGone,
    Disconnected,
}

/// Realtime transport backed by Supabase Realtime
pub struct SupabaseRealtime {
    socket_url: String,
    channels: Mutex<HashMap<String, ChannelHandle>>,
    shutdown: CancellationToken,
}

impl SupabaseRealtime {
    pub fn new(base_url: &str, api_key: &str, shutdown: CancellationToken) -> Self {
        Self {
            socket_url: socket_url(base_url, api_key),
            channels: Mutex::new(HashMap::new()),
            shutdown,
        }
    }
}

#[async_trait]
impl RealtimeTransport for SupabaseRealtime {
    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<BroadcastMessage>> {
        let mut channels = self.channels.lock().await;
        if channels.contains_key(topic) {
            return Err(Error::Network(format!("already subscribed to {}", topic)));
        }

        let phx_topic = format!("realtime:{}", topic);
        let socket = connect(&self.socket_url, &phx_topic).await?;

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let cancel = self.shutdown.child_token();
        let task = tokio::spawn(run_channel(
            self.socket_url.clone(),
            phx_topic,
            socket,
            tx,
            cancel.clone(),
        ));

        channels.insert(topic.to_string(), ChannelHandle { cancel, task });
        tracing::info!(topic = %topic, "Realtime channel joined");
        Ok(rx)
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        let handle = self.channels.lock().await.remove(topic);
        if let Some(handle) = handle {
            handle.cancel.cancel();
            if let Err(e) = handle.task.await {
                tracing::warn!(topic = %topic, error = %e, "Realtime task join failed");
            }
            tracing::info!(topic = %topic, "Realtime channel left");
        }
        Ok(())
    }
}

/// Websocket endpoint for a project URL
fn socket_url(base_url: &str, api_key: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        base.to_string()
    };
    format!("{}/realtime/v1/websocket?apikey={}&vsn=1.0.0", ws_base, api_key)
}

fn frame(topic: &str, event: &str, payload: Value, msg_ref: u64) -> Message {
    Message::Text(
        json!({
            "topic": topic,
            "event": event,
            "payload": payload,
            "ref": msg_ref.to_string(),
        })
        .to_string(),
    )
}

fn join_payload() -> Value {
    json!({
        "config": {
            "broadcast": { "self": false, "ack": false },
            "presence": { "key": "" }
        }
    })
}

async fn connect(socket_url: &str, phx_topic: &str) -> Result<Socket> {
    let (mut socket, _) = connect_async(socket_url)
        .await
        .map_err(|e| Error::Network(format!("realtime connect failed: {}", e)))?;

    socket
        .send(frame(phx_topic, "phx_join", join_payload(), 1))
        .await
        .map_err(|e| Error::Network(format!("realtime join failed: {}", e)))?;

    Ok(socket)
}

/// Broadcast carried by a Phoenix frame, if it is one
fn parse_broadcast(text: &str) -> Option<BroadcastMessage> {
    let frame: Value = serde_json::from_str(text).ok()?;

    match frame.get("event").and_then(Value::as_str)? {
        "broadcast" => {
            let inner = frame.get("payload")?;
            let event = inner.get("event").and_then(Value::as_str)?.to_string();
            let payload = inner.get("payload").cloned().unwrap_or(Value::Null);
            Some(BroadcastMessage { event, payload })
        }
        "phx_reply" => {
            let status = frame
                .pointer("/payload/status")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            if status != "ok" {
                tracing::warn!(status = %status, reply = %frame["payload"], "Realtime reply not ok");
            }
            None
        }
        "phx_error" => {
            tracing::warn!(topic = %frame["topic"], "Realtime channel error");
            None
        }
        _ => None,
    }
}

async fn run_channel(
    socket_url: String,
    phx_topic: String,
    socket: Socket,
    tx: mpsc::Sender<BroadcastMessage>,
    cancel: CancellationToken,
) {
    let mut next = Some(socket);

    loop {
        let socket = match next.take() {
            Some(socket) => socket,
            None => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                }
                match connect(&socket_url, &phx_topic).await {
                    Ok(socket) => {
                        tracing::info!(topic = %phx_topic, "Realtime reconnected");
                        socket
                    }
                    Err(e) => {
                        tracing::warn!(topic = %phx_topic, error = %e, "Realtime reconnect failed");
                        continue;
                    }
                }
            }
        };

        match pump(socket, &phx_topic, &tx, &cancel).await {
            PumpExit::Cancelled | PumpExit::ReceiverGone => break,
            PumpExit::Disconnected => {
                tracing::warn!(topic = %phx_topic, "Realtime socket disconnected");
            }
        }
    }
}

async fn pump(
    socket: Socket,
    phx_topic: &str,
    tx: &mpsc::Sender<BroadcastMessage>,
    cancel: &CancellationToken,
) -> PumpExit {
    let (mut sink, mut stream) = socket.split();
    let mut heartbeat = tokio::time::interval_at(
        tokio::time::Instant::now() + HEARTBEAT_INTERVAL,
        HEARTBEAT_INTERVAL,
    );
    let mut msg_ref: u64 = 1;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                msg_ref += 1;
                let _ = sink.send(frame(phx_topic, "phx_leave", json!({}), msg_ref)).await;
                let _ = sink.close().await;
                return PumpExit::Cancelled;
            }
            _ = heartbeat.tick() => {
                msg_ref += 1;
                if let Err(e) = sink.send(frame("phoenix", "heartbeat", json!({}), msg_ref)).await {
                    tracing::warn!(error = %e, "Realtime heartbeat failed");
                    return PumpExit::Disconnected;
                }
            }
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    if let Some(broadcast) = parse_broadcast(&text) {
                        tracing::debug!(event = %broadcast.event, "Realtime broadcast received");
                        if tx.send(broadcast).await.is_err() {
                            return PumpExit::ReceiverGone;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => return PumpExit::Disconnected,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "Realtime read failed");
                    return PumpExit::Disconnected;
                }
            },
        }
    }
}
