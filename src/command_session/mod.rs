//! CommandSession - Remote commands over the realtime channel
//!
//! ## Responsibilities
//!
//! - Subscribe to `bridge-{bridge_id}` and map broadcast events to handlers
//! - Correlate each command with its `request_id` / `requester_id`
//! - Write exactly one row to `response` per correlated command
//!
//! ## Events
//!
//! | event                              | handler            | response |
//! |------------------------------------|--------------------|----------|
//! | `/api/v1/cameras`                  | device discovery   | yes      |
//! | `/api/v1/test/get-video-snapshot`  | buffer export      | yes      |
//! | `Test message`                     | log only           | no       |
//!
//! Anything else is ignored. A responding command without a non-empty
//! `request_id` is dropped before its handler runs.

mod export;

pub use export::{export_buffers, ExportSummary};

use crate::backend::{tables, BackendStore, BroadcastMessage, RealtimeTransport};
use crate::discovery::DeviceDiscovery;
use crate::error::{Error, Result};
use crate::recording_fleet::RecordingFleet;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Handler selected by a broadcast event name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Discover,
    ExportBuffered,
    LogOnly,
}

impl CommandKind {
    pub fn from_event(event: &str) -> Option<Self> {
        match event {
            "/api/v1/cameras" => Some(CommandKind::Discover),
            "/api/v1/test/get-video-snapshot" => Some(CommandKind::ExportBuffered),
            "Test message" => Some(CommandKind::LogOnly),
            _ => None,
        }
    }
}

/// One correlated inbound command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSession {
    pub bridge_id: i64,
    pub event: String,
    pub request_id: String,
    pub requester_id: Option<String>,
}

impl CommandSession {
    /// Correlate a broadcast; `request_id` must be a non-empty string
    pub fn correlate(bridge_id: i64, message: &BroadcastMessage) -> Result<Self> {
        let request_id = message
            .payload
            .get("request_id")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::Correlation(format!("{}: request_id missing", message.event)))?;

        let requester_id = message
            .payload
            .get("requester_id")
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(Self {
            bridge_id,
            event: message.event.clone(),
            request_id: request_id.to_string(),
            requester_id,
        })
    }

    /// Row for the `response` table
    pub fn response_row(&self, body: Value) -> Value {
        json!({
            "bridge_id": self.bridge_id,
            "request_id": self.request_id,
            "requester_id": self.requester_id,
            "request_path": self.event,
            "response_body": body,
        })
    }
}

/// Realtime command service for this bridge
pub struct CommandService {
    bridge_id: i64,
    transport: Arc<dyn RealtimeTransport>,
    store: Arc<dyn BackendStore>,
    discovery: Arc<dyn DeviceDiscovery>,
    fleet: Arc<RecordingFleet>,
    export_dir: PathBuf,
}

impl CommandService {
    pub fn new(
        bridge_id: i64,
        transport: Arc<dyn RealtimeTransport>,
        store: Arc<dyn BackendStore>,
        discovery: Arc<dyn DeviceDiscovery>,
        fleet: Arc<RecordingFleet>,
        export_dir: PathBuf,
    ) -> Self {
        Self {
            bridge_id,
            transport,
            store,
            discovery,
            fleet,
            export_dir,
        }
    }

    pub fn topic(&self) -> String {
        format!("bridge-{}", self.bridge_id)
    }

    /// Serve commands until cancelled; in-flight handlers finish before return
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let topic = self.topic();
        let mut messages = self.transport.subscribe(&topic).await?;
        tracing::info!(topic = %topic, "Command session listening");

        let mut handlers = JoinSet::new();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                message = messages.recv() => match message {
                    Some(message) => {
                        let service = self.clone();
                        handlers.spawn(async move {
                            service.handle_message(message).await;
                        });
                    }
                    None => {
                        tracing::warn!(topic = %topic, "Command channel closed");
                        break;
                    }
                },
                Some(joined) = handlers.join_next(), if !handlers.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "Command handler panicked");
                    }
                }
            }
        }

        if let Err(e) = self.transport.unsubscribe(&topic).await {
            tracing::warn!(topic = %topic, error = %e, "Unsubscribe failed");
        }

        while let Some(joined) = handlers.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Command handler panicked");
            }
        }

        tracing::info!(topic = %topic, "Command session stopped");
        Ok(())
    }

    /// Handle one broadcast; returns the response body that was written
    pub async fn handle_message(&self, message: BroadcastMessage) -> Option<Value> {
        let Some(kind) = CommandKind::from_event(&message.event) else {
            tracing::debug!(event = %message.event, "Ignoring unknown event");
            return None;
        };

        if kind == CommandKind::LogOnly {
            tracing::info!(event = %message.event, payload = %message.payload, "Test message received");
            return None;
        }

        let session = match CommandSession::correlate(self.bridge_id, &message) {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!(event = %message.event, error = %e, "Dropping uncorrelated command");
                return None;
            }
        };

        let result = match kind {
            CommandKind::Discover => self.discover_cameras(&session).await,
            CommandKind::ExportBuffered => self.export_buffered(&session).await,
            CommandKind::LogOnly => return None,
        };

        let body = match result {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(
                    event = %session.event,
                    request_id = %session.request_id,
                    error = %e,
                    "Command handler failed"
                );
                json!({ "error": e.to_string() })
            }
        };

        self.respond(&session, body.clone()).await;
        Some(body)
    }

    async fn discover_cameras(&self, session: &CommandSession) -> Result<Value> {
        let devices = self.discovery.discover().await?;
        tracing::info!(
            event = %session.event,
            request_id = %session.request_id,
            count = devices.len(),
            "Found devices"
        );
        Ok(json!({ "devices": devices }))
    }

    async fn export_buffered(&self, session: &CommandSession) -> Result<Value> {
        let summary = export_buffers(&self.export_dir, &session.request_id, &self.fleet).await?;
        tracing::info!(
            event = %session.event,
            request_id = %session.request_id,
            directory = %summary.directory,
            "Buffered data exported"
        );
        Ok(serde_json::to_value(summary)?)
    }

    async fn respond(&self, session: &CommandSession, body: Value) {
        if let Err(e) = self
            .store
            .insert(tables::RESPONSE, session.response_row(body))
            .await
        {
            tracing::error!(
                event = %session.event,
                request_id = %session.request_id,
                error = %e,
                "Failed to insert response"
            );
        }
    }
}
