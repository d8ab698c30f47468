//! Backend - Persistence, storage and realtime collaborators
//!
//! ## Responsibilities
//!
//! - `BackendStore`: row insert/query and artifact upload
//! - `RealtimeTransport`: topic subscription delivering broadcast messages
//! - Supabase implementations of both (REST + Realtime websocket)
//!
//! Nothing here retries; callers decide what a failure means.

mod realtime;
mod supabase;

#[cfg(test)]
pub(crate) mod fakes;

pub use realtime::SupabaseRealtime;
pub use supabase::SupabaseStore;

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

/// Table names used by the bridge
pub mod tables {
    pub const ALARM: &str = "alarm";
    pub const BRIDGE: &str = "bridge";
    pub const CAMERA: &str = "camera";
    pub const RESPONSE: &str = "response";
}

/// Storage bucket for alarm artifacts
pub const ARTIFACT_BUCKET: &str = "alarm-snapshots";

/// Row persistence and artifact storage
#[async_trait]
pub trait BackendStore: Send + Sync {
    /// Insert one row
    async fn insert(&self, table: &str, record: Value) -> Result<()>;

    /// Rows whose columns equal the given values
    async fn query(&self, table: &str, filters: &[(&str, String)]) -> Result<Vec<Value>>;

    /// Upload bytes; returns the public URL of the stored object
    async fn upload_artifact(
        &self,
        bucket: &str,
        filename: &str,
        data: Vec<u8>,
        content_type: &str,
    ) -> Result<String>;
}

/// Broadcast delivered on a realtime topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastMessage {
    pub event: String,
    #[serde(default)]
    pub payload: Value,
}

/// Pub/sub transport
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    /// Subscribe to a topic; messages arrive on the returned receiver
    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<BroadcastMessage>>;

    /// Leave a topic; its receiver closes
    async fn unsubscribe(&self, topic: &str) -> Result<()>;
}
