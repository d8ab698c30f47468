//! Shared models for the bridge
//!
//! Types used by more than one component live here to keep module
//! dependencies one-directional.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Camera row as stored in the `camera` table
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Camera {
    pub id: i64,
    #[serde(default)]
    pub camera_name: String,
    pub ip_address: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Direct stream URL; when absent one is composed from the credentials
    #[serde(default, alias = "source")]
    pub rtsp_url: Option<String>,
}

/// Normalized alarm, ready for the `alarm` table
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlarmRecord {
    pub site_id: i64,
    pub bridge_id: i64,
    pub camera_id: i64,
    pub alarm_name: String,
    pub alarm_type: String,
    /// Time the device reports for the alarm (receipt time when unknown)
    pub alarm_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub snapshot_urls: Vec<String>,
    pub video_url: Option<String>,
}

/// Chunk of raw capture output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub data: Vec<u8>,
    pub captured_at: DateTime<Utc>,
}

/// Single encoded still frame (JPEG)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub data: Vec<u8>,
    pub captured_at: DateTime<Utc>,
}
