//! Bridge configuration
//!
//! Read once at startup from the environment (`.env` is loaded by `main`).
//! Numeric values that fail to parse fall back to their defaults.

use crate::error::{Error, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Bridge configuration
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Hardware/installation uuid of this bridge
    pub bridge_uuid: String,
    /// Supabase project URL
    pub supabase_url: String,
    /// Supabase service role key
    pub supabase_key: String,
    /// SMTP listen host
    pub smtp_host: String,
    /// SMTP listen port
    pub smtp_port: u16,
    /// Directory for exported buffer files
    pub export_dir: PathBuf,
    /// Recorder settings shared by every camera
    pub recorder: RecorderConfig,
    /// Initial registration poll delay
    pub registration_retry: Duration,
    /// Upper bound for the registration poll delay
    pub registration_max_retry: Duration,
}

/// Per-camera buffer and capture settings
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// Packets older than this (relative to the newest insert) are evicted
    pub packet_window: Duration,
    /// Hard cap on buffered packets
    pub max_packets: usize,
    /// Hard cap on buffered snapshots
    pub max_snapshots: usize,
    /// Period of the snapshot task
    pub snapshot_interval: Duration,
    /// Single-frame capture timeout
    pub snapshot_timeout: Duration,
    /// GStreamer launcher binary
    pub gstreamer_bin: String,
    /// FFmpeg binary
    pub ffmpeg_bin: String,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            packet_window: Duration::from_secs(140),
            max_packets: 4096,
            max_snapshots: 8,
            snapshot_interval: Duration::from_secs(5),
            snapshot_timeout: Duration::from_secs(5),
            gstreamer_bin: "gst-launch-1.0".to_string(),
            ffmpeg_bin: "ffmpeg".to_string(),
        }
    }
}

impl BridgeConfig {
    /// Load configuration from process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| Error::Config(format!("{} is required", key)))
        };
        let secs = |key: &str, default: u64| {
            Duration::from_secs(
                lookup(key)
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(default),
            )
        };

        let defaults = RecorderConfig::default();
        let recorder = RecorderConfig {
            packet_window: secs("RECORDER_WINDOW_SECS", 140),
            max_packets: lookup("RECORDER_MAX_PACKETS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_packets),
            max_snapshots: lookup("RECORDER_MAX_SNAPSHOTS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_snapshots),
            snapshot_interval: secs("SNAPSHOT_INTERVAL_SECS", 5),
            snapshot_timeout: secs("SNAPSHOT_TIMEOUT_SECS", 5),
            gstreamer_bin: lookup("GSTREAMER_BIN").unwrap_or(defaults.gstreamer_bin),
            ffmpeg_bin: lookup("FFMPEG_BIN").unwrap_or(defaults.ffmpeg_bin),
        };

        Ok(Self {
            bridge_uuid: required("BRIDGE_UUID")?,
            supabase_url: required("SUPABASE_URL")?
                .trim_end_matches('/')
                .to_string(),
            supabase_key: required("SUPABASE_SERVICE_ROLE_KEY")?,
            smtp_host: lookup("SMTP_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            smtp_port: lookup("SMTP_PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(1025),
            export_dir: lookup("EXPORT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            recorder,
            registration_retry: secs("REGISTRATION_RETRY_SECS", 20),
            registration_max_retry: secs("REGISTRATION_MAX_RETRY_SECS", 300),
        })
    }

    /// SMTP bind address
    pub fn smtp_addr(&self) -> String {
        format!("{}:{}", self.smtp_host, self.smtp_port)
    }
}

/// Identity of this bridge, fixed once registration completes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeIdentity {
    pub bridge_id: i64,
    pub bridge_uuid: String,
    pub site_id: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_applied() {
        let config = BridgeConfig::from_lookup(lookup(&[
            ("BRIDGE_UUID", "0a1b2c3d-aaaa"),
            ("SUPABASE_URL", "https://example.supabase.co/"),
            ("SUPABASE_SERVICE_ROLE_KEY", "secret"),
        ]))
        .unwrap();

        assert_eq!(config.smtp_port, 1025);
        assert_eq!(config.smtp_addr(), "0.0.0.0:1025");
        assert_eq!(config.supabase_url, "https://example.supabase.co");
        assert_eq!(config.recorder.packet_window, Duration::from_secs(140));
        assert_eq!(config.recorder.max_snapshots, 8);
        assert_eq!(config.registration_retry, Duration::from_secs(20));
    }

    #[test]
    fn test_missing_uuid_is_config_error() {
        let result = BridgeConfig::from_lookup(lookup(&[
            ("SUPABASE_URL", "https://example.supabase.co"),
            ("SUPABASE_SERVICE_ROLE_KEY", "secret"),
        ]));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_invalid_numbers_fall_back() {
        let config = BridgeConfig::from_lookup(lookup(&[
            ("BRIDGE_UUID", "u"),
            ("SUPABASE_URL", "https://x"),
            ("SUPABASE_SERVICE_ROLE_KEY", "k"),
            ("SMTP_PORT", "not-a-port"),
            ("RECORDER_MAX_PACKETS", "-3"),
            ("RECORDER_WINDOW_SECS", "60"),
        ]))
        .unwrap();
        assert_eq!(config.smtp_port, 1025);
        assert_eq!(config.recorder.max_packets, 4096);
        assert_eq!(config.recorder.packet_window, Duration::from_secs(60));
    }
}
