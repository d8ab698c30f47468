//! Error handling for the CHEKT bridge
//!
//! Every failure is scoped to one mail, one camera or one command; callers log
//! and continue rather than bringing the process down.

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Mail payload could not be split into parts
    #[error("Decode error: {0}")]
    Decode(String),

    /// A parser could not decide whether the event is an alarm
    #[error("Recognition error: {0}")]
    Recognition(String),

    /// Required alarm fields missing or unresolvable
    #[error("Extraction error: {0}")]
    Extraction(String),

    /// Artifact upload to storage failed
    #[error("Artifact error: {0}")]
    Artifact(String),

    /// Backend insert or query failed
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Capture tool missing, failed to spawn or exited
    #[error("Capture process error for camera {camera_id}: {message}")]
    CaptureProcess { camera_id: i64, message: String },

    /// Inbound command could not be correlated to a request
    #[error("Correlation error: {0}")]
    Correlation(String),

    /// Config error
    #[error("Config error: {0}")]
    Config(String),

    /// Network error (realtime socket, discovery)
    #[error("Network error: {0}")]
    Network(String),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Operation aborted by shutdown
    #[error("Cancelled")]
    Cancelled,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for capture failures on a given camera
    pub fn capture(camera_id: i64, message: impl Into<String>) -> Self {
        Error::CaptureProcess {
            camera_id,
            message: message.into(),
        }
    }
}
