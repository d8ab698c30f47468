//! AlarmParser - Vendor alarm recognition and extraction
//!
//! ## Responsibilities
//!
//! - Closed set of inbound protocols (`Protocol`)
//! - Per-protocol, ordered list of vendor parsers
//! - Normalizing a vendor notification into a `ParsedAlarm`
//!
//! The registry is built once at startup and read-only afterwards.

mod dahua;

pub use dahua::DahuaParser;

use crate::error::Result;
use crate::mail_decoder::MailMessage;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::net::IpAddr;

/// Inbound alarm protocols
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Smtp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Smtp => "smtp",
        }
    }
}

/// Event as delivered by a protocol server
#[derive(Debug, Clone)]
pub enum RawEvent {
    Mail(MailMessage),
}

impl RawEvent {
    pub fn protocol(&self) -> Protocol {
        match self {
            RawEvent::Mail(_) => Protocol::Smtp,
        }
    }

    /// Network address of the device that sent the event
    pub fn peer(&self) -> Option<IpAddr> {
        match self {
            RawEvent::Mail(mail) => mail.peer,
        }
    }
}

/// Alarm fields extracted from a vendor notification
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedAlarm {
    pub alarm_name: String,
    pub alarm_type: String,
    pub alarm_at: DateTime<Utc>,
    pub device_name: Option<String>,
    pub ip_address: Option<String>,
    pub input_channel: Option<String>,
}

/// Vendor-specific alarm parser
pub trait AlarmParser: Send + Sync {
    /// Parser name for logging
    fn name(&self) -> &'static str;

    /// Whether the event is an alarm this parser understands
    fn is_alarm(&self, event: &RawEvent) -> Result<bool>;

    /// Extract alarm fields; only called after `is_alarm` returned true
    fn parse_alarm(&self, event: &RawEvent) -> Result<ParsedAlarm>;
}

/// Protocol to parser list
pub struct ParserRegistry {
    parsers: HashMap<Protocol, Vec<Box<dyn AlarmParser>>>,
}

impl ParserRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            parsers: HashMap::new(),
        }
    }

    /// Registry with every built-in vendor parser
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Protocol::Smtp, Box::new(DahuaParser::new()));
        registry
    }

    /// Append a parser; parsers run in registration order
    pub fn register(&mut self, protocol: Protocol, parser: Box<dyn AlarmParser>) {
        tracing::debug!(protocol = protocol.as_str(), parser = parser.name(), "Parser registered");
        self.parsers.entry(protocol).or_default().push(parser);
    }

    pub fn parsers_for(&self, protocol: Protocol) -> &[Box<dyn AlarmParser>] {
        self.parsers
            .get(&protocol)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }
}

impl Default for ParserRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
