//! Dahua alarm mail parser
//!
//! Dahua devices send a plain text body (usually base64 transfer-encoded):
//!
//! ```text
//! Alarm Event: Motion Detect
//! Alarm Input Channel: 1
//! Alarm Start Time(D/M/Y H:M:S): 18/10/2026 14:03:22
//! Alarm Device Name: FrontGate
//! IP Address: 192.168.1.108
//! ```

use super::{AlarmParser, ParsedAlarm, RawEvent};
use crate::error::{Error, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

const ALARM_TYPE: &str = "dahua";

const EVENT_PREFIX: &str = "Alarm Event:";
const START_PREFIX: &str = "Alarm Start Time(D/M/Y H:M:S):";
const STOP_PREFIX: &str = "Alarm Stop Time(D/M/Y H:M:S):";
const DEVICE_PREFIX: &str = "Alarm Device Name:";
const CHANNEL_PREFIX: &str = "Alarm Input Channel:";
const IP_PREFIX: &str = "IP Address:";

/// Timestamp layouts, tried in order
const TIME_FORMATS: [&str; 2] = ["%d/%m/%Y %H:%M:%S", "%Y-%m-%d %H:%M:%S"];

/// Parser for Dahua alarm mails
#[derive(Debug, Default)]
pub struct DahuaParser;

impl DahuaParser {
    pub fn new() -> Self {
        Self
    }

    /// Alarm text of the event: first text/plain part, else the raw payload
    fn alarm_text(event: &RawEvent) -> Result<String> {
        let RawEvent::Mail(mail) = event;

        let payload: &[u8] = match mail.parts.first() {
            Some(part) if part.is_text_plain() => &part.content,
            _ => &mail.raw,
        };

        if payload.iter().all(|b| b.is_ascii_whitespace()) {
            return Err(Error::Recognition("empty mail payload".to_string()));
        }

        Ok(decode_text(payload))
    }
}

impl AlarmParser for DahuaParser {
    fn name(&self) -> &'static str {
        "dahua"
    }

    fn is_alarm(&self, event: &RawEvent) -> Result<bool> {
        let text = Self::alarm_text(event)?;
        Ok(text.trim_start().starts_with(EVENT_PREFIX)
            || text.contains(DEVICE_PREFIX)
            || text.contains(CHANNEL_PREFIX))
    }

    fn parse_alarm(&self, event: &RawEvent) -> Result<ParsedAlarm> {
        let text = Self::alarm_text(event)?;

        let mut alarm_name = None;
        let mut start_time = None;
        let mut stop_time = None;
        let mut device_name = None;
        let mut ip_address = None;
        let mut input_channel = None;

        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if let Some(v) = field(line, EVENT_PREFIX) {
                alarm_name = Some(v);
            } else if let Some(v) = field(line, START_PREFIX) {
                start_time = start_time.or_else(|| parse_time(&v));
            } else if let Some(v) = field(line, STOP_PREFIX) {
                stop_time = stop_time.or_else(|| parse_time(&v));
            } else if let Some(v) = field(line, DEVICE_PREFIX) {
                device_name = Some(v);
            } else if let Some(v) = field(line, CHANNEL_PREFIX) {
                input_channel = Some(v);
            } else if let Some(v) = field(line, IP_PREFIX) {
                ip_address = Some(v);
            }
        }

        let alarm_name = alarm_name
            .ok_or_else(|| Error::Extraction("missing required field: Alarm Event".to_string()))?;

        Ok(ParsedAlarm {
            alarm_name,
            alarm_type: ALARM_TYPE.to_string(),
            alarm_at: start_time.or(stop_time).unwrap_or_else(Utc::now),
            device_name,
            ip_address,
            input_channel,
        })
    }
}

/// Base64 body (line breaks ignored) when it decodes to UTF-8, else plain text
fn decode_text(payload: &[u8]) -> String {
    let compact: Vec<u8> = payload
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();

    match STANDARD.decode(&compact) {
        Ok(decoded) => match String::from_utf8(decoded) {
            Ok(text) => text,
            Err(_) => String::from_utf8_lossy(payload).into_owned(),
        },
        Err(_) => String::from_utf8_lossy(payload).into_owned(),
    }
}

/// Trimmed, non-empty value after `prefix`
fn field(line: &str, prefix: &str) -> Option<String> {
    line.strip_prefix(prefix)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn parse_time(value: &str) -> Option<DateTime<Utc>> {
    TIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}
