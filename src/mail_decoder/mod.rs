//! MailDecoder - Raw mail payload to ordered typed parts
//!
//! ## Responsibilities
//!
//! - Top-level header parsing and content-type detection
//! - Multipart splitting via a structured MIME reader
//! - Manual boundary splitting when the structured reader gives up
//!
//! Part content is kept transfer-encoded (base64 stays base64); decoding is
//! left to the alarm parsers, which know what the vendor sends.

use crate::error::{Error, Result};
use mailparse::{body::Body, MailHeaderMap};
use std::collections::HashMap;
use std::net::IpAddr;

const DEFAULT_CONTENT_TYPE: &str = "text/plain";

/// One part of a decoded mail
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailPart {
    pub content_type: String,
    pub headers: HashMap<String, String>,
    pub content: Vec<u8>,
}

impl EmailPart {
    /// Synthetic text part wrapping arbitrary bytes
    pub fn plain(content: Vec<u8>) -> Self {
        Self {
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            headers: HashMap::new(),
            content,
        }
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_text_plain(&self) -> bool {
        self.content_type
            .trim_start()
            .to_ascii_lowercase()
            .starts_with(DEFAULT_CONTENT_TYPE)
    }
}

/// Inbound mail transaction
#[derive(Debug, Clone)]
pub struct MailMessage {
    pub from: String,
    pub to: Vec<String>,
    pub raw: Vec<u8>,
    pub parts: Vec<EmailPart>,
    /// Address of the submitting client, when the transport knows it
    pub peer: Option<IpAddr>,
}

impl MailMessage {
    /// Build a message from a completed transaction.
    ///
    /// A payload that cannot be decoded still produces a message: it carries
    /// one `text/plain` part holding the whole payload.
    pub fn from_raw(from: String, to: Vec<String>, raw: Vec<u8>, peer: Option<IpAddr>) -> Self {
        let parts = match decode_mail(&raw) {
            Ok(parts) if !parts.is_empty() => parts,
            Ok(_) => {
                tracing::warn!(from = %from, "Mail decoded to zero parts, using raw payload");
                vec![EmailPart::plain(raw.clone())]
            }
            Err(e) => {
                tracing::warn!(from = %from, error = %e, "Mail decode failed, using raw payload");
                vec![EmailPart::plain(raw.clone())]
            }
        };

        tracing::debug!(from = %from, parts = parts.len(), "Mail decoded");

        Self {
            from,
            to,
            raw,
            parts,
            peer,
        }
    }
}

/// Decode a raw mail payload into its parts
pub fn decode_mail(raw: &[u8]) -> Result<Vec<EmailPart>> {
    let (headers, body_offset) = mailparse::parse_headers(raw)
        .map_err(|e| Error::Decode(format!("failed to read message headers: {}", e)))?;

    let content_type = headers
        .get_first_value("Content-Type")
        .unwrap_or_default();

    if !content_type.to_ascii_lowercase().contains("multipart") {
        let mut header_map = HashMap::new();
        for header in &headers {
            header_map
                .entry(header.get_key())
                .or_insert_with(|| header.get_value());
        }
        let content_type = if content_type.trim().is_empty() {
            DEFAULT_CONTENT_TYPE.to_string()
        } else {
            content_type
        };
        return Ok(vec![EmailPart {
            content_type,
            headers: header_map,
            content: raw.get(body_offset..).unwrap_or_default().to_vec(),
        }]);
    }

    let boundary = extract_boundary(&content_type)?;
    let body = raw.get(body_offset..).unwrap_or_default();

    match parse_structured(raw) {
        Ok(parts) if !parts.is_empty() => Ok(parts),
        Ok(_) => {
            tracing::debug!(boundary = %boundary, "Structured reader found no parts, splitting manually");
            parse_manually(body, &boundary)
        }
        Err(e) => {
            tracing::debug!(error = %e, "Structured reader failed, splitting manually");
            parse_manually(body, &boundary).map_err(|manual| {
                Error::Decode(format!(
                    "both structured and manual parsing failed: {}; {}",
                    e, manual
                ))
            })
        }
    }
}

/// Boundary parameter of a multipart content type, quotes stripped
fn extract_boundary(content_type: &str) -> Result<String> {
    let parsed = mailparse::parse_content_type(content_type);
    let boundary = parsed
        .params
        .get("boundary")
        .map(|b| b.trim_matches(|c| c == '"' || c == '\'').to_string())
        .filter(|b| !b.is_empty());

    boundary.ok_or_else(|| Error::Decode("no boundary found in multipart content type".to_string()))
}

fn parse_structured(raw: &[u8]) -> Result<Vec<EmailPart>> {
    let mail = mailparse::parse_mail(raw)
        .map_err(|e| Error::Decode(format!("structured parse failed: {}", e)))?;

    let mut parts = Vec::with_capacity(mail.subparts.len());
    for sub in &mail.subparts {
        let mut headers = HashMap::new();
        for header in &sub.headers {
            headers
                .entry(header.get_key())
                .or_insert_with(|| header.get_value());
        }

        let content_type = sub
            .headers
            .get_first_value("Content-Type")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());

        let encoded = match sub.get_body_encoded() {
            Body::Base64(b) | Body::QuotedPrintable(b) => b.get_raw().to_vec(),
            Body::SevenBit(b) | Body::EightBit(b) => b.get_raw().to_vec(),
            Body::Binary(b) => b.get_raw().to_vec(),
        };

        parts.push(EmailPart {
            content_type,
            headers,
            content: trim_bytes(&encoded).to_vec(),
        });
    }

    Ok(parts)
}

/// Boundary splitting for payloads the structured reader rejects
fn parse_manually(body: &[u8], boundary: &str) -> Result<Vec<EmailPart>> {
    let text = String::from_utf8_lossy(body);
    let marker = format!("--{}", boundary);

    if !text.contains(&marker) {
        return Err(Error::Decode(format!("boundary {} not present in body", boundary)));
    }

    let mut parts = Vec::new();
    for section in text.split(marker.as_str()) {
        let trimmed = section.trim();
        if trimmed.is_empty() || trimmed == "--" {
            continue;
        }

        let split = section
            .split_once("\r\n\r\n")
            .or_else(|| section.split_once("\n\n"));

        let Some((header_block, content)) = split else {
            parts.push(EmailPart::plain(trimmed.as_bytes().to_vec()));
            continue;
        };

        let mut headers = HashMap::new();
        for line in header_block.lines() {
            if let Some((key, value)) = line.trim().split_once(':') {
                headers
                    .entry(key.trim().to_string())
                    .or_insert_with(|| value.trim().to_string());
            }
        }

        let content_type = headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("Content-Type"))
            .map(|(_, v)| v.clone())
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());

        let content = content.trim();
        let content = content.strip_suffix("--").unwrap_or(content).trim();
        if content.is_empty() {
            continue;
        }

        parts.push(EmailPart {
            content_type,
            headers,
            content: content.as_bytes().to_vec(),
        });
    }

    Ok(parts)
}

fn trim_bytes(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map(|i| i + 1)
        .unwrap_or(start);
    &bytes[start..end.max(start)]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn multipart_mail(boundary_param: &str, boundary: &str) -> Vec<u8> {
        format!(
            "From: cam@example.com\r\n\
             To: alarm@bridge\r\n\
             Subject: Alarm\r\n\
             MIME-Version: 1.0\r\n\
             Content-Type: multipart/mixed; boundary={}\r\n\
             \r\n\
             --{b}\r\n\
             Content-Type: text/plain; charset=utf-8\r\n\
             Content-Transfer-Encoding: base64\r\n\
             \r\n\
             QWxhcm0gRXZlbnQ6IE1vdGlvbiBEZXRlY3Q=\r\n\
             --{b}\r\n\
             Content-Type: image/jpeg\r\n\
             Content-Transfer-Encoding: base64\r\n\
             \r\n\
             /9j/4AAQSkZJRg==\r\n\
             --{b}--\r\n",
            boundary_param,
            b = boundary
        )
        .into_bytes()
    }

    #[test]
    fn test_multipart_yields_each_part() {
        let raw = multipart_mail("XYZ", "XYZ");
        let parts = decode_mail(&raw).unwrap();

        assert_eq!(parts.len(), 2);
        assert!(parts[0].is_text_plain());
        assert_eq!(parts[0].content, b"QWxhcm0gRXZlbnQ6IE1vdGlvbiBEZXRlY3Q=");
        assert_eq!(parts[0].header("content-transfer-encoding"), Some("base64"));
        assert!(parts[1].content_type.starts_with("image/jpeg"));
    }

    #[test]
    fn test_quoted_boundary() {
        let raw = multipart_mail("\"XYZ\"", "XYZ");
        let parts = decode_mail(&raw).unwrap();
        assert_eq!(parts.len(), 2);
    }

    #[test]
    fn test_non_multipart_single_part() {
        let raw = b"From: cam@example.com\r\nSubject: hi\r\n\r\nAlarm Event: Motion Detect\r\n";
        let parts = decode_mail(raw).unwrap();

        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].content_type, "text/plain");
        assert_eq!(parts[0].header("subject"), Some("hi"));
        assert!(String::from_utf8_lossy(&parts[0].content).contains("Motion Detect"));
    }

    #[test]
    fn test_missing_boundary_is_decode_error() {
        let raw = b"Content-Type: multipart/mixed\r\n\r\nbody\r\n";
        assert!(matches!(decode_mail(raw), Err(Error::Decode(_))));
    }

    #[test]
    fn test_manual_split_matches_structured() {
        let raw = multipart_mail("XYZ", "XYZ");
        let (_, offset) = mailparse::parse_headers(&raw).unwrap();
        let manual = parse_manually(&raw[offset..], "XYZ").unwrap();
        let structured = parse_structured(&raw).unwrap();

        assert_eq!(manual.len(), structured.len());
        for (m, s) in manual.iter().zip(structured.iter()) {
            assert_eq!(m.content, s.content);
            assert_eq!(m.content_type, s.content_type);
        }
    }

    #[test]
    fn test_manual_split_section_without_headers() {
        let body = b"--B\r\njust some text\r\n--B--\r\n";
        let parts = parse_manually(body, "B").unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].content, b"just some text");
        assert!(parts[0].headers.is_empty());
    }

    #[test]
    fn test_manual_split_requires_boundary() {
        assert!(parse_manually(b"no markers here", "B").is_err());
    }

    #[test]
    fn test_decode_is_deterministic() {
        let raw = multipart_mail("XYZ", "XYZ");
        assert_eq!(decode_mail(&raw).unwrap(), decode_mail(&raw).unwrap());
    }

    #[test]
    fn test_from_raw_falls_back_to_single_part() {
        let raw = b"Content-Type: multipart/mixed\r\n\r\ngarbage".to_vec();
        let msg = MailMessage::from_raw("a@b".into(), vec!["c@d".into()], raw.clone(), None);
        assert_eq!(msg.parts.len(), 1);
        assert_eq!(msg.parts[0].content, raw);
        assert!(msg.parts[0].is_text_plain());
    }
}
