//! Discovery - ONVIF device discovery on the local network
//!
//! ## Responsibilities
//!
//! - Multicast a WS-Discovery `Probe` for network video transmitters
//! - Collect `ProbeMatch` replies for a bounded window
//! - Reduce replies to `DeviceDescriptor`s, one per endpoint reference

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;
use tokio::net::UdpSocket;

const MULTICAST_ADDR: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);
const MULTICAST_PORT: u16 = 3702;
const MAX_DATAGRAM: usize = 65_535;

/// Device that answered a discovery probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub endpoint_reference: String,
    pub xaddrs: Vec<String>,
    pub scopes: Vec<String>,
    pub types: Vec<String>,
    pub ip_address: Option<String>,
}

/// Device discovery collaborator
#[async_trait]
pub trait DeviceDiscovery: Send + Sync {
    async fn discover(&self) -> Result<Vec<DeviceDescriptor>>;
}

/// WS-Discovery over UDP multicast
pub struct WsDiscovery {
    listen_window: Duration,
}

impl WsDiscovery {
    pub fn new(listen_window: Duration) -> Self {
        Self { listen_window }
    }
}

impl Default for WsDiscovery {
    fn default() -> Self {
        Self::new(Duration::from_secs(3))
    }
}

#[async_trait]
impl DeviceDiscovery for WsDiscovery {
    async fn discover(&self) -> Result<Vec<DeviceDescriptor>> {
        let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))
            .await
            .map_err(|e| Error::Network(format!("discovery bind failed: {}", e)))?;

        let message_id = format!("uuid:{}", uuid::Uuid::new_v4());
        let probe = probe_message(&message_id);
        socket
            .send_to(probe.as_bytes(), SocketAddrV4::new(MULTICAST_ADDR, MULTICAST_PORT))
            .await
            .map_err(|e| Error::Network(format!("discovery probe failed: {}", e)))?;

        let deadline = tokio::time::Instant::now() + self.listen_window;
        let mut seen = HashSet::new();
        let mut devices = Vec::new();
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            let received = tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await;
            let (len, from) = match received {
                Err(_) => break,
                Ok(Ok(r)) => r,
                Ok(Err(e)) => {
                    tracing::debug!(error = %e, "Discovery receive failed");
                    continue;
                }
            };

            let xml = String::from_utf8_lossy(&buf[..len]);
            if !is_reply_to(&xml, &message_id) {
                continue;
            }

            for device in parse_probe_matches(&xml, Some(from)) {
                if seen.insert(device.endpoint_reference.clone()) {
                    devices.push(device);
                }
            }
        }

        tracing::info!(count = devices.len(), "Device discovery finished");
        Ok(devices)
    }
}

fn probe_message(message_id: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope" xmlns:a="http://schemas.xmlsoap.org/ws/2004/08/addressing" xmlns:d="http://schemas.xmlsoap.org/ws/2005/04/discovery" xmlns:dn="http://www.onvif.org/ver10/network/wsdl">
<s:Header>
<a:Action s:mustUnderstand="1">http://schemas.xmlsoap.org/ws/2005/04/discovery/Probe</a:Action>
<a:MessageID>{}</a:MessageID>
<a:ReplyTo><a:Address>http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous</a:Address></a:ReplyTo>
<a:To s:mustUnderstand="1">urn:schemas-xmlsoap-org:ws:2005:04:discovery</a:To>
</s:Header>
<s:Body>
<d:Probe><d:Types>dn:NetworkVideoTransmitter</d:Types></d:Probe>
</s:Body>
</s:Envelope>"#,
        message_id
    )
}

/// Replies without RelatesTo are accepted; some cameras omit it
fn is_reply_to(xml: &str, message_id: &str) -> bool {
    match extract_xml_value(xml, "RelatesTo") {
        Some(relates_to) => relates_to == message_id,
        None => true,
    }
}

/// Every ProbeMatch in a reply
fn parse_probe_matches(xml: &str, from: Option<SocketAddr>) -> Vec<DeviceDescriptor> {
    let ip_address = from.map(|addr| addr.ip().to_string());

    xml_sections(xml, "ProbeMatch")
        .into_iter()
        .filter_map(|section| {
            let endpoint_reference = extract_xml_value(section, "Address")?;
            Some(DeviceDescriptor {
                endpoint_reference,
                xaddrs: split_list(extract_xml_value(section, "XAddrs")),
                scopes: split_list(extract_xml_value(section, "Scopes")),
                types: split_list(extract_xml_value(section, "Types")),
                ip_address: ip_address.clone(),
            })
        })
        .collect()
}

fn split_list(value: Option<String>) -> Vec<String> {
    value
        .map(|v| v.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}

/// Bodies of every `<ns:tag ...>...</ns:tag>` element, prefix-agnostic
fn xml_sections<'a>(xml: &'a str, tag: &str) -> Vec<&'a str> {
    let mut sections = Vec::new();
    let mut rest = xml;

    while let Some(body_start) = find_open_tag(rest, tag) {
        let body = &rest[body_start..];
        let Some(close) = find_close_tag(body, tag) else {
            break;
        };
        sections.push(&body[..close]);
        rest = &body[close..];
    }

    sections
}

/// Text content of the first `tag` element, prefix-agnostic
fn extract_xml_value(xml: &str, tag: &str) -> Option<String> {
    let body_start = find_open_tag(xml, tag)?;
    let body = &xml[body_start..];
    let close = find_close_tag(body, tag)?;
    let value = body[..close].trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Offset just past the first opening `tag`
fn find_open_tag(xml: &str, tag: &str) -> Option<usize> {
    let mut search = 0;
    while let Some(rel) = xml[search..].find('<') {
        let start = search + rel + 1;
        let end = start + xml[start..].find('>')?;
        let inner = &xml[start..end];
        let name = inner.split_whitespace().next().unwrap_or("");
        let local = name.rsplit(':').next().unwrap_or(name);
        if !name.starts_with('/') && local == tag && !inner.ends_with('/') {
            return Some(end + 1);
        }
        search = end + 1;
    }
    None
}

/// Offset of the matching closing tag
fn find_close_tag(body: &str, tag: &str) -> Option<usize> {
    let mut search = 0;
    while let Some(rel) = body[search..].find("</") {
        let start = search + rel;
        let end = start + body[start..].find('>')?;
        let name = body[start + 2..end].trim();
        let local = name.rsplit(':').next().unwrap_or(name);
        if local == tag {
            return Some(start);
        }
        search = end + 1;
    }
    None
}
