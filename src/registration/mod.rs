//! Registration - Bridge announcement and site assignment
//!
//! ## Responsibilities
//!
//! - Announce this bridge (uuid, display name, access token) to the backend
//! - Poll until an operator assigns the bridge to a site
//! - Produce the immutable `BridgeIdentity` used by every other component
//!
//! ## Flow
//!
//! `Announcing -> Polling { attempt } -> Registered`, or `GaveUp` when a retry
//! limit is configured and reached. Waits between polls back off
//! exponentially and end early on shutdown.

use crate::backend::{tables, BackendStore};
use crate::config::BridgeIdentity;
use crate::error::{Error, Result};
use rand::Rng;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const ACCESS_TOKEN_LEN: usize = 5;
const ACCESS_TOKEN_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Registration progress
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationState {
    Announcing,
    Polling { attempt: u32 },
    Registered(BridgeIdentity),
    GaveUp { attempts: u32 },
}

/// Poll backoff settings
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub max: Duration,
    /// `None` polls forever
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    /// Delay after the given (zero-based) failed attempt
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.initial
            .checked_mul(factor)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(20),
            max: Duration::from_secs(300),
            max_attempts: None,
        }
    }
}

/// Random access token shown to the operator
pub fn generate_access_token() -> String {
    let mut rng = rand::thread_rng();
    (0..ACCESS_TOKEN_LEN)
        .map(|_| ACCESS_TOKEN_CHARSET[rng.gen_range(0..ACCESS_TOKEN_CHARSET.len())] as char)
        .collect()
}

/// Display name derived from the uuid
pub fn bridge_name(bridge_uuid: &str) -> String {
    let short: String = bridge_uuid.chars().take(8).collect();
    format!("Bridge-{}", short)
}

/// Bridge registration against the `bridge` table
pub struct BridgeRegistration {
    store: Arc<dyn BackendStore>,
    bridge_uuid: String,
    access_token: String,
    policy: RetryPolicy,
}

impl BridgeRegistration {
    pub fn new(store: Arc<dyn BackendStore>, bridge_uuid: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            store,
            bridge_uuid: bridge_uuid.into(),
            access_token: generate_access_token(),
            policy,
        }
    }

    /// Drive the state machine to `Registered`
    pub async fn register(&self, cancel: &CancellationToken) -> Result<BridgeIdentity> {
        let mut state = RegistrationState::Announcing;

        loop {
            tracing::debug!(state = ?state, "Registration state");

            state = match state {
                RegistrationState::Announcing => {
                    self.announce().await;
                    RegistrationState::Polling { attempt: 0 }
                }
                RegistrationState::Polling { attempt } => match self.poll().await {
                    Ok(Some(identity)) => RegistrationState::Registered(identity),
                    Ok(None) => self.wait_for_retry(attempt, cancel).await?,
                    Err(e) => {
                        tracing::warn!(attempt = attempt, error = %e, "Bridge lookup failed");
                        self.wait_for_retry(attempt, cancel).await?
                    }
                },
                RegistrationState::Registered(identity) => {
                    tracing::info!(
                        bridge_id = identity.bridge_id,
                        site_id = identity.site_id,
                        "Bridge registered"
                    );
                    return Ok(identity);
                }
                RegistrationState::GaveUp { attempts } => {
                    return Err(Error::Network(format!(
                        "bridge not assigned to a site after {} attempts",
                        attempts
                    )));
                }
            };
        }
    }

    async fn wait_for_retry(&self, attempt: u32, cancel: &CancellationToken) -> Result<RegistrationState> {
        let attempts = attempt + 1;
        if self.policy.max_attempts.is_some_and(|max| attempts >= max) {
            return Ok(RegistrationState::GaveUp { attempts });
        }

        let delay = self.policy.delay(attempt);
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(RegistrationState::Polling { attempt: attempts }),
        }
    }

    /// Insert the bridge row; an existing row is not an error
    async fn announce(&self) {
        let record = json!({
            "bridge_uuid": self.bridge_uuid,
            "bridge_name": bridge_name(&self.bridge_uuid),
            "access_token": self.access_token,
            "healthy": true,
        });

        match self.store.insert(tables::BRIDGE, record).await {
            Ok(()) => tracing::info!(bridge_uuid = %self.bridge_uuid, "Bridge announced"),
            Err(e) => tracing::debug!(bridge_uuid = %self.bridge_uuid, error = %e, "Bridge announce skipped"),
        }
    }

    /// Identity once a site is assigned
    async fn poll(&self) -> Result<Option<BridgeIdentity>> {
        let rows = self
            .store
            .query(tables::BRIDGE, &[("bridge_uuid", self.bridge_uuid.clone())])
            .await?;

        let row = rows
            .into_iter()
            .next()
            .ok_or_else(|| Error::Persistence(format!("bridge {} not found", self.bridge_uuid)))?;

        let bridge_id = row
            .get("id")
            .and_then(Value::as_i64)
            .ok_or_else(|| Error::Persistence("bridge row without id".to_string()))?;

        match row.get("site_id").and_then(Value::as_i64) {
            Some(site_id) => Ok(Some(BridgeIdentity {
                bridge_id,
                bridge_uuid: self.bridge_uuid.clone(),
                site_id,
            })),
            None => {
                let token = row
                    .get("access_token")
                    .and_then(Value::as_str)
                    .unwrap_or(self.access_token.as_str());
                tracing::info!(
                    bridge_id = bridge_id,
                    access_token = %token,
                    "Waiting for site assignment; enter the access token in the console"
                );
                Ok(None)
            }
        }
    }
}
