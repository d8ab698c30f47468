//! SmtpServer - Alarm mail intake
//!
//! ## Responsibilities
//!
//! - Accept SMTP connections from cameras (one task per connection)
//! - Accept any AUTH PLAIN / LOGIN credentials; require AUTH before MAIL
//! - Decode each completed message and hand it to the alarm pipeline
//!
//! The pipeline channel is bounded. When it is full the mail is dropped
//! with a warning and the client still gets `250`, so a burst of alarms
//! never stalls a camera's SMTP client.

mod session;

use crate::alarm_parser::RawEvent;
use crate::error::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

pub(crate) use session::serve_session;

/// Protocol limits
#[derive(Debug, Clone)]
pub struct SmtpLimits {
    /// Name announced in the greeting and EHLO reply
    pub domain: String,
    pub max_message_bytes: usize,
    pub max_recipients: usize,
    /// Per-command read timeout
    pub command_timeout: Duration,
}

impl Default for SmtpLimits {
    fn default() -> Self {
        Self {
            domain: "chekt-bridge".to_string(),
            max_message_bytes: 1024 * 1024,
            max_recipients: 50,
            command_timeout: Duration::from_secs(10),
        }
    }
}

/// SMTP listener feeding the alarm pipeline
pub struct SmtpServer {
    addr: String,
    limits: Arc<SmtpLimits>,
    events: mpsc::Sender<RawEvent>,
}

impl SmtpServer {
    pub fn new(addr: impl Into<String>, limits: SmtpLimits, events: mpsc::Sender<RawEvent>) -> Self {
        Self {
            addr: addr.into(),
            limits: Arc::new(limits),
            events,
        }
    }

    /// Bind and serve until cancelled; open sessions are closed before return
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(&self.addr).await?;
        tracing::info!(addr = %self.addr, "SMTP server listening");
        self.serve(listener, cancel).await
    }

    /// Serve on an already bound listener
    pub async fn serve(&self, listener: TcpListener, cancel: CancellationToken) -> Result<()> {
        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tracing::debug!(peer = %peer, "SMTP connection accepted");
                        let limits = self.limits.clone();
                        let events = self.events.clone();
                        let session_cancel = cancel.child_token();
                        sessions.spawn(async move {
                            if let Err(e) = serve_session(stream, Some(peer.ip()), &limits, &events, &session_cancel).await {
                                tracing::debug!(peer = %peer, error = %e, "SMTP session ended with error");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "SMTP accept failed");
                    }
                },
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "SMTP session panicked");
                    }
                }
            }
        }

        while sessions.join_next().await.is_some() {}
        tracing::info!(addr = %self.addr, "SMTP server stopped");
        Ok(())
    }
}
