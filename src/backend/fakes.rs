//! In-memory fakes for the backend traits (testing only)

use super::{BackendStore, BroadcastMessage, RealtimeTransport};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Uploaded object as seen by `MemoryStore`
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub bucket: String,
    pub filename: String,
    pub size: usize,
    pub content_type: String,
}

/// Store keeping rows and uploads in memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: Mutex<Vec<(String, Value)>>,
    uploads: Mutex<Vec<StoredObject>>,
    fail_inserts: AtomicBool,
    fail_uploads: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_uploads() -> Self {
        let store = Self::default();
        store.fail_uploads.store(true, Ordering::SeqCst);
        store
    }

    pub fn set_fail_inserts(&self, fail: bool) {
        self.fail_inserts.store(fail, Ordering::SeqCst);
    }

    /// Seed a row without going through `insert`
    pub fn seed(&self, table: &str, row: Value) {
        self.rows.lock().unwrap().push((table.to_string(), row));
    }

    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.rows
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == table)
            .map(|(_, v)| v.clone())
            .collect()
    }

    pub fn uploads(&self) -> Vec<StoredObject> {
        self.uploads.lock().unwrap().clone()
    }
}

fn matches(row: &Value, column: &str, expected: &str) -> bool {
    match row.get(column) {
        Some(Value::String(s)) => s == expected,
        Some(Value::Null) | None => false,
        Some(other) => other.to_string() == expected,
    }
}

#[async_trait]
impl BackendStore for MemoryStore {
    async fn insert(&self, table: &str, record: Value) -> Result<()> {
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(Error::Persistence(format!("insert into {} rejected", table)));
        }
        self.rows.lock().unwrap().push((table.to_string(), record));
        Ok(())
    }

    async fn query(&self, table: &str, filters: &[(&str, String)]) -> Result<Vec<Value>> {
        Ok(self
            .rows(table)
            .into_iter()
            .filter(|row| filters.iter().all(|(c, v)| matches(row, c, v)))
            .collect())
    }

    async fn upload_artifact(
        &self,
        bucket: &str,
        filename: &str,
        data: Vec<u8>,
        content_type: &str,
    ) -> Result<String> {
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(Error::Artifact(format!("upload of {} rejected", filename)));
        }
        self.uploads.lock().unwrap().push(StoredObject {
            bucket: bucket.to_string(),
            filename: filename.to_string(),
            size: data.len(),
            content_type: content_type.to_string(),
        });
        Ok(format!("memory://{}/{}", bucket, filename))
    }
}

/// Transport whose topics are fed by the test
#[derive(Debug, Default)]
pub struct MemoryRealtime {
    topics: Mutex<HashMap<String, mpsc::Sender<BroadcastMessage>>>,
    unsubscribed: Mutex<Vec<String>>,
}

impl MemoryRealtime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver a broadcast to a subscribed topic
    pub async fn publish(&self, topic: &str, message: BroadcastMessage) {
        let sender = self.topics.lock().unwrap().get(topic).cloned();
        if let Some(sender) = sender {
            sender.send(message).await.unwrap();
        }
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.topics.lock().unwrap().contains_key(topic)
    }

    pub fn unsubscribed(&self) -> Vec<String> {
        self.unsubscribed.lock().unwrap().clone()
    }
}

#[async_trait]
impl RealtimeTransport for MemoryRealtime {
    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<BroadcastMessage>> {
        let (tx, rx) = mpsc::channel(16);
        self.topics.lock().unwrap().insert(topic.to_string(), tx);
        Ok(rx)
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.topics.lock().unwrap().remove(topic);
        self.unsubscribed.lock().unwrap().push(topic.to_string());
        Ok(())
    }
}
