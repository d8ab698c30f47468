//! AlarmPipeline - Single consumer for inbound alarm events
//!
//! ## Responsibilities
//!
//! - Drain the merged event channel one event at a time, in arrival order
//! - Run the protocol's parsers and resolve the camera
//! - Upload buffered footage for the camera (best effort)
//! - Persist the alarm record (no retry)
//!
//! ## State
//!
//! `Idle -> Dispatching -> Uploading -> Persisting -> Idle`, `Stopped` once the
//! cancellation token fires or every sender is gone.

use crate::alarm_parser::{ParsedAlarm, ParserRegistry, RawEvent};
use crate::backend::{tables, BackendStore, ARTIFACT_BUCKET};
use crate::config::BridgeIdentity;
use crate::error::{Error, Result};
use crate::inventory::{CameraResolver, DeviceHint};
use crate::models::AlarmRecord;
use crate::recording_fleet::RecordingFleet;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Capacity of the inbound event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Dispatching,
    Uploading,
    Persisting,
    Stopped,
}

/// What happened to one parser's view of an event
#[derive(Debug, Clone, PartialEq)]
pub enum EventOutcome {
    /// Parser did not recognize the event (or failed to decide)
    NotAlarm { parser: &'static str },
    /// Recognized but dropped before any side effect
    Dropped { parser: &'static str, reason: String },
    /// Alarm stored
    Persisted(AlarmRecord),
    /// Alarm built but the insert failed
    PersistFailed(AlarmRecord),
}

/// Uploaded artifact URLs for one alarm
#[derive(Debug, Default)]
struct Artifacts {
    snapshot_urls: Vec<String>,
    video_url: Option<String>,
}

/// Alarm event pipeline
pub struct AlarmPipeline {
    identity: BridgeIdentity,
    registry: ParserRegistry,
    resolver: Arc<dyn CameraResolver>,
    fleet: Arc<RecordingFleet>,
    store: Arc<dyn BackendStore>,
    state: watch::Sender<PipelineState>,
}

impl AlarmPipeline {
    pub fn new(
        identity: BridgeIdentity,
        registry: ParserRegistry,
        resolver: Arc<dyn CameraResolver>,
        fleet: Arc<RecordingFleet>,
        store: Arc<dyn BackendStore>,
    ) -> Self {
        let (state, _) = watch::channel(PipelineState::Idle);
        Self {
            identity,
            registry,
            resolver,
            fleet,
            store,
            state,
        }
    }

    /// Event channel shared by every protocol server
    pub fn channel() -> (mpsc::Sender<RawEvent>, mpsc::Receiver<RawEvent>) {
        mpsc::channel(EVENT_CHANNEL_CAPACITY)
    }

    pub fn state(&self) -> PipelineState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<PipelineState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: PipelineState) {
        self.state.send_replace(state);
    }

    /// Consume events until cancelled or every sender is dropped
    pub async fn run(&self, mut events: mpsc::Receiver<RawEvent>, cancel: CancellationToken) {
        tracing::info!(bridge_id = self.identity.bridge_id, "Alarm pipeline started");
        self.set_state(PipelineState::Idle);

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!("Alarm pipeline cancelled, stopping event processing");
                    break;
                }
                event = events.recv() => match event {
                    Some(event) => event,
                    None => {
                        tracing::info!("All event sources closed, stopping alarm pipeline");
                        break;
                    }
                },
            };

            self.process_event(event).await;
        }

        self.set_state(PipelineState::Stopped);
    }

    /// Run one event through every parser registered for its protocol
    pub async fn process_event(&self, event: RawEvent) -> Vec<EventOutcome> {
        let protocol = event.protocol();
        let mut outcomes = Vec::new();

        for parser in self.registry.parsers_for(protocol) {
            self.set_state(PipelineState::Dispatching);

            match parser.is_alarm(&event) {
                Ok(true) => {}
                Ok(false) => {
                    tracing::info!(parser = parser.name(), protocol = protocol.as_str(), "Event is not an alarm, skipping");
                    outcomes.push(EventOutcome::NotAlarm { parser: parser.name() });
                    continue;
                }
                Err(e) => {
                    tracing::error!(parser = parser.name(), error = %e, "Failed to check if event is an alarm");
                    outcomes.push(EventOutcome::NotAlarm { parser: parser.name() });
                    continue;
                }
            }

            let outcome = match self.handle_alarm(parser.parse_alarm(&event), &event).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!(parser = parser.name(), error = %e, "Alarm dropped");
                    EventOutcome::Dropped {
                        parser: parser.name(),
                        reason: e.to_string(),
                    }
                }
            };
            outcomes.push(outcome);
        }

        self.set_state(PipelineState::Idle);
        outcomes
    }

    async fn handle_alarm(&self, parsed: Result<ParsedAlarm>, event: &RawEvent) -> Result<EventOutcome> {
        let parsed = parsed?;

        let hint = DeviceHint {
            ip_address: parsed.ip_address.as_deref(),
            device_name: parsed.device_name.as_deref(),
            peer: event.peer(),
        };
        let camera_id = self.resolver.resolve(&hint).ok_or_else(|| {
            Error::Extraction(format!(
                "no camera for device {:?} at {:?}",
                parsed.device_name, parsed.ip_address
            ))
        })?;

        let mut record = AlarmRecord {
            site_id: self.identity.site_id,
            bridge_id: self.identity.bridge_id,
            camera_id,
            alarm_name: parsed.alarm_name,
            alarm_type: parsed.alarm_type,
            alarm_at: parsed.alarm_at,
            snapshot_urls: Vec::new(),
            video_url: None,
        };

        tracing::info!(
            camera_id = camera_id,
            alarm_name = %record.alarm_name,
            alarm_type = %record.alarm_type,
            "Alarm recognized"
        );

        self.set_state(PipelineState::Uploading);
        let artifacts = self.upload_artifacts(&record).await;
        record.snapshot_urls = artifacts.snapshot_urls;
        record.video_url = artifacts.video_url;

        self.set_state(PipelineState::Persisting);
        let mut row = serde_json::to_value(&record)?;
        row["created_at"] = json!(Utc::now());

        match self.store.insert(tables::ALARM, row).await {
            Ok(()) => {
                tracing::info!(camera_id = camera_id, alarm_name = %record.alarm_name, "Alarm persisted");
                Ok(EventOutcome::Persisted(record))
            }
            Err(e) => {
                tracing::error!(camera_id = camera_id, error = %e, "Failed to insert alarm event into database");
                Ok(EventOutcome::PersistFailed(record))
            }
        }
    }

    /// Upload the camera's latest snapshot and buffered stream; failures are logged only
    async fn upload_artifacts(&self, record: &AlarmRecord) -> Artifacts {
        let mut artifacts = Artifacts::default();

        let Some(recorder) = self.fleet.get(record.camera_id) else {
            tracing::warn!(camera_id = record.camera_id, "No recorder for camera, skipping artifacts");
            return artifacts;
        };

        let stamp = Utc::now().format("%Y-%m-%d_%H-%M-%S");
        let prefix = format!(
            "alarm_{}_site_{}_camera_{}",
            stamp, record.site_id, record.camera_id
        );

        if let Some(snapshot) = recorder.get_latest_snapshot().await {
            let filename = format!("{}_snapshot.jpg", prefix);
            match self
                .store
                .upload_artifact(ARTIFACT_BUCKET, &filename, snapshot.data, "image/jpeg")
                .await
            {
                Ok(url) => artifacts.snapshot_urls.push(url),
                Err(e) => {
                    tracing::error!(camera_id = record.camera_id, error = %e, "Failed to upload snapshot");
                }
            }
        }

        let packets = recorder.get_all_packets().await;
        if !packets.is_empty() {
            let video: Vec<u8> = packets.into_iter().flat_map(|p| p.data).collect();
            let filename = format!("{}_video.raw", prefix);
            match self
                .store
                .upload_artifact(ARTIFACT_BUCKET, &filename, video, "application/octet-stream")
                .await
            {
                Ok(url) => artifacts.video_url = Some(url),
                Err(e) => {
                    tracing::error!(camera_id = record.camera_id, error = %e, "Failed to upload recording");
                }
            }
        }

        artifacts
    }
}
