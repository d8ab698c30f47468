//! RecordingFleet - Owns every camera recorder
//!
//! ## Responsibilities
//!
//! - Build one `CameraRecorder` per camera at startup
//! - Start/stop all recorders; one camera failing never blocks the others
//! - Fan-out reads for the alarm pipeline and command session
//!
//! The recorder map is fixed after construction, so it needs no lock.

use crate::config::RecorderConfig;
use crate::error::{Error, Result};
use crate::models::{Camera, Packet, Snapshot};
use crate::recorder::{CameraRecorder, RecorderState};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Fleet of per-camera recorders
pub struct RecordingFleet {
    recorders: HashMap<i64, Arc<CameraRecorder>>,
}

impl RecordingFleet {
    /// Build (but do not start) a recorder for every camera
    pub fn new(cameras: Vec<Camera>, config: &RecorderConfig, shutdown: &CancellationToken) -> Self {
        let recorders = cameras
            .into_iter()
            .map(|camera| {
                let id = camera.id;
                let recorder = CameraRecorder::new(camera, config.clone(), shutdown.clone());
                (id, Arc::new(recorder))
            })
            .collect();

        Self { recorders }
    }

    /// Start every recorder; returns how many are running
    pub async fn start_all(&self) -> usize {
        let results = join_all(self.recorders.values().map(|recorder| {
            let recorder = recorder.clone();
            async move { (recorder.camera_id(), recorder.start().await) }
        }))
        .await;

        let mut started = 0;
        for (camera_id, result) in results {
            match result {
                Ok(()) => started += 1,
                Err(e) => {
                    tracing::error!(camera_id = camera_id, error = %e, "Failed to start recorder");
                }
            }
        }

        tracing::info!(started = started, total = self.recorders.len(), "Recording fleet started");
        started
    }

    /// Stop every recorder and wait for their subprocesses
    pub async fn stop_all(&self) {
        join_all(self.recorders.values().map(|r| r.stop())).await;
        tracing::info!(total = self.recorders.len(), "Recording fleet stopped");
    }

    /// Restart a single camera
    pub async fn restart(&self, camera_id: i64) -> Result<()> {
        let recorder = self
            .get(camera_id)
            .ok_or_else(|| Error::capture(camera_id, "unknown camera"))?;
        recorder.restart().await
    }

    pub fn get(&self, camera_id: i64) -> Option<Arc<CameraRecorder>> {
        self.recorders.get(&camera_id).cloned()
    }

    pub fn camera_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.recorders.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn cameras(&self) -> Vec<Camera> {
        let mut cameras: Vec<Camera> = self.recorders.values().map(|r| r.camera().clone()).collect();
        cameras.sort_by_key(|c| c.id);
        cameras
    }

    pub fn len(&self) -> usize {
        self.recorders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recorders.is_empty()
    }

    /// Snapshot copies for every camera
    pub async fn get_all_snapshots(&self) -> HashMap<i64, Vec<Snapshot>> {
        let mut all = HashMap::with_capacity(self.recorders.len());
        for (id, recorder) in &self.recorders {
            all.insert(*id, recorder.get_snapshots().await);
        }
        all
    }

    /// Packet copies for every camera
    pub async fn get_all_packets(&self) -> HashMap<i64, Vec<Packet>> {
        let mut all = HashMap::with_capacity(self.recorders.len());
        for (id, recorder) in &self.recorders {
            all.insert(*id, recorder.get_all_packets().await);
        }
        all
    }

    /// Lifecycle state of every camera
    pub async fn states(&self) -> HashMap<i64, RecorderState> {
        let mut states = HashMap::with_capacity(self.recorders.len());
        for (id, recorder) in &self.recorders {
            states.insert(*id, recorder.state().await);
        }
        states
    }
}
