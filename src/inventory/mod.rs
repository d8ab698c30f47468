//! Inventory - Camera list and alarm-to-camera resolution
//!
//! ## Responsibilities
//!
//! - Load the cameras assigned to this bridge from the backend
//! - Resolve the device named in an alarm to a camera id

use crate::backend::{tables, BackendStore};
use crate::error::Result;
use crate::models::Camera;
use async_trait::async_trait;
use std::net::IpAddr;
use std::sync::Arc;

/// Source of the bridge's camera list
#[async_trait]
pub trait CameraInventory: Send + Sync {
    async fn load_cameras(&self, bridge_id: i64) -> Result<Vec<Camera>>;
}

/// Inventory read from the `camera` table
pub struct StoreInventory {
    store: Arc<dyn BackendStore>,
}

impl StoreInventory {
    pub fn new(store: Arc<dyn BackendStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl CameraInventory for StoreInventory {
    async fn load_cameras(&self, bridge_id: i64) -> Result<Vec<Camera>> {
        let rows = self
            .store
            .query(tables::CAMERA, &[("bridge_id", bridge_id.to_string())])
            .await?;

        let mut cameras = Vec::with_capacity(rows.len());
        for row in rows {
            match serde_json::from_value::<Camera>(row) {
                Ok(camera) => cameras.push(camera),
                Err(e) => {
                    tracing::warn!(bridge_id = bridge_id, error = %e, "Skipping malformed camera row");
                }
            }
        }

        tracing::info!(bridge_id = bridge_id, count = cameras.len(), "Cameras loaded");
        Ok(cameras)
    }
}

/// What an alarm tells us about the device that raised it
#[derive(Debug, Clone, Default)]
pub struct DeviceHint<'a> {
    pub ip_address: Option<&'a str>,
    pub device_name: Option<&'a str>,
    pub peer: Option<IpAddr>,
}

/// Maps alarm device hints to a camera id
pub trait CameraResolver: Send + Sync {
    fn resolve(&self, hint: &DeviceHint<'_>) -> Option<i64>;
}

/// Resolver over a fixed camera list.
///
/// Match order: reported IP, then the submitting peer address, then the
/// camera name (case-insensitive).
pub struct CameraDirectory {
    cameras: Vec<Camera>,
}

impl CameraDirectory {
    pub fn new(cameras: Vec<Camera>) -> Self {
        Self { cameras }
    }

    fn by_ip(&self, ip: &str) -> Option<i64> {
        let ip = ip.trim();
        self.cameras
            .iter()
            .find(|c| c.ip_address.trim() == ip)
            .map(|c| c.id)
    }
}

impl CameraResolver for CameraDirectory {
    fn resolve(&self, hint: &DeviceHint<'_>) -> Option<i64> {
        hint.ip_address
            .and_then(|ip| self.by_ip(ip))
            .or_else(|| hint.peer.and_then(|peer| self.by_ip(&peer.to_string())))
            .or_else(|| {
                let name = hint.device_name?.trim();
                self.cameras
                    .iter()
                    .find(|c| c.camera_name.trim().eq_ignore_ascii_case(name))
                    .map(|c| c.id)
            })
    }
}
