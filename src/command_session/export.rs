//! Buffer export to the local filesystem

use crate::error::Result;
use crate::recording_fleet::RecordingFleet;
use chrono::Utc;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Files written by one export, relative to `directory`
#[derive(Debug, Default, Serialize)]
pub struct ExportSummary {
    pub directory: String,
    pub snapshot_files: Vec<String>,
    pub video_files: Vec<String>,
}

/// Write every buffered snapshot and each camera's packet stream to a
/// subdirectory of `root` named after `request_id`.
///
/// Files are created exclusively, so concurrent or repeated exports never
/// overwrite each other. A file that fails to write is logged and skipped;
/// only a directory that cannot be created fails the whole export.
pub async fn export_buffers(root: &Path, request_id: &str, fleet: &RecordingFleet) -> Result<ExportSummary> {
    let directory = export_dir_name(request_id);
    let dir = root.join(&directory);
    fs::create_dir_all(&dir).await?;

    let mut summary = ExportSummary {
        directory,
        ..ExportSummary::default()
    };

    let mut snapshots: Vec<_> = fleet.get_all_snapshots().await.into_iter().collect();
    snapshots.sort_by_key(|(id, _)| *id);
    for (camera_id, camera_snapshots) in snapshots {
        for (i, snapshot) in camera_snapshots.iter().enumerate() {
            let filename = format!(
                "camera_{}_snapshot_{}_{}.jpg",
                camera_id,
                snapshot.captured_at.timestamp(),
                i
            );
            match write_new(dir.join(&filename), &[&snapshot.data]).await {
                Ok(()) => summary.snapshot_files.push(filename),
                Err(e) => {
                    tracing::error!(camera_id = camera_id, file = %filename, error = %e, "Failed to save snapshot");
                }
            }
        }
    }

    let now = Utc::now().timestamp();
    let mut packets: Vec<_> = fleet.get_all_packets().await.into_iter().collect();
    packets.sort_by_key(|(id, _)| *id);
    for (camera_id, camera_packets) in packets {
        if camera_packets.is_empty() {
            continue;
        }

        let filename = format!("camera_{}_video_{}.raw", camera_id, now);
        let chunks: Vec<&[u8]> = camera_packets.iter().map(|p| p.data.as_slice()).collect();
        match write_new(dir.join(&filename), &chunks).await {
            Ok(()) => summary.video_files.push(filename),
            Err(e) => {
                tracing::error!(camera_id = camera_id, file = %filename, error = %e, "Failed to save video data");
            }
        }
    }

    tracing::info!(
        dir = %dir.display(),
        snapshots = summary.snapshot_files.len(),
        videos = summary.video_files.len(),
        "Buffers exported"
    );
    Ok(summary)
}

/// Request ids come from the network; keep them to one path component
fn export_dir_name(request_id: &str) -> String {
    let name: String = request_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    format!("request_{}", name)
}

async fn write_new(path: PathBuf, chunks: &[&[u8]]) -> std::io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
        .await?;
    for chunk in chunks {
        file.write_all(chunk).await?;
    }
    file.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RecorderConfig;
    use crate::models::Camera;
    use tokio_util::sync::CancellationToken;

    fn fleet() -> RecordingFleet {
        let camera = Camera {
            id: 3,
            camera_name: "Gate".to_string(),
            ip_address: "192.168.1.30".to_string(),
            username: None,
            password: None,
            rtsp_url: None,
        };
        RecordingFleet::new(vec![camera], &RecorderConfig::default(), &CancellationToken::new())
    }

    #[tokio::test]
    async fn test_concurrent_exports_keep_their_own_files() {
        let root = tempfile::tempdir().unwrap();
        let fleet = fleet();
        let recorder = fleet.get(3).unwrap();
        recorder.add_snapshot(vec![0xff, 0xd8, 0xff, 0xd9]).await;
        recorder.add_packet(vec![1, 2, 3]).await;
        recorder.add_packet(vec![4, 5]).await;

        let (a, b) = tokio::join!(
            export_buffers(root.path(), "req-a", &fleet),
            export_buffers(root.path(), "req-b", &fleet),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_ne!(a.directory, b.directory);

        for summary in [&a, &b] {
            assert_eq!(summary.video_files.len(), 1);
            assert_eq!(summary.snapshot_files.len(), 1);
            let dir = root.path().join(&summary.directory);
            let video = std::fs::read(dir.join(&summary.video_files[0])).unwrap();
            assert_eq!(video, vec![1, 2, 3, 4, 5]);
            let snapshot = std::fs::read(dir.join(&summary.snapshot_files[0])).unwrap();
            assert_eq!(snapshot, vec![0xff, 0xd8, 0xff, 0xd9]);
        }
    }

    #[tokio::test]
    async fn test_repeated_request_does_not_truncate() {
        let root = tempfile::tempdir().unwrap();
        let fleet = fleet();
        let recorder = fleet.get(3).unwrap();
        recorder.add_packet(vec![9, 9, 9]).await;

        let first = export_buffers(root.path(), "req-1", &fleet).await.unwrap();
        let second = export_buffers(root.path(), "req-1", &fleet).await.unwrap();

        assert_eq!(first.video_files.len(), 1);
        if second.video_files.is_empty() {
            let path = root.path().join(&first.directory).join(&first.video_files[0]);
            assert_eq!(std::fs::read(path).unwrap(), vec![9, 9, 9]);
        } else {
            // the clock moved to the next second between exports
            assert_ne!(second.video_files[0], first.video_files[0]);
        }
    }

    #[test]
    fn test_export_dir_name_is_one_component() {
        assert_eq!(export_dir_name("req-3"), "request_req-3");
        assert_eq!(export_dir_name("../../etc"), "request_______etc");
        assert_eq!(export_dir_name("a/b"), "request_a_b");
    }
}
