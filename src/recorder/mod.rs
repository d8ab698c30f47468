//! Recorder - Per-camera bounded recording buffer
//!
//! ## Responsibilities
//!
//! - Supervise one streaming capture process per camera (GStreamer, FFmpeg fallback)
//! - Keep the last `packet_window` of raw output in memory
//! - Take a JPEG snapshot every `snapshot_interval`
//! - Serve copies of buffered data to the alarm pipeline and command session
//!
//! Each recorder owns two tasks (capture and snapshot). Both observe a child
//! of the process-wide cancellation token and kill their subprocess on exit.

mod buffer;
mod capture;

pub use capture::{select_tool, CaptureTool, CaptureToolKind};

use crate::config::RecorderConfig;
use crate::error::{Error, Result};
use crate::models::{Camera, Packet, Snapshot};
use buffer::{PacketBuffer, SnapshotBuffer};
use capture::READ_CHUNK;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Child;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Delay before a failed capture task gives up
const FAILURE_BACKOFF: Duration = Duration::from_secs(1);

/// Recorder lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    Stopped,
    Starting,
    Running,
    Failed,
    Restarting,
}

/// Stream URL for a camera: the configured one, else the Dahua main stream
pub fn resolve_stream_url(camera: &Camera) -> String {
    if let Some(url) = camera.rtsp_url.as_deref().filter(|u| !u.trim().is_empty()) {
        return url.to_string();
    }

    let credentials = match (camera.username.as_deref(), camera.password.as_deref()) {
        (Some(user), Some(pass)) if !user.is_empty() => format!("{}:{}@", user, pass),
        (Some(user), None) if !user.is_empty() => format!("{}@", user),
        _ => String::new(),
    };

    format!(
        "rtsp://{}{}:554/cam/realmonitor?channel=1&subtype=0",
        credentials, camera.ip_address
    )
}

/// State shared between the recorder handle and its tasks
struct Shared {
    camera_id: i64,
    packets: RwLock<PacketBuffer>,
    snapshots: RwLock<SnapshotBuffer>,
    state: RwLock<RecorderState>,
}

impl Shared {
    async fn set_state(&self, state: RecorderState) {
        let mut current = self.state.write().await;
        if *current != state {
            tracing::debug!(camera_id = self.camera_id, from = ?*current, to = ?state, "Recorder state");
            *current = state;
        }
    }
}

struct RunningTasks {
    cancel: CancellationToken,
    capture: JoinHandle<()>,
    snapshot: JoinHandle<()>,
}

/// Recorder for one camera
pub struct CameraRecorder {
    camera: Camera,
    stream_url: String,
    config: RecorderConfig,
    shared: Arc<Shared>,
    tasks: Mutex<Option<RunningTasks>>,
    shutdown: CancellationToken,
}

impl CameraRecorder {
    /// Create a stopped recorder; `shutdown` is the process-wide token
    pub fn new(camera: Camera, config: RecorderConfig, shutdown: CancellationToken) -> Self {
        let stream_url = resolve_stream_url(&camera);
        let shared = Arc::new(Shared {
            camera_id: camera.id,
            packets: RwLock::new(PacketBuffer::new(config.packet_window, config.max_packets)),
            snapshots: RwLock::new(SnapshotBuffer::new(config.max_snapshots)),
            state: RwLock::new(RecorderState::Stopped),
        });

        Self {
            camera,
            stream_url,
            config,
            shared,
            tasks: Mutex::new(None),
            shutdown,
        }
    }

    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    pub fn camera_id(&self) -> i64 {
        self.camera.id
    }

    pub async fn state(&self) -> RecorderState {
        *self.shared.state.read().await
    }

    /// Start capture and snapshot tasks.
    ///
    /// With no usable capture tool the recorder stays `Stopped`. Tasks left
    /// behind by a failed stream are reaped and capture starts again.
    pub async fn start(&self) -> Result<()> {
        let mut tasks = self.tasks.lock().await;
        if let Some(running) = tasks.as_ref() {
            let failed = *self.shared.state.read().await == RecorderState::Failed;
            if !failed && !running.capture.is_finished() {
                tracing::debug!(camera_id = self.camera.id, "Recorder already running");
                return Ok(());
            }
        }
        if let Some(finished) = tasks.take() {
            tracing::info!(camera_id = self.camera.id, "Reaping failed capture before start");
            self.reap(finished).await;
        }

        self.shared.set_state(RecorderState::Starting).await;

        let Some(tool) = select_tool(&CaptureTool::candidates(&self.config)).await else {
            tracing::error!(camera_id = self.camera.id, "Neither gstreamer nor ffmpeg found");
            self.shared.set_state(RecorderState::Stopped).await;
            return Err(Error::capture(self.camera.id, "no capture tool available"));
        };

        let child = match tool.spawn_stream(self.camera.id, &self.stream_url) {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(camera_id = self.camera.id, error = %e, "Failed to start capture process");
                self.shared.set_state(RecorderState::Failed).await;
                return Err(e);
            }
        };

        let cancel = self.shutdown.child_token();

        let capture = tokio::spawn(run_capture(self.shared.clone(), child, cancel.clone()));
        let snapshot = tokio::spawn(run_snapshots(
            self.shared.clone(),
            tool.clone(),
            self.stream_url.clone(),
            self.config.snapshot_interval,
            self.config.snapshot_timeout,
            cancel.clone(),
        ));

        *tasks = Some(RunningTasks {
            cancel,
            capture,
            snapshot,
        });

        self.shared.set_state(RecorderState::Running).await;
        tracing::info!(
            camera_id = self.camera.id,
            camera_name = %self.camera.camera_name,
            tool = tool.kind.as_str(),
            "Recorder started"
        );
        Ok(())
    }

    /// Stop both tasks and wait until their subprocesses are reaped
    pub async fn stop(&self) {
        self.stop_tasks().await;
        self.shared.set_state(RecorderState::Stopped).await;
        tracing::info!(camera_id = self.camera.id, "Recorder stopped");
    }

    /// Stop then start again
    pub async fn restart(&self) -> Result<()> {
        self.shared.set_state(RecorderState::Restarting).await;
        self.stop_tasks().await;
        tracing::info!(camera_id = self.camera.id, "Recorder restarting");
        self.start().await
    }

    async fn stop_tasks(&self) {
        let running = self.tasks.lock().await.take();
        if let Some(running) = running {
            self.reap(running).await;
        }
    }

    async fn reap(&self, running: RunningTasks) {
        running.cancel.cancel();
        if let Err(e) = running.capture.await {
            tracing::warn!(camera_id = self.camera.id, error = %e, "Capture task join failed");
        }
        if let Err(e) = running.snapshot.await {
            tracing::warn!(camera_id = self.camera.id, error = %e, "Snapshot task join failed");
        }
    }

    /// Append raw capture output stamped with the current time
    pub async fn add_packet(&self, data: Vec<u8>) {
        self.shared.packets.write().await.push_at(data, Utc::now());
    }

    /// Append a JPEG snapshot stamped with the current time
    pub async fn add_snapshot(&self, data: Vec<u8>) {
        self.shared.snapshots.write().await.push_at(data, Utc::now());
    }

    /// Packets captured strictly after `since`
    pub async fn get_packets(&self, since: DateTime<Utc>) -> Vec<Packet> {
        self.shared.packets.read().await.since(since)
    }

    /// Every buffered packet, oldest first
    pub async fn get_all_packets(&self) -> Vec<Packet> {
        self.shared.packets.read().await.all()
    }

    pub async fn get_latest_packets(&self, count: usize) -> Vec<Packet> {
        self.shared.packets.read().await.latest(count)
    }

    pub async fn get_packet_count(&self) -> usize {
        self.shared.packets.read().await.len()
    }

    pub async fn get_snapshots(&self) -> Vec<Snapshot> {
        self.shared.snapshots.read().await.all()
    }

    pub async fn get_latest_snapshot(&self) -> Option<Snapshot> {
        self.shared.snapshots.read().await.latest()
    }

    pub async fn get_snapshot_count(&self) -> usize {
        self.shared.snapshots.read().await.len()
    }
}

async fn run_capture(shared: Arc<Shared>, mut child: Child, cancel: CancellationToken) {
    let camera_id = shared.camera_id;

    let Some(mut stdout) = child.stdout.take() else {
        tracing::error!(camera_id = camera_id, "Capture stdout unavailable");
        shared.set_state(RecorderState::Failed).await;
        let _ = child.start_kill();
        let _ = child.wait().await;
        return;
    };

    let mut chunk = vec![0u8; READ_CHUNK];
    let failed = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break false,
            read = stdout.read(&mut chunk) => match read {
                Ok(0) => {
                    tracing::warn!(camera_id = camera_id, "Capture stream ended");
                    break true;
                }
                Ok(n) => {
                    shared.packets.write().await.push_at(chunk[..n].to_vec(), Utc::now());
                }
                Err(e) => {
                    tracing::error!(camera_id = camera_id, error = %e, "Capture read failed");
                    break true;
                }
            },
        }
    };

    let _ = child.start_kill();
    let _ = child.wait().await;

    if failed {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(FAILURE_BACKOFF) => {}
        }
        shared.set_state(RecorderState::Failed).await;
        // snapshot task goes down with the stream
        cancel.cancel();
    }
}

async fn run_snapshots(
    shared: Arc<Shared>,
    tool: CaptureTool,
    stream_url: String,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) {
    let camera_id = shared.camera_id;
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match tool.capture_frame(camera_id, &stream_url, timeout, &cancel).await {
            Ok(data) => {
                let size = data.len();
                shared.snapshots.write().await.push_at(data, Utc::now());
                tracing::trace!(camera_id = camera_id, size = size, "Snapshot captured");
            }
            Err(Error::Cancelled) => break,
            Err(e) => {
                tracing::debug!(camera_id = camera_id, error = %e, "Snapshot skipped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn camera() -> Camera {
        Camera {
            id: 7,
            camera_name: "Lobby".to_string(),
            ip_address: "192.168.1.20".to_string(),
            username: Some("admin".to_string()),
            password: Some("pw".to_string()),
            rtsp_url: None,
        }
    }

    fn missing_tools() -> RecorderConfig {
        RecorderConfig {
            gstreamer_bin: "/nonexistent/gst-launch-1.0".to_string(),
            ffmpeg_bin: "/nonexistent/ffmpeg".to_string(),
            max_snapshots: 3,
            ..RecorderConfig::default()
        }
    }

    #[test]
    fn test_stream_url_composed_from_credentials() {
        assert_eq!(
            resolve_stream_url(&camera()),
            "rtsp://admin:pw@192.168.1.20:554/cam/realmonitor?channel=1&subtype=0"
        );
    }

    #[test]
    fn test_direct_stream_url_wins() {
        let mut cam = camera();
        cam.rtsp_url = Some("rtsp://10.1.1.1/stream1".to_string());
        assert_eq!(resolve_stream_url(&cam), "rtsp://10.1.1.1/stream1");
    }

    #[test]
    fn test_stream_url_without_credentials() {
        let mut cam = camera();
        cam.username = None;
        cam.password = None;
        assert!(resolve_stream_url(&cam).starts_with("rtsp://192.168.1.20:554/"));
    }

    #[tokio::test]
    async fn test_start_without_tools_stays_stopped() {
        let recorder = CameraRecorder::new(camera(), missing_tools(), CancellationToken::new());

        let result = recorder.start().await;
        assert!(matches!(result, Err(Error::CaptureProcess { camera_id: 7, .. })));
        assert_eq!(recorder.state().await, RecorderState::Stopped);
    }

    #[tokio::test]
    async fn test_buffers_return_copies() {
        let recorder = CameraRecorder::new(camera(), missing_tools(), CancellationToken::new());
        let before = Utc::now() - chrono::Duration::seconds(1);

        recorder.add_packet(vec![1, 2, 3]).await;
        recorder.add_packet(vec![4]).await;
        for i in 0..5u8 {
            recorder.add_snapshot(vec![i]).await;
        }

        let mut packets = recorder.get_packets(before).await;
        packets[0].data.clear();
        assert_eq!(recorder.get_packets(before).await[0].data, vec![1, 2, 3]);
        assert_eq!(recorder.get_packet_count().await, 2);
        assert_eq!(recorder.get_latest_packets(1).await[0].data, vec![4]);

        assert_eq!(recorder.get_snapshot_count().await, 3);
        assert_eq!(recorder.get_latest_snapshot().await.map(|s| s.data), Some(vec![4]));
    }

    #[tokio::test]
    async fn test_stop_without_start() {
        let recorder = CameraRecorder::new(camera(), missing_tools(), CancellationToken::new());
        recorder.stop().await;
        assert_eq!(recorder.state().await, RecorderState::Stopped);
    }

    #[cfg(unix)]
    fn fake_tools(dir: &std::path::Path, stream: &str, snapshot: &str) -> RecorderConfig {
        RecorderConfig {
            gstreamer_bin: capture::fake_tool::write(dir, stream, snapshot)
                .to_string_lossy()
                .into_owned(),
            ffmpeg_bin: "/nonexistent/ffmpeg".to_string(),
            snapshot_interval: Duration::from_millis(100),
            snapshot_timeout: Duration::from_secs(2),
            ..RecorderConfig::default()
        }
    }

    #[cfg(unix)]
    async fn stop_promptly(recorder: &CameraRecorder) {
        tokio::time::timeout(Duration::from_secs(5), recorder.stop())
            .await
            .expect("stop did not return");
        assert_eq!(recorder.state().await, RecorderState::Stopped);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_capture_fills_packets_and_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let config = fake_tools(
            dir.path(),
            "printf 'abcdef'; exec sleep 30",
            capture::fake_tool::JPEG_SNAPSHOT,
        );
        let recorder = CameraRecorder::new(camera(), config, CancellationToken::new());

        recorder.start().await.unwrap();
        assert_eq!(recorder.state().await, RecorderState::Running);

        for _ in 0..100 {
            if recorder.get_packet_count().await > 0 && recorder.get_snapshot_count().await > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let stream: Vec<u8> = recorder
            .get_all_packets()
            .await
            .into_iter()
            .flat_map(|p| p.data)
            .collect();
        assert_eq!(stream, b"abcdef".to_vec());
        assert_eq!(
            recorder.get_latest_snapshot().await.map(|s| s.data),
            Some(b"\xff\xd8jpeg\xff\xd9".to_vec())
        );

        stop_promptly(&recorder).await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_after_stream_failure_restarts_capture() {
        let dir = tempfile::tempdir().unwrap();
        let config = fake_tools(dir.path(), "printf 'abc'; exit 0", "exit 0");
        let recorder = CameraRecorder::new(camera(), config, CancellationToken::new());

        recorder.start().await.unwrap();
        for _ in 0..100 {
            if recorder.state().await == RecorderState::Failed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(recorder.state().await, RecorderState::Failed);

        recorder.start().await.unwrap();
        assert_eq!(recorder.state().await, RecorderState::Running);
        {
            let tasks = recorder.tasks.lock().await;
            let running = tasks.as_ref().expect("tasks after restart");
            assert!(!running.capture.is_finished());
            assert!(!running.cancel.is_cancelled());
        }

        stop_promptly(&recorder).await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_snapshot_timeout_keeps_recorder_running() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = fake_tools(dir.path(), "exec sleep 30", "exec sleep 30");
        config.snapshot_timeout = Duration::from_millis(150);
        let recorder = CameraRecorder::new(camera(), config, CancellationToken::new());

        recorder.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(800)).await;

        assert_eq!(recorder.get_snapshot_count().await, 0);
        assert_eq!(recorder.state().await, RecorderState::Running);
        {
            let tasks = recorder.tasks.lock().await;
            let running = tasks.as_ref().expect("running tasks");
            assert!(!running.snapshot.is_finished());
            assert!(!running.capture.is_finished());
        }

        stop_promptly(&recorder).await;
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_stop_reaps_stream_and_snapshot_processes() {
        let dir = tempfile::tempdir().unwrap();
        let stream_pid = dir.path().join("stream.pid");
        let snapshot_pid = dir.path().join("snapshot.pid");
        let mut config = fake_tools(
            dir.path(),
            &format!("echo $$ > {}; exec sleep 30", stream_pid.display()),
            &format!("echo $$ > {}; exec sleep 30", snapshot_pid.display()),
        );
        config.snapshot_timeout = Duration::from_secs(30);
        let recorder = CameraRecorder::new(camera(), config, CancellationToken::new());

        recorder.start().await.unwrap();
        for _ in 0..100 {
            if stream_pid.exists() && snapshot_pid.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        stop_promptly(&recorder).await;

        for pid_file in [&stream_pid, &snapshot_pid] {
            let pid = std::fs::read_to_string(pid_file).unwrap();
            let proc_entry = format!("/proc/{}", pid.trim());
            assert!(!std::path::Path::new(&proc_entry).exists(), "{} still present", proc_entry);
        }
    }
}
