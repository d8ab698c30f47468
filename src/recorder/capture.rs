//! External capture tools (GStreamer, FFmpeg)
//!
//! Both tools write to stdout: a continuous raw video stream for recording,
//! and a single JPEG for snapshots. Every child is spawned with
//! `kill_on_drop(true)` so a dropped handle never leaks a process.

use crate::config::RecorderConfig;
use crate::error::{Error, Result};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

/// Stdout read size for capture output
pub(crate) const READ_CHUNK: usize = 4096;

const JPEG_SOI: [u8; 2] = [0xff, 0xd8];
const JPEG_EOI: [u8; 2] = [0xff, 0xd9];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureToolKind {
    GStreamer,
    Ffmpeg,
}

impl CaptureToolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureToolKind::GStreamer => "gstreamer",
            CaptureToolKind::Ffmpeg => "ffmpeg",
        }
    }
}

/// A capture tool binary and how to drive it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureTool {
    pub kind: CaptureToolKind,
    pub program: String,
}

impl CaptureTool {
    pub fn gstreamer(program: impl Into<String>) -> Self {
        Self {
            kind: CaptureToolKind::GStreamer,
            program: program.into(),
        }
    }

    pub fn ffmpeg(program: impl Into<String>) -> Self {
        Self {
            kind: CaptureToolKind::Ffmpeg,
            program: program.into(),
        }
    }

    /// Candidate tools in preference order
    pub fn candidates(config: &RecorderConfig) -> Vec<CaptureTool> {
        vec![
            Self::gstreamer(config.gstreamer_bin.clone()),
            Self::ffmpeg(config.ffmpeg_bin.clone()),
        ]
    }

    fn version_arg(&self) -> &'static str {
        match self.kind {
            CaptureToolKind::GStreamer => "--version",
            CaptureToolKind::Ffmpeg => "-version",
        }
    }

    /// Run the tool's version command; returns the first output line
    pub async fn probe(&self) -> Result<String> {
        let output = Command::new(&self.program)
            .arg(self.version_arg())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::Internal(format!("{} not found: {}", self.program, e)))?;

        if !output.status.success() {
            return Err(Error::Internal(format!(
                "{} version check failed",
                self.program
            )));
        }

        let version = String::from_utf8_lossy(&output.stdout);
        Ok(version.lines().next().unwrap_or("unknown").to_string())
    }

    /// Arguments for continuous raw video on stdout
    pub fn stream_args(&self, stream_url: &str) -> Vec<String> {
        match self.kind {
            CaptureToolKind::GStreamer => gst_pipeline(stream_url, &["rawvideoparse"]),
            CaptureToolKind::Ffmpeg => [
                "-loglevel", "error",
                "-i", stream_url,
                "-f", "rawvideo",
                "-pix_fmt", "yuv420p",
                "-vf", "scale=640:480",
                "pipe:1",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }

    /// Arguments for a JPEG still on stdout
    pub fn snapshot_args(&self, stream_url: &str) -> Vec<String> {
        match self.kind {
            CaptureToolKind::GStreamer => gst_pipeline(stream_url, &["jpegenc", "quality=85"]),
            CaptureToolKind::Ffmpeg => [
                "-loglevel", "error",
                "-i", stream_url,
                "-vframes", "1",
                "-f", "image2",
                "-update", "1",
                "-q:v", "2",
                "pipe:1",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }

    /// Spawn the streaming process
    pub fn spawn_stream(&self, camera_id: i64, stream_url: &str) -> Result<Child> {
        Command::new(&self.program)
            .args(self.stream_args(stream_url))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::capture(camera_id, format!("{} spawn failed: {}", self.program, e)))
    }

    /// Capture one JPEG frame.
    ///
    /// The child is killed and reaped on every path, including cancellation,
    /// which returns `Error::Cancelled`.
    pub async fn capture_frame(
        &self,
        camera_id: i64,
        stream_url: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let mut child = Command::new(&self.program)
            .args(self.snapshot_args(stream_url))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::capture(camera_id, format!("{} spawn failed: {}", self.program, e)))?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::capture(camera_id, "snapshot stdout unavailable"))?;

        let read = async {
            let mut frame = Vec::new();
            let mut chunk = [0u8; READ_CHUNK];
            loop {
                let n = stdout.read(&mut chunk).await?;
                if n == 0 {
                    break;
                }
                frame.extend_from_slice(&chunk[..n]);
                if complete_jpeg_len(&frame).is_some() {
                    break;
                }
            }
            Ok::<_, std::io::Error>(frame)
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = tokio::time::timeout(timeout, read) => Some(result),
        };

        let _ = child.start_kill();
        let _ = child.wait().await;

        let Some(result) = result else {
            return Err(Error::Cancelled);
        };

        match result {
            Ok(Ok(frame)) => match complete_jpeg_len(&frame) {
                Some((start, end)) => Ok(frame[start..end].to_vec()),
                None if frame.is_empty() => Err(Error::capture(camera_id, "snapshot returned empty output")),
                None => Ok(frame),
            },
            Ok(Err(e)) => Err(Error::capture(camera_id, format!("snapshot read failed: {}", e))),
            Err(_) => {
                tracing::warn!(
                    camera_id = camera_id,
                    timeout_ms = timeout.as_millis() as u64,
                    tool = self.kind.as_str(),
                    "Snapshot timeout, process killed"
                );
                Err(Error::capture(
                    camera_id,
                    format!("snapshot timeout ({}ms)", timeout.as_millis()),
                ))
            }
        }
    }
}

/// First tool whose version probe succeeds
pub async fn select_tool(candidates: &[CaptureTool]) -> Option<CaptureTool> {
    for tool in candidates {
        match tool.probe().await {
            Ok(version) => {
                tracing::debug!(tool = tool.kind.as_str(), version = %version, "Capture tool available");
                return Some(tool.clone());
            }
            Err(e) => {
                tracing::debug!(tool = tool.kind.as_str(), error = %e, "Capture tool unavailable");
            }
        }
    }
    None
}

fn gst_pipeline(stream_url: &str, sink_chain: &[&str]) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-q".into(),
        "rtspsrc".into(),
        format!("location={}", stream_url),
        "latency=0".into(),
        "drop-on-latency=true".into(),
    ];
    for element in ["rtph264depay", "h264parse", "avdec_h264", "videoconvert"] {
        args.push("!".into());
        args.push(element.into());
    }
    args.push("!".into());
    args.extend(sink_chain.iter().map(|s| s.to_string()));
    args.push("!".into());
    args.push("fdsink".into());
    args
}

/// Byte range of the first complete JPEG (SOI..=EOI) in `data`
fn complete_jpeg_len(data: &[u8]) -> Option<(usize, usize)> {
    let start = data.windows(2).position(|w| w == JPEG_SOI)?;
    let end = data[start + 2..]
        .windows(2)
        .position(|w| w == JPEG_EOI)?;
    Some((start, start + 2 + end + 2))
}
