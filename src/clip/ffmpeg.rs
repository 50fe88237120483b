//! Clip writer backed by an external `ffmpeg` muxer.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

use super::{ClipOutcome, ClipRequest, ClipWriter};
use crate::{ClipError, EncodedPacketSnapshot};

/// Highest frame rate handed to the muxer.
pub const MAX_CLIP_FPS: u32 = 240;

/// Picks the frame rate the muxer should assume for `snapshot`.
///
/// A raw elementary stream carries no timing, so the muxer spaces frames at
/// a fixed rate. When the snapshot covers less time than requested (the
/// session has not been running that long, or frames were dropped), the
/// rate is estimated from the number of coded pictures over the pts span so
/// playback length matches wall time. Otherwise `nominal_fps` is used,
/// falling back to `fallback_fps`. The result is clamped to `1..=240`.
pub fn resolve_clip_fps(
    snapshot: &EncodedPacketSnapshot,
    requested: Duration,
    nominal_fps: Option<u32>,
    fallback_fps: u32,
) -> u32 {
    let configured = nominal_fps.filter(|&fps| fps > 0).unwrap_or(fallback_fps);

    let pictures = snapshot.access_unit_count();
    let estimate = snapshot.pts_span_ms().and_then(|span_ms| {
        let requested_ms = requested.as_millis();
        let shorter = requested_ms == 0 || (span_ms as u128) < requested_ms;
        if span_ms <= 0 || pictures == 0 || !shorter {
            return None;
        }
        let fps = pictures as f64 / (span_ms as f64 / 1000.0);
        Some(fps.round() as u32)
    });

    estimate.unwrap_or(configured).clamp(1, MAX_CLIP_FPS)
}

/// Arguments for muxing an H.264 elementary stream from stdin into `path`.
pub fn mux_args(fps: u32, duration: Duration, path: &Path) -> Vec<String> {
    let mut args = vec![
        "-y".to_string(),
        "-r".to_string(),
        fps.to_string(),
        "-f".to_string(),
        "h264".to_string(),
        "-i".to_string(),
        "pipe:0".to_string(),
        "-c".to_string(),
        "copy".to_string(),
    ];
    if !duration.is_zero() {
        args.push("-t".to_string());
        args.push(format!("{:.3}", duration.as_secs_f64()));
    }
    args.push(path.to_string_lossy().into_owned());
    args
}

/// Muxes snapshots with an `ffmpeg` child process.
///
/// # Example
///
/// ```
/// use instant_replay::FfmpegClipWriter;
///
/// let writer = FfmpegClipWriter::new("ffmpeg").with_fallback_fps(30);
/// assert_eq!(writer.fallback_fps(), 30);
/// ```
#[derive(Debug, Clone)]
pub struct FfmpegClipWriter {
    program: PathBuf,
    fallback_fps: u32,
}

impl FfmpegClipWriter {
    /// Creates a writer that runs `program`.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            fallback_fps: 60,
        }
    }

    /// Frame rate used when the stream's rate is unknown.
    #[must_use]
    pub fn with_fallback_fps(mut self, fps: u32) -> Self {
        self.fallback_fps = fps.max(1);
        self
    }

    /// Frame rate used when the stream's rate is unknown.
    pub fn fallback_fps(&self) -> u32 {
        self.fallback_fps
    }
}

#[async_trait]
impl ClipWriter for FfmpegClipWriter {
    fn name(&self) -> &str {
        "ffmpeg"
    }

    async fn write(&self, request: ClipRequest<'_>) -> Result<ClipOutcome, ClipError> {
        let ClipRequest {
            path,
            snapshot,
            duration,
            nominal_fps,
        } = request;

        if snapshot.is_empty() {
            tracing::debug!(path = %path.display(), "empty snapshot, clip skipped");
            return Ok(ClipOutcome::Skipped);
        }

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ClipError::io(parent, e))?;
        }

        let fps = resolve_clip_fps(snapshot, duration, nominal_fps, self.fallback_fps);
        let args = mux_args(fps, duration, path);
        tracing::debug!(
            program = %self.program.display(),
            ?args,
            packets = snapshot.len(),
            bytes = snapshot.total_bytes(),
            "spawning clip muxer"
        );

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ClipError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut text = String::new();
                if let Err(e) = stderr.read_to_string(&mut text).await {
                    tracing::debug!("muxer stderr read failed: {e}");
                }
                text
            })
        });

        if let Some(mut stdin) = child.stdin.take() {
            for packet in snapshot {
                match stdin.write_all(&packet.data).await {
                    Ok(()) => {}
                    // The muxer stops reading once it reaches `-t`.
                    Err(e) if e.kind() == ErrorKind::BrokenPipe => break,
                    Err(e) => return Err(ClipError::io(path, e)),
                }
            }
            match stdin.shutdown().await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::BrokenPipe => {}
                Err(e) => return Err(ClipError::io(path, e)),
            }
        }

        let status = child.wait().await.map_err(|e| ClipError::io(path, e))?;
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        if !status.success() {
            tracing::warn!(%status, path = %path.display(), "clip muxer failed");
            return Err(ClipError::MuxFailed {
                status,
                stderr: stderr.trim().to_string(),
            });
        }

        let bytes = match tokio::fs::metadata(path).await {
            Ok(meta) if meta.len() > 0 => meta.len(),
            _ => {
                return Err(ClipError::EmptyOutput {
                    path: path.to_path_buf(),
                })
            }
        };

        tracing::info!(path = %path.display(), bytes, fps, "clip written");
        Ok(ClipOutcome::Written {
            path: path.to_path_buf(),
            bytes,
        })
    }
}
