//! State shared by the process-backed encoders.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::process::{EncoderCounters, EncoderProcess};
use super::{BackendContext, EncodeArgs, FramePool, RETENTION_HEADROOM};
use crate::clip::{ClipOutcome, ClipRequest};
use crate::packet::PacketRingBuffer;
use crate::{ClipError, EncoderError, RecordingSettings};

/// Lifecycle flags, counters and the packet ring of one backend instance.
pub(crate) struct ProcessBackendCore {
    pub codec: String,
    pub context: BackendContext,
    pub counters: Arc<EncoderCounters>,
    pub pool: Arc<FramePool>,
    started: AtomicBool,
    running: AtomicBool,
    pending_resize: Mutex<Option<(u32, u32)>>,
    ring: Mutex<Option<Arc<PacketRingBuffer>>>,
    settings: Mutex<Option<RecordingSettings>>,
}

impl ProcessBackendCore {
    pub fn new(codec: impl Into<String>, context: BackendContext) -> Self {
        Self {
            codec: codec.into(),
            context,
            counters: Arc::new(EncoderCounters::default()),
            pool: Arc::new(FramePool::new()),
            started: AtomicBool::new(false),
            running: AtomicBool::new(false),
            pending_resize: Mutex::new(None),
            ring: Mutex::new(None),
            settings: Mutex::new(None),
        }
    }

    /// Claims the one allowed `start`, checks the codec and creates the ring.
    pub async fn begin_start(
        &self,
        settings: &RecordingSettings,
    ) -> Result<Arc<PacketRingBuffer>, EncoderError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(EncoderError::AlreadyStarted);
        }
        self.context.capabilities.ensure_encoder(&self.codec).await?;

        let ring = Arc::new(PacketRingBuffer::new(
            settings.retention() + RETENTION_HEADROOM,
            self.context.max_ring_bytes,
        ));
        *self.ring.lock() = Some(Arc::clone(&ring));
        *self.settings.lock() = Some(settings.clone());
        Ok(ring)
    }

    /// Launches an encoder process for `width`x`height` input.
    pub fn spawn_process(&self, width: u32, height: u32) -> Result<EncoderProcess, EncoderError> {
        let settings = self.settings.lock().clone().ok_or(EncoderError::NotStarted)?;
        let ring = self.ring().ok_or(EncoderError::NotStarted)?;
        let args = EncodeArgs::new(self.codec.clone())
            .with_size(width, height)
            .with_fps(settings.effective_fps())
            .with_bitrate(settings.effective_bitrate())
            .build();
        EncoderProcess::spawn(
            &self.context.ffmpeg_path,
            &args,
            ring,
            Arc::clone(&self.counters),
        )
    }

    pub fn ring(&self) -> Option<Arc<PacketRingBuffer>> {
        self.ring.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    pub fn request_resize(&self, width: u32, height: u32) {
        *self.pending_resize.lock() = Some((width.max(1), height.max(1)));
    }

    pub fn take_resize(&self) -> Option<(u32, u32)> {
        self.pending_resize.lock().take()
    }

    pub fn record_restart(&self, width: u32, height: u32) {
        self.counters.restarts.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            codec = %self.codec,
            width,
            height,
            "restarting encoder process for new resolution"
        );
    }

    pub fn record_copy_failure(&self, reason: &dyn std::fmt::Display) {
        let failures = self.counters.gpu_copy_failures.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::debug!(failures, "frame readback skipped: {reason}");
    }

    /// Reason string for a broken input pipe, with the encoder's last words.
    pub fn pipe_failure(&self, error: &std::io::Error) -> EncoderError {
        let detail = match self.counters.last_stderr() {
            Some(line) => format!("{error} ({line})"),
            None => error.to_string(),
        };
        EncoderError::Io(std::io::Error::new(error.kind(), detail))
    }

    /// Snapshots the ring and hands it to the clip writer.
    pub async fn flush_recent(
        &self,
        path: &Path,
        duration: Duration,
    ) -> Result<ClipOutcome, ClipError> {
        let Some(ring) = self.ring() else {
            return Ok(ClipOutcome::Skipped);
        };
        let snapshot = ring.snapshot_last(duration);
        let nominal_fps = self.settings.lock().as_ref().map(|s| s.effective_fps());
        self.context
            .clip_writer
            .write(ClipRequest {
                path,
                snapshot: &snapshot,
                duration,
                nominal_fps,
            })
            .await
    }

    pub fn debug_status(&self) -> String {
        let ring = self.ring().map(|r| r.stats()).unwrap_or_default();
        self.counters
            .status_line(&self.codec, self.is_running(), ring)
    }
}
