//! Pipe encoder: readback frames into a bounded queue drained by a writer
//! task into an external encoder process.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use tokio::io::AsyncWriteExt;
use tokio::process::ChildStdin;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use super::backend::ProcessBackendCore;
use super::process::{join_with_timeout, EncoderCounters, EncoderProcess};
use super::{BackendContext, BackendKind, FramePool, FrameReadback, HardwareEncoder};
use crate::clip::ClipOutcome;
use crate::{ClipError, EncoderError, RawFrame, RecordingSettings};

const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_millis(750);

struct PendingInput {
    data: Vec<u8>,
    timestamp_ms: i64,
}

/// One encoder process plus the queue and task feeding it.
struct PipeSession {
    process: EncoderProcess,
    producer: HeapProd<PendingInput>,
    wake: Arc<Notify>,
    closed: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
    writer: JoinHandle<()>,
}

struct PipeState {
    width: u32,
    height: u32,
    readback: FrameReadback,
    session: Option<PipeSession>,
}

/// Primary encoder backend.
///
/// `encode` copies the frame to CPU memory and pushes it into a small
/// queue; a writer task feeds the queue to the encoder's stdin and a reader
/// task turns its stdout into packets for the ring buffer. When the queue
/// is full the new frame is dropped. A resolution change restarts the
/// process with the new size on the next `encode`.
pub struct PipeEncoder {
    core: ProcessBackendCore,
    state: Mutex<PipeState>,
}

impl PipeEncoder {
    /// Creates a backend that encodes with `codec`.
    pub fn new(codec: impl Into<String>, context: BackendContext) -> Self {
        Self {
            core: ProcessBackendCore::new(codec, context),
            state: Mutex::new(PipeState {
                width: 0,
                height: 0,
                readback: FrameReadback::new(),
                session: None,
            }),
        }
    }

    fn spawn_session(&self, width: u32, height: u32) -> Result<PipeSession, EncoderError> {
        let mut process = self.core.spawn_process(width, height)?;
        let stdin = process
            .take_stdin()
            .ok_or_else(|| EncoderError::unsupported("encoder process has no stdin"))?;

        let capacity = self.core.context.encoder_queue_capacity.max(1);
        let (producer, consumer) = HeapRb::<PendingInput>::new(capacity).split();
        let wake = Arc::new(Notify::new());
        let closed = Arc::new(AtomicBool::new(false));
        let failed = Arc::new(AtomicBool::new(false));

        let writer = tokio::spawn(write_input_loop(
            stdin,
            consumer,
            InputSignals {
                wake: Arc::clone(&wake),
                closed: Arc::clone(&closed),
                failed: Arc::clone(&failed),
            },
            Arc::clone(&self.core.counters),
            Arc::clone(&self.core.pool),
        ));

        Ok(PipeSession {
            process,
            producer,
            wake,
            closed,
            failed,
            writer,
        })
    }

    async fn restart(
        &self,
        state: &mut PipeState,
        width: u32,
        height: u32,
    ) -> Result<(), EncoderError> {
        if let Some(session) = state.session.take() {
            stop_session(session, &self.core.counters).await;
        }
        self.core.record_restart(width, height);
        state.width = width;
        state.height = height;
        state.session = Some(self.spawn_session(width, height)?);
        Ok(())
    }

    async fn fail(&self, state: &mut PipeState, error: EncoderError) -> EncoderError {
        tracing::warn!(codec = %self.core.codec, "pipe encoder failed: {error}");
        self.core.set_running(false);
        if let Some(session) = state.session.take() {
            stop_session(session, &self.core.counters).await;
        }
        error
    }
}

#[async_trait]
impl HardwareEncoder for PipeEncoder {
    fn backend_name(&self) -> String {
        format!("pipe:{}", self.core.codec)
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Pipe
    }

    async fn start(&self, settings: &RecordingSettings) -> Result<(), EncoderError> {
        self.core.begin_start(settings).await?;

        let mut state = self.state.lock().await;
        let (width, height) = (settings.width.max(1), settings.height.max(1));
        state.session = Some(self.spawn_session(width, height)?);
        state.width = width;
        state.height = height;
        self.core.set_running(true);

        tracing::info!(
            codec = %self.core.codec,
            width,
            height,
            fps = settings.effective_fps(),
            "pipe encoder started"
        );
        Ok(())
    }

    async fn encode(&self, frame: RawFrame) -> Result<(), EncoderError> {
        if !self.core.is_running() {
            frame.release();
            return Err(EncoderError::NotStarted);
        }

        let mut state = self.state.lock().await;

        let writer_failed = state
            .session
            .as_ref()
            .map_or(true, |s| s.failed.load(Ordering::Acquire));
        if writer_failed {
            frame.release();
            let error = std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "encoder input pipe closed",
            );
            let error = self.core.pipe_failure(&error);
            return Err(self.fail(&mut state, error).await);
        }

        if !frame.is_valid() {
            self.core.record_copy_failure(&crate::CaptureError::SurfaceInvalidated);
            frame.release();
            return Ok(());
        }

        let (width, height) = frame.dimensions();
        let resize_requested = self.core.take_resize().is_some();
        if resize_requested || (width, height) != (state.width, state.height) {
            if let Err(e) = self.restart(&mut state, width, height).await {
                frame.release();
                return Err(self.fail(&mut state, e).await);
            }
        }

        let data = match state.readback.read(&frame, &self.core.pool) {
            Ok(data) => data,
            Err(e) => {
                self.core.record_copy_failure(&e);
                frame.release();
                return Ok(());
            }
        };
        let timestamp_ms = frame.timestamp_ms();
        frame.release();

        let Some(session) = state.session.as_mut() else {
            self.core.pool.give_back(data);
            return Err(EncoderError::NotStarted);
        };

        match session.producer.try_push(PendingInput { data, timestamp_ms }) {
            Ok(()) => {
                self.core
                    .counters
                    .queued_buffers
                    .fetch_add(1, Ordering::Relaxed);
                session.wake.notify_one();
            }
            Err(rejected) => {
                let drops = self
                    .core
                    .counters
                    .queue_drops
                    .fetch_add(1, Ordering::Relaxed)
                    + 1;
                tracing::trace!(drops, "encoder input queue full, frame dropped");
                self.core.pool.give_back(rejected.data);
            }
        }
        Ok(())
    }

    fn reconfigure(&self, width: u32, height: u32) {
        tracing::debug!(width, height, "pipe encoder reconfigure requested");
        self.core.request_resize(width, height);
    }

    async fn flush_recent(
        &self,
        path: &Path,
        duration: Duration,
    ) -> Result<ClipOutcome, ClipError> {
        self.core.flush_recent(path, duration).await
    }

    async fn stop(&self) {
        self.core.set_running(false);
        let mut state = self.state.lock().await;
        if let Some(session) = state.session.take() {
            stop_session(session, &self.core.counters).await;
            tracing::info!(codec = %self.core.codec, "pipe encoder stopped");
        }
        state.readback.release();
    }

    fn debug_status(&self) -> String {
        self.core.debug_status()
    }
}

/// Closes the input queue, lets the writer drain briefly, then shuts the
/// process down.
async fn stop_session(session: PipeSession, counters: &EncoderCounters) {
    let PipeSession {
        process,
        producer,
        wake,
        closed,
        writer,
        ..
    } = session;

    closed.store(true, Ordering::Release);
    wake.notify_one();
    join_with_timeout(writer, WRITER_DRAIN_TIMEOUT).await;
    drop(producer);
    counters.queued_buffers.store(0, Ordering::Relaxed);

    process.shutdown().await;
}

struct InputSignals {
    wake: Arc<Notify>,
    closed: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
}

async fn write_input_loop(
    mut stdin: ChildStdin,
    mut queue: HeapCons<PendingInput>,
    signals: InputSignals,
    counters: Arc<EncoderCounters>,
    pool: Arc<FramePool>,
) {
    loop {
        let notified = signals.wake.notified();

        while let Some(input) = queue.try_pop() {
            let result = stdin.write_all(&input.data).await;
            counters.queued_buffers.fetch_sub(1, Ordering::Relaxed);
            match result {
                Ok(()) => counters.frame_written(input.data.len(), input.timestamp_ms),
                Err(e) => {
                    tracing::warn!("encoder stdin write failed: {e}");
                    signals.failed.store(true, Ordering::Release);
                    pool.give_back(input.data);
                    return;
                }
            }
            pool.give_back(input.data);
        }

        if signals.closed.load(Ordering::Acquire) {
            break;
        }
        notified.await;
    }

    if let Err(e) = stdin.flush().await {
        tracing::debug!("encoder stdin flush failed: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::FfmpegCapabilities;
    use crate::source::CpuSurface;
    use crate::ReplayConfig;

    fn context_with(program: &str, listing: &str) -> BackendContext {
        let config = ReplayConfig {
            ffmpeg_path: program.into(),
            ..Default::default()
        };
        let mut context = BackendContext::from_config(&config);
        context.capabilities = Arc::new(FfmpegCapabilities::from_listing(program, listing));
        context
    }

    fn small_settings() -> RecordingSettings {
        RecordingSettings {
            width: 4,
            height: 4,
            fps: 30,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_unlisted_codec_is_unsupported() {
        let encoder = PipeEncoder::new("h264_nvenc", context_with("ffmpeg", " V....D libx264 x"));
        let err = encoder.start(&small_settings()).await.unwrap_err();
        assert!(matches!(err, EncoderError::Unsupported { .. }));
        assert!(encoder.debug_status().contains("running=false"));
        encoder.stop().await;
    }

    #[tokio::test]
    async fn test_start_is_allowed_once() {
        let encoder = PipeEncoder::new("h264_nvenc", context_with("ffmpeg", ""));
        assert!(encoder.start(&small_settings()).await.is_err());
        let err = encoder.start(&small_settings()).await.unwrap_err();
        assert!(matches!(err, EncoderError::AlreadyStarted));
    }

    #[tokio::test]
    async fn test_encode_before_start_releases_frame() {
        let encoder = PipeEncoder::new("libx264", context_with("ffmpeg", ""));
        let surface: Arc<dyn crate::source::GpuSurface> =
            Arc::new(CpuSurface::solid(1, 4, 4, [0; 4]));
        let frame = RawFrame::new(Arc::clone(&surface), 1);
        let err = encoder.encode(frame).await.unwrap_err();
        assert!(matches!(err, EncoderError::NotStarted));
        assert_eq!(Arc::strong_count(&surface), 1);
    }

    #[tokio::test]
    async fn test_flush_before_start_is_noop() {
        let encoder = PipeEncoder::new("libx264", context_with("ffmpeg", ""));
        let dir = tempfile::tempdir().unwrap();
        let outcome = encoder
            .flush_recent(&dir.path().join("clip.mp4"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(outcome, ClipOutcome::Skipped);
    }

    #[test]
    fn test_backend_name() {
        let encoder = PipeEncoder::new("h264_nvenc", context_with("ffmpeg", ""));
        assert_eq!(encoder.backend_name(), "pipe:h264_nvenc");
        assert_eq!(encoder.kind(), BackendKind::Pipe);
    }

    fn annexb_frame(width: u32, index: usize, ts: i64) -> RawFrame {
        let header = if index % 10 == 0 { 0x65 } else { 0x41 };
        let mut pixels = vec![0xAB; width as usize * 4];
        pixels[..6].copy_from_slice(&[0, 0, 0, 1, header, index as u8]);
        let surface = CpuSurface::from_pixels(1, width, 1, pixels).unwrap();
        RawFrame::new(Arc::new(surface), ts)
    }

    fn counter(status: &str, key: &str) -> u64 {
        status
            .split(';')
            .find_map(|kv| kv.strip_prefix(&format!("{key}=")))
            .and_then(|v| v.parse().ok())
            .unwrap()
    }

    /// A script that ignores its arguments and echoes stdin stands in for
    /// the encoder: frames whose pixels are Annex B units come back out as
    /// packets.
    #[cfg(unix)]
    #[tokio::test]
    async fn test_frames_flow_through_passthrough_process() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-encoder.sh");
        std::fs::write(&script, "#!/bin/sh\nexec cat\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut context = context_with("unused", " V....D libx264 x");
        context.ffmpeg_path = script.clone();
        let encoder = PipeEncoder::new("libx264", context);
        let settings = RecordingSettings {
            width: 4,
            height: 1,
            fps: 30,
            ..Default::default()
        };
        encoder.start(&settings).await.unwrap();

        for i in 0..20 {
            encoder.encode(annexb_frame(4, i, 1000 + i as i64 * 33)).await.unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        encoder.reconfigure(8, 1);
        for i in 20..30 {
            encoder.encode(annexb_frame(8, i, 1000 + i as i64 * 33)).await.unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        encoder.stop().await;

        let status = encoder.debug_status();
        assert!(status.contains("running=false"), "{status}");
        assert_eq!(counter(&status, "restarts"), 1);
        let delivered = counter(&status, "packets");
        assert_eq!(delivered + counter(&status, "queueDrops"), 30, "{status}");
        assert_eq!(counter(&status, "ringPackets"), delivered);

        // Encoding after stop is rejected and does not restart anything.
        let err = encoder.encode(annexb_frame(8, 0, 5000)).await.unwrap_err();
        assert!(matches!(err, EncoderError::NotStarted));
    }

    /// The stand-in encoder exits at once, so its input pipe breaks while
    /// frames are still arriving.
    #[cfg(unix)]
    #[tokio::test]
    async fn test_writer_failure_stops_backend() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("dying-encoder.sh");
        std::fs::write(&script, "#!/bin/sh\nexit 0\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut context = context_with("unused", " V....D libx264 x");
        context.ffmpeg_path = script.clone();
        let encoder = PipeEncoder::new("libx264", context);
        encoder.start(&small_settings()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut failure = None;
        for i in 0..100 {
            let frame = RawFrame::new(Arc::new(CpuSurface::solid(1, 4, 4, [9; 4])), 1 + i);
            if let Err(e) = encoder.encode(frame).await {
                failure = Some(e);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let failure = failure.expect("input pipe never broke");
        assert!(matches!(failure, EncoderError::Io(_)), "{failure}");
        assert!(failure.stops_backend());
        assert!(encoder.debug_status().contains("running=false"));

        let frame = RawFrame::new(Arc::new(CpuSurface::solid(1, 4, 4, [9; 4])), 500);
        let err = encoder.encode(frame).await.unwrap_err();
        assert!(matches!(err, EncoderError::NotStarted));
        encoder.stop().await;
    }
}
