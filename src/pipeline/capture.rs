//! Capture manager: bridges a capture source to the active encoder.
//!
//! ```text
//! source callback → frame queue (drop oldest) → consumer task → encoder
//!        └──── resolution signal ──→ resolution task → encoder.reconfigure
//! ```
//!
//! The source never waits on the encoder. When the consumer falls behind,
//! the queue drops the oldest frame and counts it; nothing is raised.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{frame_queue, FrameReceiver};
use crate::encoder::HardwareEncoder;
use crate::source::{CaptureSource, SourceSignals};
use crate::{CaptureError, RecordingSettings, ReplayError, SessionStatus, StatusCallback};

/// How long `stop` waits for the consumer to hand over its last frame.
const CONSUMER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Throughput counters of a capture manager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Frames accepted into the queue, including frames later dropped.
    pub enqueued: u64,
    /// Frames handed to the encoder.
    pub encoded: u64,
    /// Frames evicted from a full queue.
    pub dropped: u64,
    /// Frames accepted but neither encoded nor dropped yet.
    ///
    /// Computed as `enqueued - encoded - dropped`. Evicted frames are
    /// subtracted as well, so this is the frames still waiting in the queue
    /// or in the consumer's hands, and it returns to zero after `stop`.
    pub pending: u64,
}

struct Running {
    cancel: CancellationToken,
    receiver: Arc<FrameReceiver>,
    consumer: JoinHandle<()>,
    resolution: JoinHandle<()>,
}

impl Running {
    /// Ends the consumer and resolution tasks and releases queued frames.
    async fn shut_down(self) -> Arc<FrameReceiver> {
        self.cancel.cancel();
        self.receiver.close();

        let mut consumer = self.consumer;
        if tokio::time::timeout(CONSUMER_JOIN_TIMEOUT, &mut consumer)
            .await
            .is_err()
        {
            tracing::warn!("frame consumer did not finish in time, aborting");
            consumer.abort();
        }
        self.resolution.abort();

        let discarded = self.receiver.discard_pending();
        if discarded > 0 {
            tracing::debug!(discarded, "released queued frames on stop");
        }
        self.receiver
    }
}

/// Owns the frame queue between one capture source and one encoder.
///
/// Dropping a manager that is running, or that was dropped in the middle of
/// [`start`](Self::start), stops the source and the encoder on a background
/// task.
pub struct CaptureManager {
    source: Option<Box<dyn CaptureSource>>,
    encoder: Arc<dyn HardwareEncoder>,
    queue_capacity: usize,
    encoded: Arc<AtomicU64>,
    encode_errors: Arc<AtomicU64>,
    encoder_failed: Arc<AtomicBool>,
    status: Option<StatusCallback>,
    running: Option<Running>,
    last_stats: SessionStats,
    encoder_started: bool,
}

impl CaptureManager {
    /// Creates a stopped manager.
    pub fn new(
        source: Box<dyn CaptureSource>,
        encoder: Arc<dyn HardwareEncoder>,
        queue_capacity: usize,
    ) -> Self {
        Self {
            source: Some(source),
            encoder,
            queue_capacity: queue_capacity.max(1),
            encoded: Arc::new(AtomicU64::new(0)),
            encode_errors: Arc::new(AtomicU64::new(0)),
            encoder_failed: Arc::new(AtomicBool::new(false)),
            status: None,
            running: None,
            last_stats: SessionStats::default(),
            encoder_started: false,
        }
    }

    /// Reports `failed:<reason>` through `callback` when the encoder stops
    /// on its own while frames are still arriving.
    #[must_use]
    pub fn with_status(mut self, callback: StatusCallback) -> Self {
        self.status = Some(callback);
        self
    }

    /// The encoder frames are delivered to.
    pub fn encoder(&self) -> &Arc<dyn HardwareEncoder> {
        &self.encoder
    }

    /// Name of the capture source.
    pub fn source_name(&self) -> &str {
        self.source.as_deref().map_or("detached", |source| source.name())
    }

    /// Returns `true` between a successful `start` and `stop`.
    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Returns `true` once the encoder has stopped itself during this run.
    pub fn encoder_failed(&self) -> bool {
        self.encoder_failed.load(Ordering::Acquire)
    }

    /// Starts the encoder, the consumer task and then the source.
    ///
    /// `cancel` only governs the start: once it fires, everything already
    /// started is stopped again and [`ReplayError::Cancelled`] is returned.
    /// The same happens on any other failure.
    ///
    /// # Errors
    ///
    /// - [`ReplayError::AlreadyRunning`] on a second call
    /// - [`ReplayError::Encoder`] if the encoder fails to start
    /// - [`ReplayError::Capture`] if the source fails to start
    /// - [`ReplayError::Cancelled`] if `cancel` fires first
    pub async fn start(
        &mut self,
        settings: &RecordingSettings,
        cancel: &CancellationToken,
    ) -> Result<(), ReplayError> {
        if self.running.is_some() {
            return Err(ReplayError::AlreadyRunning);
        }
        self.encoder_failed.store(false, Ordering::Release);
        let token = CancellationToken::new();

        let (sender, receiver) = frame_queue(self.queue_capacity);
        let receiver = Arc::new(receiver);
        let (resolution_tx, resolution_rx) = mpsc::unbounded_channel();

        // From here on a teardown owes the encoder a stop, even if this
        // future is dropped while the encoder is still starting.
        self.encoder_started = true;
        let encoder_result = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(ReplayError::Cancelled),
            result = self.encoder.start(settings) => result.map_err(ReplayError::from),
        };
        if let Err(e) = encoder_result {
            self.stop().await;
            return Err(e);
        }

        let resolution = spawn_resolution_task(Arc::clone(&self.encoder), resolution_rx);
        let consumer = spawn_consumer(
            Arc::clone(&receiver),
            Arc::clone(&self.encoder),
            ConsumerCounters {
                encoded: Arc::clone(&self.encoded),
                errors: Arc::clone(&self.encode_errors),
                failed: Arc::clone(&self.encoder_failed),
            },
            self.status.clone(),
        );
        self.running = Some(Running {
            cancel: token.clone(),
            receiver,
            consumer,
            resolution,
        });

        let signals = SourceSignals {
            frames: sender,
            resolution: resolution_tx,
        };
        let started = match self.source.as_mut() {
            Some(source) => tokio::select! {
                biased;
                () = cancel.cancelled() => Err(ReplayError::Cancelled),
                result = source.start(signals, token) => result.map_err(ReplayError::from),
            },
            None => Err(CaptureError::start_failed("capture source released").into()),
        };

        if let Err(e) = started {
            tracing::warn!(source = self.source_name(), "capture start failed: {e}");
            self.stop().await;
            return Err(e);
        }

        tracing::info!(
            source = self.source_name(),
            encoder = %self.encoder.backend_name(),
            queue = self.queue_capacity,
            "capture manager running"
        );
        Ok(())
    }

    /// Forwards a resolution change to the encoder.
    pub fn reconfigure(&self, width: u32, height: u32) {
        self.encoder.reconfigure(width, height);
    }

    /// Stops the source, drains the consumer and stops the encoder.
    ///
    /// Idempotent. Frames still queued when the consumer is cancelled are
    /// released without being encoded.
    pub async fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            if let Some(source) = self.source.as_mut() {
                source.stop().await;
            }
            let receiver = running.shut_down().await;
            self.last_stats = self.snapshot(&receiver);
            tracing::info!(
                enqueued = self.last_stats.enqueued,
                encoded = self.last_stats.encoded,
                dropped = self.last_stats.dropped,
                "capture manager stopped"
            );
        }

        if std::mem::take(&mut self.encoder_started) {
            self.encoder.stop().await;
        }
    }

    /// Current counters. After `stop` the final values are kept.
    pub fn stats(&self) -> SessionStats {
        match &self.running {
            Some(running) => self.snapshot(&running.receiver),
            None => self.last_stats,
        }
    }

    /// Encode calls that returned an error.
    pub fn encode_errors(&self) -> u64 {
        self.encode_errors.load(Ordering::Relaxed)
    }

    fn snapshot(&self, receiver: &FrameReceiver) -> SessionStats {
        let enqueued = receiver.enqueued();
        let dropped = receiver.dropped();
        let encoded = self.encoded.load(Ordering::Relaxed);
        SessionStats {
            enqueued,
            encoded,
            dropped,
            pending: enqueued.saturating_sub(encoded).saturating_sub(dropped),
        }
    }
}

impl std::fmt::Debug for CaptureManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureManager")
            .field("source", &self.source_name())
            .field("encoder", &self.encoder.backend_name())
            .field("queue_capacity", &self.queue_capacity)
            .field("running", &self.running.is_some())
            .finish()
    }
}

impl Drop for CaptureManager {
    fn drop(&mut self) {
        let running = self.running.take();
        let encoder_started = std::mem::take(&mut self.encoder_started);
        if running.is_none() && !encoder_started {
            return;
        }

        if let Some(running) = &running {
            running.cancel.cancel();
            running.receiver.close();
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("capture manager dropped outside a runtime, skipping teardown");
            return;
        };

        tracing::debug!("capture manager dropped while active, tearing down in background");
        let mut source = self.source.take();
        let encoder = Arc::clone(&self.encoder);
        handle.spawn(async move {
            if let Some(running) = running {
                if let Some(source) = source.as_mut() {
                    source.stop().await;
                }
                running.shut_down().await;
            }
            if encoder_started {
                encoder.stop().await;
            }
        });
    }
}

struct ConsumerCounters {
    encoded: Arc<AtomicU64>,
    errors: Arc<AtomicU64>,
    failed: Arc<AtomicBool>,
}

fn spawn_consumer(
    receiver: Arc<FrameReceiver>,
    encoder: Arc<dyn HardwareEncoder>,
    counters: ConsumerCounters,
    status: Option<StatusCallback>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = receiver.recv().await {
            // Counted as encoded once handed over, even if the backend skips it.
            let result = encoder.encode(frame).await;
            counters.encoded.fetch_add(1, Ordering::Relaxed);
            let Err(e) = result else {
                continue;
            };

            let count = counters.errors.fetch_add(1, Ordering::Relaxed) + 1;
            if !e.stops_backend() || counters.failed.swap(true, Ordering::AcqRel) {
                tracing::debug!(count, "encode failed: {e}");
                continue;
            }
            tracing::error!(
                backend = %encoder.backend_name(),
                "encoder stopped while capturing: {e}"
            );
            if let Some(callback) = &status {
                callback(SessionStatus::Failed(format!("encoder stopped: {e}")));
            }
        }
        tracing::debug!("frame consumer finished");
    })
}

fn spawn_resolution_task(
    encoder: Arc<dyn HardwareEncoder>,
    mut changes: mpsc::UnboundedReceiver<(u32, u32)>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some((width, height)) = changes.recv().await {
            tracing::info!(width, height, "capture resolution changed");
            encoder.reconfigure(width, height);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clip::ClipOutcome;
    use crate::encoder::BackendKind;
    use crate::source::SyntheticSource;
    use crate::{CaptureError, ClipError, EncoderError, RawFrame};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::path::Path;

    #[derive(Default)]
    struct RecordingEncoder {
        fail_start: bool,
        frames: AtomicU64,
        resizes: Mutex<Vec<(u32, u32)>>,
        stops: AtomicU64,
        encode_delay: Option<Duration>,
        fail_after: Option<u64>,
    }

    #[async_trait]
    impl HardwareEncoder for RecordingEncoder {
        fn backend_name(&self) -> String {
            "recording".to_string()
        }

        fn kind(&self) -> BackendKind {
            BackendKind::Pipe
        }

        async fn start(&self, _settings: &RecordingSettings) -> Result<(), EncoderError> {
            if self.fail_start {
                return Err(EncoderError::unsupported("test"));
            }
            Ok(())
        }

        async fn encode(&self, frame: RawFrame) -> Result<(), EncoderError> {
            if let Some(delay) = self.encode_delay {
                tokio::time::sleep(delay).await;
            }
            frame.release();
            let index = self.frames.fetch_add(1, Ordering::SeqCst);
            match self.fail_after {
                Some(limit) if index == limit => Err(EncoderError::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "encoder input pipe closed",
                ))),
                Some(limit) if index > limit => Err(EncoderError::NotStarted),
                _ => Ok(()),
            }
        }

        fn reconfigure(&self, width: u32, height: u32) {
            self.resizes.lock().push((width, height));
        }

        async fn flush_recent(
            &self,
            _path: &Path,
            _duration: Duration,
        ) -> Result<ClipOutcome, ClipError> {
            Ok(ClipOutcome::Skipped)
        }

        async fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }

        fn debug_status(&self) -> String {
            String::new()
        }
    }

    struct FailingSource;

    #[async_trait]
    impl CaptureSource for FailingSource {
        fn name(&self) -> &str {
            "failing"
        }

        async fn start(
            &mut self,
            _signals: SourceSignals,
            _cancel: CancellationToken,
        ) -> Result<(), CaptureError> {
            Err(CaptureError::start_failed("no such window"))
        }

        async fn stop(&mut self) {}
    }

    /// A source whose start only returns once its token is cancelled.
    #[derive(Default)]
    struct HangingSource {
        stops: Arc<AtomicU64>,
    }

    #[async_trait]
    impl CaptureSource for HangingSource {
        fn name(&self) -> &str {
            "hanging"
        }

        async fn start(
            &mut self,
            _signals: SourceSignals,
            cancel: CancellationToken,
        ) -> Result<(), CaptureError> {
            tokio::select! {
                () = cancel.cancelled() => Err(CaptureError::start_failed("cancelled")),
                () = tokio::time::sleep(Duration::from_secs(3600)) => Ok(()),
            }
        }

        async fn stop(&mut self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn wait_for_frames(source_limit: u64, stats: impl Fn() -> SessionStats) {
        for _ in 0..200 {
            let s = stats();
            if s.enqueued >= source_limit && s.pending == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_frames_flow_to_encoder() {
        let encoder = Arc::new(RecordingEncoder::default());
        let source = SyntheticSource::new(8, 8, 200).with_frame_limit(20);
        let mut manager = CaptureManager::new(Box::new(source), encoder.clone(), 4);

        manager
            .start(&RecordingSettings::default(), &CancellationToken::new())
            .await
            .unwrap();
        wait_for_frames(20, || manager.stats()).await;
        manager.stop().await;

        let stats = manager.stats();
        assert_eq!(stats.enqueued, 20);
        assert_eq!(stats.encoded + stats.dropped, 20);
        assert_eq!(stats.pending, 0);
        assert_eq!(encoder.frames.load(Ordering::SeqCst), stats.encoded);
        assert_eq!(encoder.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_slow_encoder_drops_oldest() {
        let encoder = Arc::new(RecordingEncoder {
            encode_delay: Some(Duration::from_millis(40)),
            ..Default::default()
        });
        let source = SyntheticSource::new(4, 4, 500).with_frame_limit(50);
        let mut manager = CaptureManager::new(Box::new(source), encoder.clone(), 2);

        manager
            .start(&RecordingSettings::default(), &CancellationToken::new())
            .await
            .unwrap();
        wait_for_frames(50, || {
            let mut s = manager.stats();
            s.pending = 0;
            s
        })
        .await;
        manager.stop().await;

        let stats = manager.stats();
        assert_eq!(stats.enqueued, 50);
        assert!(stats.dropped > 0, "{stats:?}");
        assert!(stats.encoded + stats.dropped <= stats.enqueued);
    }

    #[tokio::test]
    async fn test_resolution_change_reaches_encoder() {
        let encoder = Arc::new(RecordingEncoder::default());
        let source = SyntheticSource::new(8, 8, 200)
            .with_resolution_change(5, 16, 8)
            .with_frame_limit(10);
        let mut manager = CaptureManager::new(Box::new(source), encoder.clone(), 4);

        manager
            .start(&RecordingSettings::default(), &CancellationToken::new())
            .await
            .unwrap();
        wait_for_frames(10, || manager.stats()).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.stop().await;

        assert_eq!(*encoder.resizes.lock(), vec![(16, 8)]);
    }

    #[tokio::test]
    async fn test_source_failure_tears_down() {
        let encoder = Arc::new(RecordingEncoder::default());
        let mut manager = CaptureManager::new(Box::new(FailingSource), encoder.clone(), 4);

        let err = manager
            .start(&RecordingSettings::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ReplayError::Capture(_)));
        assert!(!manager.is_running());
        assert_eq!(encoder.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_encoder_failure_is_fatal() {
        let encoder = Arc::new(RecordingEncoder {
            fail_start: true,
            ..Default::default()
        });
        let source = SyntheticSource::new(8, 8, 30);
        let mut manager = CaptureManager::new(Box::new(source), encoder, 4);

        let err = manager
            .start(&RecordingSettings::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ReplayError::Encoder(_)));
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let encoder = Arc::new(RecordingEncoder::default());
        let source = SyntheticSource::new(8, 8, 30);
        let mut manager = CaptureManager::new(Box::new(source), encoder, 4);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = manager
            .start(&RecordingSettings::default(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ReplayError::Cancelled));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let encoder = Arc::new(RecordingEncoder::default());
        let source = SyntheticSource::new(8, 8, 30);
        let mut manager = CaptureManager::new(Box::new(source), encoder, 4);
        manager.stop().await;
        manager
            .start(&RecordingSettings::default(), &CancellationToken::new())
            .await
            .unwrap();
        manager.stop().await;
        manager.stop().await;
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn test_dropped_mid_start_tears_down() {
        let encoder = Arc::new(RecordingEncoder::default());
        let source = HangingSource::default();
        let source_stops = Arc::clone(&source.stops);
        let mut manager = CaptureManager::new(Box::new(source), encoder.clone(), 4);

        let settings = RecordingSettings::default();
        let cancel = CancellationToken::new();
        let timed_out = tokio::time::timeout(
            Duration::from_millis(100),
            manager.start(&settings, &cancel),
        )
        .await
        .is_err();
        assert!(timed_out);

        drop(manager);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(encoder.stops.load(Ordering::SeqCst), 1);
        assert_eq!(source_stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_after_encoder_started() {
        let encoder = Arc::new(RecordingEncoder::default());
        let source = HangingSource::default();
        let source_stops = Arc::clone(&source.stops);
        let mut manager = CaptureManager::new(Box::new(source), encoder.clone(), 4);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = manager
            .start(&RecordingSettings::default(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ReplayError::Cancelled));
        assert!(!manager.is_running());
        assert_eq!(encoder.stops.load(Ordering::SeqCst), 1);
        assert_eq!(source_stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_encoder_failure_while_running_is_reported_once() {
        let encoder = Arc::new(RecordingEncoder {
            fail_after: Some(3),
            ..Default::default()
        });
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&statuses);
        let callback = crate::event::status_callback(move |status| sink.lock().push(status));
        let source = SyntheticSource::new(8, 8, 200).with_frame_limit(10);
        let mut manager =
            CaptureManager::new(Box::new(source), encoder.clone(), 16).with_status(callback);

        manager
            .start(&RecordingSettings::default(), &CancellationToken::new())
            .await
            .unwrap();
        wait_for_frames(10, || manager.stats()).await;
        assert!(manager.encoder_failed());
        manager.stop().await;

        let statuses = statuses.lock();
        assert_eq!(statuses.len(), 1);
        assert!(
            statuses[0].to_string().starts_with("failed:encoder stopped:"),
            "{statuses:?}"
        );
        assert_eq!(manager.encode_errors(), 7);
    }
}
