//! Synthetic capture source for running the pipeline without a platform
//! capture API.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::{CaptureSource, CpuSurface, SourceSignals, SurfaceGeneration};
use crate::{CaptureError, RawFrame, RecordingSettings};

/// Device id reported by synthetic surfaces.
const SYNTHETIC_DEVICE_ID: u64 = 0x5359_4e54;

/// Produces solid-color CPU surfaces at a fixed rate.
///
/// The color cycles with the frame index so consecutive frames differ. A
/// resolution change can be scripted to exercise encoder restarts: the
/// source bumps its surface generation (invalidating frames already in
/// flight), reports the new size and continues at that size.
///
/// # Example
///
/// ```
/// use instant_replay::source::SyntheticSource;
///
/// let source = SyntheticSource::new(320, 180, 30)
///     .with_resolution_change(90, 640, 360)
///     .with_frame_limit(300);
/// assert_eq!(source.frames_emitted(), 0);
/// ```
#[derive(Debug)]
pub struct SyntheticSource {
    width: u32,
    height: u32,
    fps: u32,
    resize: Option<(u64, u32, u32)>,
    frame_limit: Option<u64>,
    generation: SurfaceGeneration,
    frames_emitted: Arc<AtomicU64>,
    task: Option<(CancellationToken, JoinHandle<()>)>,
}

impl SyntheticSource {
    /// Creates a source producing `width`x`height` frames at `fps`.
    pub fn new(width: u32, height: u32, fps: u32) -> Self {
        Self {
            width: width.max(1),
            height: height.max(1),
            fps: fps.max(1),
            resize: None,
            frame_limit: None,
            generation: SurfaceGeneration::new(),
            frames_emitted: Arc::new(AtomicU64::new(0)),
            task: None,
        }
    }

    /// Creates a source matching a session's size and frame rate.
    pub fn from_settings(settings: &RecordingSettings) -> Self {
        Self::new(settings.width, settings.height, settings.effective_fps())
    }

    /// Switches to `width`x`height` after `after_frames` frames.
    #[must_use]
    pub fn with_resolution_change(mut self, after_frames: u64, width: u32, height: u32) -> Self {
        self.resize = Some((after_frames, width.max(1), height.max(1)));
        self
    }

    /// Stops producing after `frames` frames.
    #[must_use]
    pub fn with_frame_limit(mut self, frames: u64) -> Self {
        self.frame_limit = Some(frames);
        self
    }

    /// Number of frames handed to the frame queue so far.
    pub fn frames_emitted(&self) -> u64 {
        self.frames_emitted.load(Ordering::Relaxed)
    }

    /// Generation counter shared with every surface this source produced.
    pub fn generation(&self) -> &SurfaceGeneration {
        &self.generation
    }
}

#[async_trait]
impl CaptureSource for SyntheticSource {
    fn name(&self) -> &str {
        "synthetic"
    }

    async fn start(
        &mut self,
        signals: SourceSignals,
        cancel: CancellationToken,
    ) -> Result<(), CaptureError> {
        if self.task.is_some() {
            return Err(CaptureError::start_failed("synthetic source already running"));
        }
        if cancel.is_cancelled() {
            return Err(CaptureError::start_failed("cancelled before start"));
        }

        let token = cancel.child_token();
        let mut producer = Producer {
            width: self.width,
            height: self.height,
            resize: self.resize,
            frame_limit: self.frame_limit,
            generation: self.generation.clone(),
            emitted: Arc::clone(&self.frames_emitted),
            signals,
        };
        let period = std::time::Duration::from_secs_f64(1.0 / f64::from(self.fps));
        let task_token = token.clone();

        let handle = tokio::spawn(async move {
            let started = Instant::now();
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = task_token.cancelled() => break,
                    _ = ticker.tick() => {
                        // Timestamps start at 1 ms so they always count as known.
                        let elapsed = started.elapsed().as_millis();
                        let ts = i64::try_from(elapsed).unwrap_or(i64::MAX - 1) + 1;
                        if !producer.emit(ts) {
                            break;
                        }
                    }
                }
            }
            tracing::debug!(
                frames = producer.emitted.load(Ordering::Relaxed),
                "synthetic source finished"
            );
        });

        tracing::info!(
            width = self.width,
            height = self.height,
            fps = self.fps,
            "synthetic source started"
        );
        self.task = Some((token, handle));
        Ok(())
    }

    async fn stop(&mut self) {
        if let Some((token, handle)) = self.task.take() {
            token.cancel();
            let _ = handle.await;
        }
    }
}

struct Producer {
    width: u32,
    height: u32,
    resize: Option<(u64, u32, u32)>,
    frame_limit: Option<u64>,
    generation: SurfaceGeneration,
    emitted: Arc<AtomicU64>,
    signals: SourceSignals,
}

impl Producer {
    /// Emits one frame. Returns `false` when production should end.
    fn emit(&mut self, timestamp_ms: i64) -> bool {
        let index = self.emitted.load(Ordering::Relaxed);
        if self.frame_limit.is_some_and(|limit| index >= limit) {
            return false;
        }

        if let Some((after, width, height)) = self.resize {
            if index == after {
                self.resize = None;
                self.generation.advance();
                self.width = width;
                self.height = height;
                self.signals.resolution_changed(width, height);
            }
        }

        let shade = (index % 256) as u8;
        let surface = CpuSurface::solid(
            SYNTHETIC_DEVICE_ID,
            self.width,
            self.height,
            [shade, shade.wrapping_mul(3), 255 - shade, 255],
        )
        .bound_to(&self.generation);

        let frame = RawFrame::new(Arc::new(surface), timestamp_ms);
        if self.signals.frames.send(frame).is_closed() {
            return false;
        }
        self.emitted.fetch_add(1, Ordering::Relaxed);
        true
    }
}
