//! Capture source abstraction.
//!
//! Platform capture (desktop duplication, window capture and the like) lives
//! outside this crate. A source only has to push [`RawFrame`]s into the
//! frame queue and report resolution changes; everything downstream is
//! platform independent.
//!
//! [`RawFrame`]: crate::RawFrame

mod surface;
mod synthetic;

pub use surface::{
    CpuSurface, GpuSurface, MappedSurface, StagingSurface, SurfaceGeneration, BYTES_PER_PIXEL,
};
pub use synthetic::SyntheticSource;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::pipeline::FrameSender;
use crate::CaptureError;

/// Signals a running source delivers to the capture manager.
///
/// Each signal has exactly one consumer. Frames go through the bounded
/// drop-oldest queue; `send` never waits, so a source's capture callback is
/// never stalled by a slow encoder.
#[derive(Debug, Clone)]
pub struct SourceSignals {
    /// Frame-arrived signal.
    pub frames: FrameSender,
    /// Resolution-changed signal carrying the new `(width, height)`.
    pub resolution: mpsc::UnboundedSender<(u32, u32)>,
}

impl SourceSignals {
    /// Reports a new capture resolution.
    ///
    /// Ignored once the capture manager has stopped listening.
    pub fn resolution_changed(&self, width: u32, height: u32) {
        let _ = self.resolution.send((width, height));
    }
}

/// A producer of GPU-resident frames.
///
/// Implemented per platform. `start` returns once capture is running;
/// frames then arrive asynchronously through [`SourceSignals`] until
/// `stop` is called or `cancel` fires.
#[async_trait]
pub trait CaptureSource: Send {
    /// Short name for logs and diagnostics.
    fn name(&self) -> &str;

    /// Starts delivering frames.
    ///
    /// # Errors
    ///
    /// Returns [`CaptureError::StartFailed`] if the target cannot be captured.
    async fn start(
        &mut self,
        signals: SourceSignals,
        cancel: CancellationToken,
    ) -> Result<(), CaptureError>;

    /// Stops delivering frames. Safe to call when not started.
    async fn stop(&mut self);
}

/// Creates a capture source for a session's settings.
///
/// Sessions call this once per `start`, so a restarted session gets a fresh
/// source.
pub type CaptureSourceFactory = std::sync::Arc<
    dyn Fn(&crate::RecordingSettings) -> Result<Box<dyn CaptureSource>, CaptureError>
        + Send
        + Sync,
>;
