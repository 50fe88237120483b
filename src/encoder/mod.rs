//! Hardware encoder abstraction and its backends.
//!
//! Every backend implements [`HardwareEncoder`]. The session only ever talks
//! to an [`AdaptiveEncoder`], which starts the first backend of an ordered
//! candidate list that works on this machine and delegates to it.
//!
//! | Backend | Input path | Output |
//! |---------|-----------|--------|
//! | [`PipeEncoder`] | readback into a queue drained by a writer task | external process, packet ring |
//! | [`ReadbackEncoder`] | readback written synchronously per frame | external process, packet ring |
//! | [`VendorNativeEncoder`] | native vendor session | not available in this build |

mod backend;
mod capabilities;
mod command;
mod native;
mod pipe;
mod process;
mod readback;
mod selector;
mod staging;

pub use capabilities::FfmpegCapabilities;
pub use command::EncodeArgs;
pub use native::VendorNativeEncoder;
pub use pipe::PipeEncoder;
pub use readback::ReadbackEncoder;
pub use selector::{policy_candidates, AdaptiveEncoder, BackendSpec, EncoderCandidate};
pub use staging::{FramePool, FrameReadback, MAX_POOLED_BUFFERS};

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::clip::{ClipOutcome, ClipWriter, FfmpegClipWriter};
use crate::{ClipError, EncoderError, RawFrame, RecordingSettings, ReplayConfig};

/// Extra retention kept by encoder ring buffers beyond the clip length, so a
/// full-length clip can still reach back to a keyframe before its window.
pub const RETENTION_HEADROOM: Duration = Duration::from_secs(4);

/// The closed set of backend variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Native vendor encode session.
    VendorNative,
    /// External process fed through an internal queue.
    Pipe,
    /// External process fed synchronously per frame.
    Readback,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::VendorNative => "native",
            Self::Pipe => "pipe",
            Self::Readback => "readback",
        })
    }
}

/// A video encoder that keeps its recent output for clip saves.
///
/// Lifecycle: `start` once, then any number of `encode`/`reconfigure`/
/// `flush_recent` calls, then `stop`. Methods take `&self`; backends use
/// interior mutability so the capture consumer task and the save path can
/// share one instance.
///
/// # Implementation Notes
///
/// - `start` must fail with [`EncoderError::Unsupported`] when a dependency
///   is missing so the selector can fall back
/// - `encode` consumes the frame in every case, including errors
/// - `encode` may drop frames under load but must not wait unboundedly
/// - `flush_recent` before anything was encoded returns
///   [`ClipOutcome::Skipped`]
/// - `stop` is idempotent and safe after a failed `start`
#[async_trait]
pub trait HardwareEncoder: Send + Sync {
    /// Backend identity, e.g. `pipe:h264_nvenc`.
    fn backend_name(&self) -> String;

    /// Which variant this backend is.
    fn kind(&self) -> BackendKind;

    /// Acquires processes and devices for `settings`.
    async fn start(&self, settings: &RecordingSettings) -> Result<(), EncoderError>;

    /// Encodes one frame.
    async fn encode(&self, frame: RawFrame) -> Result<(), EncoderError>;

    /// Announces a resolution change; applied lazily on the next `encode`.
    fn reconfigure(&self, width: u32, height: u32);

    /// Writes the last `duration` of output to `path`.
    async fn flush_recent(&self, path: &Path, duration: Duration)
        -> Result<ClipOutcome, ClipError>;

    /// Releases every resource. Idempotent.
    async fn stop(&self);

    /// One-line diagnostic snapshot. Not for control flow.
    fn debug_status(&self) -> String;
}

/// Shared dependencies handed to every backend a selector constructs.
#[derive(Clone)]
pub struct BackendContext {
    /// Encoder program.
    pub ffmpeg_path: PathBuf,
    /// Cached encoder listing of `ffmpeg_path`.
    pub capabilities: Arc<FfmpegCapabilities>,
    /// Writer used by `flush_recent`.
    pub clip_writer: Arc<dyn ClipWriter>,
    /// Capacity of the pipe backend's input queue.
    pub encoder_queue_capacity: usize,
    /// Byte ceiling of each backend's packet ring.
    pub max_ring_bytes: usize,
}

impl BackendContext {
    /// Builds a context from engine configuration with the ffmpeg clip writer.
    pub fn from_config(config: &ReplayConfig) -> Self {
        let clip_writer =
            FfmpegClipWriter::new(config.ffmpeg_path.clone()).with_fallback_fps(config.clip_fps);
        Self {
            ffmpeg_path: config.ffmpeg_path.clone(),
            capabilities: Arc::new(FfmpegCapabilities::new(config.ffmpeg_path.clone())),
            clip_writer: Arc::new(clip_writer),
            encoder_queue_capacity: config.encoder_queue_capacity.max(1),
            max_ring_bytes: config.max_ring_bytes,
        }
    }

    /// Replaces the clip writer.
    #[must_use]
    pub fn with_clip_writer(mut self, writer: Arc<dyn ClipWriter>) -> Self {
        self.clip_writer = writer;
        self
    }
}

impl fmt::Debug for BackendContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendContext")
            .field("ffmpeg_path", &self.ffmpeg_path)
            .field("clip_writer", &self.clip_writer.name())
            .field("encoder_queue_capacity", &self.encoder_queue_capacity)
            .field("max_ring_bytes", &self.max_ring_bytes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoder_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Arc<dyn HardwareEncoder>>();
    }

    #[test]
    fn test_context_from_config() {
        let config = ReplayConfig {
            encoder_queue_capacity: 0,
            ..Default::default()
        };
        let context = BackendContext::from_config(&config);
        assert_eq!(context.encoder_queue_capacity, 1);
        assert_eq!(context.clip_writer.name(), "ffmpeg");
        assert_eq!(context.max_ring_bytes, 256 * 1024 * 1024);
    }

    #[test]
    fn test_backend_kind_display() {
        assert_eq!(BackendKind::Pipe.to_string(), "pipe");
        assert_eq!(BackendKind::Readback.to_string(), "readback");
        assert_eq!(BackendKind::VendorNative.to_string(), "native");
    }
}
