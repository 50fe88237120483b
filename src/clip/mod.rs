//! Clip writing: turning a packet snapshot into a playable file.
//!
//! A [`ClipWriter`] receives an [`EncodedPacketSnapshot`] that already starts
//! at a keyframe and muxes it into a container at the requested path. The
//! crate ships [`FfmpegClipWriter`], which pipes the elementary stream into
//! an external muxer; tests and hosts can provide their own.

mod ffmpeg;

pub use ffmpeg::{mux_args, resolve_clip_fps, FfmpegClipWriter, MAX_CLIP_FPS};

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use crate::{ClipError, EncodedPacketSnapshot};

/// Result of a clip save request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClipOutcome {
    /// A file was written.
    Written {
        /// Output path.
        path: PathBuf,
        /// Size of the written file in bytes.
        bytes: u64,
    },
    /// Nothing was buffered yet, so no file was produced.
    Skipped,
}

impl ClipOutcome {
    /// Returns `true` if a file was written.
    pub fn is_written(&self) -> bool {
        matches!(self, Self::Written { .. })
    }
}

/// Parameters of one clip save.
#[derive(Debug, Clone, Copy)]
pub struct ClipRequest<'a> {
    /// Output file path. Parent directories are created as needed.
    pub path: &'a Path,
    /// Packets to mux, oldest first.
    pub snapshot: &'a EncodedPacketSnapshot,
    /// Requested clip length. Zero means "whatever the snapshot holds".
    pub duration: Duration,
    /// Frame rate the stream was encoded at, if known.
    pub nominal_fps: Option<u32>,
}

/// A destination that turns encoded packets into a file.
///
/// # Implementation Notes
///
/// - An empty snapshot must yield [`ClipOutcome::Skipped`], never a file
/// - On success the file at `path` must exist and be non-empty
#[async_trait]
pub trait ClipWriter: Send + Sync {
    /// Human-readable name for logging.
    fn name(&self) -> &str;

    /// Writes the snapshot to `request.path`.
    ///
    /// # Errors
    ///
    /// Returns a [`ClipError`] when no usable file could be produced.
    async fn write(&self, request: ClipRequest<'_>) -> Result<ClipOutcome, ClipError>;
}
