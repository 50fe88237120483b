//! Error types for instant-replay.
//!
//! Errors are split into two categories:
//! - **Fatal errors** ([`ReplayError`]): prevent a session from starting
//! - **Recoverable conditions**: dropped frames, discarded bitstream bytes and
//!   failed backend candidates are absorbed, counted, and surfaced through
//!   [`ClipSession::debug_status`](crate::ClipSession::debug_status)
//!
//! Component-level errors ([`EncoderError`], [`ClipError`], [`CaptureError`])
//! only reach the caller when they make the whole pipeline unusable or when a
//! requested clip could not be written.

use std::path::PathBuf;
use std::process::ExitStatus;

/// Fatal errors that prevent a replay session from starting.
///
/// Returned from [`ReplayBuilder::start()`](crate::ReplayBuilder::start) and
/// [`ClipSession::start()`](crate::ClipSession::start). Whatever was partially
/// started has already been torn down when one of these is returned.
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    /// No capture source factory was configured before starting.
    #[error("no capture source configured - use capture_source() before calling start()")]
    NoCaptureSource,

    /// The capture source could not be created or started.
    #[error("capture source failed: {0}")]
    Capture(#[from] CaptureError),

    /// Every encoder backend candidate failed to start.
    #[error(transparent)]
    Encoder(#[from] EncoderError),

    /// The start was cancelled before the pipeline was running.
    #[error("session start cancelled")]
    Cancelled,

    /// `start()` was called on a session that is already running.
    #[error("session already running")]
    AlreadyRunning,
}

/// One failed attempt recorded by the adaptive encoder selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendAttempt {
    /// Backend identity (e.g. `pipe:h264_nvenc`).
    pub backend: String,
    /// Why the backend could not start.
    pub reason: String,
}

impl std::fmt::Display for BackendAttempt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.backend, self.reason)
    }
}

/// Errors raised by a hardware encoder backend.
#[derive(Debug, thiserror::Error)]
pub enum EncoderError {
    /// A hardware or runtime dependency of this backend is absent.
    ///
    /// Recoverable: the selector falls back to the next candidate.
    #[error("backend unsupported: {reason}")]
    Unsupported {
        /// What is missing.
        reason: String,
    },

    /// The external encoder process could not be launched.
    #[error("failed to spawn {program}: {source}")]
    ProcessSpawn {
        /// Program that was launched.
        program: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The external process pipes closed early or a write failed.
    #[error("encoder I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// `start()` was called twice on the same backend instance.
    #[error("backend already started")]
    AlreadyStarted,

    /// The backend is not running (never started, failed, or stopped).
    #[error("backend not started")]
    NotStarted,

    /// No candidate backend could be started.
    #[error("no encoder backend could be started: {}", format_attempts(.attempts))]
    AllBackendsFailed {
        /// Per-backend failure reasons, most preferred first.
        attempts: Vec<BackendAttempt>,
    },
}

impl EncoderError {
    /// Creates an unsupported-backend error with the given reason.
    pub fn unsupported(reason: impl Into<String>) -> Self {
        Self::Unsupported {
            reason: reason.into(),
        }
    }

    /// Returns `true` if the backend is no longer running after this error.
    ///
    /// A broken pipe or a failed process respawn stops the backend; every
    /// later `encode` then fails with [`EncoderError::NotStarted`].
    pub fn stops_backend(&self) -> bool {
        matches!(self, Self::Io(_) | Self::ProcessSpawn { .. } | Self::NotStarted)
    }
}

fn format_attempts(attempts: &[BackendAttempt]) -> String {
    if attempts.is_empty() {
        return "no candidates configured".to_string();
    }
    attempts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors raised while writing a clip file.
#[derive(Debug, thiserror::Error)]
pub enum ClipError {
    /// The muxer process could not be launched.
    #[error("failed to spawn muxer {program}: {source}")]
    Spawn {
        /// Program that was launched.
        program: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The muxer exited with a failure status.
    #[error("clip mux failed ({status}): {stderr}")]
    MuxFailed {
        /// Exit status of the muxer.
        status: ExitStatus,
        /// Captured diagnostic output.
        stderr: String,
    },

    /// The muxer reported success but no usable file was produced.
    #[error("clip file missing or empty: {path}")]
    EmptyOutput {
        /// Expected output path.
        path: PathBuf,
    },

    /// File system error around the output path.
    #[error("clip I/O error: {path}: {source}")]
    Io {
        /// Path involved.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl ClipError {
    /// Creates an I/O error for the given path.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors raised by capture sources and GPU readback.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    /// The capture source could not start.
    #[error("capture start failed: {reason}")]
    StartFailed {
        /// Why the source failed.
        reason: String,
    },

    /// A GPU to CPU copy failed.
    #[error("readback failed: {reason}")]
    Readback {
        /// Description of the failure.
        reason: String,
    },

    /// The frame's surface was recreated by its source and is no longer valid.
    #[error("surface invalidated by its source")]
    SurfaceInvalidated,
}

impl CaptureError {
    /// Creates a start failure with the given reason.
    pub fn start_failed(reason: impl Into<String>) -> Self {
        Self::StartFailed {
            reason: reason.into(),
        }
    }

    /// Creates a readback failure with the given reason.
    pub fn readback(reason: impl Into<String>) -> Self {
        Self::Readback {
            reason: reason.into(),
        }
    }
}
