//! Session status notifications.
//!
//! Statuses are human-readable transitions for a host UI. They are
//! informational: failures that matter to the caller are also returned as
//! errors from the call that caused them.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Status transitions emitted by a [`ClipSession`](crate::ClipSession).
///
/// The [`Display`](fmt::Display) form is the wire-stable string a UI shows,
/// e.g. `encoder:pipe:h264_nvenc` or `save_ok:/clips/last.mp4`.
///
/// # Example
///
/// ```
/// use instant_replay::SessionStatus;
///
/// fn show(status: SessionStatus) {
///     match status {
///         SessionStatus::Failed(reason) => eprintln!("replay failed: {reason}"),
///         SessionStatus::SaveOk(path) => eprintln!("saved {}", path.display()),
///         other => eprintln!("{other}"),
///     }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    /// The encoder policy in effect, emitted first on start.
    EncoderPolicy(String),
    /// The encoder backend that started.
    Encoder(String),
    /// Capture and encoding are running.
    Running,
    /// The session has been stopped.
    Stopped,
    /// Start failed and everything has been torn down, or the encoder
    /// stopped on its own while capturing.
    Failed(String),
    /// A clip was written.
    SaveOk(PathBuf),
    /// A clip could not be written.
    SaveFailed(String),
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EncoderPolicy(policy) => write!(f, "encoderPolicy:{policy}"),
            Self::Encoder(name) => write!(f, "encoder:{name}"),
            Self::Running => f.write_str("running"),
            Self::Stopped => f.write_str("stopped"),
            Self::Failed(reason) => write!(f, "failed:{reason}"),
            Self::SaveOk(path) => write!(f, "save_ok:{}", path.display()),
            Self::SaveFailed(reason) => write!(f, "save_failed:{reason}"),
        }
    }
}

/// Callback receiving status transitions.
///
/// Called from whichever task caused the transition; keep it short.
pub type StatusCallback = Arc<dyn Fn(SessionStatus) + Send + Sync>;

/// Creates a [`StatusCallback`] from a closure.
pub fn status_callback<F>(f: F) -> StatusCallback
where
    F: Fn(SessionStatus) + Send + Sync + 'static,
{
    Arc::new(f)
}
