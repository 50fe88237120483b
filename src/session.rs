//! Replay session lifecycle.

use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::clip::ClipOutcome;
use crate::encoder::{AdaptiveEncoder, BackendContext, EncoderCandidate, HardwareEncoder};
use crate::error::BackendAttempt;
use crate::pipeline::{CaptureManager, SessionStats};
use crate::source::CaptureSourceFactory;
use crate::{
    ClipError, EncoderPolicy, RecordingSettings, ReplayConfig, ReplayError, SessionStatus,
    StatusCallback,
};

/// Produces the ordered encoder candidates for one start.
pub(crate) type CandidateProvider =
    Arc<dyn Fn(&BackendContext) -> Vec<EncoderCandidate> + Send + Sync>;

/// Handle to an instant-replay session.
///
/// Created by [`ReplayBuilder::build()`] or [`ReplayBuilder::start()`]. A
/// running session captures continuously and keeps the most recent
/// `retention_seconds` of encoded video; [`save_clip()`](Self::save_clip)
/// writes that window to a file at any time.
///
/// # Lifecycle
///
/// 1. [`start()`](Self::start) creates the capture source, selects an
///    encoder backend and starts capturing
/// 2. [`save_clip()`](Self::save_clip) as often as needed
/// 3. [`stop()`](Self::stop) tears down in reverse order
///
/// After `stop` the buffered output of the last run can still be saved.
/// Dropping a running session, or a `start()` future that has not finished,
/// stops the source and the encoder in the background; prefer `stop()`.
///
/// [`ReplayBuilder::build()`]: crate::ReplayBuilder::build
/// [`ReplayBuilder::start()`]: crate::ReplayBuilder::start
pub struct ClipSession {
    settings: RecordingSettings,
    policy: EncoderPolicy,
    config: ReplayConfig,
    context: BackendContext,
    source_factory: CaptureSourceFactory,
    candidates: CandidateProvider,
    status: Option<StatusCallback>,
    manager: Option<CaptureManager>,
    encoder: Option<Arc<AdaptiveEncoder>>,
    last_stats: SessionStats,
}

impl ClipSession {
    pub(crate) fn new(
        settings: RecordingSettings,
        policy: EncoderPolicy,
        config: ReplayConfig,
        context: BackendContext,
        source_factory: CaptureSourceFactory,
        candidates: CandidateProvider,
        status: Option<StatusCallback>,
    ) -> Self {
        Self {
            settings,
            policy,
            config,
            context,
            source_factory,
            candidates,
            status,
            manager: None,
            encoder: None,
            last_stats: SessionStats::default(),
        }
    }

    fn emit(&self, status: SessionStatus) {
        tracing::debug!(%status, "session status");
        if let Some(callback) = &self.status {
            callback(status);
        }
    }

    /// Settings this session records with.
    pub fn settings(&self) -> &RecordingSettings {
        &self.settings
    }

    /// Returns `true` while capture is running.
    pub fn is_running(&self) -> bool {
        self.manager.is_some()
    }

    /// Starts capture and encoding.
    ///
    /// Emits `encoderPolicy:<policy>`, then `encoder:<backend>` and
    /// `running`. On failure emits `failed:<reason>` and `stopped` after
    /// tearing down whatever had started.
    ///
    /// # Errors
    ///
    /// - [`ReplayError::AlreadyRunning`] if the session is running
    /// - [`ReplayError::Capture`] if the source cannot be created or started
    /// - [`ReplayError::Encoder`] if no encoder backend could start
    pub async fn start(&mut self) -> Result<(), ReplayError> {
        self.start_cancellable(&CancellationToken::new()).await
    }

    /// Like [`start()`](Self::start), but gives up once `cancel` fires.
    ///
    /// Whatever had started is stopped before the error is returned. The
    /// token has no effect once the session is running.
    ///
    /// # Errors
    ///
    /// As for [`start()`](Self::start), plus [`ReplayError::Cancelled`].
    pub async fn start_cancellable(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<(), ReplayError> {
        if self.manager.is_some() {
            return Err(ReplayError::AlreadyRunning);
        }
        self.emit(SessionStatus::EncoderPolicy(self.policy.to_string()));

        let source = match (self.source_factory)(&self.settings) {
            Ok(source) => source,
            Err(e) => return Err(self.fail(e.into())),
        };

        let encoder = Arc::new(AdaptiveEncoder::new((self.candidates)(&self.context)));
        self.encoder = Some(Arc::clone(&encoder));
        let mut manager = CaptureManager::new(
            source,
            Arc::clone(&encoder) as Arc<dyn HardwareEncoder>,
            self.config.frame_queue_capacity,
        );
        if let Some(callback) = &self.status {
            manager = manager.with_status(Arc::clone(callback));
        }

        if let Err(e) = manager.start(&self.settings, cancel).await {
            return Err(self.fail(e));
        }

        tracing::info!(
            source = manager.source_name(),
            backend = %encoder.backend_name(),
            target = %self.settings.target,
            "replay session running"
        );
        self.manager = Some(manager);
        self.emit(SessionStatus::Encoder(encoder.backend_name()));
        self.emit(SessionStatus::Running);
        Ok(())
    }

    /// Reports a failed start. Everything started has already been torn
    /// down, so `stopped` follows `failed`.
    fn fail(&self, error: ReplayError) -> ReplayError {
        tracing::warn!("replay session failed to start: {error}");
        self.emit(SessionStatus::Failed(error.to_string()));
        self.emit(SessionStatus::Stopped);
        error
    }

    /// Writes the last `retention_seconds` of video to `path`.
    ///
    /// Emits `save_ok:<path>` or `save_failed:<reason>`. Returns
    /// [`ClipOutcome::Skipped`] when nothing has been encoded yet.
    ///
    /// # Errors
    ///
    /// Returns a [`ClipError`] if the muxer fails or produces no file.
    pub async fn save_clip(&self, path: impl AsRef<Path>) -> Result<ClipOutcome, ClipError> {
        let path = path.as_ref();
        let Some(encoder) = self.encoder.clone() else {
            self.emit(SessionStatus::SaveFailed("session not started".to_string()));
            return Ok(ClipOutcome::Skipped);
        };

        match encoder.flush_recent(path, self.settings.retention()).await {
            Ok(ClipOutcome::Written { path, bytes }) => {
                self.emit(SessionStatus::SaveOk(path.clone()));
                Ok(ClipOutcome::Written { path, bytes })
            }
            Ok(ClipOutcome::Skipped) => {
                self.emit(SessionStatus::SaveFailed("nothing buffered yet".to_string()));
                Ok(ClipOutcome::Skipped)
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), "clip save failed: {e}");
                self.emit(SessionStatus::SaveFailed(e.to_string()));
                Err(e)
            }
        }
    }

    /// Stops capture and encoding. Idempotent; always emits `stopped`.
    pub async fn stop(&mut self) {
        if let Some(mut manager) = self.manager.take() {
            manager.stop().await;
            self.last_stats = manager.stats();
        }
        self.emit(SessionStatus::Stopped);
    }

    /// Frame counters of the current or last run.
    pub fn stats(&self) -> SessionStats {
        self.manager
            .as_ref()
            .map_or(self.last_stats, CaptureManager::stats)
    }

    /// Backend failures recorded while selecting the encoder.
    pub fn startup_errors(&self) -> Vec<BackendAttempt> {
        self.encoder
            .as_ref()
            .map(|e| e.startup_errors())
            .unwrap_or_default()
    }

    /// Name of the active encoder backend.
    pub fn active_backend(&self) -> Option<String> {
        self.encoder.as_ref().and_then(|e| e.active_backend())
    }

    /// One-line diagnostic snapshot, `inactive` when not running.
    pub fn debug_status(&self) -> String {
        let (Some(manager), Some(encoder)) = (&self.manager, &self.encoder) else {
            return "inactive".to_string();
        };
        let stats = manager.stats();
        format!(
            "backend={};enqueued={};encoded={};pending={};dropped={};encoder={}",
            encoder.backend_name(),
            stats.enqueued,
            stats.encoded,
            stats.pending,
            stats.dropped,
            encoder.debug_status()
        )
    }
}

impl std::fmt::Debug for ClipSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClipSession")
            .field("settings", &self.settings)
            .field("policy", &self.policy)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}
