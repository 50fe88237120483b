//! Builder pattern for `InstantReplay`.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::clip::ClipWriter;
use crate::encoder::{policy_candidates, BackendContext, EncoderCandidate};
use crate::session::{CandidateProvider, ClipSession};
use crate::source::{CaptureSource, CaptureSourceFactory, SyntheticSource};
use crate::{
    status_callback, CaptureError, EncoderPolicy, RecordingSettings, ReplayConfig, ReplayError,
    SessionStatus, StatusCallback,
};

/// Entry point for instant-replay sessions.
pub struct InstantReplay;

impl InstantReplay {
    /// Creates a builder with default settings.
    pub fn builder() -> ReplayBuilder {
        ReplayBuilder::new()
    }
}

/// Builder for configuring and starting a replay session.
///
/// Use [`InstantReplay::builder()`] to create a new builder.
///
/// # Example
///
/// ```ignore
/// use instant_replay::{InstantReplay, RecordingSettings};
/// use tokio::sync::mpsc;
///
/// let (tx, mut statuses) = mpsc::unbounded_channel();
///
/// let mut session = InstantReplay::builder()
///     .settings(RecordingSettings { retention_seconds: 20, ..Default::default() })
///     .synthetic_source()
///     .status_channel(tx)
///     .start()
///     .await?;
///
/// // ... later, when the user presses the hotkey:
/// session.save_clip("clips/last-20s.mp4").await?;
/// session.stop().await;
/// ```
pub struct ReplayBuilder {
    settings: RecordingSettings,
    policy: EncoderPolicy,
    config: ReplayConfig,
    source_factory: Option<CaptureSourceFactory>,
    clip_writer: Option<Arc<dyn ClipWriter>>,
    candidates: Option<CandidateProvider>,
    status: Option<StatusCallback>,
}

impl ReplayBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self {
            settings: RecordingSettings::default(),
            policy: EncoderPolicy::default(),
            config: ReplayConfig::default(),
            source_factory: None,
            clip_writer: None,
            candidates: None,
            status: None,
        }
    }

    /// Set the recording settings.
    pub fn settings(mut self, settings: RecordingSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Set the encoder selection policy.
    ///
    /// Default: automatic fallback, software encoders allowed.
    pub fn policy(mut self, policy: EncoderPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set engine-wide configuration.
    pub fn config(mut self, config: ReplayConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the factory that creates the capture source on each start.
    pub fn capture_source<F>(mut self, factory: F) -> Self
    where
        F: Fn(&RecordingSettings) -> Result<Box<dyn CaptureSource>, CaptureError>
            + Send
            + Sync
            + 'static,
    {
        let factory: CaptureSourceFactory = Arc::new(factory);
        self.source_factory = Some(factory);
        self
    }

    /// Capture from a [`SyntheticSource`] matching the settings.
    pub fn synthetic_source(self) -> Self {
        self.capture_source(|settings| {
            Ok(Box::new(SyntheticSource::from_settings(settings)) as Box<dyn CaptureSource>)
        })
    }

    /// Replace the ffmpeg clip writer.
    pub fn clip_writer(mut self, writer: Arc<dyn ClipWriter>) -> Self {
        self.clip_writer = Some(writer);
        self
    }

    /// Replace the policy-derived encoder candidates.
    ///
    /// The closure runs on every start and receives the shared backend
    /// context, so custom candidates can reuse the configured clip writer.
    pub fn encoder_candidates<F>(mut self, provider: F) -> Self
    where
        F: Fn(&BackendContext) -> Vec<EncoderCandidate> + Send + Sync + 'static,
    {
        let provider: CandidateProvider = Arc::new(provider);
        self.candidates = Some(provider);
        self
    }

    /// Register a callback for status transitions.
    pub fn on_status<F>(mut self, callback: F) -> Self
    where
        F: Fn(SessionStatus) + Send + Sync + 'static,
    {
        self.status = Some(status_callback(callback));
        self
    }

    /// Deliver status transitions into a channel.
    ///
    /// Transitions sent after the receiver is dropped are discarded.
    pub fn status_channel(self, tx: mpsc::UnboundedSender<SessionStatus>) -> Self {
        self.on_status(move |status| {
            let _ = tx.send(status);
        })
    }

    /// Assembles a stopped session.
    ///
    /// # Errors
    ///
    /// Returns [`ReplayError::NoCaptureSource`] if no capture source was set.
    pub fn build(self) -> Result<ClipSession, ReplayError> {
        let source_factory = self.source_factory.ok_or(ReplayError::NoCaptureSource)?;

        let mut context = BackendContext::from_config(&self.config);
        if let Some(writer) = self.clip_writer {
            context = context.with_clip_writer(writer);
        }

        let candidates = self.candidates.unwrap_or_else(|| {
            let policy = self.policy;
            let config = self.config.clone();
            let provider: CandidateProvider = Arc::new(move |context: &BackendContext| {
                policy_candidates(&policy, &config)
                    .into_iter()
                    .map(|spec| spec.into_candidate(context.clone()))
                    .collect()
            });
            provider
        });

        Ok(ClipSession::new(
            self.settings,
            self.policy,
            self.config,
            context,
            source_factory,
            candidates,
            self.status,
        ))
    }

    /// Builds and starts the session.
    ///
    /// # Errors
    ///
    /// Returns [`ReplayError`] if the session cannot be built or started.
    pub async fn start(self) -> Result<ClipSession, ReplayError> {
        let mut session = self.build()?;
        session.start().await?;
        Ok(session)
    }
}

impl Default for ReplayBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_requires_capture_source() {
        let err = InstantReplay::builder().build().unwrap_err();
        assert!(matches!(err, ReplayError::NoCaptureSource));
    }

    #[test]
    fn test_builder_chain() {
        let session = InstantReplay::builder()
            .settings(RecordingSettings {
                fps: 30,
                ..Default::default()
            })
            .synthetic_source()
            .build()
            .unwrap();
        assert_eq!(session.settings().fps, 30);
        assert!(!session.is_running());
        assert_eq!(session.debug_status(), "inactive");
    }

    #[tokio::test]
    async fn test_failed_source_emits_failed_status() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let err = InstantReplay::builder()
            .capture_source(|_| Err(CaptureError::start_failed("window gone")))
            .status_channel(tx)
            .start()
            .await
            .unwrap_err();
        assert!(matches!(err, ReplayError::Capture(_)));

        assert!(matches!(rx.recv().await, Some(SessionStatus::EncoderPolicy(_))));
        assert_eq!(
            rx.recv().await,
            Some(SessionStatus::Failed(
                "capture source failed: capture start failed: window gone".to_string()
            ))
        );
        assert_eq!(rx.recv().await, Some(SessionStatus::Stopped));
    }
}
