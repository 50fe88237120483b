//! Ordered backend fallback.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use super::{
    BackendContext, BackendKind, HardwareEncoder, PipeEncoder, ReadbackEncoder,
    VendorNativeEncoder,
};
use crate::clip::ClipOutcome;
use crate::error::BackendAttempt;
use crate::{
    ClipError, EncoderError, EncoderPolicy, ForcedBackend, RawFrame, RecordingSettings,
    ReplayConfig,
};

const REPORTED_ERRORS: usize = 3;

/// Description of one backend the selector may construct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendSpec {
    /// In-process vendor session.
    VendorNative {
        /// Codec name.
        codec: String,
    },
    /// External process fed by a writer task.
    Pipe {
        /// Codec name.
        codec: String,
    },
    /// External process fed synchronously.
    Readback {
        /// Codec name.
        codec: String,
    },
}

impl BackendSpec {
    /// Name the constructed backend will report.
    pub fn label(&self) -> String {
        match self {
            Self::VendorNative { codec } => format!("native:{codec}"),
            Self::Pipe { codec } => format!("pipe:{codec}"),
            Self::Readback { codec } => format!("readback:{codec}"),
        }
    }

    /// Backend variant.
    pub fn kind(&self) -> BackendKind {
        match self {
            Self::VendorNative { .. } => BackendKind::VendorNative,
            Self::Pipe { .. } => BackendKind::Pipe,
            Self::Readback { .. } => BackendKind::Readback,
        }
    }

    /// Turns the description into a factory bound to `context`.
    pub fn into_candidate(self, context: BackendContext) -> EncoderCandidate {
        let label = self.label();
        EncoderCandidate::new(label, move || {
            let encoder: Box<dyn HardwareEncoder> = match &self {
                Self::VendorNative { codec } => Box::new(VendorNativeEncoder::new(codec.clone())),
                Self::Pipe { codec } => Box::new(PipeEncoder::new(codec.clone(), context.clone())),
                Self::Readback { codec } => {
                    Box::new(ReadbackEncoder::new(codec.clone(), context.clone()))
                }
            };
            Ok(encoder)
        })
    }
}

type EncoderFactory =
    Box<dyn Fn() -> Result<Box<dyn HardwareEncoder>, EncoderError> + Send + Sync>;

/// A labelled factory for one backend instance.
pub struct EncoderCandidate {
    label: String,
    factory: EncoderFactory,
}

impl EncoderCandidate {
    /// Wraps a factory closure.
    pub fn new<F>(label: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Result<Box<dyn HardwareEncoder>, EncoderError> + Send + Sync + 'static,
    {
        Self {
            label: label.into(),
            factory: Box::new(factory),
        }
    }

    /// Name used in failure reports when construction fails.
    pub fn label(&self) -> &str {
        &self.label
    }
}

impl std::fmt::Debug for EncoderCandidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncoderCandidate")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

/// Backends to try for `policy`, most preferred first.
///
/// `Auto` yields vendor pipe, software pipe, then readback. A forced backend
/// yields just that one. `strict_gpu_only` removes every backend that
/// encodes with the software codec, which can leave the list empty.
pub fn policy_candidates(policy: &EncoderPolicy, config: &ReplayConfig) -> Vec<BackendSpec> {
    let vendor = || config.vendor_codec.clone();
    let software = || config.software_codec.clone();
    let specs = match policy.forced_backend {
        ForcedBackend::Auto => vec![
            BackendSpec::Pipe { codec: vendor() },
            BackendSpec::Pipe { codec: software() },
            BackendSpec::Readback { codec: software() },
        ],
        ForcedBackend::VendorNative => vec![BackendSpec::VendorNative { codec: vendor() }],
        ForcedBackend::VendorPipe => vec![BackendSpec::Pipe { codec: vendor() }],
        ForcedBackend::SoftwarePipe => vec![BackendSpec::Pipe { codec: software() }],
        ForcedBackend::Cpu => vec![BackendSpec::Readback { codec: software() }],
    };

    if !policy.strict_gpu_only {
        return specs;
    }
    specs
        .into_iter()
        .filter(|spec| match spec {
            BackendSpec::VendorNative { .. } => true,
            BackendSpec::Pipe { codec } => *codec == config.vendor_codec,
            BackendSpec::Readback { .. } => false,
        })
        .collect()
}

/// Starts the first working backend of an ordered list and delegates to it.
///
/// Failed candidates are stopped and recorded; only an exhausted list is
/// an error. The active backend stays in place after `stop`, so its
/// buffered output can still be saved.
pub struct AdaptiveEncoder {
    candidates: Vec<EncoderCandidate>,
    active: RwLock<Option<Arc<dyn HardwareEncoder>>>,
    startup_errors: Mutex<Vec<BackendAttempt>>,
    started: AtomicBool,
}

impl AdaptiveEncoder {
    /// Creates a selector over `candidates`, most preferred first.
    pub fn new(candidates: Vec<EncoderCandidate>) -> Self {
        Self {
            candidates,
            active: RwLock::new(None),
            startup_errors: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Creates a selector with the candidates `policy` allows.
    pub fn from_policy(
        policy: &EncoderPolicy,
        config: &ReplayConfig,
        context: BackendContext,
    ) -> Self {
        let candidates = policy_candidates(policy, config)
            .into_iter()
            .map(|spec| spec.into_candidate(context.clone()))
            .collect();
        Self::new(candidates)
    }

    /// Labels of the configured candidates in order.
    pub fn candidate_labels(&self) -> Vec<String> {
        self.candidates.iter().map(|c| c.label.clone()).collect()
    }

    /// Failures recorded during `start`, in attempt order.
    pub fn startup_errors(&self) -> Vec<BackendAttempt> {
        self.startup_errors.lock().clone()
    }

    /// Name of the backend that started, if any.
    pub fn active_backend(&self) -> Option<String> {
        self.active().map(|encoder| encoder.backend_name())
    }

    fn active(&self) -> Option<Arc<dyn HardwareEncoder>> {
        self.active.read().clone()
    }

    fn record_failure(&self, backend: String, reason: String) {
        tracing::warn!(%backend, %reason, "encoder backend unavailable, trying next");
        self.startup_errors
            .lock()
            .push(BackendAttempt { backend, reason });
    }

    fn errors_summary(&self) -> (usize, String) {
        let errors = self.startup_errors.lock();
        let summary = if errors.is_empty() {
            "none".to_string()
        } else {
            errors
                .iter()
                .take(REPORTED_ERRORS)
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("|")
        };
        (errors.len(), summary)
    }
}

#[async_trait]
impl HardwareEncoder for AdaptiveEncoder {
    fn backend_name(&self) -> String {
        self.active_backend()
            .unwrap_or_else(|| "adaptive:uninitialized".to_string())
    }

    /// Kind of the active backend; `Pipe` before one has started.
    fn kind(&self) -> BackendKind {
        self.active().map_or(BackendKind::Pipe, |encoder| encoder.kind())
    }

    async fn start(&self, settings: &RecordingSettings) -> Result<(), EncoderError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(EncoderError::AlreadyStarted);
        }

        for candidate in &self.candidates {
            let encoder: Arc<dyn HardwareEncoder> = match (candidate.factory)() {
                Ok(encoder) => Arc::from(encoder),
                Err(e) => {
                    self.record_failure(candidate.label.clone(), e.to_string());
                    continue;
                }
            };

            match encoder.start(settings).await {
                Ok(()) => {
                    tracing::info!(backend = %encoder.backend_name(), "encoder backend active");
                    *self.active.write() = Some(encoder);
                    return Ok(());
                }
                Err(e) => {
                    encoder.stop().await;
                    self.record_failure(encoder.backend_name(), e.to_string());
                }
            }
        }

        Err(EncoderError::AllBackendsFailed {
            attempts: self.startup_errors(),
        })
    }

    async fn encode(&self, frame: RawFrame) -> Result<(), EncoderError> {
        match self.active() {
            Some(encoder) => encoder.encode(frame).await,
            None => {
                frame.release();
                Err(EncoderError::NotStarted)
            }
        }
    }

    fn reconfigure(&self, width: u32, height: u32) {
        if let Some(encoder) = self.active() {
            encoder.reconfigure(width, height);
        }
    }

    async fn flush_recent(
        &self,
        path: &Path,
        duration: Duration,
    ) -> Result<ClipOutcome, ClipError> {
        match self.active() {
            Some(encoder) => encoder.flush_recent(path, duration).await,
            None => Ok(ClipOutcome::Skipped),
        }
    }

    async fn stop(&self) {
        if let Some(encoder) = self.active() {
            encoder.stop().await;
        }
    }

    fn debug_status(&self) -> String {
        let (count, errors) = self.errors_summary();
        match self.active() {
            Some(encoder) => format!(
                "active={};detail={};startupErrors={count};errors={errors}",
                encoder.backend_name(),
                encoder.debug_status()
            ),
            None => format!("inactive;startupErrors={count};errors={errors}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct FakeEncoder {
        name: &'static str,
        fail_start: bool,
        stops: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl HardwareEncoder for FakeEncoder {
        fn backend_name(&self) -> String {
            self.name.to_string()
        }

        fn kind(&self) -> BackendKind {
            BackendKind::Readback
        }

        async fn start(&self, _settings: &RecordingSettings) -> Result<(), EncoderError> {
            if self.fail_start {
                Err(EncoderError::unsupported(format!("{} missing", self.name)))
            } else {
                Ok(())
            }
        }

        async fn encode(&self, frame: RawFrame) -> Result<(), EncoderError> {
            frame.release();
            Ok(())
        }

        fn reconfigure(&self, _width: u32, _height: u32) {}

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
            format!("fake={}", self.name)
        }
    }

    fn fake(name: &'static str, fail_start: bool, stops: &Arc<AtomicUsize>) -> EncoderCandidate {
        let stops = Arc::clone(stops);
        EncoderCandidate::new(name, move || {
            Ok(Box::new(FakeEncoder {
                name,
                fail_start,
                stops: Arc::clone(&stops),
            }) as Box<dyn HardwareEncoder>)
        })
    }

    #[tokio::test]
    async fn test_falls_back_to_first_working_backend() {
        let stops = Arc::new(AtomicUsize::new(0));
        let selector = AdaptiveEncoder::new(vec![
            fake("first", true, &stops),
            fake("second", true, &stops),
            fake("third", false, &stops),
        ]);

        selector.start(&RecordingSettings::default()).await.unwrap();

        assert_eq!(selector.active_backend().as_deref(), Some("third"));
        let errors = selector.startup_errors();
        assert_eq!(errors.len(), 2);
        assert!(errors[0].reason.contains("first missing"));
        assert!(errors[1].reason.contains("second missing"));
        // Each failed candidate was disposed.
        assert_eq!(stops.load(Ordering::SeqCst), 2);

        let status = selector.debug_status();
        assert!(status.starts_with("active=third;detail=fake=third;startupErrors=2;"));
        assert!(status.contains("first:backend unsupported: first missing|second:"));
    }

    #[tokio::test]
    async fn test_all_failed_lists_every_attempt() {
        let stops = Arc::new(AtomicUsize::new(0));
        let selector = AdaptiveEncoder::new(vec![
            fake("a", true, &stops),
            EncoderCandidate::new("b", || Err(EncoderError::unsupported("no device"))),
        ]);

        let err = selector
            .start(&RecordingSettings::default())
            .await
            .unwrap_err();
        match err {
            EncoderError::AllBackendsFailed { attempts } => {
                assert_eq!(attempts.len(), 2);
                assert_eq!(attempts[1].backend, "b");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(selector.backend_name(), "adaptive:uninitialized");
        assert!(selector.debug_status().starts_with("inactive;startupErrors=2;"));
    }

    #[tokio::test]
    async fn test_empty_candidate_list_fails() {
        let selector = AdaptiveEncoder::new(Vec::new());
        let err = selector
            .start(&RecordingSettings::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no candidates configured"));
        assert_eq!(selector.debug_status(), "inactive;startupErrors=0;errors=none");
    }

    #[tokio::test]
    async fn test_inactive_selector_delegation() {
        let selector = AdaptiveEncoder::new(Vec::new());
        let outcome = selector
            .flush_recent(Path::new("clip.mp4"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(outcome, ClipOutcome::Skipped);
        selector.reconfigure(640, 480);
        selector.stop().await;
    }

    #[tokio::test]
    async fn test_start_only_once() {
        let stops = Arc::new(AtomicUsize::new(0));
        let selector = AdaptiveEncoder::new(vec![fake("only", false, &stops)]);
        selector.start(&RecordingSettings::default()).await.unwrap();
        assert!(matches!(
            selector.start(&RecordingSettings::default()).await,
            Err(EncoderError::AlreadyStarted)
        ));
    }

    #[test]
    fn test_auto_policy_order() {
        let config = ReplayConfig::default();
        let labels: Vec<String> = policy_candidates(&EncoderPolicy::default(), &config)
            .iter()
            .map(BackendSpec::label)
            .collect();
        assert_eq!(
            labels,
            vec!["pipe:h264_nvenc", "pipe:libx264", "readback:libx264"]
        );
    }

    #[test]
    fn test_strict_gpu_policy_filters_software() {
        let config = ReplayConfig::default();
        let strict = EncoderPolicy {
            forced_backend: ForcedBackend::Auto,
            strict_gpu_only: true,
        };
        assert_eq!(
            policy_candidates(&strict, &config),
            vec![BackendSpec::Pipe {
                codec: "h264_nvenc".to_string()
            }]
        );

        let strict_cpu = EncoderPolicy {
            forced_backend: ForcedBackend::Cpu,
            strict_gpu_only: true,
        };
        assert!(policy_candidates(&strict_cpu, &config).is_empty());
    }

    #[test]
    fn test_forced_policies() {
        let config = ReplayConfig::default();
        let forced = |backend| {
            policy_candidates(
                &EncoderPolicy {
                    forced_backend: backend,
                    strict_gpu_only: false,
                },
                &config,
            )
        };
        assert_eq!(forced(ForcedBackend::VendorNative)[0].kind(), BackendKind::VendorNative);
        assert_eq!(forced(ForcedBackend::SoftwarePipe)[0].label(), "pipe:libx264");
        assert_eq!(forced(ForcedBackend::Cpu)[0].label(), "readback:libx264");
        assert_eq!(forced(ForcedBackend::VendorPipe).len(), 1);
    }

    #[tokio::test]
    async fn test_forced_native_reports_unavailable() {
        let config = ReplayConfig::default();
        let policy = EncoderPolicy {
            forced_backend: ForcedBackend::VendorNative,
            strict_gpu_only: false,
        };
        let selector =
            AdaptiveEncoder::from_policy(&policy, &config, BackendContext::from_config(&config));
        assert_eq!(selector.candidate_labels(), vec!["native:h264_nvenc"]);
        let err = selector
            .start(&RecordingSettings::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("native:h264_nvenc:backend unsupported"));
    }
}
