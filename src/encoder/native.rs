//! Native vendor encode session backend.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::{BackendKind, HardwareEncoder};
use crate::clip::ClipOutcome;
use crate::{ClipError, EncoderError, RawFrame, RecordingSettings};

/// Placeholder for an in-process vendor encode session.
///
/// No vendor SDK binding ships with this crate, so `start` always reports
/// [`EncoderError::Unsupported`] and the selector moves on. The type exists
/// so the policy `forced_backend = vendor-native` resolves to a real
/// candidate with a clear failure reason.
#[derive(Debug)]
pub struct VendorNativeEncoder {
    codec: String,
    started: AtomicBool,
}

impl VendorNativeEncoder {
    /// Creates the backend for `codec`.
    pub fn new(codec: impl Into<String>) -> Self {
        Self {
            codec: codec.into(),
            started: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl HardwareEncoder for VendorNativeEncoder {
    fn backend_name(&self) -> String {
        format!("native:{}", self.codec)
    }

    fn kind(&self) -> BackendKind {
        BackendKind::VendorNative
    }

    async fn start(&self, _settings: &RecordingSettings) -> Result<(), EncoderError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(EncoderError::AlreadyStarted);
        }
        Err(EncoderError::unsupported(
            "vendor-native encode session is not available in this build",
        ))
    }

    async fn encode(&self, frame: RawFrame) -> Result<(), EncoderError> {
        frame.release();
        Err(EncoderError::NotStarted)
    }

    fn reconfigure(&self, _width: u32, _height: u32) {}

    async fn flush_recent(
        &self,
        _path: &Path,
        _duration: Duration,
    ) -> Result<ClipOutcome, ClipError> {
        Ok(ClipOutcome::Skipped)
    }

    async fn stop(&self) {}

    fn debug_status(&self) -> String {
        format!("codec={};running=false;native=unavailable", self.codec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_native_backend_is_unsupported() {
        let encoder = VendorNativeEncoder::new("h264_nvenc");
        let err = encoder
            .start(&RecordingSettings::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EncoderError::Unsupported { .. }));
        assert_eq!(encoder.backend_name(), "native:h264_nvenc");
        let outcome = encoder
            .flush_recent(Path::new("clip.mp4"), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(outcome, ClipOutcome::Skipped);
    }
}
