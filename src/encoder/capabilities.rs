//! Encoder availability probe.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tokio::sync::OnceCell;

use crate::EncoderError;

/// Answers "can this ffmpeg encode with codec X?".
///
/// The encoder listing is fetched once per instance and shared by every
/// backend candidate built from the same context. A failed probe is not
/// remembered; the next query runs the program again.
#[derive(Debug)]
pub struct FfmpegCapabilities {
    program: PathBuf,
    listing: OnceCell<String>,
}

impl FfmpegCapabilities {
    /// Probes `program` on first use.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            listing: OnceCell::new(),
        }
    }

    /// Creates a probe that answers from a fixed `-encoders` listing.
    pub fn from_listing(program: impl Into<PathBuf>, listing: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            listing: OnceCell::new_with(Some(listing.into())),
        }
    }

    /// Program being probed.
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Returns `true` if `codec` is listed and the program runs.
    pub async fn supports_encoder(&self, codec: &str) -> bool {
        self.ensure_encoder(codec).await.is_ok()
    }

    /// Fails with [`EncoderError::Unsupported`] unless `codec` is usable.
    pub async fn ensure_encoder(&self, codec: &str) -> Result<(), EncoderError> {
        if codec.trim().is_empty() {
            return Err(EncoderError::unsupported("empty codec name"));
        }
        let listing = self
            .listing
            .get_or_try_init(|| probe_encoders(self.program.clone()))
            .await
            .map_err(EncoderError::unsupported)?;
        if listing_contains(listing, codec) {
            Ok(())
        } else {
            Err(EncoderError::unsupported(format!(
                "{codec} not listed by {}",
                self.program.display()
            )))
        }
    }
}

async fn probe_encoders(program: PathBuf) -> Result<String, String> {
    let output = Command::new(&program)
        .args(["-hide_banner", "-encoders"])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| format!("cannot run {}: {e}", program.display()))?;

    if !output.status.success() {
        return Err(format!(
            "{} -encoders exited with {}",
            program.display(),
            output.status
        ));
    }

    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    tracing::debug!(program = %program.display(), bytes = text.len(), "encoder listing probed");
    Ok(text)
}

/// Returns `true` if an `-encoders` listing has a line for `codec`.
///
/// Listing lines look like ` V....D libx264   libx264 H.264 ...`: flags,
/// then the encoder name.
fn listing_contains(listing: &str, codec: &str) -> bool {
    listing.lines().any(|line| {
        let mut fields = line.split_whitespace();
        fields.next();
        fields
            .next()
            .is_some_and(|name| name.eq_ignore_ascii_case(codec))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = "\
Encoders:
 V..... = Video
 ------
 V....D libx264              libx264 H.264 / AVC / MPEG-4 AVC (codec h264)
 V....D h264_nvenc           NVIDIA NVENC H.264 encoder (codec h264)
 A....D aac                  AAC (Advanced Audio Coding)
";

    #[test]
    fn test_listing_contains() {
        assert!(listing_contains(LISTING, "libx264"));
        assert!(listing_contains(LISTING, "H264_NVENC"));
        assert!(!listing_contains(LISTING, "h264_amf"));
        // Mentioned in a description, not an encoder name.
        assert!(!listing_contains(LISTING, "NVIDIA"));
    }

    #[tokio::test]
    async fn test_from_listing() {
        let caps = FfmpegCapabilities::from_listing("ffmpeg", LISTING);
        assert!(caps.supports_encoder("libx264").await);
        let err = caps.ensure_encoder("h264_qsv").await.unwrap_err();
        assert!(matches!(err, EncoderError::Unsupported { .. }));
        assert!(err.to_string().contains("h264_qsv not listed"));
    }

    #[tokio::test]
    async fn test_missing_program_is_unsupported() {
        let caps = FfmpegCapabilities::new("/nonexistent/ffmpeg-binary");
        let err = caps.ensure_encoder("libx264").await.unwrap_err();
        assert!(matches!(err, EncoderError::Unsupported { .. }));
        assert!(err.to_string().contains("cannot run"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_probe_is_retried() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let program = dir.path().join("late-ffmpeg.sh");
        let caps = FfmpegCapabilities::new(&program);
        assert!(!caps.supports_encoder("libx264").await);

        std::fs::write(&program, "#!/bin/sh\necho ' V....D libx264 H.264'\n").unwrap();
        std::fs::set_permissions(&program, std::fs::Permissions::from_mode(0o755)).unwrap();
        assert!(caps.supports_encoder("libx264").await);
    }

    #[tokio::test]
    async fn test_empty_codec_is_unsupported() {
        let caps = FfmpegCapabilities::from_listing("ffmpeg", LISTING);
        assert!(!caps.supports_encoder("  ").await);
    }
}
