//! Readback encoder: each frame is copied to CPU memory and written to the
//! encoder process before `encode` returns.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::ChildStdin;
use tokio::sync::Mutex;

use super::backend::ProcessBackendCore;
use super::process::EncoderProcess;
use super::{BackendContext, BackendKind, FrameReadback, HardwareEncoder};
use crate::clip::ClipOutcome;
use crate::{ClipError, EncoderError, RawFrame, RecordingSettings};

struct ReadbackSession {
    process: EncoderProcess,
    stdin: ChildStdin,
}

struct ReadbackState {
    width: u32,
    height: u32,
    readback: FrameReadback,
    session: Option<ReadbackSession>,
}

/// Fallback backend with no input queue.
///
/// Throughput is bounded by the encoder process: `encode` waits until the
/// frame has been written to its stdin.
pub struct ReadbackEncoder {
    core: ProcessBackendCore,
    state: Mutex<ReadbackState>,
}

impl ReadbackEncoder {
    /// Creates a backend that encodes with `codec`.
    pub fn new(codec: impl Into<String>, context: BackendContext) -> Self {
        Self {
            core: ProcessBackendCore::new(codec, context),
            state: Mutex::new(ReadbackState {
                width: 0,
                height: 0,
                readback: FrameReadback::new(),
                session: None,
            }),
        }
    }

    fn spawn_session(&self, width: u32, height: u32) -> Result<ReadbackSession, EncoderError> {
        let mut process = self.core.spawn_process(width, height)?;
        let stdin = process
            .take_stdin()
            .ok_or_else(|| EncoderError::unsupported("encoder process has no stdin"))?;
        Ok(ReadbackSession { process, stdin })
    }

    async fn teardown(state: &mut ReadbackState) {
        if let Some(ReadbackSession { process, stdin }) = state.session.take() {
            drop(stdin);
            process.shutdown().await;
        }
    }
}

#[async_trait]
impl HardwareEncoder for ReadbackEncoder {
    fn backend_name(&self) -> String {
        format!("readback:{}", self.core.codec)
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Readback
    }

    async fn start(&self, settings: &RecordingSettings) -> Result<(), EncoderError> {
        self.core.begin_start(settings).await?;

        let mut state = self.state.lock().await;
        let (width, height) = (settings.width.max(1), settings.height.max(1));
        state.session = Some(self.spawn_session(width, height)?);
        state.width = width;
        state.height = height;
        self.core.set_running(true);
        tracing::info!(codec = %self.core.codec, width, height, "readback encoder started");
        Ok(())
    }

    async fn encode(&self, frame: RawFrame) -> Result<(), EncoderError> {
        if !self.core.is_running() {
            frame.release();
            return Err(EncoderError::NotStarted);
        }

        let mut state = self.state.lock().await;

        let (width, height) = frame.dimensions();
        let resize_requested = self.core.take_resize().is_some();
        let size_changed = (width, height) != (state.width, state.height);
        if frame.is_valid() && (resize_requested || size_changed) {
            Self::teardown(&mut state).await;
            self.core.record_restart(width, height);
            match self.spawn_session(width, height) {
                Ok(session) => {
                    state.session = Some(session);
                    state.width = width;
                    state.height = height;
                }
                Err(e) => {
                    frame.release();
                    self.core.set_running(false);
                    return Err(e);
                }
            }
        }

        let data = match state.readback.read(&frame, &self.core.pool) {
            Ok(data) => data,
            Err(e) => {
                self.core.record_copy_failure(&e);
                frame.release();
                return Ok(());
            }
        };
        let timestamp_ms = frame.timestamp_ms();
        frame.release();

        let Some(session) = state.session.as_mut() else {
            self.core.pool.give_back(data);
            return Err(EncoderError::NotStarted);
        };

        let result = session.stdin.write_all(&data).await;
        let len = data.len();
        self.core.pool.give_back(data);
        match result {
            Ok(()) => {
                self.core.counters.frame_written(len, timestamp_ms);
                Ok(())
            }
            Err(e) => {
                let error = self.core.pipe_failure(&e);
                tracing::warn!(codec = %self.core.codec, "readback encoder failed: {error}");
                self.core.set_running(false);
                Self::teardown(&mut state).await;
                Err(error)
            }
        }
    }

    fn reconfigure(&self, width: u32, height: u32) {
        self.core.request_resize(width, height);
    }

    async fn flush_recent(
        &self,
        path: &Path,
        duration: Duration,
    ) -> Result<ClipOutcome, ClipError> {
        self.core.flush_recent(path, duration).await
    }

    async fn stop(&self) {
        self.core.set_running(false);
        let mut state = self.state.lock().await;
        if state.session.is_some() {
            Self::teardown(&mut state).await;
            tracing::info!(codec = %self.core.codec, "readback encoder stopped");
        }
        state.readback.release();
    }

    fn debug_status(&self) -> String {
        self.core.debug_status()
    }
}
