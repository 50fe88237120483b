//! # instant-replay
//!
//! **Note:** This crate is under active development. The API may change before 1.0.
//!
//! Continuous screen capture that keeps the last N seconds of encoded video in
//! memory and writes them to a clip file on demand.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use instant_replay::{InstantReplay, RecordingSettings, CaptureTarget};
//!
//! let mut session = InstantReplay::builder()
//!     .settings(RecordingSettings {
//!         retention_seconds: 30,
//!         target: CaptureTarget::Monitor(0),
//!         ..Default::default()
//!     })
//!     .capture_source(|settings| platform_source(settings))
//!     .on_status(|status| tracing::info!(%status, "replay"))
//!     .start()
//!     .await?;
//!
//! // The hotkey fires:
//! session.save_clip("clips/highlight.mp4").await?;
//!
//! session.stop().await;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! CaptureSource ─► frame queue ─► HardwareEncoder ─► encoder process
//!  (platform)     (drop oldest)   (adaptive select)        │ Annex B
//!                                                           ▼
//!     clip file ◄── ClipWriter ◄── snapshot ◄── PacketRingBuffer
//! ```
//!
//! - **Capture source**: delivers GPU frames and never waits on the encoder
//! - **Frame queue**: bounded; when full the oldest frame is dropped and counted
//! - **Encoder**: the first backend of an ordered list that starts on this
//!   machine; its output is split into NAL units and kept for the retention
//!   window
//! - **Clip writer**: remuxes a keyframe-aligned snapshot into a container
//!   without re-encoding

#![warn(missing_docs)]
// Timestamp and pixel arithmetic casts between integer widths on purpose
#![allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap,
    clippy::cast_lossless
)]
// unwrap/expect allowed in tests only
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]
#![allow(clippy::missing_panics_doc, clippy::missing_errors_doc)]

mod builder;
pub mod clip;
mod config;
pub mod encoder;
mod error;
mod event;
mod frame;
pub mod packet;
pub mod pipeline;
mod session;
pub mod source;

pub use builder::{InstantReplay, ReplayBuilder};
pub use clip::{ClipOutcome, ClipWriter, FfmpegClipWriter};
pub use config::{CaptureTarget, EncoderPolicy, ForcedBackend, RecordingSettings, ReplayConfig};
pub use encoder::{AdaptiveEncoder, HardwareEncoder};
pub use error::{BackendAttempt, CaptureError, ClipError, EncoderError, ReplayError};
pub use event::{status_callback, SessionStatus, StatusCallback};
pub use frame::RawFrame;
pub use packet::{
    AnnexBPacketizer, EncodedPacket, EncodedPacketSnapshot, NalUnitType, PacketRingBuffer,
};
pub use pipeline::SessionStats;
pub use session::ClipSession;
pub use source::{CaptureSource, SyntheticSource};
