//! Frame pipeline between a capture source and the encoder.
//!
//! ```text
//! capture callback → FrameQueue (drop oldest) → consumer task → HardwareEncoder
//! ```
//!
//! - **Frame queue**: bounded, never blocks the producer, evicts the oldest
//!   frame when full and counts the eviction
//! - **Capture manager**: owns the queue, the consumer task and the
//!   resolution-change forwarding, and exposes throughput counters

mod capture;
mod frame_queue;

pub use capture::{CaptureManager, SessionStats};
pub use frame_queue::{frame_queue, FrameReceiver, FrameSender, SendOutcome};
