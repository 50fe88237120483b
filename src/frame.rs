//! Captured frame handle.

use std::fmt;
use std::sync::Arc;

use crate::source::GpuSurface;

/// One captured picture.
///
/// A `RawFrame` references a GPU-resident surface together with its size and
/// a monotonic capture timestamp. It is produced by a capture source, moved
/// through the frame queue, and consumed exactly once by the encoder: it is
/// not `Clone`, and dropping it releases the surface reference.
///
/// The surface may be invalidated by its source after a resolution change;
/// check [`is_valid`](Self::is_valid) before reading it back.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use instant_replay::RawFrame;
/// use instant_replay::source::CpuSurface;
///
/// let surface = CpuSurface::solid(1, 640, 360, [0, 0, 0, 255]);
/// let frame = RawFrame::new(Arc::new(surface), 16);
/// assert_eq!(frame.dimensions(), (640, 360));
/// assert_eq!(frame.timestamp_ms(), 16);
/// ```
pub struct RawFrame {
    surface: Arc<dyn GpuSurface>,
    width: u32,
    height: u32,
    timestamp_ms: i64,
}

impl RawFrame {
    /// Wraps a surface captured at `timestamp_ms`.
    pub fn new(surface: Arc<dyn GpuSurface>, timestamp_ms: i64) -> Self {
        let width = surface.width();
        let height = surface.height();
        Self {
            surface,
            width,
            height,
            timestamp_ms,
        }
    }

    /// Width in pixels.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// `(width, height)` in pixels.
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Monotonic capture time in milliseconds.
    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }

    /// The backing surface.
    pub fn surface(&self) -> &dyn GpuSurface {
        self.surface.as_ref()
    }

    /// Returns `false` if the source has recreated the backing storage.
    pub fn is_valid(&self) -> bool {
        self.surface.is_valid()
    }

    /// Tightly packed size of this frame in bytes.
    pub fn packed_len(&self) -> usize {
        self.width as usize * self.height as usize * crate::source::BYTES_PER_PIXEL
    }

    /// Releases the frame without encoding it.
    pub fn release(self) {
        drop(self);
    }
}

impl fmt::Debug for RawFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawFrame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("timestamp_ms", &self.timestamp_ms)
            .field("device_id", &self.surface.device_id())
            .finish()
    }
}
