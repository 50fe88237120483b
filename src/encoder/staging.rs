//! GPU to CPU frame readback with staging reuse and buffer pooling.

use parking_lot::Mutex;

use crate::source::StagingSurface;
use crate::{CaptureError, RawFrame};

/// Most buffers kept by a [`FramePool`].
pub const MAX_POOLED_BUFFERS: usize = 4;

#[derive(Debug, Default)]
struct PoolState {
    size: usize,
    buffers: Vec<Vec<u8>>,
}

/// Reuses tightly packed frame buffers of one size.
///
/// Renting a different size empties the pool; buffers of a stale size are
/// not taken back.
#[derive(Debug, Default)]
pub struct FramePool {
    state: Mutex<PoolState>,
}

impl FramePool {
    /// Creates an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a buffer of exactly `size` bytes.
    pub fn rent(&self, size: usize) -> Vec<u8> {
        let mut state = self.state.lock();
        if state.size != size {
            state.buffers.clear();
            state.size = size;
        }
        state.buffers.pop().unwrap_or_else(|| vec![0; size])
    }

    /// Hands a buffer back for reuse.
    pub fn give_back(&self, buffer: Vec<u8>) {
        let mut state = self.state.lock();
        if buffer.len() == state.size && state.buffers.len() < MAX_POOLED_BUFFERS {
            state.buffers.push(buffer);
        }
    }

    /// Buffers currently available.
    pub fn pooled(&self) -> usize {
        self.state.lock().buffers.len()
    }
}

/// Copies frames out of GPU memory.
///
/// Owns one staging surface, recreated only when the frame size or the
/// source device changes. Confined to the backend that created it.
#[derive(Debug, Default)]
pub struct FrameReadback {
    staging: Option<StagingSurface>,
    recreated: u64,
}

impl FrameReadback {
    /// Creates a readback with no staging surface yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies `frame` into a tightly packed BGRA buffer rented from `pool`.
    ///
    /// # Errors
    ///
    /// [`CaptureError::SurfaceInvalidated`] if the source recreated the
    /// frame's storage, or [`CaptureError::Readback`] if the copy failed.
    pub fn read(&mut self, frame: &RawFrame, pool: &FramePool) -> Result<Vec<u8>, CaptureError> {
        if !frame.is_valid() {
            return Err(CaptureError::SurfaceInvalidated);
        }

        let surface = frame.surface();
        let (width, height) = frame.dimensions();
        let device_id = surface.device_id();

        let reusable = self
            .staging
            .as_ref()
            .is_some_and(|staging| staging.matches(device_id, width, height));
        if !reusable {
            self.staging = None;
            self.recreated += 1;
            tracing::debug!(width, height, device_id, "creating staging surface");
        }
        let staging = self
            .staging
            .get_or_insert_with(|| StagingSurface::new(device_id, width, height));

        surface.copy_to_staging(staging)?;

        let row_bytes = frame.packed_len() / height.max(1) as usize;
        let mut buffer = pool.rent(frame.packed_len());
        if let Err(e) = staging
            .map()
            .copy_rows_tight(row_bytes, height as usize, &mut buffer)
        {
            pool.give_back(buffer);
            return Err(e);
        }
        Ok(buffer)
    }

    /// Number of staging surfaces created so far.
    pub fn staging_recreations(&self) -> u64 {
        self.recreated
    }

    /// Drops the staging surface.
    pub fn release(&mut self) {
        self.staging = None;
    }
}
