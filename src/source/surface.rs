//! GPU surface abstraction and an in-memory implementation.
//!
//! Platform capture produces GPU-resident images. The encoder backends only
//! need two things from them: copy into a CPU-visible staging surface, and
//! know whether the image is still valid. [`GpuSurface`] is that seam.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::CaptureError;

/// Bytes per BGRA pixel.
pub const BYTES_PER_PIXEL: usize = 4;

/// Row alignment of staging surfaces, matching typical GPU map pitch.
const STAGING_ROW_ALIGNMENT: usize = 256;

/// A GPU-resident BGRA image produced by a capture source.
pub trait GpuSurface: Send + Sync {
    /// Width in pixels.
    fn width(&self) -> u32;

    /// Height in pixels.
    fn height(&self) -> u32;

    /// Identity of the device that owns the surface.
    ///
    /// Staging surfaces are bound to a device; a change forces recreation.
    fn device_id(&self) -> u64;

    /// Returns `false` once the source has recreated the underlying storage.
    fn is_valid(&self) -> bool {
        true
    }

    /// Copies the image into a CPU-visible staging surface.
    ///
    /// The staging surface is at least as large as this surface.
    fn copy_to_staging(&self, staging: &mut StagingSurface) -> Result<(), CaptureError>;
}

/// A CPU-readable copy target with a padded row pitch.
#[derive(Debug)]
pub struct StagingSurface {
    device_id: u64,
    width: u32,
    height: u32,
    row_pitch: usize,
    data: Vec<u8>,
}

impl StagingSurface {
    /// Allocates a staging surface for the given device and size.
    pub fn new(device_id: u64, width: u32, height: u32) -> Self {
        let tight = width as usize * BYTES_PER_PIXEL;
        let row_pitch = tight.div_ceil(STAGING_ROW_ALIGNMENT) * STAGING_ROW_ALIGNMENT;
        Self {
            device_id,
            width,
            height,
            row_pitch,
            data: vec![0; row_pitch * height as usize],
        }
    }

    /// Returns `true` if this surface can receive a copy of the given shape.
    pub fn matches(&self, device_id: u64, width: u32, height: u32) -> bool {
        self.device_id == device_id && self.width == width && self.height == height
    }

    /// Width in pixels.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Bytes between the starts of consecutive rows.
    pub fn row_pitch(&self) -> usize {
        self.row_pitch
    }

    /// Mutable access for [`GpuSurface::copy_to_staging`] implementations.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Maps the surface for reading.
    pub fn map(&self) -> MappedSurface<'_> {
        MappedSurface {
            data: &self.data,
            row_pitch: self.row_pitch,
        }
    }
}

/// A read mapping of a [`StagingSurface`].
#[derive(Debug, Clone, Copy)]
pub struct MappedSurface<'a> {
    /// Mapped bytes, `row_pitch * height` long.
    pub data: &'a [u8],
    /// Bytes between the starts of consecutive rows.
    pub row_pitch: usize,
}

impl MappedSurface<'_> {
    /// Copies `height` rows of `row_bytes` each into `out`, dropping row padding.
    pub fn copy_rows_tight(
        &self,
        row_bytes: usize,
        height: usize,
        out: &mut [u8],
    ) -> Result<(), CaptureError> {
        if row_bytes > self.row_pitch || out.len() < row_bytes * height {
            return Err(CaptureError::readback(format!(
                "row layout mismatch: row={row_bytes} pitch={} out={}",
                self.row_pitch,
                out.len()
            )));
        }
        if self.data.len() < self.row_pitch * height.saturating_sub(1) + row_bytes {
            return Err(CaptureError::readback("mapped surface shorter than frame"));
        }

        for y in 0..height {
            let src = &self.data[y * self.row_pitch..y * self.row_pitch + row_bytes];
            out[y * row_bytes..(y + 1) * row_bytes].copy_from_slice(src);
        }
        Ok(())
    }
}

/// Generation counter a source bumps when it recreates its storage.
///
/// Surfaces remember the generation they were captured in and report
/// themselves invalid once it moves on.
#[derive(Debug, Clone, Default)]
pub struct SurfaceGeneration(Arc<AtomicU64>);

impl SurfaceGeneration {
    /// Creates a counter at generation zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current generation.
    pub fn current(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    /// Invalidates every surface captured so far.
    pub fn advance(&self) -> u64 {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }
}

/// An in-memory BGRA surface.
///
/// Stands in for a GPU texture in the synthetic source and in tests.
#[derive(Debug)]
pub struct CpuSurface {
    device_id: u64,
    width: u32,
    height: u32,
    pixels: Vec<u8>,
    generation: Option<(SurfaceGeneration, u64)>,
}

impl CpuSurface {
    /// Creates a surface from tightly packed BGRA pixels.
    ///
    /// Returns `None` if `pixels` does not hold exactly `width * height` pixels.
    pub fn from_pixels(device_id: u64, width: u32, height: u32, pixels: Vec<u8>) -> Option<Self> {
        if pixels.len() != width as usize * height as usize * BYTES_PER_PIXEL {
            return None;
        }
        Some(Self {
            device_id,
            width,
            height,
            pixels,
            generation: None,
        })
    }

    /// Creates a surface filled with one BGRA color.
    pub fn solid(device_id: u64, width: u32, height: u32, bgra: [u8; 4]) -> Self {
        let count = width as usize * height as usize;
        let mut pixels = Vec::with_capacity(count * BYTES_PER_PIXEL);
        for _ in 0..count {
            pixels.extend_from_slice(&bgra);
        }
        Self {
            device_id,
            width,
            height,
            pixels,
            generation: None,
        }
    }

    /// Ties validity to a source generation counter.
    #[must_use]
    pub fn bound_to(mut self, generation: &SurfaceGeneration) -> Self {
        self.generation = Some((generation.clone(), generation.current()));
        self
    }

    /// Tightly packed pixel bytes.
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }
}

impl GpuSurface for CpuSurface {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn device_id(&self) -> u64 {
        self.device_id
    }

    fn is_valid(&self) -> bool {
        match &self.generation {
            Some((counter, captured)) => counter.current() == *captured,
            None => true,
        }
    }

    fn copy_to_staging(&self, staging: &mut StagingSurface) -> Result<(), CaptureError> {
        if staging.width() < self.width || staging.height() < self.height {
            return Err(CaptureError::readback(format!(
                "staging {}x{} smaller than surface {}x{}",
                staging.width(),
                staging.height(),
                self.width,
                self.height
            )));
        }

        let row_bytes = self.width as usize * BYTES_PER_PIXEL;
        let pitch = staging.row_pitch();
        let data = staging.data_mut();
        for (y, row) in self.pixels.chunks_exact(row_bytes).enumerate() {
            data[y * pitch..y * pitch + row_bytes].copy_from_slice(row);
        }
        Ok(())
    }
}
