//! Configuration types for replay sessions.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// What to capture. Exactly one target per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureTarget {
    /// A monitor by its index.
    Monitor(u32),
    /// A top-level window by its native handle.
    Window(u64),
    /// The main window of a process by its id.
    Process(u32),
}

impl Default for CaptureTarget {
    fn default() -> Self {
        Self::Monitor(0)
    }
}

impl fmt::Display for CaptureTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Monitor(index) => write!(f, "monitor:{index}"),
            Self::Window(handle) => write!(f, "window:{handle:#x}"),
            Self::Process(pid) => write!(f, "process:{pid}"),
        }
    }
}

/// Per-session recording settings.
///
/// Created once when a session starts and never mutated afterwards. A
/// resolution change reported by the capture source reconfigures the encoder
/// but leaves these settings untouched.
///
/// # Example
///
/// ```
/// use instant_replay::{CaptureTarget, RecordingSettings};
///
/// let settings = RecordingSettings {
///     fps: 30,
///     target: CaptureTarget::Process(4242),
///     ..Default::default()
/// };
/// assert_eq!(settings.retention(), std::time::Duration::from_secs(30));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingSettings {
    /// Output width in pixels.
    pub width: u32,
    /// Output height in pixels.
    pub height: u32,
    /// Frames per second.
    pub fps: u32,
    /// Target bitrate in bits per second.
    pub bitrate: u32,
    /// Length of the retained window (and of a saved clip) in seconds.
    pub retention_seconds: u32,
    /// Capture target.
    pub target: CaptureTarget,
}

impl RecordingSettings {
    /// Retention window as a [`Duration`], at least one second.
    #[must_use]
    pub fn retention(&self) -> Duration {
        Duration::from_secs(u64::from(self.retention_seconds.max(1)))
    }

    /// Frames per second, at least one.
    #[must_use]
    pub fn effective_fps(&self) -> u32 {
        self.fps.max(1)
    }

    /// Bitrate, at least one bit per second.
    #[must_use]
    pub fn effective_bitrate(&self) -> u32 {
        self.bitrate.max(1)
    }

    /// Nominal interval between frames.
    #[must_use]
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.effective_fps()))
    }
}

impl Default for RecordingSettings {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            fps: 60,
            bitrate: 12_000_000,
            retention_seconds: 30,
            target: CaptureTarget::default(),
        }
    }
}

/// Forces a specific encoder backend instead of the automatic order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ForcedBackend {
    /// Try vendor pipe, software pipe, then readback.
    #[default]
    Auto,
    /// Native vendor encode session only.
    VendorNative,
    /// External encoder process with the vendor hardware codec.
    VendorPipe,
    /// External encoder process with the software codec.
    SoftwarePipe,
    /// Per-frame readback into the software codec.
    Cpu,
}

impl ForcedBackend {
    /// Stable lowercase name used in status strings.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::VendorNative => "vendor-native",
            Self::VendorPipe => "vendor-pipe",
            Self::SoftwarePipe => "software-pipe",
            Self::Cpu => "cpu",
        }
    }
}

impl std::str::FromStr for ForcedBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" | "" => Ok(Self::Auto),
            "vendor-native" => Ok(Self::VendorNative),
            "vendor-pipe" => Ok(Self::VendorPipe),
            "software-pipe" => Ok(Self::SoftwarePipe),
            "cpu" => Ok(Self::Cpu),
            other => Err(format!("unknown encoder backend: {other}")),
        }
    }
}

/// Encoder selection policy handed to the adaptive selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EncoderPolicy {
    /// Which backend to use; `Auto` keeps the default fallback order.
    pub forced_backend: ForcedBackend,
    /// Exclude backends that encode on the CPU.
    pub strict_gpu_only: bool,
}

impl fmt::Display for EncoderPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "forced={};strictGpu={}",
            self.forced_backend.as_str(),
            self.strict_gpu_only
        )
    }
}

/// Engine-wide tuning that is not part of a single recording.
///
/// Use [`ReplayConfig::default()`] for sensible defaults, or customize as needed.
#[derive(Debug, Clone)]
pub struct ReplayConfig {
    /// Program used for both encoding and clip muxing.
    ///
    /// Default: `ffmpeg` (resolved through `PATH`)
    pub ffmpeg_path: PathBuf,

    /// Capacity of the capture-to-encoder frame queue.
    ///
    /// When full, the oldest queued frame is dropped. Default: 4
    pub frame_queue_capacity: usize,

    /// Capacity of the pipe encoder's internal input queue.
    ///
    /// When full, the newest frame is dropped. Default: 8
    pub encoder_queue_capacity: usize,

    /// Byte ceiling of each encoder's packet ring buffer.
    ///
    /// Default: 256 MiB
    pub max_ring_bytes: usize,

    /// Clip frame rate used when it cannot be estimated from timestamps.
    ///
    /// Default: 60
    pub clip_fps: u32,

    /// Vendor hardware codec name for the vendor pipe backend.
    ///
    /// Default: `h264_nvenc`
    pub vendor_codec: String,

    /// Software codec name for the software pipe and readback backends.
    ///
    /// Default: `libx264`
    pub software_codec: String,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            frame_queue_capacity: 4,
            encoder_queue_capacity: 8,
            max_ring_bytes: 256 * 1024 * 1024,
            clip_fps: 60,
            vendor_codec: "h264_nvenc".to_string(),
            software_codec: "libx264".to_string(),
        }
    }
}
