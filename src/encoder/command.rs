//! Encoder process command line.

/// Builds the argument list of a raw-BGRA-in, H.264-out encoder process.
///
/// # Example
///
/// ```
/// use instant_replay::encoder::EncodeArgs;
///
/// let args = EncodeArgs::new("libx264").with_size(1280, 720).with_fps(30).build();
/// assert!(args.windows(2).any(|w| w == ["-s", "1280x720"]));
/// assert!(args.windows(2).any(|w| w == ["-tune", "zerolatency"]));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeArgs {
    codec: String,
    width: u32,
    height: u32,
    fps: u32,
    bitrate: u32,
}

impl EncodeArgs {
    /// Starts from 1920x1080 at 60 fps and 12 Mbit/s.
    pub fn new(codec: impl Into<String>) -> Self {
        Self {
            codec: codec.into(),
            width: 1920,
            height: 1080,
            fps: 60,
            bitrate: 12_000_000,
        }
    }

    /// Input frame size in pixels.
    #[must_use]
    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width.max(1);
        self.height = height.max(1);
        self
    }

    /// Input frame rate; also the keyframe interval (one per second).
    #[must_use]
    pub fn with_fps(mut self, fps: u32) -> Self {
        self.fps = fps.max(1);
        self
    }

    /// Target bitrate in bits per second.
    #[must_use]
    pub fn with_bitrate(mut self, bitrate: u32) -> Self {
        self.bitrate = bitrate.max(1);
        self
    }

    /// Codec selection and low-latency tuning.
    pub fn codec_args(&self) -> Vec<String> {
        let mut args = vec!["-c:v".to_string(), self.codec.clone()];
        if self.codec.to_ascii_lowercase().contains("nvenc") {
            args.extend(["-preset", "p1", "-tune", "ll"].map(String::from));
        } else if self.codec.eq_ignore_ascii_case("libx264") {
            args.extend(["-preset", "veryfast", "-tune", "zerolatency"].map(String::from));
        }
        args.extend([
            "-g".to_string(),
            self.fps.to_string(),
            "-bf".to_string(),
            "0".to_string(),
            "-b:v".to_string(),
            self.bitrate.to_string(),
        ]);
        args
    }

    /// Full argument list: raw frames on stdin, Annex B on stdout.
    pub fn build(&self) -> Vec<String> {
        let mut args: Vec<String> = [
            "-hide_banner",
            "-loglevel",
            "error",
            "-y",
            "-f",
            "rawvideo",
            "-pix_fmt",
            "bgra",
            "-s",
        ]
        .map(String::from)
        .into();
        args.push(format!("{}x{}", self.width, self.height));
        args.push("-r".to_string());
        args.push(self.fps.to_string());
        args.extend(["-i", "pipe:0", "-an"].map(String::from));
        args.extend(self.codec_args());
        args.extend(["-f", "h264", "pipe:1"].map(String::from));
        args
    }
}
