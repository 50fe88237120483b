//! H.264 Annex B NAL unit helpers.
//!
//! The type codes below are H.264 values. HEVC carries a two-byte header
//! with a six-bit type field and different numbering, so these constants
//! must be revisited before the pipeline is pointed at an HEVC encoder.

/// NAL unit types (5 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NalUnitType {
    /// Non-IDR slice (P or B frame)
    SliceNonIdr,
    /// Slice data partition A
    SliceDataPartA,
    /// Slice data partition B
    SliceDataPartB,
    /// Slice data partition C
    SliceDataPartC,
    /// IDR slice (keyframe)
    SliceIdr,
    /// Supplemental enhancement information
    Sei,
    /// Sequence parameter set
    Sps,
    /// Picture parameter set
    Pps,
    /// Access unit delimiter
    Aud,
    /// End of sequence
    EndSeq,
    /// End of stream
    EndStream,
    /// Filler data
    Filler,
    /// Unknown/reserved
    Unknown(u8),
}

impl From<u8> for NalUnitType {
    fn from(value: u8) -> Self {
        match value & 0x1F {
            1 => NalUnitType::SliceNonIdr,
            2 => NalUnitType::SliceDataPartA,
            3 => NalUnitType::SliceDataPartB,
            4 => NalUnitType::SliceDataPartC,
            5 => NalUnitType::SliceIdr,
            6 => NalUnitType::Sei,
            7 => NalUnitType::Sps,
            8 => NalUnitType::Pps,
            9 => NalUnitType::Aud,
            10 => NalUnitType::EndSeq,
            11 => NalUnitType::EndStream,
            12 => NalUnitType::Filler,
            n => NalUnitType::Unknown(n),
        }
    }
}

impl NalUnitType {
    /// IDR slice: decodable without earlier units.
    pub fn is_keyframe(&self) -> bool {
        matches!(self, NalUnitType::SliceIdr)
    }

    /// Coded slice data (types 1..=5), i.e. one picture's worth of video.
    pub fn is_slice(&self) -> bool {
        matches!(
            self,
            NalUnitType::SliceNonIdr
                | NalUnitType::SliceDataPartA
                | NalUnitType::SliceDataPartB
                | NalUnitType::SliceDataPartC
                | NalUnitType::SliceIdr
        )
    }

    /// Stream headers a decoder needs ahead of a keyframe (SEI, SPS, PPS, AUD).
    pub fn is_stream_header(&self) -> bool {
        matches!(
            self,
            NalUnitType::Sei | NalUnitType::Sps | NalUnitType::Pps | NalUnitType::Aud
        )
    }
}

/// Length of the start code at the beginning of `data`, if any.
pub fn start_code_len(data: &[u8]) -> Option<usize> {
    match data {
        [0, 0, 1, ..] => Some(3),
        [0, 0, 0, 1, ..] => Some(4),
        _ => None,
    }
}

/// Type of a start-code-prefixed NAL unit.
///
/// Returns `None` when `data` does not begin with a start code followed by
/// a header byte.
pub fn nal_type(data: &[u8]) -> Option<NalUnitType> {
    let prefix = start_code_len(data)?;
    data.get(prefix).map(|&header| NalUnitType::from(header))
}

/// Returns `true` if `data` is a start-code-prefixed IDR slice.
pub fn is_keyframe_unit(data: &[u8]) -> bool {
    nal_type(data).is_some_and(|t| t.is_keyframe())
}
