//! Encoded bitstream handling: Annex B packetizing, the rolling packet
//! buffer, and keyframe-anchored snapshots.

mod nal;
mod packetizer;
mod ring_buffer;

pub use nal::{is_keyframe_unit, nal_type, start_code_len, NalUnitType};
pub use packetizer::AnnexBPacketizer;
pub use ring_buffer::{EncodedPacketSnapshot, PacketRingBuffer, RingStats};

use bytes::Bytes;

/// One NAL unit emitted by an encoder, start code included.
///
/// Payloads are reference-counted [`Bytes`]; cloning a packet never copies
/// the bitstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPacket {
    /// Annex B bytes: start code followed by the NAL unit.
    pub data: Bytes,
    /// Presentation timestamp in milliseconds. Zero or negative means unknown.
    pub pts: i64,
    /// Decode timestamp in milliseconds.
    pub dts: i64,
    /// `true` when this unit is an IDR slice.
    pub keyframe: bool,
}

impl EncodedPacket {
    /// Wraps an Annex B unit, classifying it from its NAL header.
    pub fn new(data: impl Into<Bytes>, pts: i64, dts: i64) -> Self {
        let data = data.into();
        let keyframe = is_keyframe_unit(&data);
        Self {
            data,
            pts,
            dts,
            keyframe,
        }
    }

    /// NAL unit type, if the payload starts with a start code.
    pub fn nal_type(&self) -> Option<NalUnitType> {
        nal_type(&self.data)
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns `true` for coded picture data (NAL types 1..=5).
    pub fn is_slice(&self) -> bool {
        self.nal_type().is_some_and(|t| t.is_slice())
    }

    /// Returns `true` for SEI, SPS, PPS and AUD units.
    pub fn is_stream_header(&self) -> bool {
        self.nal_type().is_some_and(|t| t.is_stream_header())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoded_packet_classifies_keyframe() {
        let idr = EncodedPacket::new(vec![0, 0, 0, 1, 0x65, 0xAA], 10, 10);
        assert!(idr.keyframe);
        assert!(idr.is_slice());
        assert!(!idr.is_stream_header());

        let sps = EncodedPacket::new(vec![0, 0, 0, 1, 0x67, 0x42], 10, 10);
        assert!(!sps.keyframe);
        assert!(sps.is_stream_header());
        assert_eq!(sps.nal_type(), Some(NalUnitType::Sps));
    }

    #[test]
    fn test_encoded_packet_without_start_code() {
        let junk = EncodedPacket::new(vec![0xFF, 0xFE], 0, 0);
        assert!(!junk.keyframe);
        assert_eq!(junk.nal_type(), None);
        assert_eq!(junk.len(), 2);
    }
}
