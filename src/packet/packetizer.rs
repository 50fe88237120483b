//! Splits an arbitrary byte stream into Annex B NAL units.
//!
//! Encoder output arrives in reads of whatever size the pipe delivers. A NAL
//! unit is only known to be complete once the next start code shows up, so
//! the tail from the last start code is held back until more data arrives
//! or [`AnnexBPacketizer::flush`] is called.

use bytes::{Buf, BytesMut};

use super::EncodedPacket;

/// Pending bytes allowed to accumulate without two start codes.
const MAX_PENDING_BYTES: usize = 8 * 1024 * 1024;

/// Bytes kept when the pending buffer overflows and has no usable start code.
const OVERFLOW_KEEP_BYTES: usize = 1024 * 1024;

/// Incremental Annex B splitter.
///
/// Emitted packets carry their own start code, so concatenating every
/// emitted payload reproduces the input from its first start code onward.
///
/// # Example
///
/// ```
/// use instant_replay::AnnexBPacketizer;
///
/// let mut packetizer = AnnexBPacketizer::new();
/// let out = packetizer.push(&[0, 0, 0, 1, 0x67, 0x42, 0, 0, 0, 1, 0x65], 1000, 1000);
/// assert_eq!(out.len(), 1);
/// assert_eq!(&out[0].data[..], &[0, 0, 0, 1, 0x67, 0x42]);
///
/// let rest = packetizer.flush(1016, 1016);
/// assert!(rest[0].keyframe);
/// ```
#[derive(Debug, Default)]
pub struct AnnexBPacketizer {
    pending: BytesMut,
    /// Start code offsets found in `pending`, ascending.
    starts: Vec<usize>,
    /// Next offset to examine for a start code.
    scan_from: usize,
    discarded_bytes: u64,
}

impl AnnexBPacketizer {
    /// Creates an empty packetizer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends bytes and returns every NAL unit completed by them.
    ///
    /// Returned packets are stamped with `pts`/`dts`, the timestamps of the
    /// read that completed them.
    pub fn push(&mut self, data: &[u8], pts: i64, dts: i64) -> Vec<EncodedPacket> {
        if data.is_empty() {
            return Vec::new();
        }
        self.pending.extend_from_slice(data);
        self.scan();

        if self.starts.len() < 2 {
            self.bound_pending();
            return Vec::new();
        }

        let mut packets = Vec::with_capacity(self.starts.len() - 1);
        let last = self.starts[self.starts.len() - 1];
        // Bytes before the first start code cannot be framed.
        let first = self.starts[0];
        if first > 0 {
            self.discarded_bytes += first as u64;
        }
        let mut head = self.pending.split_to(last);
        head.advance(first);
        let mut offset = first;
        for window in self.starts.windows(2) {
            let unit = head.split_to(window[1] - offset).freeze();
            offset = window[1];
            if !unit.is_empty() {
                packets.push(EncodedPacket::new(unit, pts, dts));
            }
        }

        self.starts.clear();
        self.starts.push(0);
        self.scan_from -= last;
        packets
    }

    /// Emits whatever is pending as a final packet.
    pub fn flush(&mut self, pts: i64, dts: i64) -> Vec<EncodedPacket> {
        self.starts.clear();
        self.scan_from = 0;
        if self.pending.is_empty() {
            return Vec::new();
        }
        let unit = self.pending.split().freeze();
        vec![EncodedPacket::new(unit, pts, dts)]
    }

    /// Bytes held back waiting for the next start code.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Total bytes thrown away because they could not be framed.
    pub fn discarded_bytes(&self) -> u64 {
        self.discarded_bytes
    }

    fn scan(&mut self) {
        let buf = &self.pending[..];
        let mut i = self.scan_from;
        // One byte of lookahead past a 3-byte code decides between 3 and 4.
        while i + 3 < buf.len() {
            if buf[i] == 0 && buf[i + 1] == 0 {
                if buf[i + 2] == 1 {
                    self.starts.push(i);
                    i += 3;
                    continue;
                }
                if buf[i + 2] == 0 && buf[i + 3] == 1 {
                    self.starts.push(i);
                    i += 4;
                    continue;
                }
            }
            i += 1;
        }
        self.scan_from = i;
    }

    fn bound_pending(&mut self) {
        if self.pending.len() <= MAX_PENDING_BYTES {
            return;
        }
        let before = self.pending.len();

        if let Some(&last) = self.starts.last() {
            if last > 0 {
                self.pending.advance(last);
                self.scan_from -= last;
                self.starts.clear();
                self.starts.push(0);
            }
        }

        if self.pending.len() > MAX_PENDING_BYTES {
            let cut = self.pending.len() - OVERFLOW_KEEP_BYTES;
            self.pending.advance(cut);
            self.starts.clear();
            self.scan_from = 0;
            self.scan();
        }

        let dropped = before - self.pending.len();
        self.discarded_bytes += dropped as u64;
        tracing::warn!(
            dropped,
            kept = self.pending.len(),
            "Annex B buffer overflow without start codes, discarding bytes"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(header: u8, body_len: usize) -> Vec<u8> {
        let mut v = vec![0, 0, 0, 1, header];
        v.extend(std::iter::repeat(0xAB).take(body_len));
        v
    }

    #[test]
    fn test_splits_complete_units() {
        let mut stream = unit(0x67, 8);
        stream.extend(unit(0x68, 4));
        stream.extend(unit(0x65, 32));

        let mut p = AnnexBPacketizer::new();
        let out = p.push(&stream, 100, 100);
        assert_eq!(out.len(), 2);
        assert_eq!(&out[0].data[..], &unit(0x67, 8)[..]);
        assert_eq!(&out[1].data[..], &unit(0x68, 4)[..]);
        assert_eq!(p.pending_len(), unit(0x65, 32).len());

        let rest = p.flush(116, 116);
        assert_eq!(rest.len(), 1);
        assert!(rest[0].keyframe);
        assert_eq!(rest[0].pts, 116);
    }

    #[test]
    fn test_start_code_split_across_reads() {
        let mut stream = unit(0x41, 10);
        stream.extend(unit(0x41, 10));
        let split_at = stream.len() - 13; // inside the second start code

        let mut p = AnnexBPacketizer::new();
        assert!(p.push(&stream[..split_at], 1, 1).is_empty());
        let out = p.push(&stream[split_at..], 2, 2);
        assert_eq!(out.len(), 1);
        assert_eq!(&out[0].data[..], &unit(0x41, 10)[..]);
        assert_eq!(out[0].pts, 2);
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut stream = Vec::new();
        for header in [0x09, 0x67, 0x68, 0x65, 0x41, 0x41] {
            stream.extend(unit(header, 7));
        }

        let mut p = AnnexBPacketizer::new();
        let mut out = Vec::new();
        for (i, b) in stream.iter().enumerate() {
            out.extend(p.push(std::slice::from_ref(b), i as i64 + 1, i as i64 + 1));
        }
        out.extend(p.flush(999, 999));

        let joined: Vec<u8> = out.iter().flat_map(|pkt| pkt.data.iter().copied()).collect();
        assert_eq!(joined, stream);
        assert_eq!(out.len(), 6);
    }

    #[test]
    fn test_three_byte_start_codes() {
        let stream = [0, 0, 1, 0x67, 1, 2, 0, 0, 1, 0x65, 3, 4];
        let mut p = AnnexBPacketizer::new();
        let out = p.push(&stream, 5, 5);
        assert_eq!(out.len(), 1);
        assert_eq!(&out[0].data[..], &[0, 0, 1, 0x67, 1, 2]);
        let rest = p.flush(6, 6);
        assert_eq!(&rest[0].data[..], &[0, 0, 1, 0x65, 3, 4]);
    }

    #[test]
    fn test_leading_garbage_is_discarded() {
        let mut stream = vec![0xDE, 0xAD];
        stream.extend(unit(0x67, 2));
        stream.extend(unit(0x65, 2));
        let mut p = AnnexBPacketizer::new();
        let out = p.push(&stream, 1, 1);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].nal_type(), Some(crate::NalUnitType::Sps));
        assert_eq!(p.discarded_bytes(), 2);
    }

    #[test]
    fn test_flush_empty() {
        let mut p = AnnexBPacketizer::new();
        assert!(p.flush(0, 0).is_empty());
        assert!(p.push(&[], 0, 0).is_empty());
    }

    #[test]
    fn test_overflow_without_start_codes_keeps_tail() {
        let mut p = AnnexBPacketizer::new();
        let chunk = vec![0xAB; 1024 * 1024];
        for _ in 0..9 {
            assert!(p.push(&chunk, 1, 1).is_empty());
        }
        assert_eq!(p.pending_len(), OVERFLOW_KEEP_BYTES);
        assert_eq!(p.discarded_bytes(), 8 * 1024 * 1024);
    }

    #[test]
    fn test_overflow_drops_bytes_before_last_start() {
        let mut p = AnnexBPacketizer::new();
        let mut first = vec![0xAB; MAX_PENDING_BYTES];
        first.extend(unit(0x65, 16));
        assert!(p.push(&first, 1, 1).is_empty());
        assert_eq!(p.pending_len(), unit(0x65, 16).len());

        let out = p.push(&unit(0x41, 4), 2, 2);
        assert_eq!(out.len(), 1);
        assert!(out[0].keyframe);
    }
}
