//! Time- and size-bounded packet history.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;

use super::EncodedPacket;

/// Retention used when a non-positive duration is configured.
const DEFAULT_RETENTION: Duration = Duration::from_secs(60);

/// Counters describing what a [`PacketRingBuffer`] currently holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingStats {
    /// Number of buffered packets.
    pub packets: usize,
    /// Sum of buffered payload lengths.
    pub bytes: usize,
}

#[derive(Debug)]
struct Entry {
    packet: EncodedPacket,
    /// Milliseconds used for retention: the pts when known, otherwise the
    /// buffer's own clock at append time.
    arrival_ms: i64,
}

#[derive(Debug, Default)]
struct RingState {
    entries: VecDeque<Entry>,
    bytes: usize,
}

/// Rolling window of encoded packets.
///
/// After every append the buffer holds nothing older than the retention
/// window (measured from the newest packet) and no more than `max_bytes`
/// of payload. All methods take `&self`; appends from the encoder's reader
/// task and snapshots from the save path may race freely.
#[derive(Debug)]
pub struct PacketRingBuffer {
    state: Mutex<RingState>,
    retention: Duration,
    max_bytes: usize,
    epoch: Instant,
}

impl PacketRingBuffer {
    /// Creates an empty buffer.
    ///
    /// A zero `retention` falls back to 60 seconds.
    pub fn new(retention: Duration, max_bytes: usize) -> Self {
        let retention = if retention.is_zero() {
            DEFAULT_RETENTION
        } else {
            retention
        };
        Self {
            state: Mutex::new(RingState::default()),
            retention,
            max_bytes,
            epoch: Instant::now(),
        }
    }

    /// Configured retention window.
    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Configured byte ceiling.
    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Appends a copy of `packet` and evicts what falls outside the bounds.
    ///
    /// The payload is copied so callers may reuse their read buffers.
    pub fn append(&self, packet: &EncodedPacket) {
        let arrival_ms = if packet.pts > 0 {
            packet.pts
        } else {
            self.clock_ms()
        };
        let stored = EncodedPacket {
            data: Bytes::copy_from_slice(&packet.data),
            ..packet.clone()
        };

        let mut state = self.state.lock();
        state.bytes += stored.data.len();
        state.entries.push_back(Entry {
            packet: stored,
            arrival_ms,
        });

        let cutoff = arrival_ms.saturating_sub(duration_ms(self.retention));
        while let Some(front) = state.entries.front() {
            if front.arrival_ms >= cutoff && state.bytes <= self.max_bytes {
                break;
            }
            if let Some(evicted) = state.entries.pop_front() {
                state.bytes -= evicted.packet.data.len();
            }
        }
    }

    /// Returns the packets needed to decode the last `duration` of video.
    ///
    /// The result starts at a keyframe, preceded by any SEI/SPS/PPS/AUD
    /// units that sit directly before it, and runs to the newest packet.
    /// The keyframe is the closest one at or before the start of the
    /// requested window; if the window has none before it, the first one
    /// inside the window is used. With no keyframe buffered at all the
    /// snapshot is empty. A zero `duration` means the full retention.
    pub fn snapshot_last(&self, duration: Duration) -> EncodedPacketSnapshot {
        let keep = if duration.is_zero() {
            self.retention
        } else {
            duration
        };

        let state = self.state.lock();
        let entries = &state.entries;
        let Some(latest) = entries.back() else {
            return EncodedPacketSnapshot::default();
        };
        let min_time = latest.arrival_ms.saturating_sub(duration_ms(keep));

        let window_start = entries
            .iter()
            .position(|e| e.arrival_ms >= min_time)
            .unwrap_or(entries.len() - 1);

        let anchor = (0..=window_start)
            .rev()
            .find(|&i| entries[i].packet.keyframe)
            .or_else(|| (window_start..entries.len()).find(|&i| entries[i].packet.keyframe));
        let Some(mut anchor) = anchor else {
            return EncodedPacketSnapshot::default();
        };

        while anchor > 0 && entries[anchor - 1].packet.is_stream_header() {
            anchor -= 1;
        }

        let packets = entries
            .range(anchor..)
            .map(|e| e.packet.clone())
            .collect();
        EncodedPacketSnapshot { packets }
    }

    /// Current packet and byte counts.
    pub fn stats(&self) -> RingStats {
        let state = self.state.lock();
        RingStats {
            packets: state.entries.len(),
            bytes: state.bytes,
        }
    }

    /// Number of buffered packets.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Returns `true` if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    /// Drops every buffered packet.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.bytes = 0;
    }

    fn clock_ms(&self) -> i64 {
        duration_ms(self.epoch.elapsed())
    }
}

fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// An ordered, decodable run of packets copied out of a [`PacketRingBuffer`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncodedPacketSnapshot {
    packets: Vec<EncodedPacket>,
}

impl EncodedPacketSnapshot {
    /// Wraps packets that are already in decode order.
    pub fn from_packets(packets: Vec<EncodedPacket>) -> Self {
        Self { packets }
    }

    /// The packets, oldest first.
    pub fn packets(&self) -> &[EncodedPacket] {
        &self.packets
    }

    /// Number of packets.
    pub fn len(&self) -> usize {
        self.packets.len()
    }

    /// Returns `true` if the snapshot holds nothing.
    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Sum of payload lengths.
    pub fn total_bytes(&self) -> usize {
        self.packets.iter().map(EncodedPacket::len).sum()
    }

    /// Number of coded picture units (NAL types 1..=5).
    pub fn access_unit_count(&self) -> usize {
        self.packets.iter().filter(|p| p.is_slice()).count()
    }

    /// Milliseconds between the first and last known (positive) pts.
    pub fn pts_span_ms(&self) -> Option<i64> {
        let mut known = self.packets.iter().map(|p| p.pts).filter(|&pts| pts > 0);
        let first = known.next()?;
        let last = known.last()?;
        Some(last - first)
    }

    /// Iterates over the packets in order.
    pub fn iter(&self) -> std::slice::Iter<'_, EncodedPacket> {
        self.packets.iter()
    }

    /// Consumes the snapshot, returning its packets.
    pub fn into_packets(self) -> Vec<EncodedPacket> {
        self.packets
    }
}

impl<'a> IntoIterator for &'a EncodedPacketSnapshot {
    type Item = &'a EncodedPacket;
    type IntoIter = std::slice::Iter<'a, EncodedPacket>;

    fn into_iter(self) -> Self::IntoIter {
        self.packets.iter()
    }
}
