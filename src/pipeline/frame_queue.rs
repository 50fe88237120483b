//! Bounded drop-oldest queue between a capture source and the encoder.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::RawFrame;

/// What happened to a frame handed to [`FrameSender::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Queued behind existing frames.
    Queued,
    /// Queued; the oldest queued frame was dropped to make room.
    DroppedOldest,
    /// The queue is closed; the frame was released.
    Closed,
}

impl SendOutcome {
    /// Returns `true` if the queue no longer accepts frames.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

#[derive(Debug, Default)]
struct QueueState {
    frames: VecDeque<RawFrame>,
    closed: bool,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
    senders: AtomicUsize,
    enqueued: AtomicU64,
    dropped: AtomicU64,
}

/// Creates a queue holding at most `capacity` frames (minimum one).
pub fn frame_queue(capacity: usize) -> (FrameSender, FrameReceiver) {
    let shared = Arc::new(Shared {
        state: Mutex::new(QueueState::default()),
        notify: Notify::new(),
        capacity: capacity.max(1),
        senders: AtomicUsize::new(1),
        enqueued: AtomicU64::new(0),
        dropped: AtomicU64::new(0),
    });
    (
        FrameSender {
            shared: Arc::clone(&shared),
        },
        FrameReceiver { shared },
    )
}

/// Producer half. Cloneable; [`send`](Self::send) never waits.
///
/// Dropping the last sender closes the queue.
#[derive(Debug)]
pub struct FrameSender {
    shared: Arc<Shared>,
}

impl FrameSender {
    /// Enqueues `frame`, evicting and releasing the oldest frame when full.
    pub fn send(&self, frame: RawFrame) -> SendOutcome {
        let evicted = {
            let mut state = self.shared.state.lock();
            if state.closed {
                drop(state);
                frame.release();
                return SendOutcome::Closed;
            }
            state.frames.push_back(frame);
            if state.frames.len() > self.shared.capacity {
                state.frames.pop_front()
            } else {
                None
            }
        };

        self.shared.enqueued.fetch_add(1, Ordering::Relaxed);
        self.shared.notify.notify_one();

        match evicted {
            Some(old) => {
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(ts = old.timestamp_ms(), "frame queue full, dropped oldest");
                old.release();
                SendOutcome::DroppedOldest
            }
            None => SendOutcome::Queued,
        }
    }

    /// Returns `true` once the queue has been closed.
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }
}

impl Clone for FrameSender {
    fn clone(&self) -> Self {
        self.shared.senders.fetch_add(1, Ordering::Relaxed);
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Drop for FrameSender {
    fn drop(&mut self) {
        if self.shared.senders.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.shared.state.lock().closed = true;
            self.shared.notify.notify_one();
        }
    }
}

/// Consumer half.
#[derive(Debug)]
pub struct FrameReceiver {
    shared: Arc<Shared>,
}

impl FrameReceiver {
    /// Waits for the next frame.
    ///
    /// Returns `None` once the queue is closed (explicitly or by dropping
    /// every sender) and drained.
    pub async fn recv(&self) -> Option<RawFrame> {
        loop {
            let notified = self.shared.notify.notified();
            {
                let mut state = self.shared.state.lock();
                if let Some(frame) = state.frames.pop_front() {
                    return Some(frame);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Takes the next frame if one is queued.
    pub fn try_recv(&self) -> Option<RawFrame> {
        self.shared.state.lock().frames.pop_front()
    }

    /// Stops accepting frames. Queued frames remain receivable.
    pub fn close(&self) {
        self.shared.state.lock().closed = true;
        self.shared.notify.notify_one();
    }

    /// Frames currently queued.
    pub fn len(&self) -> usize {
        self.shared.state.lock().frames.len()
    }

    /// Returns `true` if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Frames accepted by [`FrameSender::send`], including later-dropped ones.
    pub fn enqueued(&self) -> u64 {
        self.shared.enqueued.load(Ordering::Relaxed)
    }

    /// Frames evicted to make room for newer ones.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Releases every queued frame without delivering it.
    pub fn discard_pending(&self) -> usize {
        let frames: Vec<RawFrame> = self.shared.state.lock().frames.drain(..).collect();
        let count = frames.len();
        frames.into_iter().for_each(RawFrame::release);
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::CpuSurface;
    use std::time::Duration;

    fn frame(ts: i64) -> RawFrame {
        RawFrame::new(Arc::new(CpuSurface::solid(1, 2, 2, [0; 4])), ts)
    }

    #[test]
    fn test_drop_oldest_keeps_most_recent() {
        let (tx, rx) = frame_queue(4);
        let outcomes: Vec<_> = (1..=10).map(|ts| tx.send(frame(ts))).collect();

        assert_eq!(outcomes[..4], [SendOutcome::Queued; 4]);
        assert!(outcomes[4..].iter().all(|o| *o == SendOutcome::DroppedOldest));
        assert_eq!(rx.enqueued(), 10);
        assert_eq!(rx.dropped(), 6);

        let delivered: Vec<_> = std::iter::from_fn(|| rx.try_recv())
            .map(|f| f.timestamp_ms())
            .collect();
        assert_eq!(delivered, vec![7, 8, 9, 10]);
    }

    #[test]
    fn test_zero_capacity_holds_one() {
        let (tx, rx) = frame_queue(0);
        tx.send(frame(1));
        tx.send(frame(2));
        assert_eq!(rx.len(), 1);
        assert_eq!(rx.try_recv().map(|f| f.timestamp_ms()), Some(2));
    }

    #[test]
    fn test_closed_queue_rejects_frames() {
        let (tx, rx) = frame_queue(2);
        tx.send(frame(1));
        rx.close();
        assert!(tx.is_closed());
        assert_eq!(tx.send(frame(2)), SendOutcome::Closed);
        assert_eq!(rx.enqueued(), 1);
        // Frames queued before close are still delivered.
        assert_eq!(rx.try_recv().map(|f| f.timestamp_ms()), Some(1));
    }

    #[tokio::test]
    async fn test_recv_waits_for_frames() {
        let (tx, rx) = frame_queue(2);
        let consumer = tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(f) = rx.recv().await {
                seen.push(f.timestamp_ms());
                if seen.len() == 2 {
                    rx.close();
                }
            }
            seen
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        tx.send(frame(1));
        tokio::time::sleep(Duration::from_millis(10)).await;
        tx.send(frame(2));

        let seen = tokio::time::timeout(Duration::from_secs(2), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seen, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_recv_returns_none_after_close() {
        let (_tx, rx) = frame_queue(2);
        rx.close();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_recv_ends_when_last_sender_dropped() {
        let (tx, rx) = frame_queue(2);
        let second = tx.clone();
        tx.send(frame(1));
        drop(tx);
        assert!(!second.is_closed());

        let consumer = tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(f) = rx.recv().await {
                seen.push(f.timestamp_ms());
            }
            seen
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        second.send(frame(2));
        drop(second);

        let seen = tokio::time::timeout(Duration::from_secs(2), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seen, vec![1, 2]);
    }

    #[test]
    fn test_discard_pending_releases_frames() {
        let (tx, rx) = frame_queue(3);
        for ts in 0..3 {
            tx.send(frame(ts));
        }
        assert_eq!(rx.discard_pending(), 3);
        assert!(rx.is_empty());
    }
}
