// ABOUTME: Single-producer/single-consumer bounded frame bus between encoder and fan-out
// ABOUTME: Full-queue policy: non-keyframes are shed, a keyframe clears the queue and replaces it

use crate::datatypes::{CodecSpecificData, EncodedFrame};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Default bound of the frame bus. Roughly two seconds of 30 fps video;
/// deeper than this is latency, not resilience.
pub const FRAME_BUS_CAPACITY: usize = 60;

/// Observability counters for the bus. Publish failure is backpressure,
/// not an error, so it is counted rather than propagated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameBusStats {
    pub published: u64,
    pub shed: u64,
    pub keyframe_clears: u64,
}

struct Inner {
    queue: VecDeque<EncodedFrame>,
    pending_csd: Option<CodecSpecificData>,
    stats: FrameBusStats,
}

/// Bounded queue carrying encoded video frames from the encoder producer
/// to the fan-out loop.
///
/// Discipline is strictly single producer (the encoder output task) and
/// single consumer (the fan-out task). The consumer polls with a timeout
/// rather than blocking indefinitely so shutdown flags are observed
/// within one tick.
pub struct FrameBus {
    inner: Mutex<Inner>,
    notify: Notify,
    capacity: usize,
}

impl FrameBus {
    pub fn new() -> Self {
        Self::with_capacity(FRAME_BUS_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::with_capacity(capacity),
                pending_csd: None,
                stats: FrameBusStats::default(),
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Offer a frame to the bus. Returns `false` when the frame was shed.
    ///
    /// A keyframe is never refused: if the queue is full it is cleared
    /// and the keyframe enqueued alone, since a keyframe resets decoder
    /// context and makes the abandoned frames undecodable context anyway.
    pub fn publish(&self, frame: EncodedFrame) -> bool {
        let mut inner = self.inner.lock().expect("frame bus lock poisoned");
        if inner.queue.len() >= self.capacity {
            if frame.is_keyframe {
                inner.queue.clear();
                inner.stats.keyframe_clears += 1;
            } else {
                inner.stats.shed += 1;
                return false;
            }
        }
        inner.queue.push_back(frame);
        inner.stats.published += 1;
        drop(inner);
        self.notify.notify_one();
        true
    }

    /// Take the oldest frame, waiting at most `timeout`.
    pub async fn poll(&self, timeout: Duration) -> Option<EncodedFrame> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(frame) = self.try_pop() {
                return Some(frame);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            // A permit stored by notify_one survives until the next
            // notified().await, so a publish between try_pop and here is
            // not lost.
            let _ = tokio::time::timeout_at(deadline, self.notify.notified()).await;
        }
    }

    pub fn try_pop(&self) -> Option<EncodedFrame> {
        self.inner
            .lock()
            .expect("frame bus lock poisoned")
            .queue
            .pop_front()
    }

    /// Abandon everything queued. Used when an epoch is torn down.
    pub fn clear(&self) {
        self.inner
            .lock()
            .expect("frame bus lock poisoned")
            .queue
            .clear();
    }

    pub fn depth(&self) -> usize {
        self.inner.lock().expect("frame bus lock poisoned").queue.len()
    }

    /// Stash the most recent codec-specific data for the current epoch so
    /// newly-admitted sessions can be primed before their first frame.
    pub fn set_pending_csd(&self, csd: CodecSpecificData) {
        self.inner
            .lock()
            .expect("frame bus lock poisoned")
            .pending_csd = Some(csd);
    }

    pub fn pending_csd(&self) -> Option<CodecSpecificData> {
        self.inner
            .lock()
            .expect("frame bus lock poisoned")
            .pending_csd
            .clone()
    }

    pub fn stats(&self) -> FrameBusStats {
        self.inner.lock().expect("frame bus lock poisoned").stats
    }
}

impl Default for FrameBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn frame(is_keyframe: bool, pts_us: i64) -> EncodedFrame {
        EncodedFrame::new(Bytes::from_static(&[0u8; 16]), is_keyframe, pts_us, 1)
    }

    #[test]
    fn publish_within_capacity_succeeds() {
        let bus = FrameBus::with_capacity(4);
        for i in 0..4 {
            assert!(bus.publish(frame(i == 0, i as i64)));
        }
        assert_eq!(bus.depth(), 4);
        assert_eq!(bus.stats().published, 4);
        assert_eq!(bus.stats().shed, 0);
    }

    #[test]
    fn full_queue_sheds_non_keyframes() {
        let bus = FrameBus::with_capacity(60);
        assert!(bus.publish(frame(true, 0)));
        for i in 1..60 {
            assert!(bus.publish(frame(false, i)));
        }

        // 61st non-keyframe into a full queue is refused.
        assert!(!bus.publish(frame(false, 60)));
        assert!(!bus.publish(frame(false, 61)));
        assert_eq!(bus.depth(), 60);
        assert_eq!(bus.stats().shed, 2);
    }

    #[test]
    fn keyframe_clears_full_queue_and_replaces_it() {
        let bus = FrameBus::with_capacity(60);
        bus.publish(frame(true, 0));
        for i in 1..60 {
            bus.publish(frame(false, i));
        }
        assert!(!bus.publish(frame(false, 60)));

        // A fresh keyframe evicts the backlog and stands alone.
        let k2 = frame(true, 61);
        assert!(bus.publish(k2.clone()));
        assert_eq!(bus.depth(), 1);
        assert_eq!(bus.try_pop(), Some(k2));
        assert_eq!(bus.stats().keyframe_clears, 1);
    }

    #[test]
    fn pending_csd_slot_holds_latest() {
        let bus = FrameBus::new();
        assert!(bus.pending_csd().is_none());

        let old = CodecSpecificData {
            sps: Bytes::from_static(&[1]),
            pps: Bytes::from_static(&[2]),
            epoch: 1,
        };
        let new = CodecSpecificData {
            sps: Bytes::from_static(&[3]),
            pps: Bytes::from_static(&[4]),
            epoch: 2,
        };
        bus.set_pending_csd(old);
        bus.set_pending_csd(new.clone());
        assert_eq!(bus.pending_csd(), Some(new));
    }

    #[tokio::test]
    async fn poll_times_out_when_empty() {
        let bus = FrameBus::new();
        let start = std::time::Instant::now();
        assert!(bus.poll(Duration::from_millis(20)).await.is_none());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn poll_wakes_on_publish() {
        let bus = std::sync::Arc::new(FrameBus::new());
        let producer = bus.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            producer.publish(frame(true, 0));
        });

        let got = bus.poll(Duration::from_secs(2)).await;
        assert!(got.is_some_and(|f| f.is_keyframe));
        handle.await.unwrap();
    }
}
