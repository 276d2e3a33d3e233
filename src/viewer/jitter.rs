// ABOUTME: Adaptive decode queue: EWMA inter-arrival jitter drives the target buffer depth
// ABOUTME: Overfull queues trim non-keyframes and raise a backpressure signal to the server

use crate::datatypes::EncodedFrame;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// EWMA smoothing factor for both the mean inter-arrival time and the
/// jitter estimate.
const EWMA_ALPHA: f64 = 0.1;

/// Jitter thresholds (microseconds) for picking the target depth.
const LOW_JITTER_US: f64 = 10_000.0;
const HIGH_JITTER_US: f64 = 30_000.0;

/// How long the queue must sit above target before trimming starts.
const OVER_TARGET_WINDOW: Duration = Duration::from_millis(500);

/// Emitted on shed/recover edges so the client can tell the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PressureSignal {
    Backpressure,
    Clear,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeQueueStats {
    pub received: u64,
    pub trimmed: u64,
    pub shed: u64,
    pub keyframe_clears: u64,
}

/// Bounded decode queue with an adaptive target depth.
///
/// The target floats between 2 frames (steady arrival) and 4 frames
/// (jittery arrival). The client drains down to the target after every
/// push, so the buffered depth *is* the jitter allowance. The hard bound
/// uses the same keyframe-preserving shed policy as the server queues.
#[derive(Debug)]
pub struct DecodeQueue {
    queue: VecDeque<EncodedFrame>,
    capacity: usize,
    mean_interval_us: f64,
    jitter_us: f64,
    last_arrival: Option<Instant>,
    target_depth: usize,
    over_target_since: Option<Instant>,
    pressured: bool,
    stats: DecodeQueueStats,
}

impl DecodeQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(capacity),
            capacity,
            mean_interval_us: 33_000.0,
            jitter_us: 0.0,
            last_arrival: None,
            target_depth: 2,
            over_target_since: None,
            pressured: false,
            stats: DecodeQueueStats::default(),
        }
    }

    pub fn depth(&self) -> usize {
        self.queue.len()
    }

    pub fn target_depth(&self) -> usize {
        self.target_depth
    }

    pub fn jitter_us(&self) -> f64 {
        self.jitter_us
    }

    pub fn stats(&self) -> DecodeQueueStats {
        self.stats
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.over_target_since = None;
    }

    pub fn pop(&mut self) -> Option<EncodedFrame> {
        let frame = self.queue.pop_front();
        if self.queue.len() <= self.target_depth {
            // Draining back under target ends the over-target window.
            self.over_target_since = None;
        }
        frame
    }

    /// Accept an arriving frame, update the jitter estimate, and apply
    /// the depth policy. Returns a pressure edge when one occurs.
    pub fn push(&mut self, frame: EncodedFrame, now: Instant) -> Option<PressureSignal> {
        self.stats.received += 1;
        self.update_jitter(now);

        if self.queue.len() >= self.capacity {
            if frame.is_keyframe {
                self.queue.clear();
                self.stats.keyframe_clears += 1;
            } else {
                self.stats.shed += 1;
                return self.pressure_edge(true);
            }
        }
        self.queue.push_back(frame);

        let mut signal = None;
        if self.queue.len() > self.target_depth {
            match self.over_target_since {
                None => self.over_target_since = Some(now),
                Some(since) if now.duration_since(since) >= OVER_TARGET_WINDOW => {
                    self.trim_non_keyframes();
                    signal = self.pressure_edge(true);
                }
                Some(_) => {}
            }
        } else {
            self.over_target_since = None;
            signal = self.pressure_edge(false);
        }
        signal
    }

    fn update_jitter(&mut self, now: Instant) {
        if let Some(last) = self.last_arrival {
            let interval_us = now.duration_since(last).as_micros() as f64;
            let deviation = (interval_us - self.mean_interval_us).abs();
            self.mean_interval_us =
                self.mean_interval_us * (1.0 - EWMA_ALPHA) + interval_us * EWMA_ALPHA;
            self.jitter_us = self.jitter_us * (1.0 - EWMA_ALPHA) + deviation * EWMA_ALPHA;

            self.target_depth = if self.jitter_us < LOW_JITTER_US {
                2
            } else if self.jitter_us < HIGH_JITTER_US {
                3
            } else {
                4
            };
        }
        self.last_arrival = Some(now);
    }

    /// Drop non-keyframes from the oldest end until depth reaches target.
    fn trim_non_keyframes(&mut self) {
        let mut kept = VecDeque::with_capacity(self.queue.len());
        let mut excess = self.queue.len().saturating_sub(self.target_depth);
        for frame in self.queue.drain(..) {
            if excess > 0 && !frame.is_keyframe {
                excess -= 1;
                self.stats.trimmed += 1;
            } else {
                kept.push_back(frame);
            }
        }
        self.queue = kept;
        self.over_target_since = None;
    }

    fn pressure_edge(&mut self, pressured: bool) -> Option<PressureSignal> {
        if pressured == self.pressured {
            return None;
        }
        self.pressured = pressured;
        Some(if pressured {
            PressureSignal::Backpressure
        } else {
            PressureSignal::Clear
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn frame(is_keyframe: bool, pts: i64) -> EncodedFrame {
        EncodedFrame::new(Bytes::from_static(&[1u8; 4]), is_keyframe, pts, 1)
    }

    #[test]
    fn steady_arrival_keeps_shallow_target() {
        let mut queue = DecodeQueue::new(25);
        let base = Instant::now();
        for i in 0..60 {
            queue.push(frame(i == 0, i), base + Duration::from_millis(33 * i as u64));
            while queue.depth() > queue.target_depth() {
                queue.pop();
            }
        }
        assert_eq!(queue.target_depth(), 2);
        assert!(queue.jitter_us() < LOW_JITTER_US);
    }

    #[test]
    fn jittery_arrival_deepens_target() {
        let mut queue = DecodeQueue::new(25);
        let base = Instant::now();
        let mut at = base;
        for i in 0..60 {
            // Alternate 5 ms / 95 ms gaps: heavy jitter around a 50 ms mean.
            at += Duration::from_millis(if i % 2 == 0 { 5 } else { 95 });
            queue.push(frame(i == 0, i), at);
            while queue.depth() > queue.target_depth() {
                queue.pop();
            }
        }
        assert_eq!(queue.target_depth(), 4);
        assert!(queue.jitter_us() >= HIGH_JITTER_US);
    }

    #[test]
    fn sustained_overfill_trims_and_signals() {
        let mut queue = DecodeQueue::new(25);
        let base = Instant::now();
        let mut signal = None;
        // Push without draining; past the window the queue trims and
        // raises backpressure exactly once.
        for i in 0..40 {
            let now = base + Duration::from_millis(33 * i as u64);
            if let Some(s) = queue.push(frame(i == 0, i), now) {
                signal = Some((s, i));
            }
        }
        let (first_signal, _) = signal.expect("expected a pressure edge");
        assert_eq!(first_signal, PressureSignal::Backpressure);
        assert!(queue.stats().trimmed > 0);
        assert!(queue.depth() <= queue.target_depth().max(1) + 1);

        // Draining back under target clears the pressure.
        while queue.depth() > 0 {
            queue.pop();
        }
        let clear = queue.push(
            frame(false, 99),
            base + Duration::from_millis(33 * 41),
        );
        assert_eq!(clear, Some(PressureSignal::Clear));
    }

    #[test]
    fn hard_bound_keeps_keyframe_policy() {
        let mut queue = DecodeQueue::new(4);
        let base = Instant::now();
        for i in 0..4 {
            queue.push(frame(i == 0, i), base);
        }
        assert_eq!(queue.depth(), 4);

        // Non-keyframe into a full queue is shed.
        queue.push(frame(false, 4), base);
        assert_eq!(queue.stats().shed, 1);

        // Keyframe clears and replaces.
        queue.push(frame(true, 5), base);
        assert_eq!(queue.depth(), 1);
        assert!(queue.pop().unwrap().is_keyframe);
    }
}
