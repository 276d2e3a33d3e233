// ABOUTME: Viewer recovery watchdogs driven by monotonic deadlines, no nested timers
// ABOUTME: Each poll compares observed-event ages against fixed protocol timeouts

use crate::datatypes::ConnectionState;
use std::time::{Duration, Instant};

/// No `AUTH_OK` within this window forces a reconnect.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Authenticated but frameless: downgrade the UI at the soft mark.
pub const START_STALL_SOFT: Duration = Duration::from_secs(12);

/// Authenticated but frameless: reconnect at the hard mark.
pub const START_STALL_HARD: Duration = Duration::from_secs(25);

/// In `Streaming`, silence on the video path longer than this asks the
/// server for a keyframe.
pub const STREAM_STALL: Duration = Duration::from_secs(2);

/// Missing PONGs tolerated this long under normal conditions.
pub const PONG_TIMEOUT: Duration = Duration::from_secs(7);

/// PONG tolerance while audio still flows or a reconfigure grace window
/// is active.
pub const PONG_TIMEOUT_RELAXED: Duration = Duration::from_secs(14);

/// Heartbeat send cadence.
pub const PING_INTERVAL: Duration = Duration::from_secs(2);

/// Window after a reconfigure during which stall watchdogs hold fire;
/// the encoder restart legitimately produces no frames for a while.
pub const RECONFIGURE_GRACE: Duration = Duration::from_secs(10);

/// Audio counts as "still flowing" if heard within this window.
const AUDIO_FRESH: Duration = Duration::from_secs(2);

/// What a watchdog poll wants done. Multiple actions can fire in one
/// poll; `Reconnect` dominates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogAction {
    /// Show "No Video" without tearing the connection down.
    SoftDowngrade,
    /// Ask the server for a fresh decode entry point.
    RequestKeyframe,
    Reconnect,
}

/// All per-connection watchdogs in one place. The client records events
/// as they happen and polls on a coarse tick; verdicts are pure functions
/// of recorded instants, so tests drive them with explicit `now` values.
#[derive(Debug)]
pub struct Watchdogs {
    connected_at: Instant,
    authenticated_at: Option<Instant>,
    last_frame: Option<Instant>,
    last_pong: Option<Instant>,
    last_audio: Option<Instant>,
    grace_until: Option<Instant>,
    soft_stall_fired: bool,
    stream_stall_fired: bool,
}

impl Watchdogs {
    pub fn new(now: Instant) -> Self {
        Self {
            connected_at: now,
            authenticated_at: None,
            last_frame: None,
            last_pong: None,
            last_audio: None,
            grace_until: None,
            soft_stall_fired: false,
            stream_stall_fired: false,
        }
    }

    pub fn on_authenticated(&mut self, now: Instant) {
        self.authenticated_at = Some(now);
        // PONGs are only expected from here on.
        self.last_pong = Some(now);
    }

    pub fn on_frame(&mut self, now: Instant) {
        self.last_frame = Some(now);
        self.stream_stall_fired = false;
    }

    pub fn on_pong(&mut self, now: Instant) {
        self.last_pong = Some(now);
    }

    pub fn on_audio(&mut self, now: Instant) {
        self.last_audio = Some(now);
    }

    /// Open the stall-forgiveness window around an encoder restart.
    pub fn on_reconfigure(&mut self, now: Instant) {
        self.grace_until = Some(now + RECONFIGURE_GRACE);
    }

    fn grace_active(&self, now: Instant) -> bool {
        self.grace_until.is_some_and(|until| now < until)
    }

    fn audio_flowing(&self, now: Instant) -> bool {
        self.last_audio
            .is_some_and(|at| now.duration_since(at) < AUDIO_FRESH)
    }

    /// Evaluate every watchdog against `now`.
    pub fn poll(&mut self, state: ConnectionState, now: Instant) -> Vec<WatchdogAction> {
        let mut actions = Vec::new();

        // Handshake watchdog: connected but never authenticated.
        let authenticated_at = match self.authenticated_at {
            None => {
                if now.duration_since(self.connected_at) >= HANDSHAKE_TIMEOUT {
                    return vec![WatchdogAction::Reconnect];
                }
                return actions;
            }
            Some(at) => at,
        };

        // Start-stall watchdog: authenticated, zero frames so far.
        if self.last_frame.is_none() {
            let stalled_for = now.duration_since(authenticated_at);
            if stalled_for >= START_STALL_HARD && !self.grace_active(now) {
                return vec![WatchdogAction::Reconnect];
            }
            if stalled_for >= START_STALL_SOFT && !self.soft_stall_fired {
                self.soft_stall_fired = true;
                actions.push(WatchdogAction::SoftDowngrade);
            }
        }

        // Stream watchdog: frames stopped mid-stream.
        if state == ConnectionState::Streaming {
            if let Some(last_frame) = self.last_frame {
                if now.duration_since(last_frame) >= STREAM_STALL && !self.stream_stall_fired {
                    self.stream_stall_fired = true;
                    actions.push(WatchdogAction::RequestKeyframe);
                    if !self.audio_flowing(now) {
                        actions.push(WatchdogAction::SoftDowngrade);
                    }
                }
            }
        }

        // Heartbeat watchdog.
        let pong_tolerance = if self.audio_flowing(now) || self.grace_active(now) {
            PONG_TIMEOUT_RELAXED
        } else {
            PONG_TIMEOUT
        };
        if let Some(last_pong) = self.last_pong {
            if now.duration_since(last_pong) >= pong_tolerance {
                return vec![WatchdogAction::Reconnect];
            }
        }

        actions
    }
}

/// Reconnect delay ladder: 1 s, 2 s, 4 s, 8 s, then 10 s forever. Reset
/// on every successful authentication.
#[derive(Debug)]
pub struct Backoff {
    attempt: usize,
}

impl Backoff {
    const STEPS: [u64; 5] = [1, 2, 4, 8, 10];

    pub fn new() -> Self {
        Self { attempt: 0 }
    }

    pub fn next_delay(&mut self) -> Duration {
        let step = Self::STEPS[self.attempt.min(Self::STEPS.len() - 1)];
        self.attempt += 1;
        Duration::from_secs(step)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Instant {
        Instant::now()
    }

    #[test]
    fn handshake_watchdog_fires_at_ten_seconds() {
        let now = base();
        let mut dogs = Watchdogs::new(now);

        assert!(dogs.poll(ConnectionState::Connecting, now + Duration::from_secs(9)).is_empty());
        assert_eq!(
            dogs.poll(ConnectionState::Connecting, now + Duration::from_secs(10)),
            vec![WatchdogAction::Reconnect]
        );
    }

    #[test]
    fn start_stall_downgrades_then_reconnects() {
        let now = base();
        let mut dogs = Watchdogs::new(now);
        dogs.on_authenticated(now);

        // Heartbeat stays healthy throughout; only frames are missing.
        dogs.on_pong(now + Duration::from_secs(11));
        assert!(dogs.poll(ConnectionState::Authenticated, now + Duration::from_secs(11)).is_empty());

        // 12 s: one-shot downgrade to "No Video".
        dogs.on_pong(now + Duration::from_secs(12));
        assert_eq!(
            dogs.poll(ConnectionState::Connected, now + Duration::from_secs(12)),
            vec![WatchdogAction::SoftDowngrade]
        );
        dogs.on_pong(now + Duration::from_secs(13));
        assert!(dogs.poll(ConnectionState::Connected, now + Duration::from_secs(13)).is_empty());

        // 25 s total: give up and reconnect.
        dogs.on_pong(now + Duration::from_secs(25));
        assert_eq!(
            dogs.poll(ConnectionState::Connected, now + Duration::from_secs(25)),
            vec![WatchdogAction::Reconnect]
        );
    }

    #[test]
    fn reconfigure_grace_defers_hard_stall() {
        let now = base();
        let mut dogs = Watchdogs::new(now);
        dogs.on_authenticated(now);
        dogs.on_reconfigure(now + Duration::from_secs(20));

        dogs.on_pong(now + Duration::from_secs(24));
        let at_25 = dogs.poll(ConnectionState::Connected, now + Duration::from_secs(25));
        assert!(!at_25.contains(&WatchdogAction::Reconnect));
    }

    #[test]
    fn stream_stall_requests_keyframe() {
        let now = base();
        let mut dogs = Watchdogs::new(now);
        dogs.on_authenticated(now);
        dogs.on_frame(now + Duration::from_secs(1));
        dogs.on_pong(now + Duration::from_secs(2));

        let actions = dogs.poll(ConnectionState::Streaming, now + Duration::from_secs(4));
        assert!(actions.contains(&WatchdogAction::RequestKeyframe));
        assert!(actions.contains(&WatchdogAction::SoftDowngrade));

        // With audio still flowing, keep the streaming surface up.
        let mut dogs = Watchdogs::new(now);
        dogs.on_authenticated(now);
        dogs.on_frame(now + Duration::from_secs(1));
        dogs.on_pong(now + Duration::from_secs(3));
        dogs.on_audio(now + Duration::from_secs(3));
        let actions = dogs.poll(ConnectionState::Streaming, now + Duration::from_secs(4));
        assert!(actions.contains(&WatchdogAction::RequestKeyframe));
        assert!(!actions.contains(&WatchdogAction::SoftDowngrade));
    }

    #[test]
    fn pong_watchdog_relaxes_with_audio() {
        let now = base();
        let mut dogs = Watchdogs::new(now);
        dogs.on_authenticated(now);
        dogs.on_frame(now + Duration::from_secs(6));

        // 8 s without a PONG: reconnect under normal tolerance.
        assert_eq!(
            dogs.poll(ConnectionState::Streaming, now + Duration::from_secs(8)),
            vec![WatchdogAction::Reconnect]
        );

        let mut dogs = Watchdogs::new(now);
        dogs.on_authenticated(now);
        dogs.on_frame(now + Duration::from_secs(7));
        dogs.on_audio(now + Duration::from_secs(7));
        assert!(dogs.poll(ConnectionState::Streaming, now + Duration::from_secs(8)).is_empty());
    }

    #[test]
    fn backoff_ladder_caps_and_resets() {
        let mut backoff = Backoff::new();
        let observed: Vec<u64> = (0..7).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(observed, vec![1, 2, 4, 8, 10, 10, 10]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }
}
