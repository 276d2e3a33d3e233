// ABOUTME: Server-authoritative stream state plus the per-side session state machines
// ABOUTME: Transition legality is checked in code so illegal moves surface as errors, not corruption

/// Wire-level stream state broadcast as `STREAM_STATE|<code>|epoch=<n>`.
///
/// The server is the single authority; viewers mirror whatever they
/// observe here instead of inferring state from data arrival.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStateCode {
    Active = 1,
    Reconfiguring = 2,
    Paused = 3,
    Stopped = 4,
}

impl StreamStateCode {
    pub fn code(&self) -> u8 {
        *self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(StreamStateCode::Active),
            2 => Some(StreamStateCode::Reconfiguring),
            3 => Some(StreamStateCode::Paused),
            4 => Some(StreamStateCode::Stopped),
            _ => None,
        }
    }
}

/// Server-side lifecycle of one viewer session.
///
/// ```text
/// Connecting -> Authenticated -> (Streaming <-> Reconfiguring) -> Disconnected
/// ```
///
/// `Disconnected` is terminal for a session object; a reconnect mints a
/// new session (optionally seeded through the resume table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authenticated,
    Streaming,
    Reconfiguring,
    Disconnected,
}

impl SessionState {
    /// Legality table for session transitions. Any state may move to
    /// `Disconnected`; everything else follows the handshake/stream order.
    pub fn can_transition(&self, to: SessionState) -> bool {
        use SessionState::*;
        if to == Disconnected {
            return *self != Disconnected;
        }
        matches!(
            (*self, to),
            (Connecting, Authenticated)
                | (Authenticated, Streaming)
                | (Authenticated, Reconfiguring)
                | (Streaming, Reconfiguring)
                | (Reconfiguring, Streaming)
        )
    }

    pub fn is_terminal(&self) -> bool {
        *self == SessionState::Disconnected
    }
}

/// Viewer-side connection state. `Connected` renders as "No Video";
/// `Idle` is entered only on a server-initiated `Stopped` and suppresses
/// reconnects for the life of the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Authenticated,
    Streaming,
    Recovering,
    Idle,
}

impl ConnectionState {
    /// Mirror a server `STREAM_STATE` code onto the local state machine.
    pub fn from_stream_state(code: StreamStateCode) -> ConnectionState {
        match code {
            StreamStateCode::Active => ConnectionState::Streaming,
            StreamStateCode::Reconfiguring => ConnectionState::Recovering,
            StreamStateCode::Paused => ConnectionState::Connected,
            StreamStateCode::Stopped => ConnectionState::Idle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_state_code_roundtrip() {
        for code in [
            StreamStateCode::Active,
            StreamStateCode::Reconfiguring,
            StreamStateCode::Paused,
            StreamStateCode::Stopped,
        ] {
            assert_eq!(StreamStateCode::from_code(code.code()), Some(code));
        }
        assert_eq!(StreamStateCode::from_code(0), None);
        assert_eq!(StreamStateCode::from_code(5), None);
    }

    #[test]
    fn session_transitions_follow_table() {
        use SessionState::*;

        assert!(Connecting.can_transition(Authenticated));
        assert!(Authenticated.can_transition(Streaming));
        assert!(Authenticated.can_transition(Reconfiguring));
        assert!(Streaming.can_transition(Reconfiguring));
        assert!(Reconfiguring.can_transition(Streaming));

        // Streaming is re-entered only via Reconfiguring or from Authenticated.
        assert!(!Connecting.can_transition(Streaming));
        assert!(!Streaming.can_transition(Authenticated));
        assert!(!Streaming.can_transition(Streaming));

        // Everything can disconnect; nothing leaves Disconnected.
        for state in [Connecting, Authenticated, Streaming, Reconfiguring] {
            assert!(state.can_transition(Disconnected));
        }
        assert!(!Disconnected.can_transition(Connecting));
        assert!(!Disconnected.can_transition(Disconnected));
        assert!(Disconnected.is_terminal());
    }

    #[test]
    fn viewer_mirrors_server_state() {
        assert_eq!(
            ConnectionState::from_stream_state(StreamStateCode::Active),
            ConnectionState::Streaming
        );
        assert_eq!(
            ConnectionState::from_stream_state(StreamStateCode::Reconfiguring),
            ConnectionState::Recovering
        );
        assert_eq!(
            ConnectionState::from_stream_state(StreamStateCode::Paused),
            ConnectionState::Connected
        );
        assert_eq!(
            ConnectionState::from_stream_state(StreamStateCode::Stopped),
            ConnectionState::Idle
        );
    }
}
