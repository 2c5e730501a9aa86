use serde::{Deserialize, Serialize};

/// The connection lifecycle a client session steps through. Transitions are
/// pure so the session loop and the tests share one source of truth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Transport dropped and a retry is pending; queued custom mutations
    /// replay once the transport reopens.
    Reconnecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    ConnectRequested,
    TransportOpened,
    TransportClosed,
    ClosedByUser,
}

impl ConnectionState {
    pub fn transition(self, event: SessionEvent) -> ConnectionState {
        use ConnectionState::*;
        use SessionEvent::*;
        match (self, event) {
            (Disconnected, ConnectRequested) => Connecting,
            (Connecting, TransportOpened) => Connected,
            (Connecting, TransportClosed) => Reconnecting,
            (Connected, TransportClosed) => Reconnecting,
            (Reconnecting, ConnectRequested) => Connecting,
            (Reconnecting, TransportOpened) => Connected,
            (_, ClosedByUser) => Disconnected,
            (state, _) => state,
        }
    }

    pub fn is_connected(self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;
    use SessionEvent::*;

    #[test]
    fn test_happy_path() {
        let state = Disconnected
            .transition(ConnectRequested)
            .transition(TransportOpened);
        assert_eq!(state, Connected);
        assert!(state.is_connected());
    }

    #[test]
    fn test_drop_and_reconnect() {
        let state = Connected.transition(TransportClosed);
        assert_eq!(state, Reconnecting);
        assert_eq!(state.transition(TransportOpened), Connected);
    }

    #[test]
    fn test_user_close_wins_everywhere() {
        for state in [Disconnected, Connecting, Connected, Reconnecting] {
            assert_eq!(state.transition(ClosedByUser), Disconnected);
        }
    }

    #[test]
    fn test_spurious_events_are_ignored() {
        assert_eq!(Disconnected.transition(TransportClosed), Disconnected);
        assert_eq!(Connected.transition(TransportOpened), Connected);
    }
}
