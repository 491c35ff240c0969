// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Endpoint connection state machine.
//!
//! ```text
//!   Idle --connect--> Connecting --req sent--> RequestSent --resp--> Connected
//!    |                                                                 ^
//!    +--accept--> Accepting ------------resp sent---------------------+
//!
//!   any state --error / shutdown / close--> Disconnected (terminal)
//!   passive endpoints: Listening --close--> Disconnected
//! ```

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpState {
    Idle,
    Connecting,
    Accepting,
    RequestSent,
    Connected,
    Disconnected,
    Listening,
}

impl EpState {
    /// Whether `self -> to` is a legal transition.
    pub(crate) fn can_transition(self, to: EpState) -> bool {
        use EpState::*;
        match (self, to) {
            (Disconnected, _) => false,
            (_, Disconnected) => true,
            (Idle, Connecting) | (Idle, Accepting) | (Idle, Listening) => true,
            (Connecting, RequestSent) => true,
            (RequestSent, Connected) | (Accepting, Connected) => true,
            _ => false,
        }
    }

    /// Handshake not finished yet.
    pub(crate) fn is_handshake(self) -> bool {
        matches!(
            self,
            EpState::Connecting | EpState::RequestSent | EpState::Accepting
        )
    }
}

impl fmt::Display for EpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EpState::Idle => "idle",
            EpState::Connecting => "connecting",
            EpState::Accepting => "accepting",
            EpState::RequestSent => "request-sent",
            EpState::Connected => "connected",
            EpState::Disconnected => "disconnected",
            EpState::Listening => "listening",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_and_server_paths() {
        use EpState::*;
        assert!(Idle.can_transition(Connecting));
        assert!(Connecting.can_transition(RequestSent));
        assert!(RequestSent.can_transition(Connected));
        assert!(Idle.can_transition(Accepting));
        assert!(Accepting.can_transition(Connected));
    }

    #[test]
    fn test_illegal_transitions() {
        use EpState::*;
        assert!(!Idle.can_transition(Connected));
        assert!(!Connecting.can_transition(Connected));
        assert!(!Connected.can_transition(Connecting));
        assert!(!Disconnected.can_transition(Disconnected));
        assert!(!Disconnected.can_transition(Idle));
        assert!(Connected.can_transition(Disconnected));
        assert!(Listening.can_transition(Disconnected));
    }

    #[test]
    fn test_display() {
        assert_eq!(EpState::RequestSent.to_string(), "request-sent");
        assert!(EpState::Accepting.is_handshake());
        assert!(!EpState::Connected.is_handshake());
    }
}
