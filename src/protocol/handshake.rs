//! Connection handshake state machine.
//!
//! A connection is usable once both halves of the handshake happened: the
//! peer's HELLO was processed and the peer acknowledged ours with an ACK.
//! They may arrive in either order. States only move forward, and `Closing`
//! is terminal.
//!
//! ```text
//! Connecting --hello--> HelloReceived --ack---> Established
//! Connecting --ack----> HelloAcked    --hello-> Established
//! any        --close--> Closing
//! ```

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Connecting,
    HelloReceived,
    HelloAcked,
    Established,
    Closing,
}

/// Inputs that advance the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeEvent {
    HelloReceived,
    AckReceived,
    Close,
}

/// Next state for `event`. Events that do not apply leave the state unchanged.
pub fn transition(state: ConnectionState, event: HandshakeEvent) -> ConnectionState {
    use ConnectionState::*;

    match (state, event) {
        (Closing, _) => Closing,
        (_, HandshakeEvent::Close) => Closing,
        (Connecting, HandshakeEvent::HelloReceived) => HelloReceived,
        (Connecting, HandshakeEvent::AckReceived) => HelloAcked,
        (HelloReceived, HandshakeEvent::AckReceived) => Established,
        (HelloAcked, HandshakeEvent::HelloReceived) => Established,
        (current, _) => current,
    }
}

impl ConnectionState {
    pub fn is_established(self) -> bool {
        self == ConnectionState::Established
    }

    pub fn is_closing(self) -> bool {
        self == ConnectionState::Closing
    }

    pub fn has_received_hello(self) -> bool {
        matches!(
            self,
            ConnectionState::HelloReceived | ConnectionState::Established
        )
    }

    pub fn has_been_acked(self) -> bool {
        matches!(
            self,
            ConnectionState::HelloAcked | ConnectionState::Established
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::HelloReceived => "HELLO_RECEIVED",
            ConnectionState::HelloAcked => "HELLO_ACKED",
            ConnectionState::Established => "ESTABLISHED",
            ConnectionState::Closing => "CLOSING",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_established_in_either_order() {
        let hello_first = transition(
            transition(ConnectionState::Connecting, HandshakeEvent::HelloReceived),
            HandshakeEvent::AckReceived,
        );
        let ack_first = transition(
            transition(ConnectionState::Connecting, HandshakeEvent::AckReceived),
            HandshakeEvent::HelloReceived,
        );

        assert_eq!(hello_first, ConnectionState::Established);
        assert_eq!(ack_first, ConnectionState::Established);
    }

    #[test]
    fn test_repeated_events_do_not_advance() {
        let state = transition(ConnectionState::Connecting, HandshakeEvent::HelloReceived);
        assert_eq!(
            transition(state, HandshakeEvent::HelloReceived),
            ConnectionState::HelloReceived
        );
        assert_eq!(
            transition(ConnectionState::Established, HandshakeEvent::AckReceived),
            ConnectionState::Established
        );
    }

    #[test]
    fn test_closing_is_terminal() {
        for event in [
            HandshakeEvent::HelloReceived,
            HandshakeEvent::AckReceived,
            HandshakeEvent::Close,
        ] {
            assert_eq!(
                transition(ConnectionState::Closing, event),
                ConnectionState::Closing
            );
        }
        assert_eq!(
            transition(ConnectionState::HelloAcked, HandshakeEvent::Close),
            ConnectionState::Closing
        );
    }

    #[test]
    fn test_flags() {
        assert!(ConnectionState::Established.has_received_hello());
        assert!(ConnectionState::Established.has_been_acked());
        assert!(!ConnectionState::HelloAcked.has_received_hello());
        assert!(!ConnectionState::Closing.is_established());
    }
}
