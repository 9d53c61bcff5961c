//! What the client reports to its owner.
use std::time::Duration;

use mtbridge_common::event::DecodedEvent;
use mtbridge_common::net::{DEFAULT_PORT, Endpoint};
use mtbridge_common::{EngineEvent, Quote};
use strum_macros::{Display, EnumString};

/// Default wait for one remote call. Slightly above the server's command timeout so the server's
/// own timeout fault normally arrives first.
pub const CALL_TIMEOUT: Duration = Duration::from_secs(45);

/// Default bound of the TCP connect.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle of the connection to a bridge server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
pub enum ConnectionState {
    /// No channel; the initial state.
    Disconnected,
    /// Channel being opened and handshake in flight.
    Connecting,
    /// Handshake done, notifications flowing.
    Connected,
    /// Connect failed or the channel faulted.
    Failed,
}

/// Event delivered to every subscriber of a [`crate::BridgeClient`].
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// A session's quote changed.
    QuoteUpdate(Quote),
    /// A session registered on the server.
    QuoteAdded(Quote),
    /// A session deregistered.
    QuoteRemoved(Quote),
    /// The connection moved to `state`; `message` explains failures.
    ConnectionStateChanged {
        /// New state.
        state: ConnectionState,
        /// Reason, when there is one.
        message: Option<String>,
    },
    /// Event emitted by a bound session.
    EngineEvent {
        /// Event as received.
        raw: EngineEvent,
        /// Typed payload; `None` when it did not parse.
        decoded: Option<DecodedEvent>,
    },
}

/// Client settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server to connect to.
    pub endpoint: Endpoint,
    /// Wait for one remote call.
    pub call_timeout: Duration,
    /// Bound of the TCP connect.
    pub connect_timeout: Duration,
}

impl ClientConfig {
    /// Defaults for `endpoint`.
    pub fn new(endpoint: Endpoint) -> Self {
        ClientConfig {
            endpoint,
            call_timeout: CALL_TIMEOUT,
            connect_timeout: CONNECT_TIMEOUT,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig::new(Endpoint::tcp("127.0.0.1", DEFAULT_PORT))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn states_print_and_parse_by_name() {
        assert_eq!(ConnectionState::Connected.to_string(), "Connected");
        assert_eq!(
            ConnectionState::from_str("Failed").unwrap(),
            ConnectionState::Failed
        );
    }
}
