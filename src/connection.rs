use std::fmt;

use log::{info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Demo,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Demo => "demo",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Reflects transport-reported lifecycle into a single `ConnectionState`.
///
/// Retrying is the transport's business; this only records what it reports.
/// `Error` is sticky across drops and only a fresh connection leaves it. A
/// demo controller ignores every event.
#[derive(Debug)]
pub struct ConnectionController {
    state: ConnectionState,
    cause: Option<String>,
}

impl ConnectionController {
    pub fn demo() -> Self {
        ConnectionController {
            state: ConnectionState::Demo,
            cause: None,
        }
    }

    pub fn connecting() -> Self {
        ConnectionController {
            state: ConnectionState::Connecting,
            cause: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Human-readable reason for the last fatal failure.
    pub fn cause(&self) -> Option<&str> {
        self.cause.as_deref()
    }

    pub fn on_connected(&mut self) -> bool {
        self.cause = None;
        self.transition(ConnectionState::Connected)
    }

    pub fn on_dropped(&mut self, cause: &str) -> bool {
        if self.state == ConnectionState::Error {
            return false;
        }
        warn!("MQTT connection lost: {}", cause);
        self.transition(ConnectionState::Reconnecting)
    }

    pub fn on_fatal(&mut self, cause: String) -> bool {
        if self.state == ConnectionState::Demo {
            return false;
        }
        warn!("MQTT connection failed: {}", cause);
        self.cause = Some(cause);
        self.transition(ConnectionState::Error)
    }

    fn transition(&mut self, next: ConnectionState) -> bool {
        if self.state == ConnectionState::Demo {
            warn!("Ignoring {} transition in demo mode", next);
            return false;
        }
        if self.state == next {
            return false;
        }
        info!("Connection state {} -> {}", self.state, next);
        self.state = next;
        true
    }
}
