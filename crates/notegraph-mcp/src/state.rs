//! Connection lifecycle states and the transition table between them.
//!
//! Every state change of a server connection goes through
//! [`ConnectionState::next`]; callers never assign a state directly.

use serde::Serialize;
use std::fmt;

/// Lifecycle of one server connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Process launched, nothing heard from it yet.
    Spawning,
    /// Process looks alive; handshake not started.
    Ready,
    /// `initialize` is in flight.
    Initializing,
    /// Handshake complete; requests may be issued.
    Connected,
    /// Terminal.
    Disconnected,
}

/// Inputs that drive the connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateEvent {
    /// First bytes arrived on stdout.
    OutputSeen,
    /// A stderr chunk contained a readiness keyword.
    ReadyKeyword,
    /// The readiness fallback delay elapsed with the process still running.
    FallbackElapsed,
    HandshakeStarted,
    HandshakeCompleted,
    /// Explicit disconnect, process exit, or transport failure.
    Closed,
}

impl ConnectionState {
    /// The state reached by applying `event`, or `None` if the event does
    /// not apply in this state.
    pub fn next(self, event: StateEvent) -> Option<ConnectionState> {
        use ConnectionState::*;
        use StateEvent::*;

        match (self, event) {
            (Disconnected, _) => None,
            (_, Closed) => Some(Disconnected),
            (Spawning, OutputSeen | ReadyKeyword | FallbackElapsed) => Some(Ready),
            (Ready, HandshakeStarted) => Some(Initializing),
            (Initializing, HandshakeCompleted) => Some(Connected),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == ConnectionState::Disconnected
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Spawning => "spawning",
            ConnectionState::Ready => "ready",
            ConnectionState::Initializing => "initializing",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

/// Why a connection reached `Disconnected`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    Requested,
    Exited(Option<i32>),
    StdoutClosed,
    Transport(String),
    ConnectFailed(String),
}

impl DisconnectReason {
    /// Whether this reason should be reported as an error in statuses.
    pub fn is_failure(&self) -> bool {
        !matches!(self, DisconnectReason::Requested)
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Requested => f.write_str("disconnect requested"),
            DisconnectReason::Exited(Some(code)) => write!(f, "process exited with code {code}"),
            DisconnectReason::Exited(None) => f.write_str("process terminated by signal"),
            DisconnectReason::StdoutClosed => f.write_str("server closed its stdout"),
            DisconnectReason::Transport(msg) => write!(f, "transport error: {msg}"),
            DisconnectReason::ConnectFailed(msg) => write!(f, "connect failed: {msg}"),
        }
    }
}
