use std::fmt;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Initial,
    PingingServer,
    Connecting,
    Connected,
    DisconnectedForever,
}

impl ConnectionState {
    pub const ALL: [ConnectionState; 5] = [
        ConnectionState::Initial,
        ConnectionState::PingingServer,
        ConnectionState::Connecting,
        ConnectionState::Connected,
        ConnectionState::DisconnectedForever,
    ];

    pub fn is_terminal(self) -> bool {
        self == ConnectionState::DisconnectedForever
    }

    pub fn label(self) -> &'static str {
        match self {
            ConnectionState::Initial => "initial",
            ConnectionState::PingingServer => "pinging_server",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::DisconnectedForever => "disconnected_forever",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionEvent {
    Initialized,
    ServerPingSucceeded,
    ConnectionSucceeded,
    ConnectionTimedOut,
    ConnectionError,
    ConnectionClosed,
    FatalError,
}

impl ConnectionEvent {
    pub const ALL: [ConnectionEvent; 7] = [
        ConnectionEvent::Initialized,
        ConnectionEvent::ServerPingSucceeded,
        ConnectionEvent::ConnectionSucceeded,
        ConnectionEvent::ConnectionTimedOut,
        ConnectionEvent::ConnectionError,
        ConnectionEvent::ConnectionClosed,
        ConnectionEvent::FatalError,
    ];

    pub fn label(self) -> &'static str {
        match self {
            ConnectionEvent::Initialized => "initialized",
            ConnectionEvent::ServerPingSucceeded => "server_ping_succeeded",
            ConnectionEvent::ConnectionSucceeded => "connection_succeeded",
            ConnectionEvent::ConnectionTimedOut => "connection_timed_out",
            ConnectionEvent::ConnectionError => "connection_error",
            ConnectionEvent::ConnectionClosed => "connection_closed",
            ConnectionEvent::FatalError => "fatal_error",
        }
    }
}

impl fmt::Display for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Enter(ConnectionState),
    /// The machine is terminal; the event is dropped.
    Discard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("unsupported state transition: {event} while {state}")]
pub struct IllegalTransition {
    pub state: ConnectionState,
    pub event: ConnectionEvent,
}

pub fn transition(
    state: ConnectionState,
    event: ConnectionEvent,
) -> Result<Step, IllegalTransition> {
    use ConnectionEvent as E;
    use ConnectionState as S;

    let next = match (state, event) {
        (S::DisconnectedForever, _) => return Ok(Step::Discard),
        (_, E::FatalError) => S::DisconnectedForever,
        (S::Initial, E::Initialized) => S::PingingServer,
        (S::PingingServer, E::ServerPingSucceeded) => S::Connecting,
        (S::Connecting, E::ConnectionSucceeded) => S::Connected,
        (S::Connecting, E::ConnectionTimedOut | E::ConnectionError | E::ConnectionClosed) => {
            S::PingingServer
        }
        (S::Connected, E::ConnectionClosed | E::ConnectionError) => S::PingingServer,
        _ => return Err(IllegalTransition { state, event }),
    };
    Ok(Step::Enter(next))
}
