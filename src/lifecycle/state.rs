//! Pure connection lifecycle transitions
//!
//! The live state of a client is separate from the declarative
//! [`crate::model::ConnectivityStatus`] on its descriptor. Transitions are
//! pure so the actor in [`super::actor`] stays a thin driver around them.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Live state of one protocol client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientState {
    Closed,
    Connecting,
    Connected,
    Disconnecting,
    /// Terminal until a fresh open request restarts the attempt.
    Failed,
}

impl ClientState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
            Self::Failed => "failed",
        }
    }

    /// Only a connected client accepts outbound signals.
    pub fn can_publish(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything that can move a client between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    OpenRequested,
    ConnectSucceeded,
    ConnectFailed,
    CloseRequested,
    CloseCompleted,
    /// Unrecoverable transport error reported outside a command.
    TransportFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no transition from {from} on {event:?}")]
pub struct InvalidTransition {
    pub from: ClientState,
    pub event: LifecycleEvent,
}

/// Apply one event to a state. Invalid combinations leave the state
/// untouched and surface as an error the caller acknowledges negatively.
pub fn apply(state: ClientState, event: LifecycleEvent) -> Result<ClientState, InvalidTransition> {
    use ClientState::*;
    use LifecycleEvent::*;

    match (state, event) {
        (Closed | Failed, OpenRequested) => Ok(Connecting),
        (Connecting, ConnectSucceeded) => Ok(Connected),
        (Connecting, ConnectFailed) => Ok(Failed),
        // close during an in-flight connect cancels the attempt
        (Connecting | Connected | Failed, CloseRequested) => Ok(Disconnecting),
        // already closed; closing again is a no-op
        (Closed, CloseRequested) => Ok(Closed),
        (Disconnecting, CloseCompleted) => Ok(Closed),
        (_, TransportFailed) => Ok(Failed),
        (from, event) => Err(InvalidTransition { from, event }),
    }
}
