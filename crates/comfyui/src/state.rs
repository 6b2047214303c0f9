//! Connection state machine of a session worker.
//!
//! | From           | Input              | To             |
//! |----------------|--------------------|----------------|
//! | `Disconnected` | `ConnectRequested` | `Connecting`   |
//! | `Connecting`   | `ConnectSucceeded` | `Connected`    |
//! | `Connecting`   | `ConnectFailed`    | `Disconnected` |
//! | `Connected`    | `TransportLost`    | `Disconnected` |
//! | `Connected`    | `ProbeFailed`      | `Disconnected` |
//! | any            | `StopRequested`    | `Stopped`      |
//!
//! Any other pair leaves the state unchanged. `Stopped` is final.

use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Stopped,
}

/// Inputs that drive [`SessionState`] transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    ConnectRequested,
    ConnectSucceeded,
    ConnectFailed,
    /// The connection failed while a job was running on it.
    TransportLost,
    /// The liveness probe before a job failed.
    ProbeFailed,
    StopRequested,
}

impl SessionState {
    /// The state after applying `input`.
    pub fn on(self, input: Transition) -> SessionState {
        use SessionState::*;
        use Transition::*;

        match (self, input) {
            (Stopped, _) => Stopped,
            (_, StopRequested) => Stopped,
            (Disconnected, ConnectRequested) => Connecting,
            (Connecting, ConnectSucceeded) => Connected,
            (Connecting, ConnectFailed) => Disconnected,
            (Connected, TransportLost | ProbeFailed) => Disconnected,
            (state, _) => state,
        }
    }
}
