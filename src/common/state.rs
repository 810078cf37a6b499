//! Driver and server-side acquisition state machines
//!
//! ```text
//!                  start           define/validate ok        first data
//!         Idle ──────────▶ Initializing ─────────▶ Ready ──────────▶ Running
//!          ▲                    │                    │                 │ │
//!          │                    │ fail               │ fail     pause  │ │
//!          │                    ▼                    ▼                 ▼ │
//!          │                  Error ◀────────────────┴──────────── Paused│
//!          │                                                            │
//!          ├─── Aborted ◀──────────── user stop / server abort ◀────────┤
//!          │                                                            │
//!          └─── Finished ◀────── last iteration completes cleanly ◀─────┘
//! ```
//!
//! `Finished`, `Aborted` and `Error` are terminal for a session; the next
//! start re-enters `Initializing`. `Disconnected` is the pre-connect state.

use serde::{Deserialize, Serialize};

/// Driver-side acquisition state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum DriverState {
    /// No connection to the Prodigy server
    #[default]
    Disconnected,
    /// Connected, waiting for an acquire command
    Idle,
    /// Session starting: clearing, defining and validating the spectrum
    Initializing,
    /// Spectrum validated, acquisition started, no data yet
    Ready,
    /// Data is arriving
    Running,
    /// Prodigy-side pause in effect
    Paused,
    /// Session completed cleanly
    Finished,
    /// Session ended by user stop or server abort
    Aborted,
    /// Session ended by a failure
    Error,
}

impl DriverState {
    /// Check whether a transition is part of the session state machine
    pub fn can_transition_to(&self, target: DriverState) -> bool {
        use DriverState::*;
        matches!(
            (self, target),
            (Disconnected, Idle)
            | (Idle, Disconnected)
            // session start, from idle or from any terminal state
            | (Idle, Initializing)
            | (Finished, Initializing)
            | (Aborted, Initializing)
            | (Error, Initializing)
            // forward flow
            | (Initializing, Ready)
            | (Ready, Running)
            | (Running, Paused)
            | (Paused, Running)
            // clean end
            | (Running, Finished)
            | (Paused, Finished)
            // abort
            | (Ready, Aborted)
            | (Running, Aborted)
            | (Paused, Aborted)
            // failures
            | (Initializing, Error)
            | (Ready, Error)
            | (Running, Error)
            | (Paused, Error)
            // back to waiting
            | (Finished, Idle)
            | (Aborted, Idle)
            | (Error, Idle)
            // explicit disconnect from any settled state
            | (Finished, Disconnected)
            | (Aborted, Disconnected)
            | (Error, Disconnected)
        )
    }

    /// True while a session is in progress
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            DriverState::Initializing
                | DriverState::Ready
                | DriverState::Running
                | DriverState::Paused
        )
    }

    /// True for states that refuse analyzer-parameter writes
    pub fn refuses_parameter_writes(&self) -> bool {
        matches!(self, DriverState::Running | DriverState::Paused)
    }

    /// True for session-terminal states
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DriverState::Finished | DriverState::Aborted | DriverState::Error
        )
    }
}

impl std::fmt::Display for DriverState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DriverState::Disconnected => "Disconnected",
            DriverState::Idle => "Idle",
            DriverState::Initializing => "Initializing",
            DriverState::Ready => "Ready",
            DriverState::Running => "Running",
            DriverState::Paused => "Paused",
            DriverState::Finished => "Finished",
            DriverState::Aborted => "Aborted",
            DriverState::Error => "Error",
        };
        write!(f, "{}", name)
    }
}

/// Controller state as reported by `GetAcquisitionStatus`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Running,
    Paused,
    Finished,
    Aborted,
    Error,
}

impl ControllerState {
    /// Parse the server's state token
    ///
    /// Comparison is ASCII-case-insensitive; Prodigy versions in the field
    /// report a completed run as either `finished` or `completed`.
    pub fn parse(token: &str) -> Option<Self> {
        match token.to_ascii_lowercase().as_str() {
            "idle" => Some(ControllerState::Idle),
            "running" => Some(ControllerState::Running),
            "paused" => Some(ControllerState::Paused),
            "finished" | "completed" => Some(ControllerState::Finished),
            "aborted" => Some(ControllerState::Aborted),
            "error" => Some(ControllerState::Error),
            _ => None,
        }
    }
}
