///
/// state.rs
///
/// Bus operating mode and the legality rules for switching between modes.
///
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::{CanError, CanResult};

/// Operating mode of one bus handle.
///
/// `Active` takes full part in traffic. `Passive` is listen-only: frames are
/// received and the bus is monitored, but nothing is transmitted. `Error` is
/// entered on a driver fault and is terminal until the transport is reopened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BusState {
    Active,
    Passive,
    Error,
}

/// Tracks the current [`BusState`] and rejects illegal transitions.
///
/// `Error` can never be requested from outside; only a driver fault reported
/// through [`fault`](StateMachine::fault) enters it.
#[derive(Debug)]
pub struct StateMachine {
    current: Mutex<BusState>,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(BusState::Active),
        }
    }

    pub fn current(&self) -> BusState {
        *self.lock()
    }

    /// Validate `requested` against the current state without applying it.
    pub fn check(&self, requested: BusState) -> CanResult<()> {
        let from = self.current();
        if requested == BusState::Error || from == BusState::Error {
            return Err(CanError::InvalidState { from, requested });
        }
        Ok(())
    }

    /// Validate and apply a transition.
    pub fn request(&self, requested: BusState) -> CanResult<()> {
        self.check(requested)?;
        *self.lock() = requested;
        Ok(())
    }

    /// Driver fault entry point. The one way into `Error`.
    pub fn fault(&self) {
        *self.lock() = BusState::Error;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BusState> {
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}
