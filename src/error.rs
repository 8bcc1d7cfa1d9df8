///
/// error.rs
///
/// Failure taxonomy for the whole crate. Raw driver status codes are
/// translated into these variants exactly once, at the transport boundary;
/// nothing above that layer ever sees a vendor code.
///
use thiserror::Error;

use crate::state::BusState;

pub type CanResult<T> = Result<T, CanError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CanError {
    /// Opening or configuring a channel failed. Not retriable without
    /// reopening the transport.
    #[error("initialization failed: {0}")]
    Initialization(String),

    /// A single send/receive/status call faulted. The call itself may be
    /// retried. `code` carries the raw driver status when one exists.
    #[error("driver operation failed: {reason}")]
    Operation { reason: String, code: Option<i32> },

    /// A transmit did not complete within its timeout. Distinct from
    /// "no data" on receive, which is a normal outcome and not an error.
    #[error("transmit window elapsed before the frame was accepted")]
    Timeout,

    /// Caller-supplied parameter out of range. Never retried internally.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Illegal bus state transition request.
    #[error("cannot switch bus state from {from:?} to {requested:?}")]
    InvalidState { from: BusState, requested: BusState },
}

impl CanError {
    /// Operation fault without an underlying driver code.
    pub fn operation(reason: impl Into<String>) -> Self {
        CanError::Operation {
            reason: reason.into(),
            code: None,
        }
    }

    /// Operation fault wrapping a raw driver status code.
    pub fn driver(reason: impl Into<String>, code: i32) -> Self {
        CanError::Operation {
            reason: reason.into(),
            code: Some(code),
        }
    }
}
