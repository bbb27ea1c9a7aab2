//! Error taxonomy for talking to the sprinkler controller.
//!
//! Transport failures are retried by the link before they surface here as
//! [`LinkError::Transient`]; a reply with the wrong shape is surfaced as
//! [`LinkError::Protocol`] immediately.  Claiming an already-run schedule
//! slot is not an error at all, see `db::Claim`.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinkError {
    /// Connect/write/read failed on every attempt.
    #[error("controller {addr} unreachable after {attempts} attempt(s): {source}")]
    Transient {
        addr: String,
        attempts: u32,
        #[source]
        source: io::Error,
    },

    /// The controller answered, but not with something we understand.
    #[error("unexpected controller response {response:?}: {reason}")]
    Protocol { response: String, reason: String },
}

impl LinkError {
    pub(crate) fn protocol(response: &str, reason: impl Into<String>) -> Self {
        Self::Protocol {
            response: response.to_string(),
            reason: reason.into(),
        }
    }
}

/// Errors from caller-initiated (manual) controller commands.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("a watering cycle currently holds the controller")]
    Busy,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Link(#[from] LinkError),
}

// ===========================================================================
// Tests
// ===========================================================================
