/// Session-level error taxonomy
///
/// Every variant is reported synchronously to the caller of the offending
/// operation. `release()` never produces one.

use crate::model::ModelError;
use crate::state::DetectionState;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HotwordError {
    /// Operation attempted while the resource or session is in an incompatible state
    #[error("Invalid resource state: {0}")]
    InvalidResourceState(String),

    /// Capture device could not be acquired within the retry budget
    #[error("Capture device acquisition failed after {attempts} attempts: {reason}")]
    DeviceAcquisitionFailure { attempts: u32, reason: String },

    /// Transition not permitted from the current state
    #[error("Illegal state transition: cannot {operation} while {from:?}")]
    IllegalStateTransition {
        from: DetectionState,
        operation: &'static str,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Model error: {0}")]
    Model(#[from] ModelError),
}

impl HotwordError {
    pub(crate) fn illegal(from: DetectionState, operation: &'static str) -> Self {
        Self::IllegalStateTransition { from, operation }
    }
}
