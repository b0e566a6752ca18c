use thiserror::Error;

use crate::sensing::SourceKind;

/// Failure categories of the capture pipeline.
///
/// Carried inside `anyhow::Error` and recovered with `downcast_ref` wherever
/// the category changes what the caller does next.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CaptureError {
    /// A device was missing at startup. The source does not run.
    #[error("{device} unavailable: {reason}")]
    DeviceUnavailable { device: SourceKind, reason: String },

    /// A running device went away. Terminal for that source only.
    #[error("{device} disconnected: {reason}")]
    DeviceDisconnected { device: SourceKind, reason: String },

    /// One capture, classify or transcribe call failed; the loop continues.
    #[error("{device} capture failed: {reason}")]
    TransientCapture { device: SourceKind, reason: String },

    /// A durable write failed after all retries.
    #[error("storage failure: {0}")]
    Storage(String),

    /// A record referenced a session that is unknown or already completed.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// A frame capture was already in flight on another thread.
    #[error("frame capture already in progress")]
    CaptureBusy,
}

impl CaptureError {
    pub fn unavailable(device: SourceKind, reason: impl Into<String>) -> Self {
        Self::DeviceUnavailable {
            device,
            reason: reason.into(),
        }
    }

    pub fn disconnected(device: SourceKind, reason: impl Into<String>) -> Self {
        Self::DeviceDisconnected {
            device,
            reason: reason.into(),
        }
    }

    pub fn transient(device: SourceKind, reason: impl Into<String>) -> Self {
        Self::TransientCapture {
            device,
            reason: reason.into(),
        }
    }

    /// Pulls the typed category out of an `anyhow` chain, if there is one.
    pub fn classify(err: &anyhow::Error) -> Option<&CaptureError> {
        err.chain().find_map(|cause| cause.downcast_ref::<CaptureError>())
    }

    pub fn is_invariant_violation(err: &anyhow::Error) -> bool {
        matches!(Self::classify(err), Some(CaptureError::InvariantViolation(_)))
    }
}
