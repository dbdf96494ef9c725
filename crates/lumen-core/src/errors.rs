//! Error types for Lumen Core.
//!
//! Collaborator faults (`ControlError`, `StoreError`, `DecoderError`) are
//! folded into the session-level `SessionError` taxonomy before they cross
//! the worker boundary back to the controller.

use std::time::Duration;

use thiserror::Error;

// ============================================================================
// Collaborator Errors
// ============================================================================

/// Errors reported by the control channel and pairing protocol collaborators.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ControlError {
    #[error("host unreachable: {0}")]
    Unreachable(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("malformed server response: {0}")]
    MalformedResponse(String),
}

/// Errors reported by credential and settings stores.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("storage operation failed: {0}")]
    OperationFailed(String),

    #[error("data corruption detected: {0}")]
    DataCorruption(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Errors reported by the video decoder and audio sink.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecoderError {
    #[error("no render surface attached")]
    NoSurface,

    #[error("{0}")]
    Other(String),
}

// ============================================================================
// Session Errors
// ============================================================================

/// Why a pairing attempt was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingRejection {
    IncorrectPin,
    AlreadyInProgress,
    Other(String),
}

impl std::fmt::Display for PairingRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PairingRejection::IncorrectPin => write!(f, "incorrect PIN"),
            PairingRejection::AlreadyInProgress => write!(f, "pairing already in progress"),
            PairingRejection::Other(msg) => write!(f, "{msg}"),
        }
    }
}

impl PairingRejection {
    /// User-facing guidance for the rejection.
    pub fn guidance(&self) -> String {
        match self {
            PairingRejection::IncorrectPin => "PIN incorrect. Retry pairing to try again.".into(),
            PairingRejection::AlreadyInProgress => {
                "Another device is pairing. Please wait, then retry.".into()
            }
            PairingRejection::Other(msg) => format!("Pairing failed: {msg}"),
        }
    }
}

/// Errors surfaced by the session layer.
///
/// Every failure that crosses the worker boundary is one of these values.
/// `CapabilityMismatch` is advisory and never aborts a session.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("network failure: {0}")]
    NetworkFailure(String),

    #[error("pairing rejected: {0}")]
    PairingRejected(PairingRejection),

    #[error("capability mismatch: {0}")]
    CapabilityMismatch(String),

    #[error("stage '{stage}' failed with error {code}")]
    StageFailure { stage: String, code: i32 },

    #[error("credential store error: {0}")]
    Store(#[from] StoreError),

    #[error("decoder error: {0}")]
    Decoder(#[from] DecoderError),

    #[error("transport error: {0}")]
    Transport(String),
}

impl From<ControlError> for SessionError {
    fn from(e: ControlError) -> Self {
        SessionError::NetworkFailure(e.to_string())
    }
}

impl SessionError {
    /// Status line shown to the user for this error.
    pub fn status_text(&self) -> String {
        match self {
            SessionError::InvalidInput(msg) => format!("Error: {msg}"),
            SessionError::NetworkFailure(msg) => format!("Connection error: {msg}"),
            SessionError::PairingRejected(rejection) => rejection.guidance(),
            SessionError::CapabilityMismatch(msg) => msg.clone(),
            SessionError::StageFailure { stage, code } => {
                format!("Failed: {stage} (error: {code})")
            }
            SessionError::Store(e) => format!("Storage error: {e}"),
            SessionError::Decoder(e) => format!("Decoder error: {e}"),
            SessionError::Transport(msg) => format!("Stream error: {msg}"),
        }
    }

    /// Whether the error was caused by an expired timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, SessionError::NetworkFailure(msg) if msg.contains("timed out"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_failure_status_text() {
        let err = SessionError::StageFailure {
            stage: "RTSP handshake".into(),
            code: 10,
        };
        assert_eq!(err.status_text(), "Failed: RTSP handshake (error: 10)");
    }

    #[test]
    fn test_control_error_maps_to_network_failure() {
        let err: SessionError = ControlError::Timeout(Duration::from_secs(5)).into();
        assert!(matches!(err, SessionError::NetworkFailure(_)));
        assert!(err.is_timeout());
    }

    #[test]
    fn test_rejection_guidance_is_distinct() {
        let wrong = PairingRejection::IncorrectPin.guidance();
        let busy = PairingRejection::AlreadyInProgress.guidance();
        assert_ne!(wrong, busy);
        assert!(wrong.contains("PIN incorrect"));
        assert!(busy.contains("Another device is pairing"));
    }
}
