//! Lumen Controller - host-side CLI for the streaming client core
//!
//! This crate provides:
//! - TOML configuration with CLI overrides
//! - SQLite credential storage (device identity, pinned certificates)
//! - JSON settings storage (last connection)
//! - Commands to inspect and manage that state, and to preview the stream
//!   configuration a server's capabilities would produce

pub mod cli;
pub mod config;
pub mod credentials;
pub mod output;
pub mod settings;

#[cfg(test)]
mod proptests;

pub use cli::Cli;
pub use config::{CliOverrides, Config};
pub use output::{JsonResponse, OutputFormat, OutputFormatter, SuccessMessage};

use lumen_core::SessionError;

/// Exit codes for CLI operations
///
/// - 0: Success
/// - 1: General error
/// - 2: Pairing rejected by the server
/// - 3: Timeout
/// - 4: Connection failed
/// - 5: Invalid input
/// - 6: Not paired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    GeneralError = 1,
    PairingRejected = 2,
    Timeout = 3,
    ConnectionFailed = 4,
    InvalidInput = 5,
    NotPaired = 6,
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as i32
    }
}

impl From<&SessionError> for ExitCode {
    fn from(e: &SessionError) -> Self {
        match e {
            e if e.is_timeout() => ExitCode::Timeout,
            SessionError::InvalidInput(_) => ExitCode::InvalidInput,
            SessionError::NetworkFailure(_)
            | SessionError::StageFailure { .. }
            | SessionError::Transport(_) => ExitCode::ConnectionFailed,
            SessionError::PairingRejected(_) => ExitCode::PairingRejected,
            SessionError::CapabilityMismatch(_)
            | SessionError::Store(_)
            | SessionError::Decoder(_) => ExitCode::GeneralError,
        }
    }
}

impl ExitCode {
    /// Convert to process exit code
    pub fn to_exit_code(self) -> std::process::ExitCode {
        std::process::ExitCode::from(self as u8)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ExitCode::Success => "SUCCESS",
            ExitCode::GeneralError => "GENERAL_ERROR",
            ExitCode::PairingRejected => "PAIRING_REJECTED",
            ExitCode::Timeout => "TIMEOUT",
            ExitCode::ConnectionFailed => "CONNECTION_FAILED",
            ExitCode::InvalidInput => "INVALID_INPUT",
            ExitCode::NotPaired => "NOT_PAIRED",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ExitCode::Success => "Operation completed successfully",
            ExitCode::GeneralError => "An unspecified error occurred",
            ExitCode::PairingRejected => "The server rejected pairing",
            ExitCode::Timeout => "Operation timed out",
            ExitCode::ConnectionFailed => "Could not establish connection",
            ExitCode::InvalidInput => "Invalid arguments or data provided",
            ExitCode::NotPaired => "Host pairing required",
        }
    }
}

#[cfg(test)]
mod exit_code_tests {
    use super::*;
    use lumen_core::errors::{ControlError, PairingRejection, StoreError};
    use std::time::Duration;

    #[test]
    fn test_exit_code_values() {
        assert_eq!(ExitCode::Success as i32, 0);
        assert_eq!(ExitCode::GeneralError as i32, 1);
        assert_eq!(ExitCode::PairingRejected as i32, 2);
        assert_eq!(ExitCode::Timeout as i32, 3);
        assert_eq!(ExitCode::ConnectionFailed as i32, 4);
        assert_eq!(ExitCode::InvalidInput as i32, 5);
        assert_eq!(ExitCode::NotPaired as i32, 6);
    }

    #[test]
    fn test_exit_code_names_are_unique() {
        let codes = [
            ExitCode::Success,
            ExitCode::GeneralError,
            ExitCode::PairingRejected,
            ExitCode::Timeout,
            ExitCode::ConnectionFailed,
            ExitCode::InvalidInput,
            ExitCode::NotPaired,
        ];
        let names: std::collections::HashSet<_> = codes.iter().map(ExitCode::name).collect();
        assert_eq!(names.len(), codes.len());
        assert!(codes.iter().all(|c| !c.description().is_empty()));
    }

    #[test]
    fn test_session_error_mapping() {
        let timeout: SessionError = ControlError::Timeout(Duration::from_secs(10)).into();
        assert_eq!(ExitCode::from(&timeout), ExitCode::Timeout);

        let unreachable: SessionError = ControlError::Unreachable("pc".into()).into();
        assert_eq!(ExitCode::from(&unreachable), ExitCode::ConnectionFailed);

        let rejected = SessionError::PairingRejected(PairingRejection::IncorrectPin);
        assert_eq!(ExitCode::from(&rejected), ExitCode::PairingRejected);

        let invalid = SessionError::InvalidInput("Host cannot be empty".into());
        assert_eq!(ExitCode::from(&invalid), ExitCode::InvalidInput);

        let store = SessionError::Store(StoreError::NotFound("pc".into()));
        assert_eq!(ExitCode::from(&store), ExitCode::GeneralError);
    }
}
