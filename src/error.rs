use sdr::error::{codes, ErrorReason, ErrorReport};
use sdr::{ArgumentError, SdrError};
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BridgeError>;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Active session did not close within {0:?}, cannot restart")]
    CannotRestart(Duration),

    #[error("Active session did not close within {0:?}")]
    CannotClose(Duration),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid arguments: {0}")]
    Arguments(#[from] ArgumentError),

    #[error(transparent)]
    Sdr(#[from] SdrError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BridgeError {
    /// Driver or exit code, if this failure has one
    pub fn code(&self) -> Option<i32> {
        match self {
            BridgeError::CannotRestart(_) => Some(codes::EXIT_CANNOT_RESTART),
            BridgeError::CannotClose(_) => Some(codes::EXIT_CANNOT_CLOSE),
            BridgeError::Config(_) | BridgeError::Arguments(_) | BridgeError::Json(_) => {
                Some(codes::EXIT_WRONG_ARGS)
            }
            BridgeError::Sdr(err) => err.code(),
            BridgeError::Io(_) => None,
        }
    }

    pub fn reason(&self) -> ErrorReason {
        match self {
            BridgeError::Sdr(err) => err.reason(),
            other => other
                .code()
                .and_then(ErrorReason::for_code)
                .unwrap_or(ErrorReason::UnknownError),
        }
    }

    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            reason: self.reason(),
            code: self.code(),
            message: self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeouts_map_to_exit_codes() {
        let restart = BridgeError::CannotRestart(Duration::from_secs(10));
        assert_eq!(restart.code(), Some(codes::EXIT_CANNOT_RESTART));
        assert_eq!(restart.reason(), ErrorReason::UnknownError);

        let close = BridgeError::CannotClose(Duration::from_secs(10));
        assert_eq!(close.code(), Some(codes::EXIT_CANNOT_CLOSE));
        assert_eq!(close.reason(), ErrorReason::Replug);
    }

    #[test]
    fn test_wrapped_driver_error_keeps_its_reason() {
        let err = BridgeError::from(SdrError::from_code(codes::ERROR_ACCESS));
        assert_eq!(err.reason(), ErrorReason::PermissionDenied);
        assert_eq!(err.report().code, Some(codes::ERROR_ACCESS));
    }

    #[test]
    fn test_argument_errors_are_wrong_args() {
        let err = BridgeError::from(ArgumentError::EmptyName);
        assert_eq!(err.code(), Some(codes::EXIT_WRONG_ARGS));
        assert!(err.to_string().contains("Missing argument name"));
    }
}
