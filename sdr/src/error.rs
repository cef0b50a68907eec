use rtl_tcp_protocol::ProtocolError;
use std::any::Any;
use std::io;
use std::time::Duration;
use strum::{Display, EnumIter};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SdrError>;

/// Numeric codes reported by drivers and by the bridge itself.
///
/// Negative values are libusb errors, non-negative values are exit codes.
pub mod codes {
    pub const LIBUSB_ERROR_IO: i32 = -1;
    pub const LIBUSB_ERROR_INVALID_PARAM: i32 = -2;
    pub const ERROR_ACCESS: i32 = -3;
    pub const LIBUSB_ERROR_NO_DEVICE: i32 = -4;
    pub const LIBUSB_ERROR_NOT_FOUND: i32 = -5;
    pub const LIBUSB_ERROR_BUSY: i32 = -6;
    pub const LIBUSB_ERROR_TIMEOUT: i32 = -7;
    pub const LIBUSB_ERROR_OVERFLOW: i32 = -8;
    pub const LIBUSB_ERROR_PIPE: i32 = -9;
    pub const LIBUSB_ERROR_INTERRUPTED: i32 = -10;
    pub const LIBUSB_ERROR_NO_MEM: i32 = -11;
    pub const LIBUSB_ERROR_NOT_SUPPORTED: i32 = -12;
    pub const LIBUSB_ERROR_OTHER: i32 = -99;

    pub const EXIT_OK: i32 = 0;
    pub const EXIT_WRONG_ARGS: i32 = 1;
    pub const EXIT_INVALID_FD: i32 = 2;
    pub const EXIT_NO_DEVICES: i32 = 3;
    pub const EXIT_FAILED_TO_OPEN_DEVICE: i32 = 4;
    pub const EXIT_CANNOT_RESTART: i32 = 5;
    pub const EXIT_CANNOT_CLOSE: i32 = 6;
    pub const EXIT_UNKNOWN: i32 = 7;
    pub const EXIT_SIGNAL_CAUGHT: i32 = 8;
    pub const EXIT_NOT_ENOUGH_POWER: i32 = 9;
    pub const EXIT_PLATFORM_NOT_SUPPORTED: i32 = 10;
}

/// User-facing failure category, stable enough to drive static messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorReason {
    PermissionDenied,
    NoDevicesFound,
    AlreadyRunning,
    UnknownError,
    Replug,
}

impl ErrorReason {
    pub fn user_message(&self) -> &'static str {
        match self {
            ErrorReason::PermissionDenied => "Permission to access the device was denied.",
            ErrorReason::NoDevicesFound => "No supported device was found. Check the connection.",
            ErrorReason::AlreadyRunning => "The device is already in use by another session.",
            ErrorReason::UnknownError => "An unexpected error occurred.",
            ErrorReason::Replug => "The device stopped responding. Please replug it.",
        }
    }

    /// Category for a driver/exit code. `None` for success and unknown codes.
    pub fn for_code(code: i32) -> Option<Self> {
        use codes::*;
        match code {
            LIBUSB_ERROR_IO => Some(ErrorReason::NoDevicesFound),
            LIBUSB_ERROR_INVALID_PARAM => Some(ErrorReason::UnknownError),
            ERROR_ACCESS => Some(ErrorReason::PermissionDenied),
            LIBUSB_ERROR_NO_DEVICE | LIBUSB_ERROR_NOT_FOUND => Some(ErrorReason::NoDevicesFound),
            LIBUSB_ERROR_BUSY => Some(ErrorReason::AlreadyRunning),
            LIBUSB_ERROR_TIMEOUT | LIBUSB_ERROR_OVERFLOW => Some(ErrorReason::NoDevicesFound),
            LIBUSB_ERROR_PIPE | LIBUSB_ERROR_INTERRUPTED | LIBUSB_ERROR_NO_MEM => {
                Some(ErrorReason::UnknownError)
            }
            LIBUSB_ERROR_NOT_SUPPORTED => Some(ErrorReason::NoDevicesFound),
            LIBUSB_ERROR_OTHER => Some(ErrorReason::UnknownError),

            EXIT_OK => None,
            EXIT_WRONG_ARGS => Some(ErrorReason::UnknownError),
            EXIT_INVALID_FD => Some(ErrorReason::PermissionDenied),
            EXIT_NO_DEVICES | EXIT_FAILED_TO_OPEN_DEVICE => Some(ErrorReason::NoDevicesFound),
            EXIT_CANNOT_RESTART => Some(ErrorReason::UnknownError),
            EXIT_CANNOT_CLOSE => Some(ErrorReason::Replug),
            EXIT_UNKNOWN | EXIT_SIGNAL_CAUGHT | EXIT_NOT_ENOUGH_POWER
            | EXIT_PLATFORM_NOT_SUPPORTED => Some(ErrorReason::UnknownError),
            _ => None,
        }
    }
}

/// Static description of a driver/exit code
pub fn describe_code(code: i32) -> String {
    use codes::*;
    let libusb = |name: &str| format!("USB failure {}", name);
    match code {
        LIBUSB_ERROR_IO => libusb("LIBUSB_ERROR_IO"),
        LIBUSB_ERROR_INVALID_PARAM => libusb("LIBUSB_ERROR_INVALID_PARAM"),
        ERROR_ACCESS => "Access to the USB device was denied".to_string(),
        LIBUSB_ERROR_NO_DEVICE => libusb("LIBUSB_ERROR_NO_DEVICE"),
        LIBUSB_ERROR_NOT_FOUND => libusb("LIBUSB_ERROR_NOT_FOUND"),
        LIBUSB_ERROR_BUSY => libusb("LIBUSB_ERROR_BUSY"),
        LIBUSB_ERROR_TIMEOUT => libusb("LIBUSB_ERROR_TIMEOUT"),
        LIBUSB_ERROR_OVERFLOW => libusb("LIBUSB_ERROR_OVERFLOW"),
        LIBUSB_ERROR_PIPE => libusb("LIBUSB_ERROR_PIPE"),
        LIBUSB_ERROR_INTERRUPTED => libusb("LIBUSB_ERROR_INTERRUPTED"),
        LIBUSB_ERROR_NO_MEM => libusb("LIBUSB_ERROR_NO_MEM"),
        LIBUSB_ERROR_NOT_SUPPORTED => libusb("LIBUSB_ERROR_NOT_SUPPORTED"),
        LIBUSB_ERROR_OTHER => libusb("LIBUSB_ERROR_OTHER"),
        EXIT_OK => "Closed successfully".to_string(),
        EXIT_WRONG_ARGS => "Wrong arguments".to_string(),
        EXIT_INVALID_FD => "Invalid USB file descriptor".to_string(),
        EXIT_NO_DEVICES => "No devices found".to_string(),
        EXIT_FAILED_TO_OPEN_DEVICE => "Failed to open the device".to_string(),
        EXIT_CANNOT_RESTART => "Cannot restart the driver".to_string(),
        EXIT_CANNOT_CLOSE => "Cannot close the driver".to_string(),
        EXIT_UNKNOWN => "Unknown error".to_string(),
        EXIT_SIGNAL_CAUGHT => "Driver terminated by a signal".to_string(),
        EXIT_NOT_ENOUGH_POWER => "The device is not getting enough power".to_string(),
        EXIT_PLATFORM_NOT_SUPPORTED => "Platform not supported".to_string(),
        other => format!("Driver error {}", other),
    }
}

/// Driver-level failure kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    PermissionDenied,
    Busy,
    NoDevice,
    Timeout,
    Unsupported,
    Generic,
}

impl DriverErrorKind {
    pub fn from_code(code: i32) -> Self {
        use codes::*;
        match code {
            ERROR_ACCESS | EXIT_INVALID_FD => DriverErrorKind::PermissionDenied,
            LIBUSB_ERROR_BUSY => DriverErrorKind::Busy,
            LIBUSB_ERROR_NO_DEVICE | LIBUSB_ERROR_NOT_FOUND | EXIT_NO_DEVICES
            | EXIT_FAILED_TO_OPEN_DEVICE => DriverErrorKind::NoDevice,
            LIBUSB_ERROR_TIMEOUT => DriverErrorKind::Timeout,
            LIBUSB_ERROR_NOT_SUPPORTED | EXIT_PLATFORM_NOT_SUPPORTED => {
                DriverErrorKind::Unsupported
            }
            _ => DriverErrorKind::Generic,
        }
    }
}

#[derive(Error, Debug)]
pub enum SdrError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("No client connected within {0:?}")]
    AcceptTimeout(Duration),

    #[error("{message} (code {code})")]
    Driver {
        kind: DriverErrorKind,
        code: i32,
        message: String,
    },

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Device has already been opened once")]
    AlreadyUsed,

    #[error("Sample producer stopped unexpectedly")]
    ProducerStopped,

    #[error("Device backend panicked: {0}")]
    Panicked(String),
}

impl SdrError {
    /// Wrap a driver/exit code with its category and description
    pub fn from_code(code: i32) -> Self {
        SdrError::Driver {
            kind: DriverErrorKind::from_code(code),
            code,
            message: describe_code(code),
        }
    }

    pub fn unsupported(what: impl Into<String>) -> Self {
        SdrError::Unsupported(what.into())
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            SdrError::Driver { code, .. } => Some(*code),
            SdrError::AlreadyUsed => Some(codes::LIBUSB_ERROR_BUSY),
            SdrError::InvalidArgument(_) => Some(codes::EXIT_WRONG_ARGS),
            _ => None,
        }
    }

    pub fn kind(&self) -> DriverErrorKind {
        match self {
            SdrError::Driver { kind, .. } => *kind,
            SdrError::AcceptTimeout(_) => DriverErrorKind::Timeout,
            SdrError::Unsupported(_) => DriverErrorKind::Unsupported,
            SdrError::AlreadyUsed => DriverErrorKind::Busy,
            _ => DriverErrorKind::Generic,
        }
    }

    pub fn reason(&self) -> ErrorReason {
        match self {
            SdrError::Driver { code, .. } => {
                ErrorReason::for_code(*code).unwrap_or(ErrorReason::UnknownError)
            }
            SdrError::AlreadyUsed => ErrorReason::AlreadyRunning,
            _ => ErrorReason::UnknownError,
        }
    }
}

/// Structured failure handed to the host application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReport {
    pub reason: ErrorReason,
    pub code: Option<i32>,
    pub message: String,
}

impl From<&SdrError> for ErrorReport {
    fn from(err: &SdrError) -> Self {
        ErrorReport {
            reason: err.reason(),
            code: err.code(),
            message: err.to_string(),
        }
    }
}

/// Best-effort text of a panic payload
pub fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
