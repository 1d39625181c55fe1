//! # Error Taxonomy
//!
//! libbladeRF reports failures as negative integers. Every native call site
//! passes its status through [`translate`] (or [`check_count`] for calls that
//! return a count) so raw codes never escape this crate family.
//!
//! | Code | Kind                     |
//! |------|--------------------------|
//! |  -1  | `Unexpected`             |
//! |  -2  | `OutOfRange`             |
//! |  -3  | `InvalidParameter`       |
//! |  -4  | `AllocationFailure`      |
//! |  -5  | `IoError`                |
//! |  -6  | `Timeout`                |
//! |  -7  | `NoDevice`               |
//! |  -8  | `Unsupported`            |
//! |  -9  | `Misaligned`             |
//! | -10  | `ChecksumInvalid`        |
//! | -11  | `FileNotFound`           |
//! | -12  | `FpgaUpdateRequired`     |
//! | -13  | `FirmwareUpdateRequired` |
//! | -14  | `TimestampInPast`        |
//! | -15  | `QueueFull`              |
//! | -16  | `FpgaOperationFailed`    |
//! | -17  | `PermissionDenied`       |
//! | -18  | `WouldBlock`             |
//! | -19  | `NotInitialized`         |
//!
//! Unknown negative codes become `Unexpected` with the raw code kept for
//! diagnostics. `ContractViolation` and `BufferSizeMismatch` never come from
//! the driver; they are raised by the streaming and transfer layers.

use std::fmt;

/// Result type for bladeRF operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Closed set of failure kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Unexpected,
    OutOfRange,
    InvalidParameter,
    AllocationFailure,
    IoError,
    Timeout,
    NoDevice,
    Unsupported,
    Misaligned,
    ChecksumInvalid,
    FileNotFound,
    FpgaUpdateRequired,
    FirmwareUpdateRequired,
    TimestampInPast,
    QueueFull,
    FpgaOperationFailed,
    PermissionDenied,
    WouldBlock,
    NotInitialized,
    /// A stream callback broke its contract, or the bridge ran after teardown.
    ContractViolation,
    /// The driver reported more samples than the caller asked for.
    BufferSizeMismatch,
}

impl ErrorKind {
    /// Map a native status code to a kind. Returns `None` for 0 and positive
    /// values.
    pub fn from_code(code: i32) -> Option<Self> {
        let kind = match code {
            c if c >= 0 => return None,
            -2 => ErrorKind::OutOfRange,
            -3 => ErrorKind::InvalidParameter,
            -4 => ErrorKind::AllocationFailure,
            -5 => ErrorKind::IoError,
            -6 => ErrorKind::Timeout,
            -7 => ErrorKind::NoDevice,
            -8 => ErrorKind::Unsupported,
            -9 => ErrorKind::Misaligned,
            -10 => ErrorKind::ChecksumInvalid,
            -11 => ErrorKind::FileNotFound,
            -12 => ErrorKind::FpgaUpdateRequired,
            -13 => ErrorKind::FirmwareUpdateRequired,
            -14 => ErrorKind::TimestampInPast,
            -15 => ErrorKind::QueueFull,
            -16 => ErrorKind::FpgaOperationFailed,
            -17 => ErrorKind::PermissionDenied,
            -18 => ErrorKind::WouldBlock,
            -19 => ErrorKind::NotInitialized,
            _ => ErrorKind::Unexpected,
        };
        Some(kind)
    }

    /// The native code for this kind, if it has one.
    pub fn code(self) -> Option<i32> {
        let code = match self {
            ErrorKind::Unexpected => -1,
            ErrorKind::OutOfRange => -2,
            ErrorKind::InvalidParameter => -3,
            ErrorKind::AllocationFailure => -4,
            ErrorKind::IoError => -5,
            ErrorKind::Timeout => -6,
            ErrorKind::NoDevice => -7,
            ErrorKind::Unsupported => -8,
            ErrorKind::Misaligned => -9,
            ErrorKind::ChecksumInvalid => -10,
            ErrorKind::FileNotFound => -11,
            ErrorKind::FpgaUpdateRequired => -12,
            ErrorKind::FirmwareUpdateRequired => -13,
            ErrorKind::TimestampInPast => -14,
            ErrorKind::QueueFull => -15,
            ErrorKind::FpgaOperationFailed => -16,
            ErrorKind::PermissionDenied => -17,
            ErrorKind::WouldBlock => -18,
            ErrorKind::NotInitialized => -19,
            ErrorKind::ContractViolation | ErrorKind::BufferSizeMismatch => return None,
        };
        Some(code)
    }

    /// Human-readable description, matching the driver's wording.
    pub fn description(self) -> &'static str {
        match self {
            ErrorKind::Unexpected => "An unexpected failure occurred",
            ErrorKind::OutOfRange => "Provided parameter is out of range",
            ErrorKind::InvalidParameter => "Invalid operation/parameter",
            ErrorKind::AllocationFailure => "Memory allocation error",
            ErrorKind::IoError => "File/Device I/O error",
            ErrorKind::Timeout => "Operation timed out",
            ErrorKind::NoDevice => "No device(s) available",
            ErrorKind::Unsupported => "Operation not supported",
            ErrorKind::Misaligned => "Misaligned flash access",
            ErrorKind::ChecksumInvalid => "Invalid checksum",
            ErrorKind::FileNotFound => "File not found",
            ErrorKind::FpgaUpdateRequired => "An FPGA update is required",
            ErrorKind::FirmwareUpdateRequired => "A firmware update is required",
            ErrorKind::TimestampInPast => "Requested timestamp is in the past",
            ErrorKind::QueueFull => "Could not enqueue data into full queue",
            ErrorKind::FpgaOperationFailed => "An FPGA operation reported failure",
            ErrorKind::PermissionDenied => "Insufficient permissions for the requested operation",
            ErrorKind::WouldBlock => "Operation would block, but has been requested to be non-blocking",
            ErrorKind::NotInitialized => "Device insufficiently initialized for operation",
            ErrorKind::ContractViolation => "Stream callback contract violated",
            ErrorKind::BufferSizeMismatch => "Transferred sample count does not match the buffer",
        }
    }

    /// Stream drive loops keep going after these.
    pub fn is_recoverable(self) -> bool {
        matches!(self, ErrorKind::Timeout | ErrorKind::WouldBlock)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Errors raised by bladeRF operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("{kind} (code {code})")]
    Native { kind: ErrorKind, code: i32 },

    #[error("Stream callback contract violated: {0}")]
    ContractViolation(String),

    #[error("Buffer size mismatch: requested {requested} samples, driver reported {actual}")]
    BufferSizeMismatch { requested: usize, actual: usize },

    #[error("libbladeRF not found: {0}")]
    LibraryNotFound(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Build a native error from a kind, using its canonical code.
    pub fn native(kind: ErrorKind) -> Self {
        Error::Native {
            kind,
            code: kind.code().unwrap_or(-1),
        }
    }

    /// Build an error from a raw negative status code.
    pub fn from_code(code: i32) -> Self {
        Error::Native {
            kind: ErrorKind::from_code(code).unwrap_or(ErrorKind::Unexpected),
            code,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Native { kind, .. } => *kind,
            Error::ContractViolation(_) => ErrorKind::ContractViolation,
            Error::BufferSizeMismatch { .. } => ErrorKind::BufferSizeMismatch,
            Error::LibraryNotFound(_) => ErrorKind::FileNotFound,
            Error::Config(_) => ErrorKind::InvalidParameter,
        }
    }

    /// Raw native code, when the error came from the driver.
    pub fn code(&self) -> Option<i32> {
        match self {
            Error::Native { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        self.kind().is_recoverable()
    }
}

/// Translate a native status code. 0 and positive values are success.
pub fn translate(code: i32) -> Result<()> {
    if code < 0 {
        Err(Error::from_code(code))
    } else {
        Ok(())
    }
}

/// Translate a status that doubles as a count on success.
pub fn check_count(code: i32) -> Result<usize> {
    translate(code)?;
    Ok(code as usize)
}
