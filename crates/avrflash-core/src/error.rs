//! Error types for avrflash-core
//!
//! Every fallible operation in the workspace returns [`Error`], which pairs a
//! `Copy` [`ErrorKind`] with a free-form context string and the source
//! location where the error was raised. The location is captured through
//! `#[track_caller]` and only printed by the reporter at debug verbosity.

use std::fmt;
use std::panic::Location;

/// Classification of an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// No answer from the programmer or target within the time budget
    Timeout,
    /// Frame with bad CRC, parity or stop bits
    BadFrame,
    /// Response sequence number does not match the request
    WrongSeq,
    /// Operation issued in a state that does not allow it
    IllegalState,
    /// Parameter value out of range or malformed
    IllegalParam,
    /// Target is not powered
    NoTargetPower,
    /// Device signature does not match the selected part
    SignatureMismatch,
    /// Read-back contents differ from what was written
    VerifyMismatch,
    /// Attempt to change a read-only location
    ReadOnly,
    /// Programmer or part does not support the operation
    Unsupported,
    /// Programmer answered with a failure response code
    ProtocolRefused(u8),
    /// Recoverable failure; the caller may continue or redeem it later
    SoftFail,
    /// Unrecoverable failure
    HardFail,
    /// Host I/O error (files, serial ports, USB)
    Io,
    /// Input, catalogue or command line could not be parsed
    Parse,
    /// Allocation or size limit exceeded
    OutOfMemory,
}

impl ErrorKind {
    /// Soft errors are reported and the run continues with the next update
    pub fn is_soft(self) -> bool {
        matches!(self, Self::WrongSeq | Self::SoftFail)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::BadFrame => write!(f, "bad frame"),
            Self::WrongSeq => write!(f, "wrong sequence number"),
            Self::IllegalState => write!(f, "illegal state"),
            Self::IllegalParam => write!(f, "illegal parameter"),
            Self::NoTargetPower => write!(f, "no target power"),
            Self::SignatureMismatch => write!(f, "signature mismatch"),
            Self::VerifyMismatch => write!(f, "verification mismatch"),
            Self::ReadOnly => write!(f, "read-only memory"),
            Self::Unsupported => write!(f, "not supported"),
            Self::ProtocolRefused(code) => write!(f, "refused by programmer (0x{:02x})", code),
            Self::SoftFail => write!(f, "soft failure"),
            Self::HardFail => write!(f, "failure"),
            Self::Io => write!(f, "I/O error"),
            Self::Parse => write!(f, "parse error"),
            Self::OutOfMemory => write!(f, "out of memory"),
        }
    }
}

/// Error carrying a kind, context and source location
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    context: String,
    location: &'static Location<'static>,
}

impl Error {
    /// Create an error with context, recording the caller's location
    #[track_caller]
    pub fn new(kind: ErrorKind, context: impl Into<String>) -> Self {
        Self {
            kind,
            context: context.into(),
            location: Location::caller(),
        }
    }

    /// Error kind
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Context message (may be empty)
    pub fn context(&self) -> &str {
        &self.context
    }

    /// Source location where the error was raised
    pub fn location(&self) -> &'static Location<'static> {
        self.location
    }

    /// Shorthand for `self.kind().is_soft()`
    pub fn is_soft(&self) -> bool {
        self.kind.is_soft()
    }

    /// Prefix the context with an outer description, keeping kind and location
    pub fn with_context(mut self, outer: impl fmt::Display) -> Self {
        self.context = if self.context.is_empty() {
            outer.to_string()
        } else {
            format!("{}: {}", outer, self.context)
        };
        self
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.context == other.context
    }
}

impl From<ErrorKind> for Error {
    #[track_caller]
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind, "")
    }
}

impl From<std::io::Error> for Error {
    #[track_caller]
    fn from(e: std::io::Error) -> Self {
        let kind = match e.kind() {
            std::io::ErrorKind::TimedOut => ErrorKind::Timeout,
            std::io::ErrorKind::OutOfMemory => ErrorKind::OutOfMemory,
            _ => ErrorKind::Io,
        };
        Self::new(kind, e.to_string())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.context.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{} ({})", self.context, self.kind)
        }
    }
}

impl std::error::Error for Error {}

/// Result type alias using the core Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Build an `Err` of the given kind with a formatted context
#[macro_export]
macro_rules! bail {
    ($kind:expr, $($arg:tt)+) => {
        return Err($crate::error::Error::new($kind, format!($($arg)+)))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_soft_kinds() {
        assert!(ErrorKind::WrongSeq.is_soft());
        assert!(ErrorKind::SoftFail.is_soft());
        assert!(!ErrorKind::VerifyMismatch.is_soft());
        assert!(!ErrorKind::ProtocolRefused(0xA0).is_soft());
    }

    #[test]
    fn test_location_is_captured() {
        let e = Error::new(ErrorKind::Timeout, "no answer");
        assert!(e.location().file().ends_with("error.rs"));
        assert_eq!(e.to_string(), "no answer (timeout)");
    }

    #[test]
    fn test_with_context() {
        let e = Error::from(ErrorKind::ReadOnly).with_context("flash");
        assert_eq!(e.context(), "flash");
        let e = e.with_context("write");
        assert_eq!(e.context(), "write: flash");
        assert_eq!(e.kind(), ErrorKind::ReadOnly);
    }
}
