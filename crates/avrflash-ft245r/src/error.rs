//! Error types for the FT245R programmer

use avrflash_core::{Error, ErrorKind};
use thiserror::Error;

/// Result type for FT245R operations
pub type Result<T> = std::result::Result<T, Ft245rError>;

/// Errors that can occur during FT245R operations
#[derive(Debug, Error)]
pub enum Ft245rError {
    /// No matching FT245R/FT232R found
    #[error("no FTDI FT245R found{0}")]
    DeviceNotFound(String),

    /// Failed to open device
    #[error("failed to open device: {0}")]
    OpenFailed(String),

    /// Failed to configure device
    #[error("failed to configure device: {0}")]
    ConfigFailed(String),

    /// USB transfer failed
    #[error("USB transfer failed: {0}")]
    TransferFailed(String),

    /// Invalid `-P` or `-x` parameter
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// libftdi error
    #[error("libftdi error: {0}")]
    LibFtdi(String),

    /// USB enumeration error
    #[error("USB error: {0}")]
    UsbError(String),
}

impl From<ftdi::Error> for Ft245rError {
    fn from(e: ftdi::Error) -> Self {
        Ft245rError::LibFtdi(e.to_string())
    }
}

impl From<nusb::Error> for Ft245rError {
    fn from(e: nusb::Error) -> Self {
        Ft245rError::UsbError(e.to_string())
    }
}

impl Ft245rError {
    /// Core error kind for this failure
    pub fn kind(&self) -> ErrorKind {
        match self {
            Ft245rError::InvalidParameter(_) => ErrorKind::IllegalParam,
            _ => ErrorKind::Io,
        }
    }
}

impl From<Ft245rError> for Error {
    #[track_caller]
    fn from(e: Ft245rError) -> Self {
        Error::new(e.kind(), e.to_string())
    }
}
