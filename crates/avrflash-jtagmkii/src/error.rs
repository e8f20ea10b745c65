//! Error types for JTAG ICE mkII operations

use avrflash_core::{Error, ErrorKind};
use thiserror::Error;

use crate::protocol::rsp_name;

/// JTAG ICE mkII specific errors
#[derive(Debug, Error)]
pub enum JtagError {
    /// No ICE found on the requested port
    #[error("JTAG ICE mkII not found{0}")]
    DeviceNotFound(String),

    /// Failed to open the device
    #[error("Failed to open JTAG ICE mkII: {0}")]
    OpenFailed(String),

    /// USB transfer error
    #[error("USB transfer failed: {0}")]
    TransferFailed(String),

    /// No complete frame within the time budget
    #[error("Timeout waiting for a response")]
    Timeout,

    /// Frame with a CRC mismatch
    #[error("CRC mismatch: computed 0x{computed:04x}, received 0x{received:04x}")]
    BadCrc {
        /// CRC over the received bytes
        computed: u16,
        /// CRC carried by the frame
        received: u16,
    },

    /// Response code other than the expected one
    #[error("{command} failed: {} (0x{code:02x})", rsp_name(*code))]
    Refused {
        /// Human readable command name
        command: &'static str,
        /// Response code from the ICE
        code: u8,
    },

    /// Response shorter than its command requires
    #[error("Short response to {command}: {len} bytes")]
    ShortResponse {
        /// Human readable command name
        command: &'static str,
        /// Length actually received
        len: usize,
    },

    /// Firmware too old for the requested interface
    #[error("{0}")]
    Firmware(String),

    /// Bad `-x` parameter or interface selection
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// I/O error during communication
    #[error("I/O error: {0}")]
    IoError(String),

    /// Serial port error
    #[error("Serial port error: {0}")]
    SerialError(#[from] serialport::Error),
}

/// Result type for JTAG ICE mkII operations
pub type Result<T> = std::result::Result<T, JtagError>;

impl From<std::io::Error> for JtagError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::TimedOut {
            JtagError::Timeout
        } else {
            JtagError::IoError(e.to_string())
        }
    }
}

impl From<nusb::Error> for JtagError {
    fn from(e: nusb::Error) -> Self {
        JtagError::TransferFailed(e.to_string())
    }
}

impl JtagError {
    /// Map to the workspace-wide error classification
    pub fn kind(&self) -> ErrorKind {
        match self {
            JtagError::Timeout => ErrorKind::Timeout,
            JtagError::BadCrc { .. } | JtagError::ShortResponse { .. } => ErrorKind::BadFrame,
            JtagError::Refused { code, .. } if *code == crate::protocol::RSP_NO_TARGET_POWER => {
                ErrorKind::NoTargetPower
            }
            JtagError::Refused { code, .. } => ErrorKind::ProtocolRefused(*code),
            JtagError::Firmware(_) => ErrorKind::Unsupported,
            JtagError::InvalidParameter(_) => ErrorKind::IllegalParam,
            JtagError::DeviceNotFound(_)
            | JtagError::OpenFailed(_)
            | JtagError::TransferFailed(_)
            | JtagError::IoError(_)
            | JtagError::SerialError(_) => ErrorKind::Io,
        }
    }
}

impl From<JtagError> for Error {
    #[track_caller]
    fn from(e: JtagError) -> Self {
        Error::new(e.kind(), e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refusal_maps_to_protocol_kind() {
        let e: Error = JtagError::Refused { command: "read memory", code: 0xA3 }.into();
        assert_eq!(e.kind(), ErrorKind::ProtocolRefused(0xA3));
        assert!(e.context().contains("RSP_ILLEGAL_MEMORY_RANGE"));

        let e: Error = JtagError::Refused { command: "enter progmode", code: 0xAB }.into();
        assert_eq!(e.kind(), ErrorKind::NoTargetPower);
    }

    #[test]
    fn test_timeout_from_io() {
        let e = JtagError::from(std::io::Error::from(std::io::ErrorKind::TimedOut));
        assert_eq!(e.kind(), ErrorKind::Timeout);
    }
}
