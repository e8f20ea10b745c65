//! Error types for the terminal

use thiserror::Error;

/// Errors that can occur in the terminal
#[derive(Error, Debug)]
pub enum TermError {
    /// I/O error (reading/writing stdin/stdout)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Line editor failure
    #[error("line editor: {0}")]
    Readline(String),

    /// A programmer or memory operation failed
    #[error("{0}")]
    Core(#[from] avrflash_core::Error),

    /// Wrong number or shape of arguments; carries the usage text
    #[error("{0}")]
    Usage(String),

    /// Invalid argument
    #[error("{0}")]
    InvalidArgument(String),
}

/// Result type for terminal operations
pub type Result<T> = std::result::Result<T, TermError>;
