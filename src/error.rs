use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, MolinoError>;

#[derive(Debug, Error)]
pub enum MolinoError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("corruption detected: {0}")]
    Corruption(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
}

impl MolinoError {
    /// Parse errors are reported per input line and skipped; everything
    /// else aborts the current pass.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, MolinoError::Parse(_))
    }
}
