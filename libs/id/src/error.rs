//! Error types for tenant ID parsing and validation.

use thiserror::Error;

/// Errors that can occur when parsing or validating a tenant ID.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The ID string is empty.
    #[error("tenant ID cannot be empty")]
    Empty,

    /// The ID is longer than platform object names allow.
    #[error("tenant ID too long: {len} characters (max {max})")]
    TooLong { len: usize, max: usize },

    /// The ID must start with an ASCII letter or digit.
    #[error("tenant ID must start with an ASCII letter or digit, got '{0}'")]
    InvalidStart(char),

    /// The ID must end with an ASCII letter or digit.
    #[error("tenant ID must end with an ASCII letter or digit, got '{0}'")]
    InvalidEnd(char),

    /// The ID contains a character that cannot appear in a platform object name.
    #[error("invalid character '{ch}' at position {position} in tenant ID")]
    InvalidCharacter { ch: char, position: usize },

    /// The name prefix would not produce valid platform object names.
    #[error("invalid name prefix '{prefix}': {reason}")]
    InvalidPrefix { prefix: String, reason: String },
}

impl IdError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty)
    }
}
