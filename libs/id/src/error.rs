//! Error types for ID parsing.

use thiserror::Error;

/// Errors that can occur when parsing an ID from a string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdError {
    /// The input string was empty.
    #[error("ID string is empty")]
    Empty,

    /// The input did not contain the `_` prefix separator.
    #[error("ID is missing the prefix separator")]
    MissingSeparator,

    /// The prefix did not match the expected resource type.
    #[error("invalid ID prefix: expected '{expected}', got '{actual}'")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    /// The ULID portion failed to parse.
    #[error("invalid ULID: {0}")]
    InvalidUlid(String),
}
