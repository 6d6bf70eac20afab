//! Errors that can occur in the io module

use thiserror::Error;

#[derive(Error, Debug)]
#[allow(clippy::upper_case_acronyms)]
/// All the errors that can occur while parsing or serializing a file
pub enum IOError {
    /// The magic string at the start of a file was wrong.
    #[error("expected {expected} as the first 7 characters, got '{got}' instead")]
    BadMagic {
        /// The magic string for the format
        expected: &'static str,
        /// What was found
        got: String,
    },

    /// A header field held a value that cannot be right.
    #[error("expected a value {expected} for header field {field}, but got '{got}' instead")]
    BadHeaderValue {
        /// The header field
        field: &'static str,
        /// Description of the acceptable values
        expected: String,
        /// What was found
        got: String,
    },

    /// Error to describe some kind of inconsistent state within a file or buffer.
    #[error("Inconsistent {thing} (expected: {expected}, found: {found})")]
    Inconsistent {
        /// What was inconsistent
        thing: String,
        /// The value that was expected
        expected: String,
        /// The unexpected value that was found
        found: String,
    },

    #[error("{0}")]
    /// A string in the file was not valid utf-8
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("{0}")]
    /// Error derived from [`std::io::Error`]
    StdIo(#[from] std::io::Error),
}
