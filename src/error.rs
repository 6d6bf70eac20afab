//! Errors that can occur in kvis

use std::path::PathBuf;

use thiserror::Error;

use crate::io::error::IOError;

/// All the errors that can occur in kvis
#[derive(Error, Debug)]
pub enum KvisError {
    /// A key was requested that is not stored in either orientation.
    #[error("Key {key} not found")]
    KeyNotFound {
        /// display of the requested key
        key: String,
    },

    /// An array or container did not have the expected shape.
    #[error("bad array shape supplied to argument {argument} of function {function}. expected {expected}, received {received}")]
    ShapeMismatch {
        /// The argument name within the function
        argument: String,
        /// The function name
        function: String,
        /// The expected shape
        expected: String,
        /// The shape that was received instead
        received: String,
    },

    /// The format cannot subset the requested axis.
    #[error("The {format} format does not support selecting on the {axis} axis")]
    UnsupportedSelector {
        /// The format that rejected the selector
        format: String,
        /// The axis that was selected on
        axis: String,
    },

    /// Whole-file metadata is required but the format cannot provide it.
    #[error("Whole-file metadata is unavailable, but {needed_for} requires it. Supply an explicit list instead")]
    MetadataUnavailable {
        /// What needed the metadata
        needed_for: String,
    },

    /// An update tried to write a key that was not part of the last read.
    #[error("Key {key} was not part of the most recently read subset")]
    KeyNotInSubset {
        /// display of the offending key
        key: String,
    },

    /// A subset-bound operation was attempted before any read.
    #[error("No subset has been read yet, so {operation} has nothing to act on")]
    SubsetUndefined {
        /// The operation that was attempted
        operation: String,
    },

    /// The recorded subset does not exist in the destination file.
    #[error("Region out of bounds for {path:?}: {axis} {value} does not exist in the destination")]
    RegionOutOfBounds {
        /// The destination path
        path: PathBuf,
        /// The axis that failed to map
        axis: String,
        /// The value that could not be found
        value: String,
    },

    /// Refusing to clobber an existing file.
    #[error("{path:?} already exists; set overwrite to replace it")]
    FileExists {
        /// The path that already exists
        path: PathBuf,
    },

    /// The backend failed while writing.
    #[error("Failed to write {path:?}: {source}")]
    BackendWrite {
        /// The path that was being written
        path: PathBuf,
        /// The underlying error
        source: IOError,
    },

    /// The backend failed while reading.
    #[error("Failed to read {path:?}: {source}")]
    BackendRead {
        /// The path that was being read
        path: PathBuf,
        /// The underlying error
        source: IOError,
    },

    /// A calibration update did not include every key of the read.
    #[error("Update of {container} is missing {num_missing} keys from the original read, e.g. {example}")]
    IncompleteUpdate {
        /// Which container was incomplete
        container: String,
        /// How many keys were missing
        num_missing: usize,
        /// One of the missing keys
        example: String,
    },

    /// The operation is not available for this format or handle.
    #[error("{operation} is not supported by {target}")]
    NotSupported {
        /// The operation that was attempted
        operation: String,
        /// What does not support it
        target: String,
    },

    /// A frequency, time or index that was asked for does not exist.
    #[error("No {axis} matching {value} in the dataset")]
    SelectionNotFound {
        /// The axis being selected on
        axis: String,
        /// The value or index that was not found
        value: String,
    },

    /// Chunk sizes must be at least one.
    #[error("Invalid chunk size {group_size}, must be at least 1")]
    InvalidChunkSize {
        /// The group size that was given
        group_size: usize,
    },

    /// Files opened together do not describe the same dataset.
    #[error("{path:?} is incompatible with the first file: {reason}")]
    IncompatibleFiles {
        /// The offending file
        path: PathBuf,
        /// What differs
        reason: String,
    },

    /// No format could be determined.
    #[error("Could not determine a format for {input}, expected one of {expected}")]
    UnknownFormat {
        /// the extension or name that was given
        input: String,
        /// the known formats
        expected: String,
    },

    /// A polarization string outside of the supported set.
    #[error("Invalid polarization string '{0}'")]
    InvalidPol(String),

    /// A malformed `ant1_ant2_pol` string.
    #[error("Invalid antpairpol string '{0}'")]
    InvalidAntPairPol(String),

    /// A gain convention other than `divide` or `multiply`.
    #[error("Invalid gain convention '{0}', expected one of divide, multiply")]
    InvalidGainConvention(String),

    #[error("{0}")]
    /// Error derived from [`std::io::Error`]
    Io(#[from] std::io::Error),
}

impl KvisError {
    pub(crate) fn backend_read<P: Into<PathBuf>>(path: P, source: IOError) -> Self {
        Self::BackendRead {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn backend_write<P: Into<PathBuf>>(path: P, source: IOError) -> Self {
        Self::BackendWrite {
            path: path.into(),
            source,
        }
    }
}
