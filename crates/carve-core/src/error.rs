//! Error types for the carve-core library.
//!
//! Probing never produces an [`Error`]: a failed probe is a normal outcome
//! reported through [`Probe`](crate::spec::Probe). The variants here cover the
//! mutating decode pass, the decode cache and the scan session itself.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for carve operations
pub type Result<T> = std::result::Result<T, Error>;

/// Comprehensive error type for all carve operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Failed to open or read a root input file
    #[error("failed to read file '{path}': {source}")]
    FileRead {
        /// Path to the file that failed to read
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// I/O error while decoding an input
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The input ended inside a field during decode
    #[error("input truncated at offset {offset}: needed {needed} bytes, {available} available")]
    Truncated {
        /// Absolute offset of the field being decoded
        offset: u64,
        /// Number of bytes the field needed
        needed: u64,
        /// Number of bytes actually available
        available: u64,
    },

    /// A decoded value violates the attribute's final value or allowed set
    #[error("invalid value for '{attribute}' at offset {offset}: {found}")]
    InvalidValue {
        /// Attribute name
        attribute: String,
        /// Absolute offset of the value
        offset: u64,
        /// Rendered value that was found
        found: String,
    },

    /// A length or count refers to an attribute with no bound numeric value
    #[error("attribute '{attribute}' is not bound to a numeric value in scope")]
    UnresolvedAttribute {
        /// Attribute name or identifier
        attribute: String,
    },

    /// An attribute was written without any enclosing declaration
    #[error("attribute '{attribute}' was set without being declared")]
    UndeclaredAttribute {
        /// Attribute name or identifier
        attribute: String,
    },

    /// A decoder or the decode cache failed while materializing a stream
    #[error("failed to decode '{name}': {source}")]
    Decode {
        /// Name of the encoded stream
        name: String,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// The decode cache scratch file could not be created
    #[error("failed to create decode cache in '{dir}': {source}")]
    CacheCreate {
        /// Directory the scratch file was to be created in
        dir: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// A derived input is nested deeper than the configured limit
    #[error("encoded input nested {depth} levels deep exceeds limit of {max}")]
    DepthExceeded {
        /// Depth of the derived input
        depth: usize,
        /// Configured maximum
        max: usize,
    },

    /// A decode pass panicked
    #[error("decode panicked: {0}")]
    Panicked(String),

    /// Generic internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Creates a new file read error
    pub fn file_read(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FileRead {
            path: path.into(),
            source,
        }
    }

    /// Creates a new truncation error
    pub fn truncated(offset: u64, needed: u64, available: u64) -> Self {
        Self::Truncated {
            offset,
            needed,
            available,
        }
    }

    /// Creates a new invalid value error
    pub fn invalid_value(attribute: impl Into<String>, offset: u64, found: impl Into<String>) -> Self {
        Self::InvalidValue {
            attribute: attribute.into(),
            offset,
            found: found.into(),
        }
    }

    /// Creates a new unresolved attribute error
    pub fn unresolved_attribute(attribute: impl Into<String>) -> Self {
        Self::UnresolvedAttribute {
            attribute: attribute.into(),
        }
    }

    /// Creates a new undeclared attribute error
    pub fn undeclared_attribute(attribute: impl Into<String>) -> Self {
        Self::UndeclaredAttribute {
            attribute: attribute.into(),
        }
    }

    /// Creates a new stream decode error
    pub fn decode(name: impl Into<String>, source: std::io::Error) -> Self {
        Self::Decode {
            name: name.into(),
            source,
        }
    }

    /// Creates a new cache creation error
    pub fn cache_create(dir: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::CacheCreate {
            dir: dir.into(),
            source,
        }
    }

    /// Creates a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Returns true if this error aborts the whole scan session
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::CacheCreate { .. })
    }

    /// Returns true if this error only affects the node it is attached to
    pub fn is_recoverable(&self) -> bool {
        !self.is_fatal()
    }
}
