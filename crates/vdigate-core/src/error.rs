//! Gateway error types

use thiserror::Error;

/// The main error type for gateway operations
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error on a backing device or stream
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed request data: bad header, invalid VHD structure, wrong size
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Backing path is not a regular file or block device
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Backing path does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Requested range does not fit the backing device
    #[error("Range not satisfiable: {0}")]
    RangeNotSatisfiable(String),

    /// Feature outside the supported subset (static VHDs, `*` ranges)
    #[error("Not implemented: {0}")]
    NotImplemented(String),

    /// Consistency bug or unexpected failure
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a bad request error
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Error::BadRequest(msg.into())
    }

    /// Create a forbidden error
    pub fn forbidden(msg: impl Into<String>) -> Self {
        Error::Forbidden(msg.into())
    }

    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    /// Create a range-not-satisfiable error
    pub fn range_not_satisfiable(msg: impl Into<String>) -> Self {
        Error::RangeNotSatisfiable(msg.into())
    }

    /// Create a not implemented error
    pub fn not_implemented(msg: impl Into<String>) -> Self {
        Error::NotImplemented(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// The HTTP status code this error maps to
    pub fn http_status(&self) -> u16 {
        match self {
            Error::Io(_) => 500,
            Error::BadRequest(_) => 400,
            Error::Forbidden(_) => 403,
            Error::NotFound(_) => 404,
            Error::RangeNotSatisfiable(_) => 416,
            Error::NotImplemented(_) => 501,
            Error::Internal(_) => 500,
        }
    }
}
