//! Transport error types.

use thiserror::Error;

/// A result type using `ClientError`.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors raised by a single call against the control plane.
///
/// Callers treat every variant uniformly as "this attempt failed"; the
/// helpers below exist for diagnostics and for the rare caller that needs to
/// tell a missing resource apart from a broken connection.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The HTTP request could not be sent or its body could not be read.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The control plane answered with a non-success status.
    #[error("{method} {path} returned {status}: {message}")]
    Status {
        /// HTTP method of the failed call.
        method: String,
        /// Resource path of the failed call.
        path: String,
        /// HTTP status code.
        status: u16,
        /// Message extracted from the error body.
        message: String,
    },

    /// The response body was not valid JSON.
    #[error("failed to parse response from {path}: {message}")]
    Parse {
        /// Resource path of the call.
        path: String,
        /// Parser message.
        message: String,
    },

    /// The configured base URL cannot be combined with a resource path.
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
}

impl ClientError {
    /// Returns the HTTP status code, if the control plane produced one.
    #[must_use]
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Http(e) => e.status().map(|s| s.as_u16()),
            Self::Parse { .. } | Self::InvalidUrl(_) => None,
        }
    }

    /// Returns true if the remote resource does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.status_code() == Some(404)
    }

    /// Returns true if this error might be resolved by retrying.
    ///
    /// Only a malformed base URL is permanent.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        !matches!(self, Self::InvalidUrl(_))
    }
}
