//! Error types for onboarding operations.
//!
//! Every error carries a machine-checkable [`ErrorKind`]; callers and tests
//! branch on the kind, the message is for humans.

use onboard_client::ClientError;
use onboard_core::{IdError, TransactionId};
use thiserror::Error;

/// A result type using `OnboardError`.
pub type Result<T> = std::result::Result<T, OnboardError>;

/// Broad classification of an [`OnboardError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The requested configuration can never succeed as given. Never retried.
    Configuration,
    /// The remote side failed or is not yet in the desired state.
    Transient,
    /// A retry budget ran out.
    Exhausted,
    /// A batched transaction was aborted or failed to commit.
    Transaction,
    /// The license-management service refused or never activated a license.
    Licensing,
    /// The control plane answered with something this crate cannot interpret.
    Protocol,
}

/// Errors that can occur while onboarding a device.
#[derive(Debug, Error)]
pub enum OnboardError {
    /// A single call against the control plane failed.
    #[error(transparent)]
    Client(#[from] ClientError),

    /// The remote resource is reachable but not yet in the desired state.
    #[error("not ready: {0}")]
    NotReady(String),

    /// The retry budget was exhausted; wraps the last failure.
    #[error("gave up after {attempts} attempts: {source}")]
    RetryExhausted {
        /// Total number of attempts made, including the first.
        attempts: u32,
        /// The failure observed on the last attempt.
        #[source]
        source: Box<OnboardError>,
    },

    /// No license pool with the given name exists.
    #[error("license pool not found: {0}")]
    PoolNotFound(String),

    /// Every offering in the pool is expired, not yet valid, or claimed.
    #[error("no valid license offering available in pool {pool}")]
    NoValidLicense {
        /// Name of the scanned pool.
        pool: String,
    },

    /// The license never reached the licensed state within the budget.
    #[error("timed out waiting for license {registration_key} to become active after {attempts} attempts")]
    LicensingTimedOut {
        /// Registration key of the claimed offering.
        registration_key: String,
        /// Total number of status checks made.
        attempts: u32,
    },

    /// The license-management service reported a terminal failure.
    #[error("license {registration_key} was rejected: state {state}")]
    LicensingRejected {
        /// Registration key of the claimed offering.
        registration_key: String,
        /// The terminal state reported by the service.
        state: String,
    },

    /// A mutation inside a transaction failed; the transaction was not committed.
    #[error("transaction {transaction_id} aborted: {source}")]
    TransactionAborted {
        /// The abandoned transaction.
        transaction_id: TransactionId,
        /// The mutation failure.
        #[source]
        source: Box<OnboardError>,
    },

    /// The transaction commit did not complete.
    #[error("transaction {transaction_id} failed: {reason}")]
    TransactionFailed {
        /// The failed transaction.
        transaction_id: TransactionId,
        /// The reported terminal state or commit failure.
        reason: String,
    },

    /// A mutation was staged on a transaction that is no longer open.
    #[error("transaction {0} is no longer open")]
    TransactionClosed(TransactionId),

    /// Only `Create`, `Modify` and `Delete` can be staged in a transaction.
    #[error("cannot stage {method} {path} in a transaction")]
    InvalidMutation {
        /// HTTP method of the rejected mutation.
        method: String,
        /// Target resource.
        path: String,
    },

    /// A user cannot be created without a role.
    #[error("role is required to create user {0}")]
    RoleRequired(String),

    /// Changing the root password requires the current password.
    #[error("old password is required to change the root password")]
    OldPasswordRequired,

    /// The requested module does not exist on the device.
    #[error("module {0} is not provisionable")]
    NotProvisionable(String),

    /// A response was missing a field or had an unexpected shape.
    #[error("unexpected response from {path}: {message}")]
    UnexpectedResponse {
        /// Resource path of the call.
        path: String,
        /// What was wrong with the response.
        message: String,
    },

    /// An identifier in a response could not be parsed.
    #[error("invalid identifier: {0}")]
    InvalidId(#[from] IdError),
}

impl OnboardError {
    /// Returns the classification of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Client(_) | Self::NotReady(_) => ErrorKind::Transient,
            Self::RetryExhausted { .. } => ErrorKind::Exhausted,
            Self::PoolNotFound(_)
            | Self::RoleRequired(_)
            | Self::OldPasswordRequired
            | Self::NotProvisionable(_)
            | Self::InvalidMutation { .. } => ErrorKind::Configuration,
            Self::NoValidLicense { .. }
            | Self::LicensingTimedOut { .. }
            | Self::LicensingRejected { .. } => ErrorKind::Licensing,
            Self::TransactionAborted { .. }
            | Self::TransactionFailed { .. }
            | Self::TransactionClosed(_) => ErrorKind::Transaction,
            Self::UnexpectedResponse { .. } | Self::InvalidId(_) => ErrorKind::Protocol,
        }
    }

    /// Returns true if this error might be resolved by retrying.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient)
    }

    pub(crate) fn unexpected(path: &str, message: impl Into<String>) -> Self {
        Self::UnexpectedResponse {
            path: path.to_string(),
            message: message.into(),
        }
    }
}
