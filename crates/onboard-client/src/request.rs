//! Request description shared by every `RestClient` implementation.

use std::fmt;

use onboard_core::TransactionId;
use serde_json::Value;

/// The four operations the control plane exposes on a resource path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// Read the current document (`GET`).
    List,
    /// Create a resource or run a command-style action (`POST`).
    Create,
    /// Patch an existing resource (`PATCH`).
    Modify,
    /// Remove a resource (`DELETE`).
    Delete,
}

impl Method {
    /// The HTTP verb used on the wire.
    #[must_use]
    pub const fn as_http(&self) -> &'static str {
        match self {
            Self::List => "GET",
            Self::Create => "POST",
            Self::Modify => "PATCH",
            Self::Delete => "DELETE",
        }
    }

    /// Returns true if the method changes remote state.
    #[must_use]
    pub const fn is_mutating(&self) -> bool {
        !matches!(self, Self::List)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_http())
    }
}

/// One call against a path-addressed resource.
#[derive(Debug, Clone, PartialEq)]
pub struct RestRequest {
    /// Operation to perform.
    pub method: Method,
    /// Resource path relative to the client's base URL (e.g. `/tm/sys/provision`).
    pub path: String,
    /// Optional query parameters.
    pub query: Vec<(String, String)>,
    /// JSON body for `Create` and `Modify`.
    pub body: Option<Value>,
    /// Transaction the call is scoped to, if any.
    pub transaction: Option<TransactionId>,
}

impl RestRequest {
    /// Create a request without body, query or transaction.
    #[must_use]
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            transaction: None,
        }
    }

    /// Attach a JSON body.
    #[must_use]
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Append a query parameter.
    #[must_use]
    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Scope the request to a remote transaction.
    #[must_use]
    pub fn in_transaction(mut self, transaction: TransactionId) -> Self {
        self.transaction = Some(transaction);
        self
    }
}
