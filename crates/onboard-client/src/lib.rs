//! REST client capability for the appliance control plane.
//!
//! Everything the onboarding engine knows about the network is expressed
//! through four operations against a path-addressed resource tree:
//!
//! - `list(path)` reads the current document
//! - `create(path, body)` creates a resource or runs a command-style action
//! - `modify(path, body)` patches a resource
//! - `delete(path)` removes a resource
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐     ┌──────────────────┐
//! │  Onboard engine  │────▶│   RestClient     │
//! │                  │     │   (trait)        │
//! └──────────────────┘     └────────┬─────────┘
//!                                   │
//!                 ┌─────────────────┴─────────────────┐
//!                 ▼                                   ▼
//!        ┌──────────────────┐              ┌──────────────────┐
//!        │  HttpRestClient  │              │  MockRestClient  │
//!        │  (reqwest)       │              │  (test-utils)    │
//!        └────────┬─────────┘              └──────────────────┘
//!                 │ HTTPS
//!        ┌────────▼─────────┐
//!        │  Control plane   │
//!        └──────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use onboard_client::{ClientConfig, HttpRestClient, RestClient};
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ClientConfig {
//!     base_url: "https://10.0.0.5/mgmt".to_string(),
//!     username: "admin".to_string(),
//!     password: "admin".to_string(),
//!     ..ClientConfig::default()
//! };
//! let client = HttpRestClient::new(&config)?;
//!
//! let settings = client.list("/tm/sys/global-settings").await?;
//! println!("hostname: {}", settings["hostname"]);
//!
//! client
//!     .modify("/tm/sys/global-settings", json!({"guiSetup": "disabled"}))
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod http;
pub mod request;

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

pub use error::{ClientError, Result};
pub use http::HttpRestClient;
pub use request::{Method, RestRequest};

#[cfg(any(test, feature = "test-utils"))]
pub use mock::{MockReply, MockRestClient};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

/// Header carrying the transaction id on transaction-scoped calls.
pub const TRANSACTION_HEADER: &str = "X-F5-REST-Coordination-Id";

/// Trait for control plane communication.
///
/// Implementations only need [`RestClient::send`]; the four verbs are
/// provided on top of it.
#[async_trait]
pub trait RestClient: Send + Sync {
    /// Execute a single request and return the parsed response document.
    ///
    /// An empty response body is returned as `Value::Null`.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails, the control plane answers with
    /// a non-success status, or the body is not valid JSON.
    async fn send(&self, request: RestRequest) -> Result<Value>;

    /// Read the document at `path`.
    ///
    /// # Errors
    ///
    /// See [`RestClient::send`].
    async fn list(&self, path: &str) -> Result<Value> {
        self.send(RestRequest::new(Method::List, path)).await
    }

    /// Create a resource, or run a command-style action, at `path`.
    ///
    /// # Errors
    ///
    /// See [`RestClient::send`].
    async fn create(&self, path: &str, body: Value) -> Result<Value> {
        self.send(RestRequest::new(Method::Create, path).with_body(body))
            .await
    }

    /// Patch the resource at `path` with the fields in `body`.
    ///
    /// # Errors
    ///
    /// See [`RestClient::send`].
    async fn modify(&self, path: &str, body: Value) -> Result<Value> {
        self.send(RestRequest::new(Method::Modify, path).with_body(body))
            .await
    }

    /// Remove the resource at `path`.
    ///
    /// # Errors
    ///
    /// See [`RestClient::send`].
    async fn delete(&self, path: &str) -> Result<Value> {
        self.send(RestRequest::new(Method::Delete, path)).await
    }
}

/// Connection settings for [`HttpRestClient`].
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Base URL every resource path is appended to (e.g. `https://10.0.0.5/mgmt`).
    pub base_url: String,

    /// Username for basic authentication.
    pub username: String,

    /// Password for basic authentication.
    pub password: String,

    /// Total request timeout in seconds.
    #[serde(default = "ClientConfig::default_timeout")]
    pub timeout_seconds: u64,

    /// Connection timeout in seconds.
    #[serde(default = "ClientConfig::default_connect_timeout")]
    pub connect_timeout_seconds: u64,

    /// Accept self-signed device certificates.
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

impl ClientConfig {
    const fn default_timeout() -> u64 {
        30
    }

    const fn default_connect_timeout() -> u64 {
        5
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://localhost/mgmt".to_string(),
            username: "admin".to_string(),
            password: String::new(),
            timeout_seconds: Self::default_timeout(),
            connect_timeout_seconds: Self::default_connect_timeout(),
            accept_invalid_certs: false,
        }
    }
}

/// Extract the member documents of a collection response.
///
/// Collections come back either as a bare array or as an object with an
/// `items` array; anything else has no members.
#[must_use]
pub fn collection_items(document: &Value) -> Vec<Value> {
    match document {
        Value::Array(items) => items.clone(),
        Value::Object(map) => match map.get("items") {
            Some(Value::Array(items)) => items.clone(),
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}
