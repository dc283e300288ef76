//! HTTP implementation of [`RestClient`] backed by `reqwest`.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{ClientError, Result};
use crate::request::{Method, RestRequest};
use crate::{ClientConfig, RestClient, TRANSACTION_HEADER};

/// Error body returned by the control plane.
#[derive(Debug, Deserialize)]
struct ErrorResponse {
    message: Option<String>,
}

/// HTTP client for the control plane REST API.
#[derive(Debug, Clone)]
pub struct HttpRestClient {
    client: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
}

impl HttpRestClient {
    /// Create a new client from connection settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the base URL is malformed or the HTTP client
    /// cannot be built.
    pub fn new(config: &ClientConfig) -> Result<Self> {
        reqwest::Url::parse(&config.base_url)
            .map_err(|e| ClientError::InvalidUrl(format!("{}: {e}", config.base_url)))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .connect_timeout(Duration::from_secs(config.connect_timeout_seconds))
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()?;

        Ok(Self::with_client(client, config))
    }

    /// Create a new client with a custom reqwest client.
    #[must_use]
    pub fn with_client(client: reqwest::Client, config: &ClientConfig) -> Self {
        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
        }
    }

    /// Get the base URL of the control plane.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url_for(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{path}", self.base_url)
        } else {
            format!("{}/{path}", self.base_url)
        }
    }

    async fn parse_body(path: &str, response: reqwest::Response) -> Result<Value> {
        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| ClientError::Parse {
            path: path.to_string(),
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl RestClient for HttpRestClient {
    async fn send(&self, request: RestRequest) -> Result<Value> {
        let url = self.url_for(&request.path);

        let mut builder = match request.method {
            Method::List => self.client.get(&url),
            Method::Create => self.client.post(&url),
            Method::Modify => self.client.patch(&url),
            Method::Delete => self.client.delete(&url),
        }
        .basic_auth(&self.username, Some(&self.password));

        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(transaction) = request.transaction {
            builder = builder.header(TRANSACTION_HEADER, transaction.to_string());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        tracing::trace!(method = %request.method, path = %request.path, "Sending request");

        let response = builder.send().await?;
        let status = response.status();

        if status.is_success() {
            return Self::parse_body(&request.path, response).await;
        }

        let message = response
            .json::<ErrorResponse>()
            .await
            .ok()
            .and_then(|e| e.message)
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("unknown error").to_string());

        tracing::debug!(
            method = %request.method,
            path = %request.path,
            status = %status,
            error = %message,
            "Control plane rejected request"
        );

        Err(ClientError::Status {
            method: request.method.to_string(),
            path: request.path,
            status: status.as_u16(),
            message,
        })
    }
}
