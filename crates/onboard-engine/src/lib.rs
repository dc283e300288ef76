//! Onboarding engine for network appliances.
//!
//! This crate drives a freshly booted appliance to a configured state over
//! its REST control plane: device settings, users, licensing and module
//! provisioning. Every step is safe to re-run; settings are reconciled
//! against the current remote state and only differing fields are sent.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       OnboardService                        │
//! │  ┌─────────────┐ ┌─────────────┐ ┌─────────────────────┐    │
//! │  │  Settings   │ │  Licensing  │ │    Provisioning     │    │
//! │  │  & Users    │ │  (pool/key) │ │    (transaction)    │    │
//! │  └──────┬──────┘ └──────┬──────┘ └──────────┬──────────┘    │
//! └─────────┼───────────────┼───────────────────┼───────────────┘
//!           ▼               ▼                   ▼
//!   ┌───────────────┐ ┌───────────────┐ ┌─────────────────────┐
//!   │StateReconciler│ │LicenseLease-  │ │TransactionalApplier │
//!   │ (diff, patch) │ │Selector       │ │ (open, stage,       │
//!   └───────┬───────┘ └───────┬───────┘ │  commit, poll)      │
//!           │                 │         └──────────┬──────────┘
//!           │                 └──── try_until ─────┤
//!           ▼                                      ▼
//!   ┌─────────────────────────────────────────────────────────┐
//!   │                  RestClient (onboard-client)            │
//!   └─────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use onboard_client::{ClientConfig, HttpRestClient};
//! use onboard_engine::{OnboardConfig, OnboardContext, OnboardService, Onboarder};
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = HttpRestClient::new(&ClientConfig {
//!     base_url: "https://10.0.0.5/mgmt".to_string(),
//!     username: "admin".to_string(),
//!     password: "admin".to_string(),
//!     ..ClientConfig::default()
//! })?;
//! let onboard = OnboardService::new(
//!     Arc::new(client),
//!     OnboardConfig::default(),
//!     OnboardContext::for_device("10.0.0.5"),
//! );
//!
//! onboard.wait_until_ready().await?;
//! let settings = json!({"hostname": "edge-01.example.com", "guiSetup": "disabled"});
//! if let serde_json::Value::Object(settings) = settings {
//!     onboard.apply_global_settings(settings).await?;
//! }
//! onboard.save_config().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Failure model
//!
//! Every [`OnboardError`] carries an [`ErrorKind`]. Configuration errors
//! (unknown pool, unknown module, missing role) are returned at once and
//! never retried. Transient errors are retried by [`retry::try_until`] until
//! the configured [`RetryPolicy`] runs out.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod context;
pub mod error;
pub mod license;
pub mod reconcile;
pub mod retry;
pub mod service;
pub mod transaction;
pub mod types;

pub use config::OnboardConfig;
pub use context::OnboardContext;
pub use error::{ErrorKind, OnboardError, Result};
pub use license::{
    AssignmentState, LicenseAssignment, LicenseLeaseSelector, LicenseOffering, LicensePool,
};
pub use reconcile::{Reconciled, StateReconciler};
pub use retry::{try_until, RetryPolicy};
pub use service::{OnboardService, Onboarder};
pub use transaction::{Mutation, TransactionState, TransactionalApplier};
pub use types::{
    GlobalSettingsOutcome, LeasedLicense, LicenseRequest, PoolLicenseRequest, PortOutcome,
    ProvisionOutcome, UserOutcome, UserRequest,
};

// Re-export commonly used types from dependencies for convenience
pub use onboard_client::{ClientError, RestClient};
pub use onboard_core::{MemberId, PoolId, TransactionId};
