//! Request and outcome types for onboarding workflows.

use onboard_core::{MemberId, TransactionId};
use serde::{Deserialize, Serialize};

use crate::license::LicensePool;
use crate::reconcile::Reconciled;

/// Create-or-update request for a management user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRequest {
    /// User name.
    pub name: String,
    /// New password, if it should be set.
    #[serde(default)]
    pub password: Option<String>,
    /// Role granted on all partitions. Required when the user is created,
    /// ignored when it already exists.
    #[serde(default)]
    pub role: Option<String>,
    /// Login shell (e.g. `bash`, `tmsh`, `none`).
    #[serde(default)]
    pub shell: Option<String>,
}

impl UserRequest {
    /// Create a request with only a name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            password: None,
            role: None,
            shell: None,
        }
    }

    /// Set the password.
    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set the role.
    #[must_use]
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    /// Set the shell.
    #[must_use]
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = Some(shell.into());
        self
    }
}

/// What `update_user` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserOutcome {
    /// The user did not exist and was created.
    Created,
    /// The user existed and was modified.
    Updated,
    /// The user existed and already matched the request.
    Unchanged,
}

/// Direct license installation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LicenseRequest {
    /// Base registration key.
    pub registration_key: String,
    /// Add-on keys installed with it.
    #[serde(default)]
    pub add_on_keys: Vec<String>,
    /// Reinstall even if the same key is already installed.
    #[serde(default)]
    pub overwrite: bool,
}

impl LicenseRequest {
    /// Create a request for a base key.
    #[must_use]
    pub fn new(registration_key: impl Into<String>) -> Self {
        Self {
            registration_key: registration_key.into(),
            add_on_keys: Vec::new(),
            overwrite: false,
        }
    }
}

/// Lease a license from a pool on the license-management service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolLicenseRequest {
    /// Name of the pool to lease from.
    pub pool_name: String,
    /// Address (`host:port`) the service uses to reach the device.
    pub device_address: String,
    /// Device credentials handed to the service for installing the license.
    pub username: String,
    /// Device password.
    pub password: String,
}

/// A license leased from a pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeasedLicense {
    /// The pool it came from.
    pub pool: LicensePool,
    /// The claimed registration key.
    pub registration_key: String,
    /// The device's membership in the offering.
    pub member_id: MemberId,
}

/// Result of applying global settings.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalSettingsOutcome {
    /// Device rename, when a hostname was requested.
    pub hostname: Option<Reconciled>,
    /// The global settings reconciliation.
    pub settings: Reconciled,
}

/// Result of opening a management port.
#[derive(Debug, Clone, PartialEq)]
pub struct PortOutcome {
    /// Port the management UI listens on.
    pub httpd: Reconciled,
    /// Default-allow list of self IPs.
    pub self_allow: Reconciled,
}

/// Result of provisioning modules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionOutcome {
    /// Modules whose level was changed, in request order.
    pub changed: Vec<String>,
    /// The committed transaction, if any change was needed.
    pub transaction: Option<TransactionId>,
}
