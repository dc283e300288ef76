//! Onboarding service implementation.
//!
//! This module provides the `Onboarder` trait and `OnboardService`
//! implementation that drives a single device through its onboarding
//! workflows.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use onboard_client::{collection_items, RestClient};
use onboard_core::MemberId;
use serde_json::{json, Map, Value};

use crate::config::OnboardConfig;
use crate::context::OnboardContext;
use crate::error::{OnboardError, Result};
use crate::license::{await_licensed, LicenseAssignment, LicenseLeaseSelector};
use crate::reconcile::{Reconciled, StateReconciler};
use crate::retry::try_until;
use crate::transaction::{Mutation, TransactionalApplier};
use crate::types::{
    GlobalSettingsOutcome, LeasedLicense, LicenseRequest, PoolLicenseRequest, PortOutcome,
    ProvisionOutcome, UserOutcome, UserRequest,
};

const GLOBAL_SETTINGS_PATH: &str = "/tm/sys/global-settings";
const DEVICES_PATH: &str = "/tm/cm/device";
const USERS_PATH: &str = "/tm/auth/user";
const ROOT_PASSWORD_PATH: &str = "/shared/authn/root";
const LICENSE_PATH: &str = "/tm/sys/license";
const PROVISION_PATH: &str = "/tm/sys/provision";
const HTTPD_PATH: &str = "/tm/sys/httpd";
const SELF_ALLOW_PATH: &str = "/tm/net/self-allow";
const READY_PATH: &str = "/tm/sys/ready";
const DB_PATH: &str = "/tm/sys/db";
const CONFIG_PATH: &str = "/tm/sys/config";

const ROOT_USER: &str = "root";
const ALL_PARTITIONS: &str = "all-partitions";

/// Trait defining the onboarding operations for one device.
///
/// Every settings-style operation reads the current remote state first and
/// only sends fields that differ, so running a workflow twice is harmless.
#[async_trait]
pub trait Onboarder: Send + Sync {
    // =========================================================================
    // Device Settings
    // =========================================================================

    /// Apply global settings. A `hostname` entry also renames the device,
    /// before the settings themselves are patched.
    ///
    /// # Errors
    ///
    /// Returns `OnboardError::UnexpectedResponse` if a hostname is requested
    /// but the device list has no entry for this device.
    async fn apply_global_settings(
        &self,
        settings: Map<String, Value>,
    ) -> Result<GlobalSettingsOutcome>;

    /// Set database variables, one reconciliation per variable.
    async fn set_db_vars(&self, vars: BTreeMap<String, String>) -> Result<Vec<Reconciled>>;

    /// Make the management UI listen on `port` and allow it on self IPs.
    ///
    /// With `remove_legacy`, the legacy port is removed from the
    /// default-allow list unless it is the requested port.
    async fn ensure_port(&self, port: u16, remove_legacy: bool) -> Result<PortOutcome>;

    /// Save the running configuration.
    async fn save_config(&self) -> Result<()>;

    // =========================================================================
    // Users
    // =========================================================================

    /// Set a user's password.
    ///
    /// # Errors
    ///
    /// Returns `OnboardError::OldPasswordRequired` when changing the root
    /// password without the current one.
    async fn set_password(
        &self,
        user: &str,
        new_password: &str,
        old_password: Option<&str>,
    ) -> Result<()>;

    /// Create a user, or update it if it already exists.
    ///
    /// An existing user only receives the fields that differ from its
    /// current state.
    ///
    /// # Errors
    ///
    /// Returns `OnboardError::RoleRequired` when creating a user without a
    /// role.
    async fn update_user(&self, request: UserRequest) -> Result<UserOutcome>;

    // =========================================================================
    // Licensing
    // =========================================================================

    /// Install a registration key directly on the device.
    async fn install_license(&self, request: LicenseRequest) -> Result<Reconciled>;

    /// Lease a license from a pool on the license-management service reached
    /// through `pool_client`, and wait for it to become active.
    ///
    /// # Errors
    ///
    /// Returns `OnboardError::PoolNotFound`, `OnboardError::NoValidLicense`,
    /// `OnboardError::LicensingRejected` or `OnboardError::LicensingTimedOut`.
    async fn lease_license(
        &self,
        pool_client: &dyn RestClient,
        request: PoolLicenseRequest,
    ) -> Result<LeasedLicense>;

    // =========================================================================
    // Provisioning
    // =========================================================================

    /// Set module provisioning levels in a single transaction.
    ///
    /// # Errors
    ///
    /// Returns `OnboardError::NotProvisionable` before any change if a module
    /// is unknown to the device.
    async fn provision(&self, modules: BTreeMap<String, String>) -> Result<ProvisionOutcome>;

    // =========================================================================
    // Operational
    // =========================================================================

    /// Wait until the device reports that it is ready for configuration.
    async fn wait_until_ready(&self) -> Result<()>;
}

/// The main onboarding service implementation.
pub struct OnboardService<C: RestClient> {
    client: Arc<C>,
    config: OnboardConfig,
    context: OnboardContext,
}

impl<C: RestClient> OnboardService<C> {
    /// Create a new onboarding service.
    #[must_use]
    pub fn new(client: Arc<C>, config: OnboardConfig, context: OnboardContext) -> Self {
        Self {
            client,
            config,
            context,
        }
    }

    /// Create with default configuration and no logging context.
    #[must_use]
    pub fn with_defaults(client: Arc<C>) -> Self {
        Self::new(client, OnboardConfig::default(), OnboardContext::default())
    }

    /// Get a reference to the device client.
    #[must_use]
    pub fn client(&self) -> &C {
        &self.client
    }

    /// Get the configuration.
    #[must_use]
    pub const fn config(&self) -> &OnboardConfig {
        &self.config
    }

    fn reconciler(&self) -> StateReconciler<'_, C> {
        StateReconciler::new(&*self.client, &self.context)
    }

    /// Name of this device in the device list.
    async fn self_device_name(&self) -> Result<String> {
        let listing = self.client.list(DEVICES_PATH).await?;
        collection_items(&listing)
            .iter()
            .find(|device| is_self_device(device))
            .and_then(|device| device.get("name").and_then(Value::as_str))
            .map(str::to_string)
            .ok_or_else(|| OnboardError::unexpected(DEVICES_PATH, "no self device listed"))
    }

    async fn wait_for_license(&self, registration_key: &str) -> Result<()> {
        let client = &*self.client;
        try_until(&self.config.ready_policy, || async move {
            let license = client.list(LICENSE_PATH).await?;
            match find_field(&license, "registrationKey") {
                Some(installed) if installed == registration_key => Ok(()),
                installed => Err(OnboardError::NotReady(format!(
                    "installed license is {}",
                    installed.unwrap_or("none")
                ))),
            }
        })
        .await
    }
}

#[async_trait]
impl<C: RestClient + 'static> Onboarder for OnboardService<C> {
    // =========================================================================
    // Device Settings
    // =========================================================================

    async fn apply_global_settings(
        &self,
        settings: Map<String, Value>,
    ) -> Result<GlobalSettingsOutcome> {
        self.context
            .scope(async {
                let reconciler = self.reconciler();

                let hostname = match settings.get("hostname").and_then(Value::as_str) {
                    Some(hostname) => {
                        let current = self.self_device_name().await?;
                        Some(
                            reconciler
                                .rename_if_different(DEVICES_PATH, &current, hostname)
                                .await?,
                        )
                    }
                    None => None,
                };

                let settings = reconciler
                    .apply_if_different(GLOBAL_SETTINGS_PATH, &settings)
                    .await?;

                Ok(GlobalSettingsOutcome { hostname, settings })
            })
            .await
    }

    async fn set_db_vars(&self, vars: BTreeMap<String, String>) -> Result<Vec<Reconciled>> {
        let reconciler = self.reconciler();
        let mut outcomes = Vec::with_capacity(vars.len());
        for (name, value) in vars {
            let mut desired = Map::new();
            desired.insert("value".to_string(), Value::String(value));
            outcomes.push(
                reconciler
                    .apply_if_different(&format!("{DB_PATH}/{name}"), &desired)
                    .await?,
            );
        }
        Ok(outcomes)
    }

    async fn ensure_port(&self, port: u16, remove_legacy: bool) -> Result<PortOutcome> {
        self.context
            .scope(async {
                let reconciler = self.reconciler();

                let mut desired = Map::new();
                desired.insert("sslPort".to_string(), Value::from(port));
                let httpd = reconciler.apply_if_different(HTTPD_PATH, &desired).await?;

                let allow = format!("tcp:{port}");
                let legacy = format!("tcp:{}", self.config.legacy_port);
                let drop_legacy = remove_legacy && port != self.config.legacy_port;

                let self_allow = reconciler
                    .apply_derived(SELF_ALLOW_PATH, |current| {
                        let mut defaults = current
                            .get("defaults")
                            .and_then(Value::as_array)
                            .cloned()
                            .unwrap_or_default();
                        if !defaults.iter().any(|d| d.as_str() == Some(allow.as_str())) {
                            defaults.push(Value::String(allow.clone()));
                        }
                        if drop_legacy {
                            defaults.retain(|d| d.as_str() != Some(legacy.as_str()));
                        }
                        let mut desired = Map::new();
                        desired.insert("defaults".to_string(), Value::Array(defaults));
                        desired
                    })
                    .await?;

                Ok(PortOutcome { httpd, self_allow })
            })
            .await
    }

    async fn save_config(&self) -> Result<()> {
        tracing::info!("Saving running configuration");
        self.client
            .create(CONFIG_PATH, json!({"command": "save"}))
            .await?;
        Ok(())
    }

    // =========================================================================
    // Users
    // =========================================================================

    async fn set_password(
        &self,
        user: &str,
        new_password: &str,
        old_password: Option<&str>,
    ) -> Result<()> {
        if user == ROOT_USER {
            let old_password = old_password.ok_or(OnboardError::OldPasswordRequired)?;
            tracing::info!(user = %user, "Changing root password");
            self.client
                .create(
                    ROOT_PASSWORD_PATH,
                    json!({"oldPassword": old_password, "newPassword": new_password}),
                )
                .await?;
            return Ok(());
        }

        let mut desired = Map::new();
        desired.insert(
            "password".to_string(),
            Value::String(new_password.to_string()),
        );
        self.reconciler()
            .apply_if_different(&format!("{USERS_PATH}/{user}"), &desired)
            .await?;
        Ok(())
    }

    async fn update_user(&self, request: UserRequest) -> Result<UserOutcome> {
        self.context
            .scope(async {
                let listing = self.client.list(USERS_PATH).await?;
                let exists = collection_items(&listing)
                    .iter()
                    .any(|user| user.get("name").and_then(Value::as_str) == Some(request.name.as_str()));

                let mut body = Map::new();
                if let Some(password) = &request.password {
                    body.insert("password".to_string(), Value::String(password.clone()));
                }
                if let Some(shell) = &request.shell {
                    body.insert("shell".to_string(), Value::String(shell.clone()));
                }

                if exists {
                    if body.is_empty() {
                        return Ok(UserOutcome::Unchanged);
                    }
                    let outcome = self
                        .reconciler()
                        .apply_if_different(&format!("{USERS_PATH}/{}", request.name), &body)
                        .await?;
                    return Ok(if outcome.is_noop() {
                        UserOutcome::Unchanged
                    } else {
                        tracing::info!(user = %request.name, "Updated user");
                        UserOutcome::Updated
                    });
                }

                let role = request
                    .role
                    .as_deref()
                    .ok_or_else(|| OnboardError::RoleRequired(request.name.clone()))?;
                body.insert("name".to_string(), Value::String(request.name.clone()));
                body.insert(
                    "partitionAccess".to_string(),
                    json!([{"name": ALL_PARTITIONS, "role": role}]),
                );

                tracing::info!(user = %request.name, role = %role, "Creating user");
                self.client.create(USERS_PATH, Value::Object(body)).await?;
                Ok(UserOutcome::Created)
            })
            .await
    }

    // =========================================================================
    // Licensing
    // =========================================================================

    async fn install_license(&self, request: LicenseRequest) -> Result<Reconciled> {
        self.context
            .scope(async {
                let current = self.client.list(LICENSE_PATH).await?;
                let installed = find_field(&current, "registrationKey");

                if installed == Some(request.registration_key.as_str()) && !request.overwrite {
                    tracing::info!(
                        registration_key = %request.registration_key,
                        "License already installed"
                    );
                    return Ok(Reconciled::NoOp {
                        path: LICENSE_PATH.to_string(),
                        message: "Identical license already installed".to_string(),
                    });
                }

                let mut patch = Map::new();
                patch.insert(
                    "registrationKey".to_string(),
                    Value::String(request.registration_key.clone()),
                );
                if !request.add_on_keys.is_empty() {
                    patch.insert("addOnKeys".to_string(), json!(request.add_on_keys));
                }
                let mut body = patch.clone();
                body.insert("command".to_string(), Value::from("install"));

                tracing::info!(
                    registration_key = %request.registration_key,
                    add_ons = request.add_on_keys.len(),
                    "Installing license"
                );
                self.client
                    .create(LICENSE_PATH, Value::Object(body))
                    .await?;
                self.wait_for_license(&request.registration_key).await?;

                Ok(Reconciled::Applied {
                    path: LICENSE_PATH.to_string(),
                    patch,
                })
            })
            .await
    }

    async fn lease_license(
        &self,
        pool_client: &dyn RestClient,
        request: PoolLicenseRequest,
    ) -> Result<LeasedLicense> {
        self.context
            .scope(async {
                let selector = LicenseLeaseSelector::new(pool_client, &self.context);
                let pool = selector.resolve_pool(&request.pool_name).await?;
                let offerings = selector.offerings(&pool).await?;
                let registration_key = selector
                    .select_license(&pool, &offerings, Utc::now())
                    .await?;

                let members_path = pool.members_path(&registration_key);
                let claim = pool_client
                    .create(
                        &members_path,
                        json!({
                            "deviceAddress": request.device_address,
                            "username": request.username,
                            "password": request.password,
                        }),
                    )
                    .await?;
                let member_id: MemberId = claim
                    .get("uuid")
                    .and_then(Value::as_str)
                    .ok_or_else(|| OnboardError::unexpected(&members_path, "claim has no uuid"))?
                    .parse()?;
                tracing::info!(
                    registration_key = %registration_key,
                    member = %member_id,
                    "Claimed license offering"
                );

                let member_path = pool.member_path(&registration_key, &member_id);
                let path = member_path.as_str();
                let assignment = await_licensed(
                    &registration_key,
                    &self.config.license_policy,
                    || async move {
                        let document = pool_client.list(path).await?;
                        serde_json::from_value::<LicenseAssignment>(document)
                            .map_err(|e| OnboardError::unexpected(path, e.to_string()))
                    },
                )
                .await?;

                Ok(LeasedLicense {
                    pool,
                    registration_key,
                    member_id: assignment.uuid,
                })
            })
            .await
    }

    // =========================================================================
    // Provisioning
    // =========================================================================

    async fn provision(&self, modules: BTreeMap<String, String>) -> Result<ProvisionOutcome> {
        self.context
            .scope(async {
                let listing = self.client.list(PROVISION_PATH).await?;
                let current: BTreeMap<&str, &str> = listing_levels(&listing);

                let mut changed = Vec::new();
                let mut mutations = Vec::new();
                for (module, level) in &modules {
                    let current_level = current
                        .get(module.as_str())
                        .ok_or_else(|| OnboardError::NotProvisionable(module.clone()))?;
                    if *current_level == level.as_str() {
                        tracing::debug!(module = %module, level = %level, "Module already provisioned");
                        continue;
                    }
                    changed.push(module.clone());
                    mutations.push(Mutation::modify(
                        format!("{PROVISION_PATH}/{module}"),
                        json!({"level": level}),
                    ));
                }

                let mut applier = TransactionalApplier::new(&*self.client, &self.context);
                if self.config.commit_poll {
                    applier = applier.with_commit_poll(self.config.transaction_policy);
                }
                let transaction = applier.apply_batch(&mutations).await?;

                Ok(ProvisionOutcome {
                    changed,
                    transaction,
                })
            })
            .await
    }

    // =========================================================================
    // Operational
    // =========================================================================

    async fn wait_until_ready(&self) -> Result<()> {
        let client = &*self.client;
        self.context
            .scope(try_until(&self.config.ready_policy, || async move {
                let document = client.list(READY_PATH).await?;
                let mut flags = Vec::new();
                readiness_flags(&document, &mut flags);
                let pending: Vec<&str> = flags
                    .iter()
                    .filter(|(_, ready)| !ready)
                    .map(|(name, _)| name.as_str())
                    .collect();

                if flags.is_empty() {
                    Err(OnboardError::NotReady("readiness not reported".to_string()))
                } else if pending.is_empty() {
                    Ok(())
                } else {
                    Err(OnboardError::NotReady(format!(
                        "{} not ready",
                        pending.join(", ")
                    )))
                }
            }))
            .await?;
        tracing::info!("Device is ready");
        Ok(())
    }
}

/// Whether a device-list entry describes the device being configured.
/// The flag arrives as a string on some versions and a boolean on others.
fn is_self_device(device: &Value) -> bool {
    match device.get("selfDevice") {
        Some(Value::Bool(flag)) => *flag,
        Some(Value::String(flag)) => flag == "true",
        _ => false,
    }
}

/// Find `key` anywhere in a document, either as a plain string or as a
/// stats entry with a `description`.
fn find_field<'v>(value: &'v Value, key: &str) -> Option<&'v str> {
    let Value::Object(map) = value else {
        return None;
    };
    if let Some(found) = map.get(key) {
        if let Some(text) = found.as_str() {
            return Some(text);
        }
        if let Some(text) = found.get("description").and_then(Value::as_str) {
            return Some(text);
        }
    }
    map.values().find_map(|nested| find_field(nested, key))
}

/// Collect `*Ready` flags from a readiness document.
fn readiness_flags(value: &Value, flags: &mut Vec<(String, bool)>) {
    let Value::Object(map) = value else {
        return;
    };
    for (key, entry) in map {
        let flag = entry
            .as_str()
            .or_else(|| entry.get("description").and_then(Value::as_str));
        match flag {
            Some(flag) if key.ends_with("Ready") => flags.push((key.clone(), flag == "yes")),
            _ => readiness_flags(entry, flags),
        }
    }
}

/// Module name to current level, from a provisioning listing.
fn listing_levels(listing: &Value) -> BTreeMap<&str, &str> {
    let items = match listing {
        Value::Array(items) => items.as_slice(),
        other => other
            .get("items")
            .and_then(Value::as_array)
            .map_or(&[][..], Vec::as_slice),
    };
    items
        .iter()
        .filter_map(|item| {
            Some((
                item.get("name")?.as_str()?,
                item.get("level")?.as_str()?,
            ))
        })
        .collect()
}
