//! License leasing from a pooled license-management service.
//!
//! Leasing has three steps:
//!
//! 1. resolve the pool by name ([`LicenseLeaseSelector::resolve_pool`])
//! 2. pick the first offering that is time-valid and unclaimed
//!    ([`LicenseLeaseSelector::select_license`])
//! 3. after the caller has claimed it, wait until the service reports the
//!    claim as licensed ([`await_licensed`])
//!
//! There is no atomic claim: another device may claim the selected offering
//! between steps 2 and 3. The claim request then fails or the member never
//! reaches `LICENSED`, and the caller sees the error.

use std::fmt;
use std::future::Future;

use chrono::{DateTime, Utc};
use onboard_client::{collection_items, RestClient};
use onboard_core::{MemberId, PoolId};
use serde::Deserialize;

use crate::context::OnboardContext;
use crate::error::{OnboardError, Result};
use crate::retry::{try_until, RetryPolicy};

/// Collection of registration-key license pools.
pub const POOLS_PATH: &str = "/cm/device/licensing/pool/regkey/licenses";

/// A named license pool.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LicensePool {
    /// Pool name as configured on the service.
    pub name: String,
    /// Pool identifier.
    pub id: PoolId,
}

impl LicensePool {
    /// Path of the pool's offerings collection.
    #[must_use]
    pub fn offerings_path(&self) -> String {
        format!("{POOLS_PATH}/{}/offerings", self.id)
    }

    /// Path of the members collection of one offering.
    #[must_use]
    pub fn members_path(&self, registration_key: &str) -> String {
        format!("{}/{registration_key}/members", self.offerings_path())
    }

    /// Path of one member (license assignment).
    #[must_use]
    pub fn member_path(&self, registration_key: &str, member: &MemberId) -> String {
        format!("{}/{member}", self.members_path(registration_key))
    }
}

/// Validity window of an offering.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LicenseWindow {
    /// Start of validity.
    pub license_start_date_time: DateTime<Utc>,
    /// End of validity.
    pub license_end_date_time: DateTime<Utc>,
}

/// One leasable registration key inside a pool.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LicenseOffering {
    /// The registration key.
    #[serde(alias = "regKey")]
    pub registration_key: String,
    /// Validity window.
    pub license_state: LicenseWindow,
    /// Number of devices holding the offering, when the service reports it.
    #[serde(default)]
    pub member_count: u32,
}

impl LicenseOffering {
    /// Returns true if `now` lies strictly inside the validity window.
    #[must_use]
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.license_state.license_start_date_time < now
            && now < self.license_state.license_end_date_time
    }
}

/// State of a license assignment as reported by the service.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum AssignmentState {
    /// The device holds an active license.
    Licensed,
    /// The service gave up installing the license on the device.
    Failed(String),
    /// Any other, non-terminal, state.
    Pending(String),
}

impl AssignmentState {
    /// Returns true if the service will not change the state on its own.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Licensed | Self::Failed(_))
    }
}

impl From<String> for AssignmentState {
    fn from(value: String) -> Self {
        match value.as_str() {
            "LICENSED" => Self::Licensed,
            "FAILED" | "INSTALLATION_FAILED" => Self::Failed(value),
            _ => Self::Pending(value),
        }
    }
}

impl fmt::Display for AssignmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Licensed => f.write_str("LICENSED"),
            Self::Failed(state) | Self::Pending(state) => f.write_str(state),
        }
    }
}

/// A device's claim on an offering.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LicenseAssignment {
    /// Member identifier.
    pub uuid: MemberId,
    /// Current state.
    pub state: AssignmentState,
}

/// Finds a usable license offering in a pool.
pub struct LicenseLeaseSelector<'a, C: ?Sized> {
    client: &'a C,
    context: &'a OnboardContext,
}

impl<'a, C: RestClient + ?Sized> LicenseLeaseSelector<'a, C> {
    /// Create a selector over the license service `client`.
    #[must_use]
    pub const fn new(client: &'a C, context: &'a OnboardContext) -> Self {
        Self { client, context }
    }

    /// Look up a pool by name.
    ///
    /// A missing pool is a configuration error and is never retried.
    ///
    /// # Errors
    ///
    /// Returns [`OnboardError::PoolNotFound`] if no pool has this name, or
    /// the transport error of the listing call.
    pub async fn resolve_pool(&self, name: &str) -> Result<LicensePool> {
        self.context
            .scope(async {
                let listing = self.client.list(POOLS_PATH).await?;
                let pool = collection_items(&listing)
                    .into_iter()
                    .find(|item| item.get("name").and_then(|n| n.as_str()) == Some(name))
                    .ok_or_else(|| OnboardError::PoolNotFound(name.to_string()))?;

                let pool: LicensePool = serde_json::from_value(pool)
                    .map_err(|e| OnboardError::unexpected(POOLS_PATH, e.to_string()))?;
                tracing::debug!(pool = %pool.name, id = %pool.id, "Resolved license pool");
                Ok(pool)
            })
            .await
    }

    /// Fetch the pool's offerings in the order the service returns them.
    ///
    /// # Errors
    ///
    /// Returns the transport error of the listing call, or
    /// [`OnboardError::UnexpectedResponse`] if an offering cannot be parsed.
    pub async fn offerings(&self, pool: &LicensePool) -> Result<Vec<LicenseOffering>> {
        let path = pool.offerings_path();
        let listing = self.client.list(&path).await?;
        collection_items(&listing)
            .into_iter()
            .map(|item| {
                serde_json::from_value(item).map_err(|e| OnboardError::unexpected(&path, e.to_string()))
            })
            .collect()
    }

    /// Pick the first offering that is valid at `now` and has no members.
    ///
    /// Offerings are scanned in the given order with a single cursor; the
    /// membership of an offering is only fetched once its validity window
    /// has been checked, and the scan stops at the first match.
    ///
    /// # Errors
    ///
    /// Returns [`OnboardError::NoValidLicense`] if the scan finds nothing,
    /// or the transport error of a membership check.
    pub async fn select_license(
        &self,
        pool: &LicensePool,
        offerings: &[LicenseOffering],
        now: DateTime<Utc>,
    ) -> Result<String> {
        self.context
            .scope(async {
                let candidates = offerings.iter().filter(|offering| {
                    let valid = offering.is_valid_at(now);
                    if !valid {
                        tracing::debug!(
                            registration_key = %offering.registration_key,
                            "Skipping offering outside its validity window"
                        );
                    }
                    valid && offering.member_count == 0
                });

                for offering in candidates {
                    if self.is_unclaimed(pool, &offering.registration_key).await? {
                        tracing::info!(
                            pool = %pool.name,
                            registration_key = %offering.registration_key,
                            "Selected license offering"
                        );
                        return Ok(offering.registration_key.clone());
                    }
                    tracing::debug!(
                        registration_key = %offering.registration_key,
                        "Skipping claimed offering"
                    );
                }

                Err(OnboardError::NoValidLicense {
                    pool: pool.name.clone(),
                })
            })
            .await
    }

    async fn is_unclaimed(&self, pool: &LicensePool, registration_key: &str) -> Result<bool> {
        let members = self
            .client
            .list(&pool.members_path(registration_key))
            .await?;
        Ok(collection_items(&members).is_empty())
    }
}

/// Poll `lookup` until the assignment reaches a terminal state.
///
/// Any non-terminal state and any lookup failure count as a retryable
/// failure. A `LICENSED` assignment ends the wait successfully; a terminal
/// failure state ends it at once with [`OnboardError::LicensingRejected`].
///
/// # Errors
///
/// Returns [`OnboardError::LicensingTimedOut`] once `policy` is exhausted,
/// or [`OnboardError::LicensingRejected`] on a terminal failure state.
pub async fn await_licensed<F, Fut>(
    registration_key: &str,
    policy: &RetryPolicy,
    mut lookup: F,
) -> Result<LicenseAssignment>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<LicenseAssignment>>,
{
    let outcome = try_until(policy, || {
        let attempt = lookup();
        async move {
            let assignment = attempt.await?;
            if assignment.state.is_terminal() {
                Ok(assignment)
            } else {
                Err(OnboardError::NotReady(format!(
                    "license {registration_key} is {}",
                    assignment.state
                )))
            }
        }
    })
    .await;

    match outcome {
        Ok(assignment) if assignment.state == AssignmentState::Licensed => {
            tracing::info!(registration_key = %registration_key, "License is active");
            Ok(assignment)
        }
        Ok(assignment) => Err(OnboardError::LicensingRejected {
            registration_key: registration_key.to_string(),
            state: assignment.state.to_string(),
        }),
        Err(OnboardError::RetryExhausted { attempts, .. }) => {
            Err(OnboardError::LicensingTimedOut {
                registration_key: registration_key.to_string(),
                attempts,
            })
        }
        Err(other) => Err(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use onboard_client::{Method, MockReply, MockRestClient};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    const POOL_ID: &str = "9f2c8a4e-1b3d-4c5e-8f6a-7b8c9d0e1f2a";
    const MEMBER_ID: &str = "0d3a0c1e-5b7f-4a8e-9c2d-6e1f2a3b4c5d";

    fn pool() -> LicensePool {
        LicensePool {
            name: "gold".to_string(),
            id: POOL_ID.parse().unwrap(),
        }
    }

    fn offering(key: &str, start_offset_days: i64, end_offset_days: i64) -> LicenseOffering {
        let now = Utc::now();
        LicenseOffering {
            registration_key: key.to_string(),
            license_state: LicenseWindow {
                license_start_date_time: now + Duration::days(start_offset_days),
                license_end_date_time: now + Duration::days(end_offset_days),
            },
            member_count: 0,
        }
    }

    fn no_members(mock: &MockRestClient, key: &str) {
        mock.set(&pool().members_path(key), json!({"items": []}));
    }

    #[test]
    fn offering_parses_service_format() {
        let offering: LicenseOffering = serde_json::from_value(json!({
            "regKey": "ABCDE-FGHIJ",
            "licenseState": {
                "licenseStartDateTime": "2020-01-01T00:00:00-08:00",
                "licenseEndDateTime": "2030-01-01T00:00:00-08:00"
            }
        }))
        .unwrap();
        assert_eq!(offering.registration_key, "ABCDE-FGHIJ");
        assert_eq!(offering.member_count, 0);
        assert!(offering.is_valid_at(Utc::now()));
    }

    #[test]
    fn assignment_states() {
        assert_eq!(AssignmentState::from("LICENSED".to_string()), AssignmentState::Licensed);
        assert!(AssignmentState::from("FAILED".to_string()).is_terminal());
        assert!(!AssignmentState::from("INSTALLING".to_string()).is_terminal());
        assert_eq!(AssignmentState::from("INSTALLING".to_string()).to_string(), "INSTALLING");
    }

    #[tokio::test]
    async fn resolve_pool_by_name() {
        let mock = MockRestClient::new();
        mock.set(
            POOLS_PATH,
            json!({"items": [
                {"name": "silver", "id": "11111111-2222-3333-4444-555555555555"},
                {"name": "gold", "id": POOL_ID}
            ]}),
        );
        let context = OnboardContext::default();
        let selector = LicenseLeaseSelector::new(&mock, &context);

        let pool = selector.resolve_pool("gold").await.unwrap();
        assert_eq!(pool.id.to_string(), POOL_ID);
    }

    #[tokio::test]
    async fn missing_pool_fails_immediately() {
        let mock = MockRestClient::new();
        mock.set(POOLS_PATH, json!({"items": [{"name": "silver", "id": POOL_ID}]}));
        let context = OnboardContext::default();
        let selector = LicenseLeaseSelector::new(&mock, &context);

        let err = selector.resolve_pool("gold").await.unwrap_err();
        assert!(matches!(err, OnboardError::PoolNotFound(ref name) if name == "gold"));
        assert_eq!(mock.requests().len(), 1);
    }

    #[tokio::test]
    async fn expired_offering_is_never_selected() {
        let mock = MockRestClient::new();
        no_members(&mock, "EXPIRED");
        no_members(&mock, "FUTURE");
        let context = OnboardContext::default();
        let selector = LicenseLeaseSelector::new(&mock, &context);

        let offerings = vec![offering("EXPIRED", -30, -1), offering("FUTURE", 1, 30)];
        let err = selector
            .select_license(&pool(), &offerings, Utc::now())
            .await
            .unwrap_err();

        assert!(matches!(err, OnboardError::NoValidLicense { ref pool } if pool == "gold"));
        // Neither window contains now, so no membership check was made.
        assert!(mock.requests().is_empty());
    }

    #[tokio::test]
    async fn claimed_offering_is_skipped() {
        let mock = MockRestClient::new();
        mock.set(
            &pool().members_path("TAKEN"),
            json!({"items": [{"uuid": MEMBER_ID, "state": "LICENSED"}]}),
        );
        no_members(&mock, "FREE");
        no_members(&mock, "ALSO-FREE");
        let context = OnboardContext::default();
        let selector = LicenseLeaseSelector::new(&mock, &context);

        let offerings = vec![
            offering("TAKEN", -1, 30),
            offering("FREE", -1, 30),
            offering("ALSO-FREE", -1, 30),
        ];
        let key = selector
            .select_license(&pool(), &offerings, Utc::now())
            .await
            .unwrap();

        assert_eq!(key, "FREE");
        // Scan stopped at the first match.
        assert_eq!(mock.count(Method::List, &pool().members_path("ALSO-FREE")), 0);
    }

    #[tokio::test]
    async fn reported_member_count_skips_without_lookup() {
        let mock = MockRestClient::new();
        no_members(&mock, "FREE");
        let context = OnboardContext::default();
        let selector = LicenseLeaseSelector::new(&mock, &context);

        let mut busy = offering("BUSY", -1, 30);
        busy.member_count = 2;
        let key = selector
            .select_license(&pool(), &[busy, offering("FREE", -1, 30)], Utc::now())
            .await
            .unwrap();

        assert_eq!(key, "FREE");
        assert_eq!(mock.count(Method::List, &pool().members_path("BUSY")), 0);
    }

    #[tokio::test]
    async fn empty_pool_has_no_valid_license() {
        let mock = MockRestClient::new();
        let context = OnboardContext::default();
        let selector = LicenseLeaseSelector::new(&mock, &context);

        let err = selector
            .select_license(&pool(), &[], Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, OnboardError::NoValidLicense { .. }));
    }

    #[tokio::test]
    async fn offerings_are_listed_in_service_order() {
        let mock = MockRestClient::new();
        mock.set(
            &pool().offerings_path(),
            json!({"items": [
                {"regKey": "B", "licenseState": {"licenseStartDateTime": "2020-01-01T00:00:00Z", "licenseEndDateTime": "2030-01-01T00:00:00Z"}},
                {"regKey": "A", "licenseState": {"licenseStartDateTime": "2020-01-01T00:00:00Z", "licenseEndDateTime": "2030-01-01T00:00:00Z"}}
            ]}),
        );
        let context = OnboardContext::default();
        let selector = LicenseLeaseSelector::new(&mock, &context);

        let offerings = selector.offerings(&pool()).await.unwrap();
        let keys: Vec<_> = offerings.iter().map(|o| o.registration_key.as_str()).collect();
        assert_eq!(keys, vec!["B", "A"]);
    }

    #[tokio::test]
    async fn waits_until_licensed() {
        let mock = MockRestClient::new();
        let path = pool().member_path("KEY", &MEMBER_ID.parse().unwrap());
        mock.script(
            Method::List,
            &path,
            vec![
                MockReply::Status(503, "unavailable".to_string()),
                MockReply::Ok(json!({"uuid": MEMBER_ID, "state": "INSTALLING"})),
                MockReply::Ok(json!({"uuid": MEMBER_ID, "state": "LICENSED"})),
            ],
        );

        let mock = &mock;
        let path = path.as_str();
        let assignment = await_licensed("KEY", &RetryPolicy::new(5, 0), || async move {
            let doc = mock.list(path).await?;
            serde_json::from_value(doc).map_err(|e| OnboardError::unexpected(path, e.to_string()))
        })
        .await
        .unwrap();

        assert_eq!(assignment.state, AssignmentState::Licensed);
        assert_eq!(mock.count(Method::List, path), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_when_never_licensed() {
        let counter = AtomicU32::new(0);
        let lookups = &counter;
        let err = await_licensed("KEY", &RetryPolicy::new(40, 5_000), || async move {
            lookups.fetch_add(1, Ordering::SeqCst);
            Ok(LicenseAssignment {
                uuid: MEMBER_ID.parse().unwrap(),
                state: AssignmentState::Pending("INSTALLING".to_string()),
            })
        })
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            OnboardError::LicensingTimedOut { attempts: 41, ref registration_key } if registration_key == "KEY"
        ));
        assert_eq!(counter.load(Ordering::SeqCst), 41);
    }

    #[tokio::test]
    async fn terminal_failure_is_rejected_without_waiting() {
        let counter = AtomicU32::new(0);
        let lookups = &counter;
        let err = await_licensed("KEY", &RetryPolicy::new(40, 5_000), || async move {
            lookups.fetch_add(1, Ordering::SeqCst);
            Ok(LicenseAssignment {
                uuid: MEMBER_ID.parse().unwrap(),
                state: AssignmentState::Failed("FAILED".to_string()),
            })
        })
        .await
        .unwrap_err();

        assert!(matches!(err, OnboardError::LicensingRejected { ref state, .. } if state == "FAILED"));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
