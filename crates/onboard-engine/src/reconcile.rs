//! Idempotent "read current, diff, patch" reconciliation.
//!
//! Every mutating call of a settings-style workflow goes through
//! [`StateReconciler`], so running onboarding twice against the same device
//! changes nothing the second time.

use onboard_client::RestClient;
use serde_json::{json, Map, Value};

use crate::context::OnboardContext;
use crate::error::Result;

/// Outcome of a reconciliation.
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciled {
    /// A mutation was issued with exactly these fields.
    Applied {
        /// Resource that was changed.
        path: String,
        /// Fields that were sent.
        patch: Map<String, Value>,
    },
    /// The remote state already matched; nothing was sent.
    NoOp {
        /// Resource that was checked.
        path: String,
        /// Human-readable explanation.
        message: String,
    },
}

impl Reconciled {
    /// Returns true if nothing was changed.
    #[must_use]
    pub const fn is_noop(&self) -> bool {
        matches!(self, Self::NoOp { .. })
    }

    /// The fields that were applied, if any.
    #[must_use]
    pub fn patch(&self) -> Option<&Map<String, Value>> {
        match self {
            Self::Applied { patch, .. } => Some(patch),
            Self::NoOp { .. } => None,
        }
    }

    /// The no-op explanation, if nothing was changed.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::NoOp { message, .. } => Some(message),
            Self::Applied { .. } => None,
        }
    }
}

/// Fields of `desired` whose value differs from, or is absent in, `current`.
#[must_use]
pub fn diff(current: &Value, desired: &Map<String, Value>) -> Map<String, Value> {
    desired
        .iter()
        .filter(|(key, value)| current.get(key.as_str()) != Some(*value))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Reconciles single resources against a desired state.
pub struct StateReconciler<'a, C: ?Sized> {
    client: &'a C,
    context: &'a OnboardContext,
}

impl<'a, C: RestClient + ?Sized> StateReconciler<'a, C> {
    /// Create a reconciler over `client`.
    #[must_use]
    pub const fn new(client: &'a C, context: &'a OnboardContext) -> Self {
        Self { client, context }
    }

    /// Patch `path` with the fields of `desired` that differ from the
    /// current document.
    ///
    /// Unchanged fields are never sent, so fields the caller did not mention
    /// keep whatever value they have remotely.
    ///
    /// # Errors
    ///
    /// Propagates the transport error of the `list` or `modify` call.
    pub async fn apply_if_different(
        &self,
        path: &str,
        desired: &Map<String, Value>,
    ) -> Result<Reconciled> {
        self.apply_derived(path, |_| desired.clone()).await
    }

    /// Like [`apply_if_different`](Self::apply_if_different), but the desired
    /// fields are computed from the current document.
    ///
    /// # Errors
    ///
    /// Propagates the transport error of the `list` or `modify` call.
    pub async fn apply_derived<F>(&self, path: &str, derive: F) -> Result<Reconciled>
    where
        F: FnOnce(&Value) -> Map<String, Value> + Send,
    {
        self.context
            .scope(async {
                let current = self.client.list(path).await?;
                let desired = derive(&current);
                let patch = diff(&current, &desired);

                if patch.is_empty() {
                    tracing::debug!(path = %path, "Resource already matches desired state");
                    return Ok(Reconciled::NoOp {
                        path: path.to_string(),
                        message: format!("{path} already matches desired values"),
                    });
                }

                tracing::info!(
                    path = %path,
                    fields = ?patch.keys().collect::<Vec<_>>(),
                    "Applying changed fields"
                );
                self.client
                    .modify(path, Value::Object(patch.clone()))
                    .await?;

                Ok(Reconciled::Applied {
                    path: path.to_string(),
                    patch,
                })
            })
            .await
    }

    /// Rename the resource `current` in `collection_path` to `desired` with
    /// a `mv` command, unless the names already match.
    ///
    /// # Errors
    ///
    /// Propagates the transport error of the rename call.
    pub async fn rename_if_different(
        &self,
        collection_path: &str,
        current: &str,
        desired: &str,
    ) -> Result<Reconciled> {
        self.context
            .scope(async {
                if current == desired {
                    return Ok(Reconciled::NoOp {
                        path: collection_path.to_string(),
                        message: format!("Device name already matches {desired}"),
                    });
                }

                tracing::info!(from = %current, to = %desired, "Renaming device");
                self.client
                    .create(
                        collection_path,
                        json!({"command": "mv", "name": current, "target": desired}),
                    )
                    .await?;

                let mut patch = Map::new();
                patch.insert("name".to_string(), Value::String(desired.to_string()));
                Ok(Reconciled::Applied {
                    path: collection_path.to_string(),
                    patch,
                })
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use onboard_client::{Method, MockRestClient};

    const SETTINGS: &str = "/tm/sys/global-settings";

    fn fields(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn diff_keeps_changed_and_missing_fields() {
        let current = json!({"a": 1, "b": 9});
        let desired = fields(json!({"a": 1, "b": 2, "c": 3}));
        assert_eq!(diff(&current, &desired), fields(json!({"b": 2, "c": 3})));
    }

    #[test]
    fn diff_against_non_object_is_everything() {
        let desired = fields(json!({"a": 1}));
        assert_eq!(diff(&Value::Null, &desired), desired);
    }

    #[tokio::test]
    async fn sends_only_differing_fields() {
        let mock = MockRestClient::new();
        mock.set(SETTINGS, json!({"a": 1, "b": 9, "untouched": "x"}));
        let context = OnboardContext::default();
        let reconciler = StateReconciler::new(&mock, &context);

        let outcome = reconciler
            .apply_if_different(SETTINGS, &fields(json!({"a": 1, "b": 2})))
            .await
            .unwrap();

        assert_eq!(outcome.patch(), Some(&fields(json!({"b": 2}))));
        let mutations = mock.mutations();
        assert_eq!(mutations.len(), 1);
        assert_eq!(mutations[0].body, Some(json!({"b": 2})));
        assert_eq!(
            mock.get(SETTINGS),
            Some(json!({"a": 1, "b": 2, "untouched": "x"}))
        );
    }

    #[tokio::test]
    async fn second_run_is_noop() {
        let mock = MockRestClient::new();
        mock.set(SETTINGS, json!({"guiSetup": "enabled"}));
        let context = OnboardContext::default();
        let reconciler = StateReconciler::new(&mock, &context);
        let desired = fields(json!({"guiSetup": "disabled"}));

        let first = reconciler.apply_if_different(SETTINGS, &desired).await.unwrap();
        let second = reconciler.apply_if_different(SETTINGS, &desired).await.unwrap();

        assert!(!first.is_noop());
        assert!(second.is_noop());
        assert!(second.message().unwrap().contains("matches"));
        assert_eq!(mock.count(Method::Modify, SETTINGS), 1);
        assert_eq!(mock.get(SETTINGS), Some(json!({"guiSetup": "disabled"})));
    }

    #[tokio::test]
    async fn list_failure_propagates_without_mutation() {
        let mock = MockRestClient::new();
        mock.fail(Method::List, SETTINGS, 503, "restjavad restarting");
        let context = OnboardContext::default();
        let reconciler = StateReconciler::new(&mock, &context);

        let err = reconciler
            .apply_if_different(SETTINGS, &fields(json!({"a": 1})))
            .await
            .unwrap_err();

        assert!(err.is_retriable());
        assert!(mock.mutations().is_empty());
        assert_eq!(mock.count(Method::List, SETTINGS), 1);
    }

    #[tokio::test]
    async fn derived_desired_state_sees_current_document() {
        let mock = MockRestClient::new();
        mock.set("/tm/net/self-allow", json!({"defaults": ["tcp:22"]}));
        let context = OnboardContext::default();
        let reconciler = StateReconciler::new(&mock, &context);

        let outcome = reconciler
            .apply_derived("/tm/net/self-allow", |current| {
                let mut defaults = current["defaults"].as_array().cloned().unwrap_or_default();
                defaults.push(json!("tcp:8443"));
                fields(json!({ "defaults": defaults }))
            })
            .await
            .unwrap();

        assert!(!outcome.is_noop());
        assert_eq!(
            mock.get("/tm/net/self-allow"),
            Some(json!({"defaults": ["tcp:22", "tcp:8443"]}))
        );
        assert_eq!(mock.count(Method::List, "/tm/net/self-allow"), 1);
    }

    #[tokio::test]
    async fn rename_noop_when_names_match() {
        let mock = MockRestClient::new();
        let context = OnboardContext::default();
        let reconciler = StateReconciler::new(&mock, &context);

        let outcome = reconciler
            .rename_if_different("/tm/cm/device", "bigip1", "bigip1")
            .await
            .unwrap();

        assert!(outcome.is_noop());
        assert!(outcome.message().unwrap().contains("matches"));
        assert!(mock.requests().is_empty());
    }

    #[tokio::test]
    async fn rename_issues_mv_command() {
        let mock = MockRestClient::new();
        let context = OnboardContext::default();
        let reconciler = StateReconciler::new(&mock, &context);

        reconciler
            .rename_if_different("/tm/cm/device", "bigip1", "edge-01")
            .await
            .unwrap();

        let requests = mock.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].method, Method::Create);
        assert_eq!(
            requests[0].body,
            Some(json!({"command": "mv", "name": "bigip1", "target": "edge-01"}))
        );
    }
}
