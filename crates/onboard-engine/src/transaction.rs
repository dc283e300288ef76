//! Atomic batches of mutations through a remote transaction.
//!
//! # State machine
//!
//! ```text
//!   create /tm/transaction
//!            │
//!            ▼
//!       ┌─────────┐  mutation fails   ┌───────────┐
//!       │  Open   │──────────────────▶│  Aborted  │ (never committed)
//!       └────┬────┘                   └───────────┘
//!            │ every mutation staged
//!            ▼
//!   ┌─────────────────┐
//!   │ CommitRequested │
//!   └────────┬────────┘
//!            │ poll
//!       ┌────┴─────┐
//!       ▼          ▼
//!  ┌──────────┐ ┌────────┐
//!  │Committed │ │ Failed │
//!  └──────────┘ └────────┘
//! ```
//!
//! The control plane discards a transaction that is never committed, so an
//! aborted batch leaves no partial changes behind.

use onboard_client::{Method, RestClient, RestRequest};
use onboard_core::TransactionId;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::context::OnboardContext;
use crate::error::{OnboardError, Result};
use crate::retry::{try_until, RetryPolicy};

/// Collection transactions are created in.
pub const TRANSACTIONS_PATH: &str = "/tm/transaction";

/// State value that asks the control plane to validate and commit.
const COMMIT_REQUEST_STATE: &str = "VALIDATING";

/// One mutation of a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    /// `Create`, `Modify` or `Delete`; anything else aborts the batch.
    pub method: Method,
    /// Target resource.
    pub path: String,
    /// Body for `Create` and `Modify`.
    pub body: Option<Value>,
}

impl Mutation {
    /// A `modify` of `path` with `body`.
    #[must_use]
    pub fn modify(path: impl Into<String>, body: Value) -> Self {
        Self {
            method: Method::Modify,
            path: path.into(),
            body: Some(body),
        }
    }

    /// A `create` at `path` with `body`.
    #[must_use]
    pub fn create(path: impl Into<String>, body: Value) -> Self {
        Self {
            method: Method::Create,
            path: path.into(),
            body: Some(body),
        }
    }

    /// A `delete` of `path`.
    #[must_use]
    pub fn delete(path: impl Into<String>) -> Self {
        Self {
            method: Method::Delete,
            path: path.into(),
            body: None,
        }
    }
}

/// Lifecycle state of a remote transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionState {
    /// Accepting mutations, or validating after a commit request.
    Open,
    /// All mutations took effect.
    Committed,
    /// The commit failed.
    Failed,
}

impl TransactionState {
    /// Map a state reported by the control plane.
    #[must_use]
    pub fn from_remote(state: &str) -> Self {
        match state {
            "COMPLETED" | "COMMITTED" => Self::Committed,
            "FAILED" => Self::Failed,
            _ => Self::Open,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransactionDocument {
    trans_id: TransactionId,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    failure_reason: Option<String>,
}

/// A transaction opened on the control plane.
#[derive(Debug)]
struct Transaction {
    id: TransactionId,
    state: TransactionState,
}

impl Transaction {
    fn request_for(&self, mutation: &Mutation) -> Result<RestRequest> {
        if self.state != TransactionState::Open {
            return Err(OnboardError::TransactionClosed(self.id));
        }
        if !mutation.method.is_mutating() {
            return Err(OnboardError::InvalidMutation {
                method: mutation.method.to_string(),
                path: mutation.path.clone(),
            });
        }
        let mut request =
            RestRequest::new(mutation.method, mutation.path.clone()).in_transaction(self.id);
        request.body.clone_from(&mutation.body);
        Ok(request)
    }

    fn path(&self) -> String {
        format!("{TRANSACTIONS_PATH}/{}", self.id)
    }
}

/// Applies a batch of mutations inside one remote transaction.
pub struct TransactionalApplier<'a, C: ?Sized> {
    client: &'a C,
    context: &'a OnboardContext,
    commit_poll: Option<RetryPolicy>,
}

impl<'a, C: RestClient + ?Sized> TransactionalApplier<'a, C> {
    /// Create an applier that trusts the commit response.
    #[must_use]
    pub const fn new(client: &'a C, context: &'a OnboardContext) -> Self {
        Self {
            client,
            context,
            commit_poll: None,
        }
    }

    /// Poll the transaction after the commit request until it completes.
    #[must_use]
    pub const fn with_commit_poll(mut self, policy: RetryPolicy) -> Self {
        self.commit_poll = Some(policy);
        self
    }

    /// Apply `mutations` atomically, in order, each awaited before the next.
    ///
    /// An empty batch opens no transaction. Returns the id of the committed
    /// transaction, if one was needed.
    ///
    /// # Errors
    ///
    /// - [`OnboardError::TransactionAborted`] if a mutation fails; no commit
    ///   is requested
    /// - [`OnboardError::TransactionFailed`] if the commit request fails or
    ///   the transaction ends in a failed state
    /// - [`OnboardError::RetryExhausted`] if commit polling runs out
    /// - the transport error of opening the transaction
    pub async fn apply_batch(&self, mutations: &[Mutation]) -> Result<Option<TransactionId>> {
        if mutations.is_empty() {
            tracing::debug!("Empty batch, no transaction needed");
            return Ok(None);
        }

        self.context
            .scope(async {
                let mut transaction = self.open().await?;
                tracing::info!(
                    transaction_id = %transaction.id,
                    mutations = mutations.len(),
                    "Opened transaction"
                );

                for (index, mutation) in mutations.iter().enumerate() {
                    let staged = match transaction.request_for(mutation) {
                        Ok(request) => self.client.send(request).await.map_err(OnboardError::from),
                        Err(e) => Err(e),
                    };
                    if let Err(e) = staged {
                        tracing::warn!(
                            transaction_id = %transaction.id,
                            index,
                            path = %mutation.path,
                            error = %e,
                            "Mutation failed, abandoning transaction"
                        );
                        return Err(OnboardError::TransactionAborted {
                            transaction_id: transaction.id,
                            source: Box::new(e),
                        });
                    }
                }

                self.commit(&mut transaction).await?;
                Ok(Some(transaction.id))
            })
            .await
    }

    async fn open(&self) -> Result<Transaction> {
        let created = self.client.create(TRANSACTIONS_PATH, json!({})).await?;
        let document: TransactionDocument = serde_json::from_value(created)
            .map_err(|e| OnboardError::unexpected(TRANSACTIONS_PATH, e.to_string()))?;
        Ok(Transaction {
            id: document.trans_id,
            state: TransactionState::Open,
        })
    }

    async fn commit(&self, transaction: &mut Transaction) -> Result<()> {
        let path = transaction.path();
        let response = self
            .client
            .modify(&path, json!({"state": COMMIT_REQUEST_STATE}))
            .await
            .map_err(|e| OnboardError::TransactionFailed {
                transaction_id: transaction.id,
                reason: format!("commit request failed: {e}"),
            })?;

        let mut settled = response;
        transaction.state = Self::reported_state(&settled);
        if transaction.state == TransactionState::Open {
            if let Some(policy) = &self.commit_poll {
                settled = self.poll_until_settled(transaction, policy).await?;
                transaction.state = Self::reported_state(&settled);
            } else {
                // Synchronous commit: an accepted request is a commit.
                transaction.state = TransactionState::Committed;
            }
        }

        match transaction.state {
            TransactionState::Committed => {
                tracing::info!(transaction_id = %transaction.id, "Transaction committed");
                Ok(())
            }
            _ => Err(OnboardError::TransactionFailed {
                transaction_id: transaction.id,
                reason: Self::failure_reason(&settled),
            }),
        }
    }

    /// Poll the transaction until it reports a terminal state and return
    /// that final document.
    async fn poll_until_settled(
        &self,
        transaction: &Transaction,
        policy: &RetryPolicy,
    ) -> Result<Value> {
        let path = transaction.path();
        let path = path.as_str();
        let client = self.client;
        let id = transaction.id;

        try_until(policy, || async move {
            let document = client.list(path).await?;
            if Self::reported_state(&document) == TransactionState::Open {
                return Err(OnboardError::NotReady(format!(
                    "transaction {id} is still being validated"
                )));
            }
            Ok(document)
        })
        .await
    }

    fn reported_state(document: &Value) -> TransactionState {
        document
            .get("state")
            .and_then(Value::as_str)
            .map_or(TransactionState::Open, TransactionState::from_remote)
    }

    fn failure_reason(document: &Value) -> String {
        serde_json::from_value::<TransactionDocument>(document.clone())
            .ok()
            .and_then(|d| d.failure_reason.or(d.state))
            .unwrap_or_else(|| "transaction did not complete".to_string())
    }
}
