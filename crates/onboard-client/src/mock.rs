//! In-memory control plane for tests.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use onboard_core::TransactionId;
use parking_lot::Mutex;
use serde_json::Value;

use crate::error::{ClientError, Result};
use crate::request::{Method, RestRequest};
use crate::RestClient;

const TRANSACTION_PREFIX: &str = "/tm/transaction/";
const COMMIT_STATE: &str = "VALIDATING";

/// A scripted reply for one call.
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Answer with this document.
    Ok(Value),
    /// Fail with this HTTP status and message.
    Status(u16, String),
}

/// A mock control plane that stores documents in memory.
///
/// - `list` returns the stored document, or a 404 if none is stored
/// - `modify` merges the body's top-level fields into the stored document
/// - `create` echoes the body
/// - `delete` removes the stored document
///
/// Mutations scoped to a transaction are staged instead of applied. They take
/// effect together once `modify /tm/transaction/{id}` requests the commit and
/// that request succeeds; a transaction that is never committed changes
/// nothing.
///
/// Any (method, path) pair can be scripted with [`MockRestClient::script`];
/// scripted replies take precedence and are consumed in order, the last one
/// repeating forever. Every call is recorded.
#[derive(Default)]
pub struct MockRestClient {
    documents: Mutex<HashMap<String, Value>>,
    scripts: Mutex<HashMap<(Method, String), VecDeque<MockReply>>>,
    requests: Mutex<Vec<RestRequest>>,
    staged: Mutex<HashMap<TransactionId, Vec<RestRequest>>>,
}

impl MockRestClient {
    /// Create a new, empty mock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the document returned by `list(path)`.
    pub fn set(&self, path: &str, document: Value) {
        self.documents.lock().insert(path.to_string(), document);
    }

    /// Get the stored document at `path`.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<Value> {
        self.documents.lock().get(path).cloned()
    }

    /// Script the replies for a (method, path) pair.
    pub fn script(&self, method: Method, path: &str, replies: Vec<MockReply>) {
        self.scripts
            .lock()
            .insert((method, path.to_string()), replies.into());
    }

    /// Make every call with this (method, path) fail with `status`.
    pub fn fail(&self, method: Method, path: &str, status: u16, message: &str) {
        self.script(method, path, vec![MockReply::Status(status, message.to_string())]);
    }

    /// All recorded requests, in call order.
    #[must_use]
    pub fn requests(&self) -> Vec<RestRequest> {
        self.requests.lock().clone()
    }

    /// Recorded requests that change remote state.
    #[must_use]
    pub fn mutations(&self) -> Vec<RestRequest> {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.method.is_mutating())
            .cloned()
            .collect()
    }

    /// Number of recorded calls with this (method, path).
    #[must_use]
    pub fn count(&self, method: Method, path: &str) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.method == method && r.path == path)
            .count()
    }

    fn next_scripted(&self, method: Method, path: &str) -> Option<MockReply> {
        let mut scripts = self.scripts.lock();
        let queue = scripts.get_mut(&(method, path.to_string()))?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }

    /// Number of mutations staged in `transaction` and not yet committed.
    #[must_use]
    pub fn staged(&self, transaction: TransactionId) -> usize {
        self.staged.lock().get(&transaction).map_or(0, Vec::len)
    }

    /// The transaction whose commit `request` asks for, if any.
    fn committed(request: &RestRequest) -> Option<TransactionId> {
        if request.method != Method::Modify {
            return None;
        }
        let id = request.path.strip_prefix(TRANSACTION_PREFIX)?.parse().ok()?;
        let state = request.body.as_ref()?.get("state")?.as_str()?;
        (state == COMMIT_STATE).then_some(id)
    }

    fn apply(documents: &mut HashMap<String, Value>, request: &RestRequest) -> Result<Value> {
        match request.method {
            Method::List => documents
                .get(&request.path)
                .cloned()
                .ok_or_else(|| Self::status(request, 404, "resource not found".to_string())),
            Method::Create => Ok(request.body.clone().unwrap_or(Value::Null)),
            Method::Modify => {
                let entry = documents
                    .entry(request.path.clone())
                    .or_insert_with(|| Value::Object(serde_json::Map::new()));
                if let (Value::Object(current), Some(Value::Object(patch))) =
                    (&mut *entry, request.body.as_ref())
                {
                    for (key, value) in patch {
                        current.insert(key.clone(), value.clone());
                    }
                }
                Ok(entry.clone())
            }
            Method::Delete => documents
                .remove(&request.path)
                .map(|_| Value::Null)
                .ok_or_else(|| Self::status(request, 404, "resource not found".to_string())),
        }
    }

    fn status(request: &RestRequest, status: u16, message: String) -> ClientError {
        ClientError::Status {
            method: request.method.to_string(),
            path: request.path.clone(),
            status,
            message,
        }
    }
}

#[async_trait]
impl RestClient for MockRestClient {
    async fn send(&self, request: RestRequest) -> Result<Value> {
        self.requests.lock().push(request.clone());

        let reply = match self.next_scripted(request.method, &request.path) {
            Some(MockReply::Ok(value)) => value,
            Some(MockReply::Status(status, message)) => {
                return Err(Self::status(&request, status, message));
            }
            None => match request.transaction {
                Some(id) if request.method.is_mutating() => {
                    let echo = request.body.clone().unwrap_or(Value::Null);
                    self.staged.lock().entry(id).or_default().push(request);
                    return Ok(echo);
                }
                _ => Self::apply(&mut self.documents.lock(), &request)?,
            },
        };

        if let Some(id) = Self::committed(&request) {
            let staged = self.staged.lock().remove(&id).unwrap_or_default();
            let mut documents = self.documents.lock();
            for staged in &staged {
                Self::apply(&mut documents, staged)?;
            }
        }
        Ok(reply)
    }
}
