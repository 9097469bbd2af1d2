//! Remote rule collection interface consumed by the reconciler.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use futures::future::BoxFuture;
use uuid::Uuid;

use crate::cancel::Cancellation;
use crate::error::{OpsError, PollError};
use crate::poller::{await_convergence, Convergence, ConvergenceSpec};
use crate::rule::Rule;

/// One in-flight asynchronous mutation.
#[async_trait]
pub trait OperationHandle: Send {
    /// Identifier for logs.
    fn id(&self) -> &str;

    /// Block until the mutation converges per `spec`, fails, times out or is
    /// cancelled. Consumes the handle.
    async fn wait(
        self: Box<Self>,
        spec: &ConvergenceSpec,
        cancel: Cancellation,
    ) -> Result<Convergence, PollError>;
}

/// A named rule collection on a remote backend.
#[async_trait]
pub trait RuleOps<R: Rule>: Send + Sync {
    /// Snapshot of every rule currently in the collection.
    async fn fetch_all(&self) -> Result<BTreeMap<String, R>, OpsError>;

    /// Start creating or replacing the rule called `name`.
    async fn create_or_update(
        &self,
        name: &str,
        rule: &R,
    ) -> Result<Box<dyn OperationHandle>, OpsError>;

    /// Start deleting the rule called `name`.
    async fn delete(&self, name: &str) -> Result<Box<dyn OperationHandle>, OpsError>;
}

/// Refresh function returning the current state label of one resource.
pub type RefreshFn = Box<dyn FnMut() -> BoxFuture<'static, Result<String, OpsError>> + Send>;

/// Handle that waits by polling a refresh function.
pub struct PollingHandle {
    id: String,
    refresh: RefreshFn,
}

impl PollingHandle {
    pub fn new(refresh: RefreshFn) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            refresh,
        }
    }

    pub fn with_id(id: impl Into<String>, refresh: RefreshFn) -> Self {
        Self {
            id: id.into(),
            refresh,
        }
    }
}

impl fmt::Debug for PollingHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollingHandle").field("id", &self.id).finish()
    }
}

#[async_trait]
impl OperationHandle for PollingHandle {
    fn id(&self) -> &str {
        &self.id
    }

    async fn wait(
        self: Box<Self>,
        spec: &ConvergenceSpec,
        cancel: Cancellation,
    ) -> Result<Convergence, PollError> {
        await_convergence(self.refresh, spec, cancel).await
    }
}
