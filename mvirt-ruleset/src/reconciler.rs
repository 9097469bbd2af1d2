//! Rule-set reconciler.
//!
//! Compares a desired rule set with the rules currently observed on the
//! remote collection and converges the remote side: every create, update and
//! delete is dispatched concurrently, each one waits for its own operation to
//! settle, and the pass joins on all of them before reporting.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinSet;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::cancel::Cancellation;
use crate::diff::{Action, RuleDiff};
use crate::error::{AggregateError, PollError, ReconcileError, RuleError, RuleFailure};
use crate::locks::KeyedLocks;
use crate::ops::{OperationHandle, RuleOps};
use crate::poller::ConvergenceSpec;
use crate::rule::{Rule, RuleSet};

/// Convergence settings for one reconciliation pass.
#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    /// Wait applied after every create. Not-found means not visible yet.
    pub create: ConvergenceSpec,
    /// Wait applied after every update. Not-found is fatal.
    pub update: ConvergenceSpec,
    /// Wait applied after every delete.
    pub delete: ConvergenceSpec,
    /// Overall deadline for the pass. Every wait is clamped to it.
    pub timeout: Option<Duration>,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            create: ConvergenceSpec::for_create(["Provisioning", "Updating"], ["Ready"]),
            update: ConvergenceSpec::new(["Provisioning", "Updating"], ["Ready"]),
            delete: ConvergenceSpec::for_delete(["Deleting"]),
            timeout: None,
        }
    }
}

/// Names touched by a reconciliation pass, each list sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileResult {
    pub created: Vec<String>,
    pub updated: Vec<String>,
    pub deleted: Vec<String>,
    pub unchanged: Vec<String>,
}

impl ReconcileResult {
    /// Number of rules that were mutated.
    pub fn changed(&self) -> usize {
        self.created.len() + self.updated.len() + self.deleted.len()
    }

    fn record(&mut self, action: Action, name: String) {
        match action {
            Action::Create => self.created.push(name),
            Action::Update => self.updated.push(name),
            Action::Delete => self.deleted.push(name),
        }
    }
}

struct ParentLock {
    locks: Arc<KeyedLocks>,
    kind: String,
    name: String,
}

/// Reconciles a named rule collection through a [`RuleOps`] backend.
pub struct RuleSetReconciler<R: Rule> {
    ops: Arc<dyn RuleOps<R>>,
    options: ReconcileOptions,
    parent: Option<ParentLock>,
}

enum Interrupted {
    Cancelled,
    DeadlineExceeded,
}

/// Run `fut` unless `cancel` fires or `deadline` passes first.
async fn race<T>(
    fut: impl Future<Output = T>,
    cancel: &mut Cancellation,
    deadline: Option<Instant>,
) -> Result<T, Interrupted> {
    let expired = async {
        match deadline {
            Some(deadline) => sleep_until(deadline).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Interrupted::Cancelled),
        _ = expired => Err(Interrupted::DeadlineExceeded),
        value = fut => Ok(value),
    }
}

impl<R: Rule> RuleSetReconciler<R> {
    pub fn new(ops: Arc<dyn RuleOps<R>>) -> Self {
        Self {
            ops,
            options: ReconcileOptions::default(),
            parent: None,
        }
    }

    pub fn with_options(mut self, options: ReconcileOptions) -> Self {
        self.options = options;
        self
    }

    /// Serialize passes against the same parent resource through `locks`.
    pub fn with_parent_lock(
        mut self,
        locks: Arc<KeyedLocks>,
        kind: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        self.parent = Some(ParentLock {
            locks,
            kind: kind.into(),
            name: name.into(),
        });
        self
    }

    pub fn options(&self) -> &ReconcileOptions {
        &self.options
    }

    /// Validate, fetch and diff without changing anything.
    pub async fn plan(&self, desired: &RuleSet<R>) -> Result<RuleDiff, ReconcileError> {
        desired.validate()?;
        let observed = self.ops.fetch_all().await.map_err(ReconcileError::Fetch)?;
        Ok(RuleDiff::compute(desired.as_map(), &observed))
    }

    /// Converge the remote collection to `desired`.
    ///
    /// Invalid input or a failed fetch aborts before any mutation. Otherwise
    /// every diffed rule is attempted; if any of them fails the returned
    /// [`AggregateError`] lists each failing rule and what did get applied.
    pub async fn reconcile(
        &self,
        desired: &RuleSet<R>,
        mut cancel: Cancellation,
    ) -> Result<ReconcileResult, ReconcileError> {
        desired.validate()?;

        let deadline = self.options.timeout.map(|t| Instant::now() + t);
        let interrupted = |i: Interrupted| match i {
            Interrupted::Cancelled => ReconcileError::Cancelled,
            Interrupted::DeadlineExceeded => ReconcileError::DeadlineExceeded,
        };

        let _guard = match &self.parent {
            Some(parent) => Some(
                race(
                    parent.locks.lock(&parent.kind, &parent.name),
                    &mut cancel,
                    deadline,
                )
                .await
                .map_err(interrupted)?,
            ),
            None => None,
        };

        info!("Reconciling {} desired rules", desired.len());
        let observed = race(self.ops.fetch_all(), &mut cancel, deadline)
            .await
            .map_err(interrupted)?
            .map_err(ReconcileError::Fetch)?;

        let diff = RuleDiff::compute(desired.as_map(), &observed);
        info!(
            "Rule diff: {} to create, {} to update, {} to delete, {} unchanged",
            diff.to_create.len(),
            diff.to_update.len(),
            diff.to_delete.len(),
            diff.unchanged.len()
        );

        if diff.is_empty() {
            return Ok(ReconcileResult {
                unchanged: diff.unchanged,
                ..Default::default()
            });
        }

        // Dropping the pass aborts every unit still running.
        let mut units = JoinSet::new();
        let mut dispatched: BTreeMap<String, Action> = BTreeMap::new();

        for (name, action) in diff.actions() {
            let mutation = match (action, desired.get(name)) {
                (Action::Delete, _) => Mutation::Delete,
                (Action::Create | Action::Update, Some(rule)) => Mutation::Apply(rule.clone()),
                (_, None) => {
                    // diff only yields create/update for desired names
                    warn!("Skipping {} of rule {}: not in desired set", action, name);
                    continue;
                }
            };
            let spec = match action {
                Action::Create => &self.options.create,
                Action::Update => &self.options.update,
                Action::Delete => &self.options.delete,
            };

            let unit = Unit {
                name: name.to_string(),
                action,
                mutation,
                ops: Arc::clone(&self.ops),
                spec: clamp(spec, deadline),
                deadline,
                cancel: cancel.clone(),
            };
            dispatched.insert(name.to_string(), action);
            units.spawn(unit.run());
        }

        let mut outcomes: HashMap<String, Result<(), RuleError>> = HashMap::new();
        while let Some(joined) = units.join_next().await {
            match joined {
                Ok(report) => {
                    outcomes.insert(report.name, report.outcome);
                }
                Err(e) => error!("Rule worker exited abnormally: {}", e),
            }
        }

        let mut applied = ReconcileResult {
            unchanged: diff.unchanged,
            ..Default::default()
        };
        let mut failures = Vec::new();
        for (name, action) in dispatched {
            match outcomes.remove(&name) {
                Some(Ok(())) => applied.record(action, name),
                Some(Err(error)) => failures.push(RuleFailure {
                    name,
                    action,
                    error,
                }),
                None => {
                    warn!("Rule {} ({}) finished without a result", name, action);
                    failures.push(RuleFailure {
                        name,
                        action,
                        error: RuleError::Lost,
                    });
                }
            }
        }

        if failures.is_empty() {
            info!(
                "Reconciled rules: {} created, {} updated, {} deleted",
                applied.created.len(),
                applied.updated.len(),
                applied.deleted.len()
            );
            return Ok(applied);
        }

        let err = AggregateError { failures, applied };
        error!("Reconciliation incomplete: {}", err);
        Err(err.into())
    }
}

/// Copy of `spec` whose timeout does not outlive `deadline`.
fn clamp(spec: &ConvergenceSpec, deadline: Option<Instant>) -> ConvergenceSpec {
    let mut spec = spec.clone();
    if let Some(deadline) = deadline {
        let remaining = deadline.saturating_duration_since(Instant::now());
        spec.timeout = spec.timeout.min(remaining);
    }
    spec
}

enum Mutation<R> {
    Apply(R),
    Delete,
}

struct Report {
    name: String,
    outcome: Result<(), RuleError>,
}

/// One concurrently running rule mutation.
struct Unit<R: Rule> {
    name: String,
    action: Action,
    mutation: Mutation<R>,
    ops: Arc<dyn RuleOps<R>>,
    spec: ConvergenceSpec,
    deadline: Option<Instant>,
    cancel: Cancellation,
}

impl<R: Rule> Unit<R> {
    async fn run(self) -> Report {
        let outcome = self.execute().await;
        match &outcome {
            Ok(()) => info!("Rule {} converged ({})", self.name, self.action),
            Err(e) => warn!("Failed to {} rule {}: {}", self.action, self.name, e),
        }

        Report {
            name: self.name,
            outcome,
        }
    }

    async fn execute(&self) -> Result<(), RuleError> {
        debug!("Dispatching {} of rule {}", self.action, self.name);
        let mut cancel = self.cancel.clone();

        let dispatch = async {
            match &self.mutation {
                Mutation::Apply(rule) => self.ops.create_or_update(&self.name, rule).await,
                Mutation::Delete => self.ops.delete(&self.name).await,
            }
        };
        let handle: Box<dyn OperationHandle> = race(dispatch, &mut cancel, self.deadline)
            .await
            .map_err(|i| {
                RuleError::Convergence(match i {
                    Interrupted::Cancelled => PollError::Cancelled { last_state: None },
                    Interrupted::DeadlineExceeded => PollError::Timeout {
                        timeout: self.spec.timeout,
                        last_state: None,
                    },
                })
            })?
            .map_err(RuleError::Dispatch)?;

        debug!(
            "Waiting on operation {} for {} of rule {}",
            handle.id(),
            self.action,
            self.name
        );
        let done = handle
            .wait(&self.spec, cancel)
            .await
            .map_err(RuleError::Convergence)?;
        debug!(
            "Rule {} reached {} after {} polls",
            self.name, done.state, done.polls
        );
        Ok(())
    }
}
