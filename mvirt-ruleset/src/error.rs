//! Error types for rule-set reconciliation.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::diff::Action;
use crate::reconciler::ReconcileResult;

/// Errors raised while validating a desired rule set. No remote call is made
/// once one of these is returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("rule name is required")]
    EmptyName,

    #[error("duplicate rule name '{0}'")]
    DuplicateName(String),

    #[error("rule names '{first}' and '{second}' refer to the same remote rule")]
    NameCollision { first: String, second: String },

    #[error("rule '{name}': invalid {field} '{value}'")]
    InvalidAddress {
        name: String,
        field: &'static str,
        value: String,
    },

    #[error("rule '{name}': start and end address must be the same IP version")]
    AddressFamilyMismatch { name: String },

    #[error("rule '{name}': start address {start} is after end address {end}")]
    InvertedRange {
        name: String,
        start: String,
        end: String,
    },
}

/// Errors returned by a remote rule collection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OpsError {
    /// The addressed rule does not exist (yet, or any more).
    #[error("not found: {0}")]
    NotFound(String),

    /// The request was rejected before anything was started.
    #[error("rejected: {0}")]
    Rejected(String),

    /// Any other remote failure.
    #[error("remote: {0}")]
    Remote(String),
}

impl OpsError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, OpsError::NotFound(_))
    }
}

/// Errors returned by the convergence poller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PollError {
    #[error("timed out after {timeout:?} waiting for target state (last state: {})", display_state(.last_state))]
    Timeout {
        timeout: Duration,
        last_state: Option<String>,
    },

    #[error("cancelled while waiting for target state (last state: {})", display_state(.last_state))]
    Cancelled { last_state: Option<String> },

    #[error("refreshing state failed (last state: {}): {source}", display_state(.last_state))]
    Refresh {
        last_state: Option<String>,
        #[source]
        source: OpsError,
    },

    #[error("resource still not found after {checks} consecutive checks")]
    NotFoundExhausted { checks: u32 },
}

fn display_state(state: &Option<String>) -> &str {
    state.as_deref().unwrap_or("none observed")
}

/// Failure of a single rule mutation within a reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleError {
    #[error("dispatch failed: {0}")]
    Dispatch(OpsError),

    #[error(transparent)]
    Convergence(PollError),

    #[error("worker exited without reporting a result")]
    Lost,
}

/// One failing rule in an aggregate error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleFailure {
    pub name: String,
    pub action: Action,
    pub error: RuleError,
}

impl fmt::Display for RuleFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.name, self.action, self.error)
    }
}

/// Every rule that failed in a pass, plus what did get applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateError {
    /// Failures sorted by rule name.
    pub failures: Vec<RuleFailure>,
    /// Rules whose mutation converged, and rules that were left untouched.
    pub applied: ReconcileResult,
}

impl AggregateError {
    /// Names of the rules now inconsistent with the desired set.
    pub fn failed_names(&self) -> Vec<&str> {
        self.failures.iter().map(|f| f.name.as_str()).collect()
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let attempted = self.failures.len() + self.applied.changed();
        write!(
            f,
            "{} of {} rule operations failed: ",
            self.failures.len(),
            attempted
        )?;
        for (i, failure) in self.failures.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}", failure)?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}

/// Errors returned by [`crate::RuleSetReconciler::reconcile`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconcileError {
    #[error("invalid desired rule set: {0}")]
    Validation(#[from] ValidationError),

    #[error("fetching observed rules failed: {0}")]
    Fetch(#[source] OpsError),

    #[error("reconciliation cancelled before any rule was changed")]
    Cancelled,

    #[error("reconciliation deadline exceeded before any rule was changed")]
    DeadlineExceeded,

    #[error(transparent)]
    Partial(#[from] AggregateError),
}
