//! mvirt-ruleset: declarative rule-set reconciliation.
//!
//! Converges a remote named rule collection (for example the firewall rules
//! of one server) to a desired set and waits for every change to settle.
//!
//! # Example
//! ```ignore
//! use std::sync::Arc;
//! use mvirt_ruleset::{Cancellation, FirewallRule, MemoryRuleOps, RuleSet, RuleSetReconciler};
//!
//! let mut desired = RuleSet::new();
//! desired.insert("office", FirewallRule::single("203.0.113.7"))?;
//!
//! let ops = Arc::new(MemoryRuleOps::<FirewallRule>::default());
//! let result = RuleSetReconciler::<FirewallRule>::new(ops)
//!     .reconcile(&desired, Cancellation::never())
//!     .await?;
//! assert_eq!(result.created, vec!["office"]);
//! ```

pub mod cancel;
pub mod diff;
pub mod error;
pub mod locks;
pub mod manifest;
pub mod memory;
pub mod ops;
pub mod poller;
pub mod reconciler;
pub mod rule;

pub use cancel::{cancellation, CancelHandle, Cancellation};
pub use diff::{Action, RuleDiff};
pub use error::{
    AggregateError, OpsError, PollError, ReconcileError, RuleError, RuleFailure, ValidationError,
};
pub use locks::{KeyedGuard, KeyedLocks};
pub use memory::MemoryRuleOps;
pub use ops::{OperationHandle, PollingHandle, RefreshFn, RuleOps};
pub use poller::{await_convergence, Convergence, ConvergenceSpec, NotFound};
pub use reconciler::{ReconcileOptions, ReconcileResult, RuleSetReconciler};
pub use rule::{FirewallRule, Rule, RuleSet};
