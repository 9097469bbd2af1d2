//! In-process rule collection.
//!
//! Behaves like an eventually-consistent remote: a created rule stays
//! invisible to point reads for a few polls, updates and deletes report a
//! transitional state before settling. Faults can be injected per rule name.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::FutureExt;
use tracing::debug;

use crate::error::OpsError;
use crate::ops::{OperationHandle, PollingHandle, RefreshFn, RuleOps};
use crate::rule::Rule;

pub const STATE_READY: &str = "Ready";
pub const STATE_PROVISIONING: &str = "Provisioning";
pub const STATE_UPDATING: &str = "Updating";
pub const STATE_DELETING: &str = "Deleting";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    Create,
    Update,
    Delete,
}

#[derive(Debug)]
struct Inner<R> {
    rules: BTreeMap<String, R>,
    /// Remaining transitional polls per rule name.
    transitions: HashMap<String, (Transition, u32)>,
    settle_polls: u32,
    fail_dispatch: HashMap<String, String>,
    fail_refresh: HashMap<String, String>,
    stalled: HashSet<String>,
    vanished: HashSet<String>,
    fail_fetch: Option<String>,
    fetch_calls: u32,
    mutation_calls: u32,
    refresh_calls: u32,
}

impl<R> Inner<R> {
    fn refresh(&mut self, name: &str) -> Result<String, OpsError> {
        self.refresh_calls += 1;
        if let Some(msg) = self.fail_refresh.get(name) {
            return Err(OpsError::Remote(msg.clone()));
        }
        if self.vanished.contains(name) {
            return Err(OpsError::NotFound(name.to_string()));
        }
        if self.stalled.contains(name) {
            return Ok(STATE_PROVISIONING.to_string());
        }

        if let Some((transition, remaining)) = self.transitions.get_mut(name) {
            if *remaining > 0 {
                *remaining -= 1;
                return match transition {
                    Transition::Create => Err(OpsError::NotFound(name.to_string())),
                    Transition::Update => Ok(STATE_UPDATING.to_string()),
                    Transition::Delete => Ok(STATE_DELETING.to_string()),
                };
            }
            self.transitions.remove(name);
        }

        if self.rules.contains_key(name) {
            Ok(STATE_READY.to_string())
        } else {
            Err(OpsError::NotFound(name.to_string()))
        }
    }
}

/// Rule collection held in memory, shared between clones.
#[derive(Debug)]
pub struct MemoryRuleOps<R> {
    inner: Arc<Mutex<Inner<R>>>,
}

impl<R> Clone for MemoryRuleOps<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: Rule> Default for MemoryRuleOps<R> {
    fn default() -> Self {
        Self::new(BTreeMap::new())
    }
}

impl<R: Rule> MemoryRuleOps<R> {
    /// Collection seeded with `rules`, all settled.
    pub fn new(rules: BTreeMap<String, R>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                rules,
                transitions: HashMap::new(),
                settle_polls: 0,
                fail_dispatch: HashMap::new(),
                fail_refresh: HashMap::new(),
                stalled: HashSet::new(),
                vanished: HashSet::new(),
                fail_fetch: None,
                fetch_calls: 0,
                mutation_calls: 0,
                refresh_calls: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<R>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of transitional polls each mutation reports before settling.
    pub fn with_settle_polls(self, polls: u32) -> Self {
        self.lock().settle_polls = polls;
        self
    }

    /// Make create/update/delete of `name` fail to dispatch.
    pub fn fail_dispatch(&self, name: &str, message: &str) {
        self.lock()
            .fail_dispatch
            .insert(name.to_string(), message.to_string());
    }

    /// Make state refreshes of `name` fail.
    pub fn fail_refresh(&self, name: &str, message: &str) {
        self.lock()
            .fail_refresh
            .insert(name.to_string(), message.to_string());
    }

    /// Keep `name` provisioning forever.
    pub fn stall(&self, name: &str) {
        self.lock().stalled.insert(name.to_string());
    }

    /// Make state refreshes of `name` report it as not found, as if it was
    /// removed behind our back.
    pub fn vanish(&self, name: &str) {
        self.lock().vanished.insert(name.to_string());
    }

    /// Make the next fetches fail until cleared with `None`.
    pub fn fail_fetch(&self, message: Option<&str>) {
        self.lock().fail_fetch = message.map(str::to_string);
    }

    /// Committed rules, including those still settling.
    pub fn snapshot(&self) -> BTreeMap<String, R> {
        self.lock().rules.clone()
    }

    pub fn fetch_calls(&self) -> u32 {
        self.lock().fetch_calls
    }

    pub fn mutation_calls(&self) -> u32 {
        self.lock().mutation_calls
    }

    pub fn refresh_calls(&self) -> u32 {
        self.lock().refresh_calls
    }

    fn handle(&self, name: &str) -> Box<dyn OperationHandle> {
        let inner = Arc::clone(&self.inner);
        let name = name.to_string();
        let refresh: RefreshFn = Box::new(move || {
            let result = inner
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .refresh(&name);
            async move { result }.boxed()
        });
        Box::new(PollingHandle::new(refresh))
    }

    fn begin(&self, name: &str) -> Result<MutexGuard<'_, Inner<R>>, OpsError> {
        let mut inner = self.lock();
        inner.mutation_calls += 1;
        if let Some(msg) = inner.fail_dispatch.get(name) {
            return Err(OpsError::Rejected(msg.clone()));
        }
        Ok(inner)
    }
}

#[async_trait]
impl<R: Rule> RuleOps<R> for MemoryRuleOps<R> {
    async fn fetch_all(&self) -> Result<BTreeMap<String, R>, OpsError> {
        let mut inner = self.lock();
        inner.fetch_calls += 1;
        if let Some(msg) = &inner.fail_fetch {
            return Err(OpsError::Remote(msg.clone()));
        }
        Ok(inner.rules.clone())
    }

    async fn create_or_update(
        &self,
        name: &str,
        rule: &R,
    ) -> Result<Box<dyn OperationHandle>, OpsError> {
        {
            let mut inner = self.begin(name)?;
            let transition = if inner.rules.contains_key(name) {
                Transition::Update
            } else {
                Transition::Create
            };
            debug!("Memory backend: {:?} rule {}", transition, name);
            let polls = inner.settle_polls;
            inner.transitions.insert(name.to_string(), (transition, polls));
            inner.rules.insert(name.to_string(), rule.clone());
        }
        Ok(self.handle(name))
    }

    async fn delete(&self, name: &str) -> Result<Box<dyn OperationHandle>, OpsError> {
        {
            let mut inner = self.begin(name)?;
            if inner.rules.remove(name).is_none() {
                return Err(OpsError::NotFound(name.to_string()));
            }
            debug!("Memory backend: Delete rule {}", name);
            let polls = inner.settle_polls;
            inner
                .transitions
                .insert(name.to_string(), (Transition::Delete, polls));
        }
        Ok(self.handle(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::Cancellation;
    use crate::poller::{ConvergenceSpec, NOT_FOUND_STATE};
    use crate::rule::FirewallRule;
    use std::time::Duration;

    fn create_spec() -> ConvergenceSpec {
        ConvergenceSpec::for_create([STATE_PROVISIONING, STATE_UPDATING], [STATE_READY])
            .with_min_interval(Duration::from_millis(10))
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_becomes_visible_after_settling() {
        let ops = MemoryRuleOps::<FirewallRule>::default().with_settle_polls(2);
        let handle = ops
            .create_or_update("a", &FirewallRule::single("1.1.1.1"))
            .await
            .unwrap();

        let done = handle.wait(&create_spec(), Cancellation::never()).await.unwrap();
        assert_eq!(done.state, STATE_READY);
        assert_eq!(done.polls, 3);
        assert_eq!(ops.fetch_all().await.unwrap().len(), 1);
        assert_eq!(ops.mutation_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_waits_for_gone() {
        let seed = [("a".to_string(), FirewallRule::single("1.1.1.1"))].into();
        let ops = MemoryRuleOps::new(seed).with_settle_polls(1);

        let handle = ops.delete("a").await.unwrap();
        let spec = ConvergenceSpec::for_delete([STATE_DELETING])
            .with_min_interval(Duration::from_millis(10));
        let done = handle.wait(&spec, Cancellation::never()).await.unwrap();
        assert_eq!(done.state, NOT_FOUND_STATE);
        assert!(ops.snapshot().is_empty());

        assert_eq!(
            ops.delete("a").await.err(),
            Some(OpsError::NotFound("a".to_string()))
        );
    }

    #[tokio::test]
    async fn test_injected_faults() {
        let ops = MemoryRuleOps::<FirewallRule>::default();
        ops.fail_dispatch("bad", "invalid request");
        assert_eq!(
            ops.create_or_update("bad", &FirewallRule::single("1.1.1.1"))
                .await
                .err(),
            Some(OpsError::Rejected("invalid request".to_string()))
        );
        assert!(ops.snapshot().is_empty());

        ops.fail_fetch(Some("unavailable"));
        assert!(ops.fetch_all().await.is_err());
        ops.fail_fetch(None);
        assert!(ops.fetch_all().await.is_ok());
        assert_eq!(ops.fetch_calls(), 2);
    }
}
