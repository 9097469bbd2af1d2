//! Convergence poller.
//!
//! Turns an eventually-consistent remote mutation into a bounded wait with a
//! definite outcome: poll a state label until the target state has been seen
//! enough times in a row, the timeout elapses, or the caller cancels.

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

use crate::cancel::Cancellation;
use crate::error::{OpsError, PollError};

/// Label recorded when a not-found result is counted as a target observation.
pub const NOT_FOUND_STATE: &str = "NotFound";

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// How a not-found refresh result is classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NotFound {
    /// Abort with the refresh error.
    #[default]
    Fatal,
    /// Keep polling; the resource may not be visible yet after a create.
    Pending,
    /// Count as a target observation; the resource is expected to be gone.
    Target,
}

/// Per-wait polling configuration.
#[derive(Debug, Clone)]
pub struct ConvergenceSpec {
    pub pending: HashSet<String>,
    pub target: HashSet<String>,
    /// Floor on the spacing between two polls.
    pub min_interval: Duration,
    /// Fixed poll spacing. Exponential backoff when unset.
    pub poll_interval: Option<Duration>,
    /// Wait before the first poll.
    pub delay: Duration,
    /// Target observations required in a row before reporting success.
    pub consecutive_targets: u32,
    pub timeout: Duration,
    pub not_found: NotFound,
    /// Consecutive not-found results tolerated under [`NotFound::Pending`].
    /// Zero means unlimited.
    pub not_found_checks: u32,
}

fn labels<I, S>(states: I) -> HashSet<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    states.into_iter().map(Into::into).collect()
}

impl ConvergenceSpec {
    pub fn new<P, T, S>(pending: P, target: T) -> Self
    where
        P: IntoIterator<Item = S>,
        T: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            pending: labels(pending),
            target: labels(target),
            min_interval: Duration::from_secs(5),
            poll_interval: None,
            delay: Duration::ZERO,
            consecutive_targets: 1,
            timeout: Duration::from_secs(30 * 60),
            not_found: NotFound::Fatal,
            not_found_checks: 20,
        }
    }

    /// Wait for a created or updated resource to become visible and settle.
    pub fn for_create<P, T, S>(pending: P, target: T) -> Self
    where
        P: IntoIterator<Item = S>,
        T: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(pending, target).with_not_found(NotFound::Pending)
    }

    /// Wait for a deleted resource to disappear.
    pub fn for_delete<P, S>(pending: P) -> Self
    where
        P: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(pending, Vec::<S>::new()).with_not_found(NotFound::Target)
    }

    pub fn with_min_interval(mut self, min_interval: Duration) -> Self {
        self.min_interval = min_interval;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = Some(poll_interval);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_consecutive_targets(mut self, count: u32) -> Self {
        self.consecutive_targets = count;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_not_found(mut self, not_found: NotFound) -> Self {
        self.not_found = not_found;
        self
    }

    pub fn with_not_found_checks(mut self, checks: u32) -> Self {
        self.not_found_checks = checks;
        self
    }

    fn classify(&self, state: &str) -> Observation {
        if self.target.contains(state) {
            Observation::Target
        } else if self.pending.contains(state) {
            Observation::Pending
        } else {
            Observation::Unknown
        }
    }

    fn interval(&self, backoff: Duration) -> Duration {
        self.poll_interval.unwrap_or(backoff).max(self.min_interval)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Observation {
    Pending,
    Target,
    Unknown,
    NotFoundPending,
}

/// Successful outcome of a wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Convergence {
    /// Target state that satisfied the wait.
    pub state: String,
    /// Number of refresh calls made.
    pub polls: u32,
    pub elapsed: Duration,
}

/// Poll `refresh` until `spec` is satisfied.
///
/// `refresh` is never invoked concurrently with itself: the next poll is
/// scheduled only after the previous one returned. Once `cancel` fires or
/// the timeout elapses no further refresh is started, and one in flight is
/// abandoned.
pub async fn await_convergence<F, Fut>(
    mut refresh: F,
    spec: &ConvergenceSpec,
    mut cancel: Cancellation,
) -> Result<Convergence, PollError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<String, OpsError>>,
{
    let start = Instant::now();
    let deadline = start + spec.timeout;
    let required = spec.consecutive_targets.max(1);

    let mut last_state: Option<String> = None;
    let mut targets_seen = 0u32;
    let mut not_found_seen = 0u32;
    let mut polls = 0u32;
    let mut backoff = INITIAL_BACKOFF;
    let mut wait = spec.delay;

    loop {
        let next_poll = Instant::now() + wait;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PollError::Cancelled { last_state }),
            _ = sleep_until(deadline) => {
                return Err(PollError::Timeout { timeout: spec.timeout, last_state });
            }
            _ = sleep_until(next_poll) => {}
        }

        polls += 1;
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PollError::Cancelled { last_state }),
            _ = sleep_until(deadline) => {
                return Err(PollError::Timeout { timeout: spec.timeout, last_state });
            }
            result = refresh() => result,
        };

        let (observation, state) = match result {
            Ok(state) => (spec.classify(&state), state),
            Err(e) if e.is_not_found() => match spec.not_found {
                NotFound::Target => (Observation::Target, NOT_FOUND_STATE.to_string()),
                NotFound::Pending => (Observation::NotFoundPending, NOT_FOUND_STATE.to_string()),
                NotFound::Fatal => return Err(PollError::Refresh { last_state, source: e }),
            },
            Err(e) => return Err(PollError::Refresh { last_state, source: e }),
        };

        match observation {
            Observation::Target => {
                targets_seen += 1;
                not_found_seen = 0;
                debug!(
                    "Observed target state {} ({}/{})",
                    state, targets_seen, required
                );
                if targets_seen >= required {
                    return Ok(Convergence {
                        state,
                        polls,
                        elapsed: start.elapsed(),
                    });
                }
            }
            Observation::Pending => {
                targets_seen = 0;
                not_found_seen = 0;
                debug!("Observed pending state {}", state);
            }
            Observation::NotFoundPending => {
                targets_seen = 0;
                not_found_seen += 1;
                debug!("Resource not found yet ({} consecutive)", not_found_seen);
                if spec.not_found_checks > 0 && not_found_seen > spec.not_found_checks {
                    return Err(PollError::NotFoundExhausted {
                        checks: spec.not_found_checks,
                    });
                }
            }
            Observation::Unknown => {
                targets_seen = 0;
                warn!("Observed unexpected state {}, still waiting", state);
            }
        }

        last_state = Some(state);
        wait = spec.interval(backoff);
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::cancellation;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Refresh stub replaying a script; the last entry repeats forever.
    #[derive(Clone)]
    struct Script {
        steps: Arc<Mutex<VecDeque<Result<String, OpsError>>>>,
        calls: Arc<Mutex<u32>>,
    }

    impl Script {
        fn new(steps: Vec<Result<&str, OpsError>>) -> Self {
            let steps = steps.into_iter().map(|s| s.map(str::to_string)).collect();
            Self {
                steps: Arc::new(Mutex::new(steps)),
                calls: Arc::new(Mutex::new(0)),
            }
        }

        fn refresh(
            &self,
        ) -> impl FnMut() -> futures::future::Ready<Result<String, OpsError>> + use<> {
            let script = self.clone();
            move || {
                *script.calls.lock().unwrap() += 1;
                let mut steps = script.steps.lock().unwrap();
                let step = if steps.len() > 1 {
                    steps.pop_front().unwrap()
                } else {
                    steps.front().cloned().unwrap()
                };
                futures::future::ready(step)
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    fn spec() -> ConvergenceSpec {
        ConvergenceSpec::new(["Provisioning"], ["Ready"]).with_min_interval(Duration::from_secs(1))
    }

    #[tokio::test(start_paused = true)]
    async fn test_converges_on_target() {
        let script = Script::new(vec![Ok("Provisioning"), Ok("Provisioning"), Ok("Ready")]);
        let done = await_convergence(script.refresh(), &spec(), Cancellation::never())
            .await
            .unwrap();
        assert_eq!(done.state, "Ready");
        assert_eq!(done.polls, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_requires_consecutive_targets() {
        let script = Script::new(vec![Ok("Ready"), Ok("Provisioning"), Ok("Ready")]);
        let spec = spec().with_consecutive_targets(2);

        let done = await_convergence(script.refresh(), &spec, Cancellation::never())
            .await
            .unwrap();
        // Ready, Provisioning (reset), Ready, Ready
        assert_eq!(done.polls, 4);
        assert_eq!(script.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_names_last_state() {
        let script = Script::new(vec![Ok("Provisioning")]);
        let spec = spec()
            .with_min_interval(Duration::from_secs(3))
            .with_timeout(Duration::from_secs(10));

        let start = Instant::now();
        let err = await_convergence(script.refresh(), &spec, Cancellation::never())
            .await
            .unwrap_err();
        let elapsed = start.elapsed();

        assert_eq!(
            err,
            PollError::Timeout {
                timeout: Duration::from_secs(10),
                last_state: Some("Provisioning".to_string()),
            }
        );
        assert!(elapsed <= spec.timeout + spec.min_interval);
        assert!(elapsed >= spec.timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_error_is_fatal() {
        let script = Script::new(vec![
            Ok("Provisioning"),
            Err(OpsError::Remote("boom".to_string())),
        ]);
        let err = await_convergence(script.refresh(), &spec(), Cancellation::never())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            PollError::Refresh {
                last_state: Some("Provisioning".to_string()),
                source: OpsError::Remote("boom".to_string()),
            }
        );
        assert_eq!(script.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_disposition() {
        let steps = || {
            vec![
                Err(OpsError::NotFound("r".to_string())),
                Ok("Provisioning"),
                Ok("Ready"),
            ]
        };

        let fatal = await_convergence(Script::new(steps()).refresh(), &spec(), Cancellation::never())
            .await
            .unwrap_err();
        assert!(matches!(fatal, PollError::Refresh { source: OpsError::NotFound(_), .. }));

        let pending = spec().with_not_found(NotFound::Pending);
        let done = await_convergence(Script::new(steps()).refresh(), &pending, Cancellation::never())
            .await
            .unwrap();
        assert_eq!(done.state, "Ready");
        assert_eq!(done.polls, 3);

        let gone = ConvergenceSpec::for_delete(["Deleting"]).with_min_interval(Duration::from_secs(1));
        let script = Script::new(vec![Ok("Deleting"), Err(OpsError::NotFound("r".to_string()))]);
        let done = await_convergence(script.refresh(), &gone, Cancellation::never())
            .await
            .unwrap();
        assert_eq!(done.state, NOT_FOUND_STATE);
        assert_eq!(done.polls, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_checks_exhausted() {
        let script = Script::new(vec![Err(OpsError::NotFound("r".to_string()))]);
        let spec = spec()
            .with_not_found(NotFound::Pending)
            .with_not_found_checks(3);
        let err = await_convergence(script.refresh(), &spec, Cancellation::never())
            .await
            .unwrap_err();
        assert_eq!(err, PollError::NotFoundExhausted { checks: 3 });
        assert_eq!(script.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_state_keeps_not_found_count() {
        let missing = || Err(OpsError::NotFound("r".to_string()));
        let script = Script::new(vec![missing(), missing(), Ok("Migrating"), missing()]);
        let spec = spec()
            .with_not_found(NotFound::Pending)
            .with_not_found_checks(2);
        let err = await_convergence(script.refresh(), &spec, Cancellation::never())
            .await
            .unwrap_err();
        assert_eq!(err, PollError::NotFoundExhausted { checks: 2 });
        assert_eq!(script.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_consecutive_targets_means_one() {
        let script = Script::new(vec![Ok("Provisioning"), Ok("Ready")]);
        let spec = spec().with_consecutive_targets(0);
        let done = await_convergence(script.refresh(), &spec, Cancellation::never())
            .await
            .unwrap();
        assert_eq!(done.state, "Ready");
        assert_eq!(done.polls, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_state_keeps_polling() {
        let script = Script::new(vec![Ok("Ready"), Ok("Migrating"), Ok("Ready"), Ok("Ready")]);
        let spec = spec().with_consecutive_targets(2);
        let done = await_convergence(script.refresh(), &spec, Cancellation::never())
            .await
            .unwrap();
        assert_eq!(done.polls, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_polling() {
        let script = Script::new(vec![Ok("Provisioning")]);
        let (handle, cancel) = cancellation();
        let spec = spec().with_min_interval(Duration::from_secs(2));

        let refresh = script.refresh();
        let task = tokio::spawn(async move { await_convergence(refresh, &spec, cancel).await });

        tokio::time::sleep(Duration::from_secs(5)).await;
        handle.cancel();
        let err = task.await.unwrap().unwrap_err();
        assert_eq!(
            err,
            PollError::Cancelled {
                last_state: Some("Provisioning".to_string())
            }
        );

        let calls = script.calls();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(script.calls(), calls);
    }

    #[test]
    fn test_interval_floor_and_backoff() {
        let spec = ConvergenceSpec::new(["a"], ["b"]).with_min_interval(Duration::from_millis(250));
        assert_eq!(spec.interval(INITIAL_BACKOFF), Duration::from_millis(250));
        assert_eq!(spec.interval(MAX_BACKOFF), MAX_BACKOFF);

        let fixed = spec.clone().with_poll_interval(Duration::from_secs(1));
        assert_eq!(fixed.interval(MAX_BACKOFF), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_before_first_poll() {
        let script = Script::new(vec![Ok("Ready")]);
        let spec = spec().with_delay(Duration::from_secs(7));
        let done = await_convergence(script.refresh(), &spec, Cancellation::never())
            .await
            .unwrap();
        assert!(done.elapsed >= Duration::from_secs(7));
        assert_eq!(done.polls, 1);
    }
}
