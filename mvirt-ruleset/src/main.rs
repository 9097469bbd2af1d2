//! mvirt-ruleset: reconcile a firewall rule collection against a desired file.
//!
//! The remote collection is emulated by a JSON state file:
//! - Loads the desired rules and the current state
//! - Prints the plan, or applies it with every change running concurrently
//! - Writes the resulting state back, including partially applied passes

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mvirt_ruleset::memory::{STATE_DELETING, STATE_PROVISIONING, STATE_READY, STATE_UPDATING};
use mvirt_ruleset::{
    cancellation, manifest, ConvergenceSpec, FirewallRule, MemoryRuleOps, ReconcileError,
    ReconcileOptions, RuleSetReconciler,
};

/// mvirt firewall rule-set reconciler
#[derive(Parser, Debug)]
#[command(name = "mvirt-ruleset", version, about)]
struct Args {
    /// Desired rules (JSON)
    #[arg(long)]
    desired: PathBuf,

    /// Current rule collection (JSON), created if missing
    #[arg(long)]
    state: PathBuf,

    /// Only print the plan, change nothing
    #[arg(long)]
    plan: bool,

    /// Overall timeout for the pass in seconds
    #[arg(long, default_value = "1800")]
    timeout_secs: u64,

    /// Minimum spacing between two state polls in milliseconds
    #[arg(long, default_value = "500")]
    min_interval_ms: u64,

    /// Fixed poll spacing in milliseconds (exponential backoff if unset)
    #[arg(long)]
    poll_interval_ms: Option<u64>,

    /// Target observations required in a row before a change counts as settled
    #[arg(long, default_value = "1")]
    consecutive_targets: u32,

    /// Transitional polls the emulated backend reports before settling
    #[arg(long, default_value = "0")]
    settle_polls: u32,
}

impl Args {
    fn options(&self) -> ReconcileOptions {
        let tune = |spec: ConvergenceSpec| {
            let spec = spec
                .with_min_interval(Duration::from_millis(self.min_interval_ms))
                .with_consecutive_targets(self.consecutive_targets);
            match self.poll_interval_ms {
                Some(ms) => spec.with_poll_interval(Duration::from_millis(ms)),
                None => spec,
            }
        };

        ReconcileOptions {
            create: tune(ConvergenceSpec::for_create(
                [STATE_PROVISIONING, STATE_UPDATING],
                [STATE_READY],
            )),
            update: tune(ConvergenceSpec::new(
                [STATE_PROVISIONING, STATE_UPDATING],
                [STATE_READY],
            )),
            delete: tune(ConvergenceSpec::for_delete([STATE_DELETING])),
            timeout: Some(Duration::from_secs(self.timeout_secs)),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mvirt_ruleset=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let desired =
        manifest::load_rules(&args.desired, false).context("Failed to load desired rules")?;
    let current = manifest::load_rules(&args.state, true).context("Failed to load state")?;
    info!(
        "Loaded {} desired rules, {} current rules",
        desired.len(),
        current.len()
    );

    let ops = MemoryRuleOps::<FirewallRule>::new(current.into_map())
        .with_settle_polls(args.settle_polls);
    let reconciler = RuleSetReconciler::<FirewallRule>::new(Arc::new(ops.clone()))
        .with_options(args.options());

    if args.plan {
        let diff = reconciler.plan(&desired).await?;
        println!("{}", serde_json::to_string_pretty(&diff)?);
        return Ok(());
    }

    let (cancel_handle, cancel) = cancellation();
    let ctrl_c = tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("Received SIGINT, cancelling reconciliation");
            cancel_handle.cancel();
        }
    });

    let outcome = reconciler.reconcile(&desired, cancel).await;
    ctrl_c.abort();

    // Persist whatever was applied, also after a partial failure
    manifest::save_rules(&args.state, &ops.snapshot()).context("Failed to write state")?;

    match outcome {
        Ok(result) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Err(ReconcileError::Partial(e)) => {
            println!("{}", serde_json::to_string_pretty(&e.applied)?);
            for failure in &e.failures {
                error!("{}", failure);
            }
            Err(ReconcileError::Partial(e).into())
        }
        Err(e) => Err(e.into()),
    }
}
