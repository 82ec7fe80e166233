use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::config::STUCK_RUN_TIMEOUT_MS;
use crate::db::runs::{ClaimOutcome, RunStore};
use crate::error::Result;
use crate::executor::ExecutorClient;
use crate::types::{now_ms, DispatchReport};

/// Advances queued work into execution, one run at a time.
///
/// Invoked either by the periodic [`DispatchLoop`] or by the manual trigger
/// endpoint; each invocation completes quickly and never waits on the
/// executor's actual pricing work.
#[derive(Clone)]
pub struct Dispatcher {
    store: RunStore,
    executor: ExecutorClient,
}

impl Dispatcher {
    pub fn new(store: RunStore, executor: ExecutorClient) -> Self {
        Self { store, executor }
    }

    /// One dispatch pass:
    /// 1. Reconcile the running slot — a run older than the stuck threshold
    ///    is forced to failed; a younger one ends the pass.
    /// 2. Claim the oldest eligible run (FIFO, retry bound enforced in the
    ///    claim's WHERE clause; the partial unique index arbitrates
    ///    overlapping invocations).
    /// 3. Tell the executor to start. Fire and forget — an invocation
    ///    failure leaves the run running for the stuck check to reap later.
    pub async fn dispatch_once(&self) -> Result<DispatchReport> {
        if let Some(active) = self.store.active_run().await? {
            let age_ms = now_ms() - active.created_at;
            if age_ms > STUCK_RUN_TIMEOUT_MS {
                let message = format!("Timed out after {}s", age_ms / 1000);
                let reaped = self.store.fail_stuck(&active.id, &message).await?;
                if reaped {
                    warn!(
                        run_id = %active.id,
                        age_ms,
                        retry_count = active.retry_count,
                        "Stuck run forced to failed"
                    );
                }
                // Fall through: the freed slot can start the next eligible
                // run in this same pass.
            } else {
                return Ok(DispatchReport::still_active(Some(active.id)));
            }
        }

        let Some(candidate) = self.store.oldest_eligible().await? else {
            return Ok(DispatchReport::queue_empty());
        };

        match self.store.claim(&candidate.id).await? {
            ClaimOutcome::Claimed => {}
            ClaimOutcome::SlotTaken => return Ok(DispatchReport::still_active(None)),
            ClaimOutcome::NotEligible => return Ok(DispatchReport::queue_empty()),
        }

        let attempt = candidate.retry_count + 1;
        self.executor.spawn_start(candidate.id.clone());
        info!(
            run_id = %candidate.id,
            scenario_type = candidate.scenario_type.as_deref().unwrap_or("ad-hoc"),
            attempt,
            "Dispatched pricing run"
        );

        Ok(DispatchReport::started(
            candidate.id,
            candidate.scenario_type,
            attempt,
        ))
    }
}

// ---------------------------------------------------------------------------
// DispatchLoop
// ---------------------------------------------------------------------------

/// Background task that invokes the dispatcher on a fixed interval, standing
/// in for an external cron trigger.
pub struct DispatchLoop {
    dispatcher: Dispatcher,
    interval_secs: u64,
}

impl DispatchLoop {
    pub fn new(dispatcher: Dispatcher, interval_secs: u64) -> Self {
        Self { dispatcher, interval_secs }
    }

    pub async fn run(self) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.interval_secs));
        ticker.tick().await; // consume immediate first tick

        loop {
            ticker.tick().await;
            match self.dispatcher.dispatch_once().await {
                Ok(report) => {
                    if let Some(run_id) = &report.run_id {
                        info!(run_id = %run_id, "Dispatch pass: {}", report.message);
                    } else {
                        debug!("Dispatch pass: {}", report.message);
                    }
                }
                Err(e) => error!("Dispatch pass failed: {e}"),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
