use sqlx::SqlitePool;
use uuid::Uuid;

use crate::config::MAX_DISPATCH_ATTEMPTS;
use crate::db::models::{PricingRunRow, QueueCounts};
use crate::error::Result;
use crate::types::{now_ms, RunResults, RunStatus};

const RUN_COLUMNS: &str = "id, status, scenario_type, retry_count, queued_at, created_at, \
                           completed_at, results_json, error_message";

/// Outcome of an attempt to move a run into the running slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed,
    /// The partial unique index rejected the write — an overlapping
    /// dispatcher invocation already holds the running slot.
    SlotTaken,
    /// The run moved out of the eligible set between selection and claim.
    NotEligible,
}

/// All pricing_runs SQL lives here. Runs are never deleted; terminal rows
/// stay behind as the audit trail.
#[derive(Clone)]
pub struct RunStore {
    pool: SqlitePool,
}

impl RunStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create a queued run. `queued_at` and `created_at` are both stamped
    /// now; the dispatcher picks it up on its next pass.
    pub async fn enqueue(&self, scenario_type: Option<&str>) -> Result<PricingRunRow> {
        let id = Uuid::new_v4().to_string();
        let now = now_ms();

        sqlx::query(
            "INSERT INTO pricing_runs (id, status, scenario_type, retry_count, queued_at, created_at) \
             VALUES (?, ?, ?, 0, ?, ?)",
        )
        .bind(&id)
        .bind(RunStatus::Queued.as_str())
        .bind(scenario_type)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(PricingRunRow {
            id,
            status: RunStatus::Queued.as_str().to_string(),
            scenario_type: scenario_type.map(|s| s.to_string()),
            retry_count: 0,
            queued_at: Some(now),
            created_at: now,
            completed_at: None,
            results_json: None,
            error_message: None,
        })
    }

    pub async fn get(&self, id: &str) -> Result<Option<PricingRunRow>> {
        let row = sqlx::query_as::<_, PricingRunRow>(&format!(
            "SELECT {RUN_COLUMNS} FROM pricing_runs WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// The run currently holding the running slot, most recent first.
    pub async fn active_run(&self) -> Result<Option<PricingRunRow>> {
        let row = sqlx::query_as::<_, PricingRunRow>(&format!(
            "SELECT {RUN_COLUMNS} FROM pricing_runs \
             WHERE status = 'running' \
             ORDER BY created_at DESC \
             LIMIT 1"
        ))
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// The single oldest dispatch-eligible run: queued or failed, retries
    /// remaining, FIFO by queued_at (NULLs last) then created_at.
    pub async fn oldest_eligible(&self) -> Result<Option<PricingRunRow>> {
        let row = sqlx::query_as::<_, PricingRunRow>(&format!(
            "SELECT {RUN_COLUMNS} FROM pricing_runs \
             WHERE status IN ('queued', 'failed') AND retry_count < ? \
             ORDER BY (queued_at IS NULL), queued_at ASC, created_at ASC \
             LIMIT 1"
        ))
        .bind(MAX_DISPATCH_ATTEMPTS)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Move a run into the running slot. Single guarded UPDATE: eligibility
    /// is re-checked in the WHERE clause, the retry counter advances, and a
    /// prior failure's error_message and completed_at are cleared. The
    /// partial unique index on status='running' arbitrates overlapping
    /// dispatcher invocations.
    pub async fn claim(&self, id: &str) -> Result<ClaimOutcome> {
        let result = sqlx::query(
            "UPDATE pricing_runs \
             SET status = 'running', retry_count = retry_count + 1, \
                 error_message = NULL, completed_at = NULL \
             WHERE id = ? AND status IN ('queued', 'failed') AND retry_count < ?",
        )
        .bind(id)
        .bind(MAX_DISPATCH_ATTEMPTS)
        .execute(&self.pool)
        .await;

        match result {
            Ok(r) if r.rows_affected() == 1 => Ok(ClaimOutcome::Claimed),
            Ok(_) => Ok(ClaimOutcome::NotEligible),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Ok(ClaimOutcome::SlotTaken)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Finalize a run from a completion callback. Compare-and-swap on the
    /// non-terminal states: a replayed callback for an already-terminal run
    /// applies nothing, and concurrent deliveries for the same run resolve
    /// to exactly one winner. Returns whether the update applied.
    pub async fn finalize(
        &self,
        id: &str,
        status: RunStatus,
        results: Option<&RunResults>,
        error_message: Option<&str>,
    ) -> Result<bool> {
        let results_json = match results {
            Some(r) => Some(serde_json::to_string(r)?),
            None => None,
        };

        let result = sqlx::query(
            "UPDATE pricing_runs \
             SET status = ?, completed_at = ?, \
                 results_json = COALESCE(?, results_json), \
                 error_message = COALESCE(?, error_message) \
             WHERE id = ? AND status IN ('queued', 'running')",
        )
        .bind(status.as_str())
        .bind(now_ms())
        .bind(results_json)
        .bind(error_message)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Force a stuck run to failed. Guarded on status='running' so a
    /// callback landing between detection and this write wins.
    pub async fn fail_stuck(&self, id: &str, message: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE pricing_runs \
             SET status = 'failed', error_message = ?, completed_at = ? \
             WHERE id = ? AND status = 'running'",
        )
        .bind(message)
        .bind(now_ms())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Recent runs, newest first, optionally filtered by status.
    pub async fn recent(&self, status: Option<&str>, limit: i64) -> Result<Vec<PricingRunRow>> {
        let rows = match status {
            Some(status) => {
                sqlx::query_as::<_, PricingRunRow>(&format!(
                    "SELECT {RUN_COLUMNS} FROM pricing_runs \
                     WHERE status = ? \
                     ORDER BY created_at DESC \
                     LIMIT ?"
                ))
                .bind(status)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, PricingRunRow>(&format!(
                    "SELECT {RUN_COLUMNS} FROM pricing_runs \
                     ORDER BY created_at DESC \
                     LIMIT ?"
                ))
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(rows)
    }

    pub async fn status_counts(&self) -> Result<QueueCounts> {
        let queued: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM pricing_runs WHERE status = 'queued'")
                .fetch_one(&self.pool)
                .await?;
        let running: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM pricing_runs WHERE status = 'running'")
                .fetch_one(&self.pool)
                .await?;
        let failed_exhausted: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM pricing_runs WHERE status = 'failed' AND retry_count >= ?",
        )
        .bind(MAX_DISPATCH_ATTEMPTS)
        .fetch_one(&self.pool)
        .await?;

        Ok(QueueCounts { queued, running, failed_exhausted })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn test_store() -> RunStore {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        RunStore::new(pool)
    }

    #[tokio::test]
    async fn enqueue_creates_queued_run_with_zero_retries() {
        let store = test_store().await;
        let run = store.enqueue(Some("30yr_fixed")).await.unwrap();

        let fetched = store.get(&run.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, "queued");
        assert_eq!(fetched.retry_count, 0);
        assert_eq!(fetched.scenario_type.as_deref(), Some("30yr_fixed"));
        assert!(fetched.queued_at.is_some());
        assert!(fetched.completed_at.is_none());
    }

    #[tokio::test]
    async fn claim_increments_retry_and_clears_failure_fields() {
        let store = test_store().await;
        let run = store.enqueue(None).await.unwrap();

        assert_eq!(store.claim(&run.id).await.unwrap(), ClaimOutcome::Claimed);
        let row = store.get(&run.id).await.unwrap().unwrap();
        assert_eq!(row.status, "running");
        assert_eq!(row.retry_count, 1);

        // Fail it, then re-claim: error_message and completed_at must clear.
        assert!(store.fail_stuck(&run.id, "Timed out after 200s").await.unwrap());
        assert_eq!(store.claim(&run.id).await.unwrap(), ClaimOutcome::Claimed);
        let row = store.get(&run.id).await.unwrap().unwrap();
        assert_eq!(row.status, "running");
        assert_eq!(row.retry_count, 2);
        assert!(row.error_message.is_none());
        assert!(row.completed_at.is_none());
    }

    #[tokio::test]
    async fn claim_rejected_while_another_run_holds_the_slot() {
        let store = test_store().await;
        let first = store.enqueue(None).await.unwrap();
        let second = store.enqueue(None).await.unwrap();

        assert_eq!(store.claim(&first.id).await.unwrap(), ClaimOutcome::Claimed);
        assert_eq!(store.claim(&second.id).await.unwrap(), ClaimOutcome::SlotTaken);

        let row = store.get(&second.id).await.unwrap().unwrap();
        assert_eq!(row.status, "queued");
        assert_eq!(row.retry_count, 0);
    }

    #[tokio::test]
    async fn claim_refuses_exhausted_run() {
        let store = test_store().await;
        let run = store.enqueue(None).await.unwrap();

        for _ in 0..3 {
            assert_eq!(store.claim(&run.id).await.unwrap(), ClaimOutcome::Claimed);
            assert!(store.fail_stuck(&run.id, "Timed out after 181s").await.unwrap());
        }

        // retry_count is now 3 — out of the eligible set for good.
        assert_eq!(store.claim(&run.id).await.unwrap(), ClaimOutcome::NotEligible);
        assert!(store.oldest_eligible().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oldest_eligible_orders_fifo_with_null_queued_at_last() {
        let store = test_store().await;
        let a = store.enqueue(Some("a")).await.unwrap();
        let b = store.enqueue(Some("b")).await.unwrap();
        let c = store.enqueue(Some("c")).await.unwrap();

        // Spread queued_at apart and push one to NULL.
        sqlx::query("UPDATE pricing_runs SET queued_at = 1000 WHERE id = ?")
            .bind(&b.id)
            .execute(store.pool())
            .await
            .unwrap();
        sqlx::query("UPDATE pricing_runs SET queued_at = 2000 WHERE id = ?")
            .bind(&c.id)
            .execute(store.pool())
            .await
            .unwrap();
        sqlx::query("UPDATE pricing_runs SET queued_at = NULL, created_at = 1 WHERE id = ?")
            .bind(&a.id)
            .execute(store.pool())
            .await
            .unwrap();

        // b has the smallest non-null queued_at; a's NULL sorts last despite
        // the oldest created_at.
        let next = store.oldest_eligible().await.unwrap().unwrap();
        assert_eq!(next.id, b.id);

        store.claim(&b.id).await.unwrap();
        store
            .finalize(&b.id, RunStatus::Completed, None, None)
            .await
            .unwrap();
        let next = store.oldest_eligible().await.unwrap().unwrap();
        assert_eq!(next.id, c.id);
    }

    #[tokio::test]
    async fn finalize_is_single_shot() {
        let store = test_store().await;
        let run = store.enqueue(Some("30yr_fixed")).await.unwrap();
        store.claim(&run.id).await.unwrap();

        let results = RunResults {
            rate: Some(json!("6.125")),
            discount_points: Some(json!("0.5")),
            ..Default::default()
        };
        let applied = store
            .finalize(&run.id, RunStatus::Completed, Some(&results), None)
            .await
            .unwrap();
        assert!(applied);

        let row = store.get(&run.id).await.unwrap().unwrap();
        assert_eq!(row.status, "completed");
        assert!(row.completed_at.is_some());
        let stored: serde_json::Value =
            serde_json::from_str(row.results_json.as_deref().unwrap()).unwrap();
        assert_eq!(stored["rate"], json!("6.125"));

        // Replay: terminal run, nothing applies.
        let replay = store
            .finalize(&run.id, RunStatus::Failed, None, Some("late duplicate"))
            .await
            .unwrap();
        assert!(!replay);
        let row = store.get(&run.id).await.unwrap().unwrap();
        assert_eq!(row.status, "completed");
        assert!(row.error_message.is_none());
    }

    #[tokio::test]
    async fn fail_stuck_only_touches_running_runs() {
        let store = test_store().await;
        let run = store.enqueue(None).await.unwrap();

        assert!(!store.fail_stuck(&run.id, "Timed out after 181s").await.unwrap());

        store.claim(&run.id).await.unwrap();
        assert!(store.fail_stuck(&run.id, "Timed out after 181s").await.unwrap());
        let row = store.get(&run.id).await.unwrap().unwrap();
        assert_eq!(row.status, "failed");
        assert_eq!(row.error_message.as_deref(), Some("Timed out after 181s"));
        assert!(row.completed_at.is_some());
    }

    #[tokio::test]
    async fn status_counts_reports_exhausted_failures() {
        let store = test_store().await;
        let dead = store.enqueue(None).await.unwrap();
        store.enqueue(None).await.unwrap();

        for _ in 0..3 {
            store.claim(&dead.id).await.unwrap();
            store.fail_stuck(&dead.id, "Timed out after 181s").await.unwrap();
        }

        let counts = store.status_counts().await.unwrap();
        assert_eq!(counts.queued, 1);
        assert_eq!(counts.running, 0);
        assert_eq!(counts.failed_exhausted, 1);
    }
}
