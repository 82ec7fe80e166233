/// Database row types for the orchestrator schema.
/// Used by sqlx for typed queries.

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PricingRunRow {
    pub id: String,
    pub status: String,
    pub scenario_type: Option<String>,
    pub retry_count: i64,
    /// Millisecond epoch; drives FIFO ordering, falling back to created_at.
    pub queued_at: Option<i64>,
    pub created_at: i64,
    pub completed_at: Option<i64>,
    pub results_json: Option<String>,
    pub error_message: Option<String>,
}

/// Aggregate queue counts surfaced by /health.
#[derive(Debug, Clone, serde::Serialize)]
pub struct QueueCounts {
    pub queued: i64,
    pub running: i64,
    /// Runs that exhausted the retry bound — permanently out of dispatch,
    /// waiting on a human to notice.
    pub failed_exhausted: i64,
}
