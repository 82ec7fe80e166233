use std::collections::BTreeMap;

use chrono::{NaiveDate, Utc};
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use crate::error::Result;
use crate::types::now_ms;

/// Scenario routing table: scenario_type → (rate column, points column) on
/// daily_market_updates. Column identifiers come only from this table —
/// never from request input — and both the write path and the report read
/// path consult it. An unknown scenario type resolves to nothing and the
/// write is a no-op.
const SCENARIO_FIELDS: &[(&str, &str, &str)] = &[
    ("30yr_fixed", "rate_30yr_fixed", "points_30yr_fixed"),
    ("30yr_fixed_95ltv", "rate_30yr_fixed_95ltv", "points_30yr_fixed_95ltv"),
    ("20yr_fixed", "rate_20yr_fixed", "points_20yr_fixed"),
    ("15yr_fixed", "rate_15yr_fixed", "points_15yr_fixed"),
    ("30yr_fha", "rate_30yr_fha", "points_30yr_fha"),
    ("30yr_va", "rate_30yr_va", "points_30yr_va"),
    ("30yr_jumbo", "rate_30yr_jumbo", "points_30yr_jumbo"),
    ("7yr_arm", "rate_7yr_arm", "points_7yr_arm"),
];

pub fn resolve_scenario(scenario_type: &str) -> Option<(&'static str, &'static str)> {
    SCENARIO_FIELDS
        .iter()
        .find(|(name, _, _)| *name == scenario_type)
        .map(|(_, rate_col, points_col)| (*rate_col, *points_col))
}

/// Latest rate/points pair for one scenario on a day's summary row.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioQuote {
    pub rate: Option<f64>,
    pub points: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DailySummary {
    pub date: String,
    pub updated_at: Option<i64>,
    pub scenarios: BTreeMap<String, ScenarioQuote>,
}

/// Upserts completed scenario results into the per-day summary row.
#[derive(Clone)]
pub struct DailyAggregator {
    pool: SqlitePool,
}

impl DailyAggregator {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Route a completed run's results into today's row (UTC).
    /// Returns whether a write happened (false for unknown scenario types).
    pub async fn record(
        &self,
        scenario_type: &str,
        rate: f64,
        points: Option<f64>,
    ) -> Result<bool> {
        self.record_for_date(Utc::now().date_naive(), scenario_type, rate, points)
            .await
    }

    pub async fn record_for_date(
        &self,
        date: NaiveDate,
        scenario_type: &str,
        rate: f64,
        points: Option<f64>,
    ) -> Result<bool> {
        let Some((rate_col, points_col)) = resolve_scenario(scenario_type) else {
            debug!(scenario_type, "Unknown scenario type — skipping daily update");
            return Ok(false);
        };

        let date = date.format("%Y-%m-%d").to_string();
        let sql = format!(
            "INSERT INTO daily_market_updates (date, {rate_col}, {points_col}, updated_at) \
             VALUES (?, ?, ?, ?) \
             ON CONFLICT(date) DO UPDATE SET \
                 {rate_col} = excluded.{rate_col}, \
                 {points_col} = excluded.{points_col}, \
                 updated_at = excluded.updated_at"
        );
        sqlx::query(&sql)
            .bind(&date)
            .bind(rate)
            .bind(points)
            .bind(now_ms())
            .execute(&self.pool)
            .await?;

        info!(scenario_type, rate, points, date = %date, "Daily market update recorded");
        Ok(true)
    }

    /// Today's summary row as a scenario map; empty when nothing has been
    /// recorded yet. Only scenarios with at least one value are included.
    pub async fn today(&self) -> Result<DailySummary> {
        self.summary_for_date(Utc::now().date_naive()).await
    }

    pub async fn summary_for_date(&self, date: NaiveDate) -> Result<DailySummary> {
        let date = date.format("%Y-%m-%d").to_string();
        let row = sqlx::query("SELECT * FROM daily_market_updates WHERE date = ?")
            .bind(&date)
            .fetch_optional(&self.pool)
            .await?;

        let mut summary = DailySummary {
            date,
            updated_at: None,
            scenarios: BTreeMap::new(),
        };
        let Some(row) = row else {
            return Ok(summary);
        };

        summary.updated_at = row.try_get("updated_at")?;
        for (name, rate_col, points_col) in SCENARIO_FIELDS {
            let rate: Option<f64> = row.try_get(*rate_col)?;
            let points: Option<f64> = row.try_get(*points_col)?;
            if rate.is_some() || points.is_some() {
                summary
                    .scenarios
                    .insert(name.to_string(), ScenarioQuote { rate, points });
            }
        }
        Ok(summary)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_aggregator() -> DailyAggregator {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        DailyAggregator::new(pool)
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 8, 6).unwrap()
    }

    #[tokio::test]
    async fn known_scenario_writes_exactly_its_two_fields() {
        let agg = test_aggregator().await;
        let written = agg
            .record_for_date(day(), "30yr_fixed", 6.125, Some(0.5))
            .await
            .unwrap();
        assert!(written);

        let summary = agg.summary_for_date(day()).await.unwrap();
        assert_eq!(summary.scenarios.len(), 1);
        let quote = &summary.scenarios["30yr_fixed"];
        assert_eq!(quote.rate, Some(6.125));
        assert_eq!(quote.points, Some(0.5));
        assert!(summary.updated_at.is_some());
    }

    #[tokio::test]
    async fn scenarios_on_the_same_day_do_not_interfere() {
        let agg = test_aggregator().await;
        agg.record_for_date(day(), "30yr_fixed", 6.125, Some(0.5))
            .await
            .unwrap();
        agg.record_for_date(day(), "15yr_fixed", 5.5, Some(0.25))
            .await
            .unwrap();

        let summary = agg.summary_for_date(day()).await.unwrap();
        assert_eq!(summary.scenarios.len(), 2);
        assert_eq!(summary.scenarios["30yr_fixed"].rate, Some(6.125));
        assert_eq!(summary.scenarios["15yr_fixed"].rate, Some(5.5));
    }

    #[tokio::test]
    async fn repeat_write_updates_in_place() {
        let agg = test_aggregator().await;
        agg.record_for_date(day(), "30yr_va", 6.0, Some(1.0))
            .await
            .unwrap();
        agg.record_for_date(day(), "30yr_va", 5.875, None)
            .await
            .unwrap();

        let summary = agg.summary_for_date(day()).await.unwrap();
        let quote = &summary.scenarios["30yr_va"];
        assert_eq!(quote.rate, Some(5.875));
        // Absent points on the later write is stored as unset.
        assert_eq!(quote.points, None);
    }

    #[tokio::test]
    async fn unknown_scenario_is_a_no_op() {
        let agg = test_aggregator().await;
        let written = agg
            .record_for_date(day(), "40yr_balloon", 9.9, None)
            .await
            .unwrap();
        assert!(!written);

        let summary = agg.summary_for_date(day()).await.unwrap();
        assert!(summary.scenarios.is_empty());
        assert!(summary.updated_at.is_none());
    }

    #[tokio::test]
    async fn different_days_get_separate_rows() {
        let agg = test_aggregator().await;
        let other = NaiveDate::from_ymd_opt(2026, 8, 7).unwrap();
        agg.record_for_date(day(), "30yr_fixed", 6.125, None)
            .await
            .unwrap();
        agg.record_for_date(other, "30yr_fixed", 6.25, None)
            .await
            .unwrap();

        assert_eq!(
            agg.summary_for_date(day()).await.unwrap().scenarios["30yr_fixed"].rate,
            Some(6.125)
        );
        assert_eq!(
            agg.summary_for_date(other).await.unwrap().scenarios["30yr_fixed"].rate,
            Some(6.25)
        );
    }

    #[test]
    fn routing_is_total_over_known_scenarios() {
        for (name, rate_col, points_col) in SCENARIO_FIELDS {
            let (r, p) = resolve_scenario(name).unwrap();
            assert_eq!(r, *rate_col);
            assert_eq!(p, *points_col);
        }
        assert!(resolve_scenario("").is_none());
    }
}
