use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

// ---------------------------------------------------------------------------
// Run status
// ---------------------------------------------------------------------------

/// Lifecycle states of a pricing run. Stored as lowercase strings in SQLite;
/// `failed` is re-enterable by the dispatcher while the retry bound holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Run results
// ---------------------------------------------------------------------------

/// Completion payload persisted to results_json. Fields keep the executor's
/// raw representation (string or number); absent fields are omitted rather
/// than written as nulls.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunResults {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discount_points: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot_1: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot_2: Option<String>,
}

impl RunResults {
    pub fn is_empty(&self) -> bool {
        self.rate.is_none()
            && self.discount_points.is_none()
            && self.screenshot_1.is_none()
            && self.screenshot_2.is_none()
    }
}

/// The executor reports numeric fields loosely — "6.125" or 6.125 both occur.
pub fn parse_decimal(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                None
            } else {
                s.parse::<f64>().ok()
            }
        }
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Dispatch report
// ---------------------------------------------------------------------------

/// Outcome of one dispatcher invocation, returned to the scheduler or the
/// manual trigger endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchReport {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scenario_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_attempt: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_run_id: Option<String>,
}

impl DispatchReport {
    pub fn started(run_id: String, scenario_type: Option<String>, retry_attempt: i64) -> Self {
        Self {
            success: true,
            message: format!("started run on attempt {retry_attempt}"),
            run_id: Some(run_id),
            scenario_type,
            retry_attempt: Some(retry_attempt),
            active_run_id: None,
        }
    }

    pub fn still_active(active_run_id: Option<String>) -> Self {
        Self {
            success: true,
            message: "another run still active".to_string(),
            run_id: None,
            scenario_type: None,
            retry_attempt: None,
            active_run_id,
        }
    }

    pub fn queue_empty() -> Self {
        Self {
            success: true,
            message: "no runs in queue".to_string(),
            run_id: None,
            scenario_type: None,
            retry_attempt: None,
            active_run_id: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

/// Millisecond UTC epoch timestamp.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
