use std::time::Duration;

use tracing::{error, info};

use crate::config::EXECUTOR_REQUEST_TIMEOUT_SECS;
use crate::error::Result;

/// Client for the external pricing executor. The orchestrator only tells it
/// to start; completion truth arrives out of band through the callback
/// endpoint, never through this request's response.
#[derive(Clone)]
pub struct ExecutorClient {
    client: reqwest::Client,
    url: String,
}

impl ExecutorClient {
    pub fn new(url: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(EXECUTOR_REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| crate::error::AppError::Config(format!("executor client: {e}")))?;
        Ok(Self { client, url })
    }

    /// Fire-and-forget start. An invocation failure is logged and nothing
    /// else — the run stays running and the stuck-run timeout on a later
    /// dispatcher pass is the recovery path.
    pub fn spawn_start(&self, run_id: String) {
        let client = self.client.clone();
        let url = self.url.clone();
        tokio::spawn(async move {
            let payload = serde_json::json!({ "run_id": run_id });
            match client.post(&url).json(&payload).send().await {
                Ok(resp) => {
                    info!(
                        run_id = %run_id,
                        status = %resp.status(),
                        "Executor invocation accepted"
                    );
                }
                Err(e) => {
                    error!(run_id = %run_id, "Executor invocation failed: {e}");
                }
            }
        });
    }
}
