mod aggregator;
mod api;
mod config;
mod db;
mod dispatcher;
mod error;
mod executor;
mod types;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::aggregator::DailyAggregator;
use crate::api::routes::{router, ApiState};
use crate::config::Config;
use crate::db::RunStore;
use crate::dispatcher::{DispatchLoop, Dispatcher};
use crate::error::Result;
use crate::executor::ExecutorClient;

#[tokio::main]
async fn main() {
    let cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.log_level))
        .init();

    if let Err(e) = run(cfg).await {
        error!("Fatal error: {e}");
        std::process::exit(1);
    }
}

async fn run(cfg: Config) -> Result<()> {
    // --- Database setup ---
    let pool = sqlx::SqlitePool::connect(&format!("sqlite:{}?mode=rwc", cfg.db_path)).await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database ready at {}", cfg.db_path);

    let store = RunStore::new(pool.clone());
    let executor = ExecutorClient::new(cfg.executor_url.clone())?;
    let dispatcher = Dispatcher::new(store.clone(), executor);
    let aggregator = DailyAggregator::new(pool.clone());

    // --- Dispatch loop (background, stands in for an external cron) ---
    let loop_task = DispatchLoop::new(dispatcher.clone(), cfg.dispatch_interval_secs);
    tokio::spawn(async move { loop_task.run().await });
    info!(
        "Dispatch loop started (every {}s, executor at {})",
        cfg.dispatch_interval_secs, cfg.executor_url
    );

    // --- HTTP API server ---
    let api_state = ApiState { store, dispatcher, aggregator };
    let app = router(api_state);
    let bind_addr = format!("0.0.0.0:{}", cfg.api_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("HTTP API listening on {bind_addr}");

    axum::serve(listener, app).await?;

    Ok(())
}
