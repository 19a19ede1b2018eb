use std::sync::Arc;

use anyhow::Context;
use tracing::{info, info_span};

use salesagg::aggregate::CsvAggregator;
use salesagg::config::Config;
use salesagg::processor::{WorkerContext, WorkerPool};
use salesagg::service::JobService;
use salesagg::telemetry::init_tracing;
use salesagg::web::{start_web_server, AppState};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = Config::from_env().context("failed to load configuration")?;

    for dir in [&config.upload_dir, &config.output_dir] {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("failed to create directory {}", dir.display()))?;
    }

    let service = Arc::new(JobService::new(config.output_dir.clone()));

    let context = WorkerContext {
        service: service.clone(),
        aggregator: Arc::new(CsvAggregator::new(config.batch_rows)),
        retry: config.retry,
        required_columns: config.required_columns.clone().into(),
    };

    let pool_span = info_span!("pool");
    let pool = WorkerPool::spawn(config.workers, context, &pool_span);
    info!(workers = config.workers, "all workers launched");

    let state = AppState {
        service: service.clone(),
        upload_dir: config.upload_dir.clone(),
    };

    start_web_server(state, config.port)
        .await
        .context("web server failed")?;

    info!(backlog = service.queue().pending(), "server stopped, draining queue");
    service.queue().close();
    pool.join().await;

    Ok(())
}
