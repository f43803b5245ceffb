use orderflow::config::Config;
use orderflow::db;
use orderflow::jobs::{JobRunner, JobsRepo};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod wiring;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = Config::from_env()?;

    info!(
        worker_id = %cfg.runner.worker_id,
        mode = ?cfg.runner.mode,
        finalize = ?cfg.runner.finalize,
        invoice_base_url = %cfg.invoice.base_url,
        archive_root = %cfg.archive_root.display(),
        migrate_on_startup = cfg.migrate_on_startup,
        "orderflow worker starting"
    );

    let pool = db::make_pool(&cfg.database_url, cfg.db_max_connections).await?;
    if cfg.migrate_on_startup {
        db::run_migrations(&pool).await?;
    }

    let notifier = wiring::build_notifier(&cfg, pool.clone())?;
    let runner = JobRunner::new(
        Arc::new(JobsRepo::new(pool)),
        Arc::new(notifier),
        cfg.runner.clone(),
    );

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown requested, finishing current job");
                shutdown.cancel();
            }
        });
    }

    match runner.run(&shutdown).await {
        Ok(summary) => {
            info!(
                processed = summary.processed(),
                completed = summary.completed,
                retrying = summary.retrying,
                dead_lettered = summary.dead_lettered,
                dropped = summary.dropped,
                released = summary.released,
                "orderflow worker exited"
            );
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "orderflow worker stopped");
            Err(e.into())
        }
    }
}
