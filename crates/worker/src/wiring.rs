use orderflow::config::Config;
use orderflow::fetch::{HttpInvoiceSource, InvoiceSource, RemoteResourceFetcher};
use orderflow::notify::{Notifier, SmtpMailer};
use orderflow::render::{ArtifactRenderer, WkhtmltopdfBackend};
use orderflow::store::{ArtifactStore, OrdersRepo};
use sqlx::PgPool;
use std::sync::Arc;

/// Build the notification pipeline against the real services.
pub fn build_notifier(cfg: &Config, pool: PgPool) -> anyhow::Result<Notifier> {
    let client = reqwest::Client::builder()
        .user_agent(concat!("orderflow-worker/", env!("CARGO_PKG_VERSION")))
        .build()?;

    let fetcher = RemoteResourceFetcher::new(client, cfg.invoice.auth.clone());
    let source: Arc<dyn InvoiceSource> = Arc::new(HttpInvoiceSource::new(
        fetcher,
        cfg.invoice.base_url.clone(),
        cfg.invoice.format,
    ));

    let renderer = ArtifactRenderer::new(Arc::new(WkhtmltopdfBackend::new(
        cfg.renderer.wkhtmltopdf_path.clone(),
    )));

    let artifacts = ArtifactStore::new(
        Arc::new(OrdersRepo::new(pool)),
        source.clone(),
        renderer,
        cfg.archive_root.clone(),
        cfg.fetch,
    );

    let mailer = Arc::new(SmtpMailer::new(&cfg.smtp)?);

    Ok(Notifier::new(
        artifacts,
        source,
        mailer,
        cfg.body_fetch,
        cfg.tracking.clone(),
    ))
}
