use crate::fetch::{FetchError, FetchPolicy, InvoiceSource};
use crate::invoice::InvoiceDocument;
use crate::render::{ArtifactRenderer, RenderError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// The slice of an order record this worker reads and writes.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Order {
    pub order_id: String,
    pub order_date: Option<DateTime<Utc>>,
    pub invoice_path: Option<String>,
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn find_order(&self, order_id: &str) -> anyhow::Result<Option<Order>>;

    /// Record `path` as the order's invoice. Either the update commits or the
    /// order is left as it was.
    async fn record_invoice_path(&self, order_id: &str, path: &str) -> anyhow::Result<()>;
}

#[derive(Clone)]
pub struct OrdersRepo {
    pool: PgPool,
}

impl OrdersRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OrderStore for OrdersRepo {
    async fn find_order(&self, order_id: &str) -> anyhow::Result<Option<Order>> {
        let order = sqlx::query_as::<_, Order>(
            r#"
            SELECT order_id, order_date, invoice_path
            FROM orders
            WHERE order_id = $1
            "#,
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(order)
    }

    async fn record_invoice_path(&self, order_id: &str, path: &str) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE orders
            SET invoice_path = $2
            WHERE order_id = $1
            "#,
        )
        .bind(order_id)
        .bind(path)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated != 1 {
            tx.rollback().await?;
            anyhow::bail!("order {order_id} disappeared before its invoice path was recorded");
        }

        tx.commit().await?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("order {0} not found")]
    OrderNotFound(String),

    #[error("order id {0:?} cannot be used in an archive path")]
    InvalidOrderId(String),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error("writing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("order store: {0:#}")]
    Database(anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct Artifact {
    pub path: PathBuf,
    /// The document the PDF was rendered from, when it was rendered just now.
    /// `None` on a cache hit.
    pub document: Option<InvoiceDocument>,
}

/// Produces an order's invoice PDF at most once and remembers where it is.
#[derive(Clone)]
pub struct ArtifactStore {
    orders: Arc<dyn OrderStore>,
    source: Arc<dyn InvoiceSource>,
    renderer: ArtifactRenderer,
    archive_root: PathBuf,
    fetch_policy: FetchPolicy,
}

impl ArtifactStore {
    pub fn new(
        orders: Arc<dyn OrderStore>,
        source: Arc<dyn InvoiceSource>,
        renderer: ArtifactRenderer,
        archive_root: impl Into<PathBuf>,
        fetch_policy: FetchPolicy,
    ) -> Self {
        Self {
            orders,
            source,
            renderer,
            archive_root: archive_root.into(),
            fetch_policy,
        }
    }

    /// Return the order's invoice, generating it when there is none yet or
    /// the recorded file is gone.
    ///
    /// On any failure the order's `invoice_path` is left untouched.
    pub async fn ensure_artifact(
        &self,
        order_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Artifact, ArtifactError> {
        validate_order_id(order_id)?;

        let order = self
            .orders
            .find_order(order_id)
            .await
            .map_err(ArtifactError::Database)?
            .ok_or_else(|| ArtifactError::OrderNotFound(order_id.to_string()))?;

        if let Some(path) = reusable_path(&order).await {
            debug!(order_id, path = %path.display(), "reusing existing invoice");
            return Ok(Artifact {
                path,
                document: None,
            });
        }

        info!(order_id, "invoice missing, generating");

        let document = self
            .source
            .fetch_invoice(order_id, &self.fetch_policy, cancel)
            .await?;
        let pdf = self.renderer.render(&document).await?;

        let order_date = order.order_date.unwrap_or_else(Utc::now);
        let path = artifact_path(&self.archive_root, order_id, order_date);
        write_atomically(&path, &pdf).await?;

        self.orders
            .record_invoice_path(order_id, &path.to_string_lossy())
            .await
            .map_err(ArtifactError::Database)?;

        info!(order_id, path = %path.display(), bytes = pdf.len(), "invoice saved");
        Ok(Artifact {
            path,
            document: Some(document),
        })
    }
}

/// `{root}/{YYYY}/{MM}/INV-{order_id}.pdf`
pub fn artifact_path(root: &Path, order_id: &str, order_date: DateTime<Utc>) -> PathBuf {
    root.join(order_date.format("%Y").to_string())
        .join(order_date.format("%m").to_string())
        .join(format!("INV-{order_id}.pdf"))
}

fn validate_order_id(order_id: &str) -> Result<(), ArtifactError> {
    let bad = order_id.trim().is_empty()
        || order_id.contains(['/', '\\'])
        || order_id.contains("..")
        || order_id.chars().any(char::is_control);
    if bad {
        return Err(ArtifactError::InvalidOrderId(order_id.to_string()));
    }
    Ok(())
}

async fn reusable_path(order: &Order) -> Option<PathBuf> {
    let recorded = order.invoice_path.as_deref()?;
    let path = PathBuf::from(recorded);
    match tokio::fs::metadata(&path).await {
        Ok(meta) if meta.is_file() && meta.len() > 0 => Some(path),
        Ok(_) => {
            warn!(order_id = %order.order_id, path = %path.display(), "recorded invoice is empty, regenerating");
            None
        }
        Err(_) => {
            warn!(order_id = %order.order_id, path = %path.display(), "recorded invoice is missing, regenerating");
            None
        }
    }
}

// Write next to the destination and rename, so the final path only ever holds
// a complete PDF. Each writer gets its own temp name; concurrent writers for
// one order each publish a whole file and the last rename wins.
async fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), ArtifactError> {
    let io_err = |source| ArtifactError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await.map_err(io_err)?;
    }

    let tmp = path.with_extension(format!("pdf.{}.partial", Uuid::new_v4().simple()));
    if let Err(e) = tokio::fs::write(&tmp, bytes).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(io_err(e));
    }
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(io_err(e));
    }
    Ok(())
}
