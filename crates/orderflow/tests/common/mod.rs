#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use orderflow::fetch::{FetchError, FetchPolicy, InvoiceSource};
use orderflow::invoice::InvoiceDocument;
use orderflow::jobs::{ErrorCode, Job, JobQueue, JobStatus};
use orderflow::notify::{DeliveryError, Mailer, Notifier, OutgoingEmail, TrackingConfig};
use orderflow::render::{ArtifactRenderer, PdfBackend, RenderError};
use orderflow::store::{ArtifactStore, Order, OrderStore};
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

pub const FAKE_PDF: &[u8] = b"%PDF-1.4 fake invoice";

/// Connects to TEST_DATABASE_URL, migrates and empties the tables.
/// Returns `None` (and the test passes vacuously) when no database is set.
pub async fn setup_db() -> Option<PgPool> {
    let _ = dotenvy::dotenv();

    let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("TEST_DATABASE_URL not set, skipping database test");
        return None;
    };

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .expect("failed to connect to TEST_DATABASE_URL");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("migrations failed");

    sqlx::query("TRUNCATE TABLE tasks, orders RESTART IDENTITY")
        .execute(&pool)
        .await
        .expect("truncate failed");

    Some(pool)
}

pub fn quick_policy() -> FetchPolicy {
    FetchPolicy {
        timeout: Duration::from_secs(1),
        poll_interval: Duration::ZERO,
        max_attempts: 1,
    }
}

// ----------------------------
// Orders
// ----------------------------

#[derive(Default)]
pub struct MemoryOrders {
    rows: Mutex<HashMap<String, Order>>,
    refuse_updates: Mutex<bool>,
}

impl MemoryOrders {
    /// Make every `record_invoice_path` fail, as a lost connection would.
    pub fn refuse_updates(&self) {
        *self.refuse_updates.lock().unwrap() = true;
    }

    pub fn insert(&self, order_id: &str, order_date: Option<DateTime<Utc>>) {
        self.rows.lock().unwrap().insert(
            order_id.to_string(),
            Order {
                order_id: order_id.to_string(),
                order_date,
                invoice_path: None,
            },
        );
    }

    pub fn set_invoice_path(&self, order_id: &str, path: &str) {
        if let Some(order) = self.rows.lock().unwrap().get_mut(order_id) {
            order.invoice_path = Some(path.to_string());
        }
    }

    pub fn invoice_path(&self, order_id: &str) -> Option<String> {
        self.rows
            .lock()
            .unwrap()
            .get(order_id)
            .and_then(|o| o.invoice_path.clone())
    }
}

#[async_trait]
impl OrderStore for MemoryOrders {
    async fn find_order(&self, order_id: &str) -> anyhow::Result<Option<Order>> {
        Ok(self.rows.lock().unwrap().get(order_id).cloned())
    }

    async fn record_invoice_path(&self, order_id: &str, path: &str) -> anyhow::Result<()> {
        if *self.refuse_updates.lock().unwrap() {
            anyhow::bail!("connection reset while updating order {order_id}");
        }
        let mut rows = self.rows.lock().unwrap();
        let Some(order) = rows.get_mut(order_id) else {
            anyhow::bail!("order {order_id} missing");
        };
        order.invoice_path = Some(path.to_string());
        Ok(())
    }
}

// ----------------------------
// Invoice source
// ----------------------------

/// Serves a fixed document, or "not ready" when none is set.
#[derive(Default)]
pub struct StubSource {
    document: Mutex<Option<InvoiceDocument>>,
    calls: AtomicUsize,
}

impl StubSource {
    pub fn serving(document: InvoiceDocument) -> Self {
        Self {
            document: Mutex::new(Some(document)),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn never_ready() -> Self {
        Self::default()
    }

    pub fn set_document(&self, document: Option<InvoiceDocument>) {
        *self.document.lock().unwrap() = document;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InvoiceSource for StubSource {
    async fn fetch_invoice(
        &self,
        _order_id: &str,
        policy: &FetchPolicy,
        cancel: &CancellationToken,
    ) -> Result<InvoiceDocument, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if cancel.is_cancelled() {
            return Err(FetchError::Cancelled { attempts: 0 });
        }
        self.document
            .lock()
            .unwrap()
            .clone()
            .ok_or(FetchError::NotReady {
                attempts: policy.max_attempts,
            })
    }
}

// ----------------------------
// PDF engine
// ----------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendMode {
    Ok,
    EngineFails,
    Misconfigured,
}

pub struct CountingBackend {
    mode: Mutex<BackendMode>,
    calls: AtomicUsize,
    last_html: Mutex<Option<String>>,
}

impl CountingBackend {
    pub fn new(mode: BackendMode) -> Self {
        Self {
            mode: Mutex::new(mode),
            calls: AtomicUsize::new(0),
            last_html: Mutex::new(None),
        }
    }

    pub fn set_mode(&self, mode: BackendMode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_html(&self) -> Option<String> {
        self.last_html.lock().unwrap().clone()
    }
}

#[async_trait]
impl PdfBackend for CountingBackend {
    async fn html_to_pdf(&self, html: &str) -> Result<Vec<u8>, RenderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_html.lock().unwrap() = Some(html.to_string());
        let mode = *self.mode.lock().unwrap();
        match mode {
            BackendMode::Ok => Ok(FAKE_PDF.to_vec()),
            BackendMode::EngineFails => Err(RenderError::Engine("exit status 1".to_string())),
            BackendMode::Misconfigured => {
                Err(RenderError::Misconfigured("wkhtmltopdf not found".to_string()))
            }
        }
    }
}

// ----------------------------
// Mail
// ----------------------------

#[derive(Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<OutgoingEmail>>,
    refuse: Mutex<bool>,
}

impl RecordingMailer {
    pub fn refusing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            refuse: Mutex::new(true),
        }
    }

    pub fn sent(&self) -> Vec<OutgoingEmail> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, email: OutgoingEmail) -> Result<(), DeliveryError> {
        if *self.refuse.lock().unwrap() {
            return Err(DeliveryError::Transport("535 authentication failed".to_string()));
        }
        self.sent.lock().unwrap().push(email);
        Ok(())
    }
}

// ----------------------------
// Pipeline harness
// ----------------------------

pub struct Harness {
    pub orders: Arc<MemoryOrders>,
    pub source: Arc<StubSource>,
    pub backend: Arc<CountingBackend>,
    pub mailer: Arc<RecordingMailer>,
    pub archive: TempDir,
}

impl Harness {
    pub fn new(source: StubSource) -> Self {
        Self::with_mailer(source, RecordingMailer::default())
    }

    pub fn with_mailer(source: StubSource, mailer: RecordingMailer) -> Self {
        Self {
            orders: Arc::new(MemoryOrders::default()),
            source: Arc::new(source),
            backend: Arc::new(CountingBackend::new(BackendMode::Ok)),
            mailer: Arc::new(mailer),
            archive: tempfile::tempdir().expect("tempdir"),
        }
    }

    pub fn artifacts(&self) -> ArtifactStore {
        ArtifactStore::new(
            self.orders.clone(),
            self.source.clone(),
            ArtifactRenderer::new(self.backend.clone()),
            self.archive.path(),
            quick_policy(),
        )
    }

    pub fn notifier(&self) -> Notifier {
        Notifier::new(
            self.artifacts(),
            self.source.clone(),
            self.mailer.clone(),
            quick_policy(),
            TrackingConfig::default(),
        )
    }
}

// ----------------------------
// Queue
// ----------------------------

pub fn job(id: i32, task_name: &str, args: [Option<&str>; 3]) -> Job {
    let now = Utc::now();
    Job {
        id,
        task_name: task_name.to_string(),
        arg1: args[0].map(str::to_string),
        arg2: args[1].map(str::to_string),
        arg3: args[2].map(str::to_string),
        status: JobStatus::Pending.as_str().to_string(),
        attempts: 0,
        run_at: now,
        locked_by: None,
        locked_at: None,
        last_error_code: None,
        last_error_message: None,
        created_at: now,
        updated_at: now,
    }
}

/// In-memory stand-in for the task table with the same state transitions.
#[derive(Default)]
pub struct MemoryQueue {
    rows: Mutex<Vec<Job>>,
}

impl MemoryQueue {
    pub fn with_jobs(jobs: Vec<Job>) -> Self {
        Self {
            rows: Mutex::new(jobs),
        }
    }

    pub fn rows(&self) -> Vec<Job> {
        self.rows.lock().unwrap().clone()
    }

    pub fn get(&self, id: i32) -> Option<Job> {
        self.rows.lock().unwrap().iter().find(|j| j.id == id).cloned()
    }

    fn update<F: FnOnce(&mut Job)>(&self, id: i32, worker_id: &str, f: F) {
        let mut rows = self.rows.lock().unwrap();
        if let Some(row) = rows
            .iter_mut()
            .find(|j| j.id == id && j.locked_by.as_deref() == Some(worker_id))
        {
            f(row);
            row.locked_by = None;
            row.locked_at = None;
            row.updated_at = Utc::now();
        }
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn claim_one(&self, worker_id: &str) -> anyhow::Result<Option<Job>> {
        let now = Utc::now();
        let mut rows = self.rows.lock().unwrap();
        let next = rows
            .iter_mut()
            .filter(|j| j.status == JobStatus::Pending.as_str() && j.run_at <= now)
            .min_by_key(|j| (j.created_at, j.id));

        Ok(next.map(|row| {
            row.status = JobStatus::InProgress.as_str().to_string();
            row.locked_by = Some(worker_id.to_string());
            row.locked_at = Some(now);
            row.clone()
        }))
    }

    async fn complete(&self, job: &Job, worker_id: &str) -> anyhow::Result<()> {
        self.rows
            .lock()
            .unwrap()
            .retain(|j| !(j.id == job.id && j.locked_by.as_deref() == Some(worker_id)));
        Ok(())
    }

    async fn release(&self, job: &Job, worker_id: &str) -> anyhow::Result<()> {
        self.update(job.id, worker_id, |row| {
            row.status = JobStatus::Pending.as_str().to_string();
        });
        Ok(())
    }

    async fn retry_later(
        &self,
        job: &Job,
        worker_id: &str,
        run_at: DateTime<Utc>,
        code: ErrorCode,
        message: &str,
    ) -> anyhow::Result<()> {
        self.update(job.id, worker_id, |row| {
            row.status = JobStatus::Pending.as_str().to_string();
            row.attempts += 1;
            row.run_at = run_at;
            row.last_error_code = Some(code.as_str().to_string());
            row.last_error_message = Some(message.to_string());
        });
        Ok(())
    }

    async fn mark_failed(
        &self,
        job: &Job,
        worker_id: &str,
        code: ErrorCode,
        message: &str,
    ) -> anyhow::Result<()> {
        self.update(job.id, worker_id, |row| {
            row.status = JobStatus::Failed.as_str().to_string();
            row.attempts += 1;
            row.last_error_code = Some(code.as_str().to_string());
            row.last_error_message = Some(message.to_string());
        });
        Ok(())
    }

    async fn reap_stale_claims(&self, older_than: Duration) -> anyhow::Result<u64> {
        let cutoff = Utc::now() - ChronoDuration::from_std(older_than)?;
        let mut reaped = 0;
        for row in self.rows.lock().unwrap().iter_mut() {
            if row.status == JobStatus::InProgress.as_str()
                && row.locked_at.map_or(false, |at| at < cutoff)
            {
                row.status = JobStatus::Pending.as_str().to_string();
                row.locked_by = None;
                row.locked_at = None;
                reaped += 1;
            }
        }
        Ok(reaped)
    }

    async fn pending_count(&self) -> anyhow::Result<i64> {
        let rows = self.rows.lock().unwrap();
        Ok(rows
            .iter()
            .filter(|j| j.status == JobStatus::Pending.as_str())
            .count() as i64)
    }
}
