// crates/orderflow/src/jobs/repo.rs

use crate::jobs::error_codes::ErrorCode;
use crate::jobs::model::{Job, JobCommand, JobStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::time::Duration;

/// Operations the worker loop needs from the task table.
///
/// Every write after the claim is guarded by `worker_id`, so a worker whose
/// claim was reaped cannot finalize a row another worker now owns.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Claim one pending row, or `None` when nothing is runnable. Never waits
    /// on rows other workers hold.
    async fn claim_one(&self, worker_id: &str) -> anyhow::Result<Option<Job>>;

    /// Done: the row is deleted.
    async fn complete(&self, job: &Job, worker_id: &str) -> anyhow::Result<()>;

    /// Hand the row back untouched, without counting an attempt.
    async fn release(&self, job: &Job, worker_id: &str) -> anyhow::Result<()>;

    async fn retry_later(
        &self,
        job: &Job,
        worker_id: &str,
        run_at: DateTime<Utc>,
        code: ErrorCode,
        message: &str,
    ) -> anyhow::Result<()>;

    /// Dead-letter the row.
    async fn mark_failed(
        &self,
        job: &Job,
        worker_id: &str,
        code: ErrorCode,
        message: &str,
    ) -> anyhow::Result<()>;

    async fn reap_stale_claims(&self, older_than: Duration) -> anyhow::Result<u64>;

    async fn pending_count(&self) -> anyhow::Result<i64>;
}

#[derive(Clone)]
pub struct JobsRepo {
    pool: PgPool,
}

impl JobsRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    // ----------------------------
    // Enqueue
    // ----------------------------

    pub async fn enqueue(&self, command: &JobCommand) -> anyhow::Result<i32> {
        let [arg1, arg2, arg3] = command.args();

        let id: i32 = sqlx::query_scalar(
            r#"
            INSERT INTO tasks (task_name, arg1, arg2, arg3, status)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(command.kind().as_str())
        .bind(arg1)
        .bind(arg2)
        .bind(arg3)
        .bind(JobStatus::Pending.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    // ----------------------------
    // Reads
    // ----------------------------

    pub async fn get_job(&self, job_id: i32) -> anyhow::Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>("SELECT * FROM tasks WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    /// Dead-lettered jobs, newest first.
    pub async fn list_failed(&self, limit: i64) -> anyhow::Result<Vec<Job>> {
        let jobs = sqlx::query_as::<_, Job>(
            r#"
            SELECT *
            FROM tasks
            WHERE status = 'failed'
            ORDER BY updated_at DESC, id DESC
            LIMIT $1
            "#,
        )
        .bind(limit.clamp(1, 500))
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs)
    }

    // ----------------------------
    // Operator actions
    // ----------------------------

    /// Put a dead-lettered job back in the queue with a fresh attempt budget.
    /// Returns false when the id is not a failed job.
    pub async fn requeue_failed(&self, job_id: i32) -> anyhow::Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'pending',
                attempts = 0,
                run_at = now(),
                locked_by = NULL,
                locked_at = NULL,
                updated_at = now()
            WHERE id = $1
              AND status = 'failed'
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }
}

#[async_trait]
impl JobQueue for JobsRepo {
    // Claim exactly one runnable job.
    // SELECT ... FOR UPDATE SKIP LOCKED: concurrent workers each get a
    // different row, or nothing, and never block on each other.
    async fn claim_one(&self, worker_id: &str) -> anyhow::Result<Option<Job>> {
        let mut tx = self.pool.begin().await?;

        let job = sqlx::query_as::<_, Job>(
            r#"
            WITH candidate AS (
              SELECT id
              FROM tasks
              WHERE status = 'pending'
                AND run_at <= now()
              ORDER BY created_at ASC, id ASC
              FOR UPDATE SKIP LOCKED
              LIMIT 1
            )
            UPDATE tasks t
            SET status = 'in-progress',
                locked_by = $1,
                locked_at = now(),
                updated_at = now()
            FROM candidate
            WHERE t.id = candidate.id
            RETURNING t.*
            "#,
        )
        .bind(worker_id)
        .fetch_optional(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(job)
    }

    async fn complete(&self, job: &Job, worker_id: &str) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            DELETE FROM tasks
            WHERE id = $1
              AND locked_by = $2
            "#,
        )
        .bind(job.id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn release(&self, job: &Job, worker_id: &str) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'pending',
                locked_by = NULL,
                locked_at = NULL,
                updated_at = now()
            WHERE id = $1
              AND locked_by = $2
            "#,
        )
        .bind(job.id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

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
        sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'pending',
                attempts = attempts + 1,
                run_at = $3,
                locked_by = NULL,
                locked_at = NULL,
                last_error_code = $4,
                last_error_message = $5,
                updated_at = now()
            WHERE id = $1
              AND locked_by = $2
            "#,
        )
        .bind(job.id)
        .bind(worker_id)
        .bind(run_at)
        .bind(code.as_str())
        .bind(message)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn mark_failed(
        &self,
        job: &Job,
        worker_id: &str,
        code: ErrorCode,
        message: &str,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'failed',
                attempts = attempts + 1,
                locked_by = NULL,
                locked_at = NULL,
                last_error_code = $3,
                last_error_message = $4,
                updated_at = now()
            WHERE id = $1
              AND locked_by = $2
            "#,
        )
        .bind(job.id)
        .bind(worker_id)
        .bind(code.as_str())
        .bind(message)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // A worker that died mid-job leaves its row in-progress forever; put
    // such rows back once they are older than any job could legitimately run.
    async fn reap_stale_claims(&self, older_than: Duration) -> anyhow::Result<u64> {
        let res = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'pending',
                locked_by = NULL,
                locked_at = NULL,
                updated_at = now()
            WHERE status = 'in-progress'
              AND locked_at IS NOT NULL
              AND locked_at < now() - ($1::bigint * interval '1 second')
            "#,
        )
        .bind(older_than.as_secs() as i64)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected())
    }

    async fn pending_count(&self) -> anyhow::Result<i64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tasks WHERE status = 'pending'")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }
}
