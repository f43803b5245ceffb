use anyhow::{bail, Context};
use chrono::{NaiveDate, TimeZone, Utc};
use orderflow::db::{make_pool, run_migrations};
use orderflow::jobs::{suggested_action, JobCommand, JobQueue, JobsRepo};
use sqlx::PgPool;
use std::env;

const USAGE: &str = "orderflowctl <command>\n\
Commands:\n\
- migrate\n\
- reset\n\
- add-order <order_id> [YYYY-MM-DD]\n\
- enqueue-invoice <order_id> <email>\n\
- enqueue-tracking <order_id> <email> <tracking_number>\n\
- depth\n\
- failed [limit]\n\
- requeue <job_id>\n\
\n\
Uses DATABASE_URL or TEST_DATABASE_URL.\n";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let args: Vec<String> = env::args().skip(1).collect();
    let Some(command) = args.first() else {
        eprintln!("{USAGE}");
        std::process::exit(2);
    };

    let url = env::var("DATABASE_URL")
        .or_else(|_| env::var("TEST_DATABASE_URL"))
        .context("DATABASE_URL or TEST_DATABASE_URL must be set")?;
    let pool = make_pool(&url, 2).await?;
    let repo = JobsRepo::new(pool.clone());

    match command.as_str() {
        "migrate" => {
            run_migrations(&pool).await?;
            println!("migrations applied");
        }
        "reset" => reset(&pool).await?,
        "add-order" => {
            let order_id = arg(&args, 1, "order_id")?;
            add_order(&pool, order_id, args.get(2).map(String::as_str)).await?;
        }
        "enqueue-invoice" => {
            let cmd = JobCommand::SendInvoice {
                order_id: arg(&args, 1, "order_id")?.to_string(),
                recipient: arg(&args, 2, "email")?.to_string(),
            };
            let id = repo.enqueue(&cmd).await?;
            println!("+ enqueued send_invoice id={id}");
        }
        "enqueue-tracking" => {
            let cmd = JobCommand::SendTracking {
                order_id: arg(&args, 1, "order_id")?.to_string(),
                recipient: arg(&args, 2, "email")?.to_string(),
                tracking_number: arg(&args, 3, "tracking_number")?.to_string(),
            };
            let id = repo.enqueue(&cmd).await?;
            println!("+ enqueued send_tracking id={id}");
        }
        "depth" => show_counts(&pool, &repo).await?,
        "failed" => {
            let limit = match args.get(1) {
                Some(raw) => raw.parse().context("limit must be a number")?,
                None => 20,
            };
            list_failed(&repo, limit).await?;
        }
        "requeue" => {
            let job_id: i32 = arg(&args, 1, "job_id")?
                .parse()
                .context("job_id must be a number")?;
            if repo.requeue_failed(job_id).await? {
                println!("requeued job {job_id}");
            } else {
                bail!("job {job_id} is not a failed job");
            }
        }
        other => {
            eprintln!("Unknown command: {other}\n\n{USAGE}");
            std::process::exit(2);
        }
    }

    Ok(())
}

fn arg<'a>(args: &'a [String], idx: usize, name: &str) -> anyhow::Result<&'a str> {
    args.get(idx)
        .map(String::as_str)
        .with_context(|| format!("missing <{name}>\n\n{USAGE}"))
}

async fn reset(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::query("TRUNCATE TABLE tasks RESTART IDENTITY")
        .execute(pool)
        .await?;
    println!("reset OK");
    Ok(())
}

async fn add_order(pool: &PgPool, order_id: &str, date: Option<&str>) -> anyhow::Result<()> {
    let order_date = match date {
        Some(raw) => {
            let day = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .with_context(|| format!("bad date {raw:?}, expected YYYY-MM-DD"))?;
            let midnight = day
                .and_hms_opt(0, 0, 0)
                .context("midnight is always a valid time")?;
            Utc.from_utc_datetime(&midnight)
        }
        None => Utc::now(),
    };

    sqlx::query(
        r#"
        INSERT INTO orders (order_id, order_date)
        VALUES ($1, $2)
        ON CONFLICT (order_id) DO UPDATE SET order_date = EXCLUDED.order_date
        "#,
    )
    .bind(order_id)
    .bind(order_date)
    .execute(pool)
    .await?;

    println!("+ order {order_id} dated {}", order_date.format("%Y-%m-%d"));
    Ok(())
}

async fn show_counts(pool: &PgPool, repo: &JobsRepo) -> anyhow::Result<()> {
    let pending = repo.pending_count().await?;
    let in_progress: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM tasks WHERE status = 'in-progress'")
            .fetch_one(pool)
            .await?;
    let failed: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tasks WHERE status = 'failed'")
        .fetch_one(pool)
        .await?;

    println!("tasks: pending={pending} in-progress={in_progress} failed={failed}");
    Ok(())
}

async fn list_failed(repo: &JobsRepo, limit: i64) -> anyhow::Result<()> {
    let jobs = repo.list_failed(limit).await?;
    if jobs.is_empty() {
        println!("no failed jobs");
        return Ok(());
    }

    for job in jobs {
        let code = job.last_error_code.as_deref().unwrap_or("UNKNOWN");
        println!(
            "#{} {} order={} attempts={} code={}",
            job.id,
            job.task_name,
            job.arg1.as_deref().unwrap_or("-"),
            job.attempts,
            code,
        );
        if let Some(msg) = job.last_error_message.as_deref() {
            println!("    error:  {msg}");
        }
        println!("    action: {}", suggested_action(code));
    }
    Ok(())
}
