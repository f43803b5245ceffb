use crate::fetch::{EndpointAuth, FetchPolicy, PayloadFormat};
use crate::jobs::retry::RetryConfig;
use crate::jobs::runner::{FinalizePolicy, RunMode, RunnerConfig};
use crate::notify::TrackingConfig;
use anyhow::{anyhow, Context};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Runtime configuration, read once at process start and handed to each
/// component by the wiring code.
#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub db_max_connections: u32,
    pub migrate_on_startup: bool,

    pub invoice: InvoiceEndpointConfig,
    pub fetch: FetchPolicy,
    pub body_fetch: FetchPolicy,

    pub archive_root: PathBuf,
    pub renderer: RendererConfig,
    pub smtp: SmtpConfig,
    pub tracking: TrackingConfig,

    pub runner: RunnerConfig,
}

#[derive(Clone, Debug)]
pub struct InvoiceEndpointConfig {
    pub base_url: String,
    pub auth: EndpointAuth,
    pub format: PayloadFormat,
}

#[derive(Clone, Debug)]
pub struct RendererConfig {
    /// `None` means no engine is configured for this platform; rendering
    /// then fails with a configuration error instead of being retried.
    pub wkhtmltopdf_path: Option<PathBuf>,
}

#[derive(Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from: String,
    pub timeout: Duration,
}

impl std::fmt::Debug for SmtpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("from", &self.from)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from an arbitrary key lookup. `from_env` passes the
    /// process environment; tests pass a map.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup: &lookup };

        let database_url = env
            .get("DATABASE_URL")
            .ok_or_else(|| anyhow!("DATABASE_URL is missing"))?;

        let db_max_connections = env
            .parsed("ORDERFLOW_DB_MAX_CONNECTIONS", 4u32)?
            .clamp(1, 32);
        let migrate_on_startup = env.flag("ORDERFLOW_MIGRATE_ON_STARTUP").unwrap_or(false);

        let base_url = env
            .or_fallback("ORDERFLOW_INVOICE_URL", "SECRET_URL3")
            .ok_or_else(|| anyhow!("ORDERFLOW_INVOICE_URL is missing"))?;

        let auth = match (
            env.or_fallback("ORDERFLOW_INVOICE_TOKEN", "INTERNAL_API_TOKEN"),
            env.or_fallback("ORDERFLOW_INVOICE_SECRET", "SECRET"),
        ) {
            (Some(token), _) => EndpointAuth::Bearer(token),
            (None, Some(secret)) => EndpointAuth::PathSecret(secret),
            (None, None) => EndpointAuth::None,
        };

        let format = match env.get("ORDERFLOW_PAYLOAD_FORMAT") {
            Some(raw) => raw.parse()?,
            None => PayloadFormat::Json,
        };

        let fetch = FetchPolicy {
            timeout: Duration::from_secs(env.parsed("ORDERFLOW_FETCH_TIMEOUT_SECS", 10)?),
            poll_interval: Duration::from_secs(env.parsed("ORDERFLOW_POLL_INTERVAL_SECS", 4 * 60)?),
            max_attempts: env.parsed("ORDERFLOW_FETCH_MAX_ATTEMPTS", 30)?,
        };

        let body_fetch = FetchPolicy {
            timeout: fetch.timeout,
            poll_interval: Duration::from_secs(env.parsed("ORDERFLOW_BODY_POLL_INTERVAL_SECS", 30)?),
            max_attempts: env.parsed("ORDERFLOW_BODY_FETCH_MAX_ATTEMPTS", 3)?,
        };

        let archive_root = env
            .get("ORDERFLOW_ARCHIVE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("archives/invoices"));

        let platform_key = if cfg!(windows) { "WINDOWS_PATH" } else { "LINUX_PATH" };
        let renderer = RendererConfig {
            wkhtmltopdf_path: env.or_fallback("WKHTMLTOPDF_PATH", platform_key).map(PathBuf::from),
        };

        let username = env
            .or_fallback("ORDERFLOW_SMTP_USERNAME", "CHOC_EMAIL")
            .ok_or_else(|| anyhow!("ORDERFLOW_SMTP_USERNAME is missing"))?;
        let password = env
            .or_fallback("ORDERFLOW_SMTP_PASSWORD", "CHOC_PASSWORD")
            .ok_or_else(|| anyhow!("ORDERFLOW_SMTP_PASSWORD is missing"))?;
        let smtp = SmtpConfig {
            host: env
                .get("ORDERFLOW_SMTP_HOST")
                .unwrap_or_else(|| "smtp.gmail.com".to_string()),
            port: env.parsed("ORDERFLOW_SMTP_PORT", 587)?,
            from: env.get("ORDERFLOW_FROM_EMAIL").unwrap_or_else(|| username.clone()),
            username,
            password,
            timeout: Duration::from_secs(env.parsed("ORDERFLOW_SMTP_TIMEOUT_SECS", 30)?),
        };

        let mut tracking = TrackingConfig::default();
        if let Some(carrier) = env.get("ORDERFLOW_CARRIER") {
            tracking.carrier = carrier;
        }
        if let Some(template) = env.get("ORDERFLOW_TRACKING_URL_TEMPLATE") {
            tracking.url_template = template;
        }

        let worker_id = env
            .or_fallback("ORDERFLOW_WORKER_ID", "WORKER_ID")
            .or_else(|| env.get("HOSTNAME"))
            .unwrap_or_else(|| format!("worker-{}", uuid::Uuid::new_v4()));

        let finalize = match env.get("ORDERFLOW_FINALIZE") {
            Some(raw) => raw.parse()?,
            None => FinalizePolicy::OnSuccess,
        };
        let mode = match env.get("ORDERFLOW_RUN_MODE") {
            Some(raw) => raw.parse()?,
            None => RunMode::Daemon,
        };

        let runner = RunnerConfig {
            worker_id,
            finalize,
            mode,
            max_attempts: env.parsed("ORDERFLOW_MAX_ATTEMPTS", 5)?,
            retry: RetryConfig::default(),
            idle_poll: Duration::from_millis(env.parsed("ORDERFLOW_IDLE_POLL_MS", 10_000)?),
            claim_timeout: Duration::from_secs(env.parsed("ORDERFLOW_CLAIM_TIMEOUT_SECS", 3 * 60 * 60)?),
            job_deadline: env
                .get("ORDERFLOW_JOB_DEADLINE_SECS")
                .map(|raw| parse_value::<u64>("ORDERFLOW_JOB_DEADLINE_SECS", &raw))
                .transpose()?
                .map(Duration::from_secs),
        };

        Ok(Self {
            database_url,
            db_max_connections,
            migrate_on_startup,
            invoice: InvoiceEndpointConfig {
                base_url,
                auth,
                format,
            },
            fetch,
            body_fetch,
            archive_root,
            renderer,
            smtp,
            tracking,
            runner,
        })
    }
}

struct Env<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl Env<'_> {
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|s| !s.trim().is_empty())
    }

    fn or_fallback(&self, primary: &str, fallback: &str) -> Option<String> {
        self.get(primary).or_else(|| self.get(fallback))
    }

    fn flag(&self, key: &str) -> Option<bool> {
        self.get(key)
            .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
    }

    fn parsed<T>(&self, key: &str, default: T) -> anyhow::Result<T>
    where
        T: FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        match self.get(key) {
            Some(raw) => parse_value(key, &raw),
            None => Ok(default),
        }
    }
}

fn parse_value<T>(key: &str, raw: &str) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.trim()
        .parse()
        .with_context(|| format!("{key} has an invalid value: {raw:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn minimal() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("DATABASE_URL", "postgres://localhost/orderflow"),
            ("ORDERFLOW_INVOICE_URL", "https://shop.example/internal/invoice"),
            ("ORDERFLOW_SMTP_USERNAME", "shop@example.com"),
            ("ORDERFLOW_SMTP_PASSWORD", "app-password"),
        ])
    }

    fn load(vars: &HashMap<&'static str, &'static str>) -> anyhow::Result<Config> {
        Config::from_lookup(|k| vars.get(k).map(|v| v.to_string()))
    }

    #[test]
    fn defaults_follow_the_observed_polling_schedule() {
        let cfg = load(&minimal()).unwrap();

        assert_eq!(cfg.fetch.poll_interval, Duration::from_secs(240));
        assert_eq!(cfg.fetch.max_attempts, 30);
        assert_eq!(cfg.fetch.timeout, Duration::from_secs(10));
        assert_eq!(cfg.invoice.format, PayloadFormat::Json);
        assert_eq!(cfg.runner.finalize, FinalizePolicy::OnSuccess);
        assert_eq!(cfg.runner.mode, RunMode::Daemon);
        assert_eq!(cfg.smtp.port, 587);
        assert_eq!(cfg.smtp.from, "shop@example.com");
        assert_eq!(cfg.archive_root, PathBuf::from("archives/invoices"));
        assert!(matches!(cfg.invoice.auth, EndpointAuth::None));
    }

    #[test]
    fn missing_database_url_is_an_error() {
        let mut vars = minimal();
        vars.remove("DATABASE_URL");
        let err = load(&vars).unwrap_err();
        assert!(err.to_string().contains("DATABASE_URL"));
    }

    #[test]
    fn missing_smtp_password_is_an_error() {
        let mut vars = minimal();
        vars.remove("ORDERFLOW_SMTP_PASSWORD");
        assert!(load(&vars).is_err());
    }

    #[test]
    fn legacy_variable_names_are_honoured() {
        let vars = HashMap::from([
            ("DATABASE_URL", "postgres://localhost/orderflow"),
            ("SECRET_URL3", "https://legacy.example/invoice"),
            ("INTERNAL_API_TOKEN", "tok"),
            ("CHOC_EMAIL", "legacy@example.com"),
            ("CHOC_PASSWORD", "pw"),
            ("WORKER_ID", "worker-7"),
        ]);
        let cfg = load(&vars).unwrap();

        assert_eq!(cfg.invoice.base_url, "https://legacy.example/invoice");
        assert_eq!(cfg.smtp.username, "legacy@example.com");
        assert_eq!(cfg.runner.worker_id, "worker-7");
        assert!(matches!(cfg.invoice.auth, EndpointAuth::Bearer(ref t) if t == "tok"));
    }

    #[test]
    fn bearer_token_wins_over_path_secret() {
        let mut vars = minimal();
        vars.insert("ORDERFLOW_INVOICE_TOKEN", "tok");
        vars.insert("ORDERFLOW_INVOICE_SECRET", "s3cret");
        let cfg = load(&vars).unwrap();
        assert!(matches!(cfg.invoice.auth, EndpointAuth::Bearer(_)));

        vars.remove("ORDERFLOW_INVOICE_TOKEN");
        let cfg = load(&vars).unwrap();
        assert!(matches!(cfg.invoice.auth, EndpointAuth::PathSecret(ref s) if s == "s3cret"));
    }

    #[test]
    fn invalid_numbers_are_rejected() {
        let mut vars = minimal();
        vars.insert("ORDERFLOW_FETCH_MAX_ATTEMPTS", "lots");
        let err = load(&vars).unwrap_err();
        assert!(err.to_string().contains("ORDERFLOW_FETCH_MAX_ATTEMPTS"));
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let mut vars = minimal();
        vars.insert("ORDERFLOW_POLL_INTERVAL_SECS", "   ");
        let cfg = load(&vars).unwrap();
        assert_eq!(cfg.fetch.poll_interval, Duration::from_secs(240));
    }

    #[test]
    fn runner_knobs_are_parsed() {
        let mut vars = minimal();
        vars.insert("ORDERFLOW_FINALIZE", "always");
        vars.insert("ORDERFLOW_RUN_MODE", "drain");
        vars.insert("ORDERFLOW_JOB_DEADLINE_SECS", "900");
        vars.insert("ORDERFLOW_MAX_ATTEMPTS", "8");
        let cfg = load(&vars).unwrap();

        assert_eq!(cfg.runner.finalize, FinalizePolicy::Always);
        assert_eq!(cfg.runner.mode, RunMode::Drain);
        assert_eq!(cfg.runner.job_deadline, Some(Duration::from_secs(900)));
        assert_eq!(cfg.runner.max_attempts, 8);
    }

    #[test]
    fn smtp_password_is_not_printed() {
        let cfg = load(&minimal()).unwrap();
        let printed = format!("{:?}", cfg.smtp);
        assert!(!printed.contains("app-password"));
    }
}
