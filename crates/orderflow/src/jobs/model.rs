use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;

/// One row of the `tasks` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Job {
    pub id: i32,
    pub task_name: String,
    pub arg1: Option<String>,
    pub arg2: Option<String>,
    pub arg3: Option<String>,
    pub status: String,
    pub attempts: i32,
    pub run_at: DateTime<Utc>,

    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,

    pub last_error_code: Option<String>,
    pub last_error_message: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    InProgress,
    /// Dead-lettered. Done jobs are deleted rather than given a status.
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::InProgress => "in-progress",
            JobStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    SendInvoice,
    SendTracking,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::SendInvoice => "send_invoice",
            JobKind::SendTracking => "send_tracking",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = JobDecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "send_invoice" => Ok(JobKind::SendInvoice),
            "send_tracking" => Ok(JobKind::SendTracking),
            other => Err(JobDecodeError::UnknownKind(other.to_string())),
        }
    }
}

/// A task row decoded into something a handler can run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobCommand {
    SendInvoice {
        order_id: String,
        recipient: String,
    },
    SendTracking {
        order_id: String,
        recipient: String,
        tracking_number: String,
    },
}

impl JobCommand {
    pub fn kind(&self) -> JobKind {
        match self {
            JobCommand::SendInvoice { .. } => JobKind::SendInvoice,
            JobCommand::SendTracking { .. } => JobKind::SendTracking,
        }
    }

    pub fn order_id(&self) -> &str {
        match self {
            JobCommand::SendInvoice { order_id, .. } | JobCommand::SendTracking { order_id, .. } => order_id,
        }
    }

    /// Positional `arg1..arg3` as stored in the table.
    pub fn args(&self) -> [Option<&str>; 3] {
        match self {
            JobCommand::SendInvoice {
                order_id,
                recipient,
            } => [Some(order_id.as_str()), Some(recipient.as_str()), None],
            JobCommand::SendTracking {
                order_id,
                recipient,
                tracking_number,
            } => [
                Some(order_id.as_str()),
                Some(recipient.as_str()),
                Some(tracking_number.as_str()),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobDecodeError {
    #[error("unknown task_name {0:?}")]
    UnknownKind(String),

    #[error("{kind} needs arg{position} ({name})")]
    MissingArg {
        kind: JobKind,
        position: u8,
        name: &'static str,
    },
}

impl Job {
    pub fn kind(&self) -> Result<JobKind, JobDecodeError> {
        self.task_name.parse()
    }

    pub fn command(&self) -> Result<JobCommand, JobDecodeError> {
        let kind = self.kind()?;
        let arg = |position: u8, name: &'static str| {
            let value = match position {
                1 => self.arg1.as_deref(),
                2 => self.arg2.as_deref(),
                _ => self.arg3.as_deref(),
            };
            value
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .ok_or(JobDecodeError::MissingArg {
                    kind,
                    position,
                    name,
                })
        };

        match kind {
            JobKind::SendInvoice => Ok(JobCommand::SendInvoice {
                order_id: arg(1, "order id")?,
                recipient: arg(2, "recipient email")?,
            }),
            JobKind::SendTracking => Ok(JobCommand::SendTracking {
                order_id: arg(1, "order id")?,
                recipient: arg(2, "recipient email")?,
                tracking_number: arg(3, "tracking number")?,
            }),
        }
    }
}
