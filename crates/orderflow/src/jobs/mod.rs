pub mod dispatch;
pub mod error_codes;
pub mod model;
pub mod repo;
pub mod retry;
pub mod runner;

pub use dispatch::JobHandler;
pub use error_codes::{suggested_action, ErrorCode};
pub use model::{Job, JobCommand, JobKind, JobStatus};
pub use repo::{JobQueue, JobsRepo};
pub use runner::{FinalizePolicy, JobOutcome, JobRunner, RunMode, RunSummary, RunnerConfig, RunnerError};
