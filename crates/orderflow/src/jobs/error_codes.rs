// crates/orderflow/src/jobs/error_codes.rs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    NotReady,
    RenderFailed,
    DeliveryFailed,
    Storage,
    Database,
    Cancelled,
    OrderNotFound,
    BadArgs,
    UnknownJobType,
    Configuration,
    Unknown,
}

impl ErrorCode {
    pub fn from_str(s: &str) -> Self {
        match s.trim().to_uppercase().as_str() {
            "NOT_READY" => Self::NotReady,
            "RENDER_FAILED" => Self::RenderFailed,
            "DELIVERY_FAILED" => Self::DeliveryFailed,
            "STORAGE" => Self::Storage,
            "DATABASE" => Self::Database,
            "CANCELLED" => Self::Cancelled,
            "ORDER_NOT_FOUND" => Self::OrderNotFound,
            "BAD_ARGS" => Self::BadArgs,
            "UNKNOWN_JOB_TYPE" => Self::UnknownJobType,
            "CONFIGURATION" => Self::Configuration,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotReady => "NOT_READY",
            Self::RenderFailed => "RENDER_FAILED",
            Self::DeliveryFailed => "DELIVERY_FAILED",
            Self::Storage => "STORAGE",
            Self::Database => "DATABASE",
            Self::Cancelled => "CANCELLED",
            Self::OrderNotFound => "ORDER_NOT_FOUND",
            Self::BadArgs => "BAD_ARGS",
            Self::UnknownJobType => "UNKNOWN_JOB_TYPE",
            Self::Configuration => "CONFIGURATION",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn suggested_action(code: &str) -> &'static str {
    match ErrorCode::from_str(code) {
        ErrorCode::NotReady => {
            "Invoice service never returned the invoice. Check it rendered the order, then requeue."
        }
        ErrorCode::RenderFailed => {
            "wkhtmltopdf rejected the document. Inspect the invoice HTML for the order."
        }
        ErrorCode::DeliveryFailed => {
            "SMTP refused or timed out. Check credentials / app password and provider limits."
        }
        ErrorCode::Storage => "Archive directory not writable or file unreadable. Check disk and permissions.",
        ErrorCode::Database => "Order lookup or update failed. Check database connectivity.",
        ErrorCode::Cancelled => "Worker shut down or job deadline hit mid-job. Requeue is safe.",
        ErrorCode::OrderNotFound => {
            "Non-retryable. The order id is not in the orders table. Fix the producer."
        }
        ErrorCode::BadArgs => {
            "Non-retryable. Task arguments are missing or malformed (order id, email, tracking number)."
        }
        ErrorCode::UnknownJobType => {
            "Non-retryable. No handler for this task_name. Deploy a worker that knows it or delete the row."
        }
        ErrorCode::Configuration => {
            "Worker halted. Fix the wkhtmltopdf path or credentials and restart."
        }
        ErrorCode::Unknown => {
            "Inspect last_error_message + logs. Decide if retryable; add mapping once understood."
        }
    }
}
