use crate::config::SmtpConfig;
use crate::fetch::{FetchError, FetchPolicy, InvoiceSource};
use crate::invoice::{compose_tracking_html, InvoiceDocument};
use crate::jobs::error_codes::ErrorCode;
use crate::render::RenderError;
use crate::store::{ArtifactError, ArtifactStore};
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const PLAIN_INVOICE_BODY: &str = "Thank you for your order. Please find your invoice attached.";
const HTML_CLIENT_NOTICE: &str = "Please view this email in an HTML-compatible client.";

#[derive(Debug, Clone, PartialEq)]
pub enum EmailBody {
    Html(String),
    Plain(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmailAttachment {
    pub filename: String,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingEmail {
    pub to: String,
    pub subject: String,
    pub body: EmailBody,
    pub attachment: Option<EmailAttachment>,
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("invalid address {address:?}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("building message: {0}")]
    Build(String),

    #[error("smtp transport: {0}")]
    Transport(String),
}

/// Outbound mail transport.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: OutgoingEmail) -> Result<(), DeliveryError>;
}

pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    /// STARTTLS relay, authenticated with the account credentials. Mail goes
    /// out under `cfg.from`, which may be an alias of the login account.
    pub fn new(cfg: &SmtpConfig) -> anyhow::Result<Self> {
        let from: Mailbox = cfg
            .from
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid from address {:?}: {e}", cfg.from))?;

        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&cfg.host)?
            .port(cfg.port)
            .credentials(Credentials::new(cfg.username.clone(), cfg.password.clone()))
            .timeout(Some(cfg.timeout))
            .build();

        Ok(Self { transport, from })
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, email: OutgoingEmail) -> Result<(), DeliveryError> {
        let to = email.to.clone();
        let message = build_message(&self.from, email)?;
        self.transport
            .send(message)
            .await
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;
        info!(%to, "email sent");
        Ok(())
    }
}

pub fn build_message(from: &Mailbox, email: OutgoingEmail) -> Result<Message, DeliveryError> {
    let to: Mailbox = email.to.parse().map_err(|e: lettre::address::AddressError| {
        DeliveryError::InvalidAddress {
            address: email.to.clone(),
            reason: e.to_string(),
        }
    })?;

    let body = match email.body {
        EmailBody::Html(html) => MultiPart::alternative_plain_html(HTML_CLIENT_NOTICE.to_string(), html),
        EmailBody::Plain(text) => MultiPart::mixed().singlepart(SinglePart::plain(text)),
    };

    let content = match email.attachment {
        Some(att) => {
            let pdf = ContentType::parse("application/pdf")
                .map_err(|e| DeliveryError::Build(e.to_string()))?;
            MultiPart::mixed()
                .multipart(body)
                .singlepart(Attachment::new(att.filename).body(att.content, pdf))
        }
        None => body,
    };

    Message::builder()
        .from(from.clone())
        .to(to)
        .subject(email.subject)
        .multipart(content)
        .map_err(|e| DeliveryError::Build(e.to_string()))
}

#[derive(Debug, Clone)]
pub struct TrackingConfig {
    pub carrier: String,
    /// `{tracking_number}` is replaced with the consignment number.
    pub url_template: String,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            carrier: "India Post".to_string(),
            url_template: "https://www.indiapost.gov.in/_layouts/15/dop.portal.tracking/trackconsignment.aspx?consignmentno={tracking_number}".to_string(),
        }
    }
}

impl TrackingConfig {
    pub fn url_for(&self, tracking_number: &str) -> String {
        self.url_template.replace("{tracking_number}", tracking_number)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error("reading invoice {path}: {source}")]
    ReadArtifact {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    #[error("cancelled")]
    Cancelled,
}

impl PipelineError {
    pub fn code(&self) -> ErrorCode {
        match self {
            PipelineError::Artifact(e) => match e {
                ArtifactError::OrderNotFound(_) => ErrorCode::OrderNotFound,
                ArtifactError::InvalidOrderId(_) => ErrorCode::BadArgs,
                ArtifactError::Fetch(FetchError::NotReady { .. }) => ErrorCode::NotReady,
                ArtifactError::Fetch(FetchError::Cancelled { .. }) => ErrorCode::Cancelled,
                ArtifactError::Render(RenderError::Misconfigured(_)) => ErrorCode::Configuration,
                ArtifactError::Render(RenderError::Engine(_)) => ErrorCode::RenderFailed,
                ArtifactError::Io { .. } => ErrorCode::Storage,
                ArtifactError::Database(_) => ErrorCode::Database,
            },
            PipelineError::ReadArtifact { .. } => ErrorCode::Storage,
            PipelineError::Delivery(DeliveryError::InvalidAddress { .. }) => ErrorCode::BadArgs,
            PipelineError::Delivery(_) => ErrorCode::DeliveryFailed,
            PipelineError::Cancelled => ErrorCode::Cancelled,
        }
    }
}

/// Invoice and shipment notifications: make sure the invoice PDF exists,
/// compose the message, hand it to the mailer.
#[derive(Clone)]
pub struct Notifier {
    artifacts: ArtifactStore,
    source: Arc<dyn InvoiceSource>,
    mailer: Arc<dyn Mailer>,
    body_fetch: FetchPolicy,
    tracking: TrackingConfig,
}

impl Notifier {
    pub fn new(
        artifacts: ArtifactStore,
        source: Arc<dyn InvoiceSource>,
        mailer: Arc<dyn Mailer>,
        body_fetch: FetchPolicy,
        tracking: TrackingConfig,
    ) -> Self {
        Self {
            artifacts,
            source,
            mailer,
            body_fetch,
            tracking,
        }
    }

    pub async fn send_invoice(
        &self,
        order_id: &str,
        recipient: &str,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let artifact = self.artifacts.ensure_artifact(order_id, cancel).await?;
        let pdf = read_artifact(&artifact.path).await?;

        let document = match artifact.document {
            Some(doc) => Some(doc),
            None => match self.source.fetch_invoice(order_id, &self.body_fetch, cancel).await {
                Ok(doc) => Some(doc),
                Err(FetchError::Cancelled { .. }) => return Err(PipelineError::Cancelled),
                Err(e) => {
                    warn!(order_id, error = %e, "invoice body unavailable, sending plain text");
                    None
                }
            },
        };
        let body = match document {
            Some(InvoiceDocument::Html(html)) => EmailBody::Html(html),
            Some(doc @ InvoiceDocument::Structured(_)) => EmailBody::Html(doc.to_html()),
            None => EmailBody::Plain(PLAIN_INVOICE_BODY.to_string()),
        };

        self.mailer
            .send(OutgoingEmail {
                to: recipient.to_string(),
                subject: format!("Your Invoice - {order_id}"),
                body,
                attachment: Some(invoice_attachment(order_id, pdf)),
            })
            .await?;

        info!(order_id, recipient, "invoice email delivered");
        Ok(())
    }

    pub async fn send_tracking(
        &self,
        order_id: &str,
        recipient: &str,
        tracking_number: &str,
        tracking_url: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let artifact = self.artifacts.ensure_artifact(order_id, cancel).await?;
        let pdf = read_artifact(&artifact.path).await?;

        let url = match tracking_url {
            Some(url) => url.to_string(),
            None => self.tracking.url_for(tracking_number),
        };
        let html = compose_tracking_html(order_id, tracking_number, &self.tracking.carrier, &url);

        self.mailer
            .send(OutgoingEmail {
                to: recipient.to_string(),
                subject: format!("Your Order Has Shipped - Tracking: {tracking_number}"),
                body: EmailBody::Html(html),
                attachment: Some(invoice_attachment(order_id, pdf)),
            })
            .await?;

        info!(order_id, recipient, tracking_number, "tracking email delivered");
        Ok(())
    }
}

fn invoice_attachment(order_id: &str, content: Vec<u8>) -> EmailAttachment {
    EmailAttachment {
        filename: format!("Invoice_{order_id}.pdf"),
        content,
    }
}

async fn read_artifact(path: &std::path::Path) -> Result<Vec<u8>, PipelineError> {
    tokio::fs::read(path)
        .await
        .map_err(|source| PipelineError::ReadArtifact {
            path: path.to_path_buf(),
            source,
        })
}
