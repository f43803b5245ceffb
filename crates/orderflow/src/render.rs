use crate::invoice::InvoiceDocument;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    /// The engine cannot run at all. Retrying will not help.
    #[error("pdf engine misconfigured: {0}")]
    Misconfigured(String),

    #[error("pdf engine failed: {0}")]
    Engine(String),
}

/// HTML to PDF engine.
#[async_trait]
pub trait PdfBackend: Send + Sync {
    async fn html_to_pdf(&self, html: &str) -> Result<Vec<u8>, RenderError>;
}

/// Drives the `wkhtmltopdf` binary, HTML on stdin and PDF on stdout.
#[derive(Debug, Clone)]
pub struct WkhtmltopdfBackend {
    binary: Option<PathBuf>,
}

impl WkhtmltopdfBackend {
    pub fn new(binary: Option<PathBuf>) -> Self {
        Self { binary }
    }

    async fn resolve_binary(&self) -> Result<&PathBuf, RenderError> {
        let Some(path) = &self.binary else {
            return Err(RenderError::Misconfigured(
                "no wkhtmltopdf path configured for this platform".to_string(),
            ));
        };
        match tokio::fs::try_exists(path).await {
            Ok(true) => Ok(path),
            _ => Err(RenderError::Misconfigured(format!(
                "wkhtmltopdf not found at {}",
                path.display()
            ))),
        }
    }
}

#[async_trait]
impl PdfBackend for WkhtmltopdfBackend {
    async fn html_to_pdf(&self, html: &str) -> Result<Vec<u8>, RenderError> {
        let binary = self.resolve_binary().await?;

        let mut child = Command::new(binary)
            .args(["--quiet", "--encoding", "utf-8", "-", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RenderError::Misconfigured(format!("failed to start wkhtmltopdf: {e}")))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| RenderError::Engine("wkhtmltopdf stdin unavailable".to_string()))?;
        let input = html.to_owned();
        // Feed stdin concurrently with draining stdout so a large document
        // cannot fill both pipes.
        let writer = tokio::spawn(async move {
            stdin.write_all(input.as_bytes()).await?;
            stdin.shutdown().await
        });

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| RenderError::Engine(format!("wkhtmltopdf did not finish: {e}")))?;

        match writer.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(RenderError::Engine(format!("writing html to wkhtmltopdf: {e}"))),
            Err(e) => return Err(RenderError::Engine(format!("stdin writer task failed: {e}"))),
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RenderError::Engine(format!(
                "wkhtmltopdf exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        if output.stdout.is_empty() {
            return Err(RenderError::Engine("wkhtmltopdf produced no output".to_string()));
        }

        Ok(output.stdout)
    }
}

/// Turns an invoice document into PDF bytes. Structured payloads go through
/// the invoice template first.
#[derive(Clone)]
pub struct ArtifactRenderer {
    backend: Arc<dyn PdfBackend>,
}

impl ArtifactRenderer {
    pub fn new(backend: Arc<dyn PdfBackend>) -> Self {
        Self { backend }
    }

    pub async fn render(&self, document: &InvoiceDocument) -> Result<Vec<u8>, RenderError> {
        let html = document.to_html();
        self.backend.html_to_pdf(&html).await
    }
}
