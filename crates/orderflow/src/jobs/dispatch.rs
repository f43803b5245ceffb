use crate::jobs::model::JobCommand;
use crate::notify::{Notifier, PipelineError};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, command: &JobCommand, cancel: &CancellationToken) -> Result<(), PipelineError>;
}

#[async_trait]
impl JobHandler for Notifier {
    async fn handle(&self, command: &JobCommand, cancel: &CancellationToken) -> Result<(), PipelineError> {
        match command {
            JobCommand::SendInvoice {
                order_id,
                recipient,
            } => self.send_invoice(order_id, recipient, cancel).await,
            // The task table has no slot for a carrier URL; it is derived
            // from the tracking number.
            JobCommand::SendTracking {
                order_id,
                recipient,
                tracking_number,
            } => {
                self.send_tracking(order_id, recipient, tracking_number, None, cancel)
                    .await
            }
        }
    }
}
