//! Mailing process: sends the mails queued for a process in batches until none are left.

use super::collaborator::CollaboratorError;
use super::types::{ProcessStepTypeId, ProcessTypeId};
use super::PortalStepTaxonomy;
use crate::orchestration::{ProcessContext, ProcessTypeExecutor, StepExecutionResult};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailBatch {
    pub sent: usize,
    /// Mails still queued for the process after this batch
    pub remaining: usize,
}

#[async_trait]
pub trait MailSender: Send + Sync {
    /// Send the next batch of mails queued for `process_id`
    async fn send_mails(
        &self,
        process_id: Uuid,
        cancellation_token: &CancellationToken,
    ) -> Result<MailBatch, CollaboratorError>;
}

pub struct MailingProcessTypeExecutor {
    sender: Arc<dyn MailSender>,
    taxonomy: Arc<PortalStepTaxonomy>,
}

impl MailingProcessTypeExecutor {
    pub fn new(sender: Arc<dyn MailSender>) -> Self {
        Self {
            sender,
            taxonomy: super::taxonomy(),
        }
    }
}

#[async_trait]
impl ProcessTypeExecutor<ProcessTypeId, ProcessStepTypeId> for MailingProcessTypeExecutor {
    fn process_type_id(&self) -> ProcessTypeId {
        ProcessTypeId::Mailing
    }

    fn is_executable_step_type_id(&self, step_type: ProcessStepTypeId) -> bool {
        self.taxonomy.is_executable(ProcessTypeId::Mailing, step_type)
    }

    async fn execute_process_step(
        &self,
        step_type: ProcessStepTypeId,
        context: &ProcessContext<ProcessTypeId, ProcessStepTypeId>,
        cancellation_token: &CancellationToken,
    ) -> anyhow::Result<StepExecutionResult<ProcessStepTypeId>> {
        if step_type != ProcessStepTypeId::SendMail {
            anyhow::bail!("mailing executor cannot execute {step_type}");
        }

        let batch = match self
            .sender
            .send_mails(context.process_id, cancellation_token)
            .await
        {
            Ok(batch) => batch,
            Err(err) => return Ok(err.into_step_result()),
        };

        let next = (batch.remaining > 0).then_some(ProcessStepTypeId::SendMail);
        Ok(StepExecutionResult::done(next).with_message(format!(
            "sent {} mails, {} remaining",
            batch.sent, batch.remaining
        )))
    }
}
