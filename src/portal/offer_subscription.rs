//! # Offer Subscription Executor
//!
//! Provisions a subscription to a provider's offer:
//!
//! ```text
//! TRIGGER_PROVIDER ──► OFFERSUBSCRIPTION_CLIENT_CREATION ──► OFFERSUBSCRIPTION_TECHNICALUSER_CREATION
//!        │                          │                                       │
//!        │ autosetup                └──────────────┬────────────────────────┘
//!        ▼                                         ▼
//!  AWAIT_START_AUTOSETUP (callback)       ACTIVATE_SUBSCRIPTION ──► TRIGGER_PROVIDER_CALLBACK
//!
//! TRIGGER_PROVIDER (single instance) ──► SINGLE_INSTANCE_SUBSCRIPTION_DETAILS_CREATION ──► ACTIVATE_SUBSCRIPTION
//! ```
//!
//! Technical user creation is skipped at initialization when the offer does not need one.

use super::collaborator::CollaboratorError;
use super::types::{ProcessStepTypeId, ProcessTypeId};
use super::PortalStepTaxonomy;
use crate::orchestration::{
    InitializationResult, ProcessContext, ProcessTypeExecutor, StepExecutionResult,
};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionDetails {
    pub offer_subscription_id: Uuid,
    pub offer_name: String,
    /// Single instance offers run one shared instance and get no client of their own
    pub is_single_instance: bool,
    pub needs_technical_user: bool,
}

/// Outcome of notifying the provider about a new subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderTriggered {
    /// The provider starts its autosetup and reports back through a callback
    AutosetupStarted,
    /// The portal continues on its own
    Notified,
}

/// The external systems an offer subscription talks to
#[async_trait]
pub trait OfferSubscriptionProvider: Send + Sync {
    async fn get_subscription_details(
        &self,
        process_id: Uuid,
        cancellation_token: &CancellationToken,
    ) -> Result<SubscriptionDetails, CollaboratorError>;

    async fn trigger_provider(
        &self,
        details: &SubscriptionDetails,
        cancellation_token: &CancellationToken,
    ) -> Result<ProviderTriggered, CollaboratorError>;

    async fn create_single_instance_subscription_details(
        &self,
        details: &SubscriptionDetails,
        cancellation_token: &CancellationToken,
    ) -> Result<(), CollaboratorError>;

    /// Returns the id of the created client
    async fn create_client(
        &self,
        details: &SubscriptionDetails,
        cancellation_token: &CancellationToken,
    ) -> Result<String, CollaboratorError>;

    /// Returns the id of the created technical user
    async fn create_technical_user(
        &self,
        details: &SubscriptionDetails,
        cancellation_token: &CancellationToken,
    ) -> Result<String, CollaboratorError>;

    async fn activate_subscription(
        &self,
        details: &SubscriptionDetails,
        cancellation_token: &CancellationToken,
    ) -> Result<(), CollaboratorError>;

    async fn trigger_provider_callback(
        &self,
        details: &SubscriptionDetails,
        cancellation_token: &CancellationToken,
    ) -> Result<(), CollaboratorError>;
}

pub struct OfferSubscriptionProcessTypeExecutor {
    provider: Arc<dyn OfferSubscriptionProvider>,
    taxonomy: Arc<PortalStepTaxonomy>,
    details: DashMap<Uuid, SubscriptionDetails>,
}

impl OfferSubscriptionProcessTypeExecutor {
    pub fn new(provider: Arc<dyn OfferSubscriptionProvider>) -> Self {
        Self {
            provider,
            taxonomy: super::taxonomy(),
            details: DashMap::new(),
        }
    }

    /// Number of processes with cached subscription details
    pub fn cached_details_count(&self) -> usize {
        self.details.len()
    }

    async fn details(
        &self,
        process_id: Uuid,
        cancellation_token: &CancellationToken,
    ) -> Result<SubscriptionDetails, CollaboratorError> {
        if let Some(details) = self.details.get(&process_id) {
            return Ok(details.clone());
        }
        let details = self
            .provider
            .get_subscription_details(process_id, cancellation_token)
            .await?;
        self.details.insert(process_id, details.clone());
        Ok(details)
    }

    async fn run_step(
        &self,
        step_type: ProcessStepTypeId,
        details: &SubscriptionDetails,
        cancellation_token: &CancellationToken,
    ) -> Result<StepExecutionResult<ProcessStepTypeId>, CollaboratorError> {
        use ProcessStepTypeId::*;

        let result = match step_type {
            TriggerProvider if details.is_single_instance => {
                StepExecutionResult::done([SingleInstanceSubscriptionDetailsCreation])
            }
            TriggerProvider => match self.provider.trigger_provider(details, cancellation_token).await? {
                ProviderTriggered::AutosetupStarted => StepExecutionResult::done([])
                    .with_scheduled([AwaitStartAutosetup])
                    .with_message("provider autosetup started"),
                ProviderTriggered::Notified => {
                    StepExecutionResult::done([OfferSubscriptionClientCreation])
                }
            },
            SingleInstanceSubscriptionDetailsCreation => {
                self.provider
                    .create_single_instance_subscription_details(details, cancellation_token)
                    .await?;
                StepExecutionResult::done([ActivateSubscription])
            }
            OfferSubscriptionClientCreation => {
                let client_id = self.provider.create_client(details, cancellation_token).await?;
                let next = if details.needs_technical_user {
                    OfferSubscriptionTechnicalUserCreation
                } else {
                    ActivateSubscription
                };
                StepExecutionResult::done([next]).with_message(format!("client {client_id} created"))
            }
            OfferSubscriptionTechnicalUserCreation => {
                let user_id = self
                    .provider
                    .create_technical_user(details, cancellation_token)
                    .await?;
                StepExecutionResult::done([ActivateSubscription])
                    .with_message(format!("technical user {user_id} created"))
            }
            ActivateSubscription => {
                self.provider
                    .activate_subscription(details, cancellation_token)
                    .await?;
                StepExecutionResult::done([TriggerProviderCallback])
            }
            TriggerProviderCallback => {
                self.provider
                    .trigger_provider_callback(details, cancellation_token)
                    .await?;
                StepExecutionResult::done([])
            }
            other => {
                return Ok(StepExecutionResult::failed(format!(
                    "step {other} is not executed by the offer subscription executor"
                )))
            }
        };
        Ok(result)
    }
}

#[async_trait]
impl ProcessTypeExecutor<ProcessTypeId, ProcessStepTypeId> for OfferSubscriptionProcessTypeExecutor {
    fn process_type_id(&self) -> ProcessTypeId {
        ProcessTypeId::OfferSubscription
    }

    fn is_executable_step_type_id(&self, step_type: ProcessStepTypeId) -> bool {
        self.taxonomy
            .is_executable(ProcessTypeId::OfferSubscription, step_type)
    }

    async fn initialize_process(
        &self,
        process_id: Uuid,
        _step_type_ids: &[ProcessStepTypeId],
        cancellation_token: &CancellationToken,
    ) -> anyhow::Result<InitializationResult<ProcessStepTypeId>> {
        // always refetch: another worker may have moved the subscription on
        self.details.remove(&process_id);
        let details = match self.details(process_id, cancellation_token).await {
            Ok(details) => details,
            // the step execution fetches again and reports the failure on the step
            Err(err) => {
                debug!(process_id = %process_id, error = %err, "Subscription details unavailable at initialization");
                return Ok(InitializationResult::default());
            }
        };

        if details.needs_technical_user {
            Ok(InitializationResult::default())
        } else {
            Ok(InitializationResult::skipping(vec![
                ProcessStepTypeId::OfferSubscriptionTechnicalUserCreation,
                ProcessStepTypeId::RetriggerOfferSubscriptionTechnicalUserCreation,
            ]))
        }
    }

    fn forget_process(&self, process_id: Uuid) {
        self.details.remove(&process_id);
    }

    async fn execute_process_step(
        &self,
        step_type: ProcessStepTypeId,
        context: &ProcessContext<ProcessTypeId, ProcessStepTypeId>,
        cancellation_token: &CancellationToken,
    ) -> anyhow::Result<StepExecutionResult<ProcessStepTypeId>> {
        let details = match self.details(context.process_id, cancellation_token).await {
            Ok(details) => details,
            Err(err) => return Ok(err.into_step_result()),
        };

        let result = match self.run_step(step_type, &details, cancellation_token).await {
            Ok(result) => result,
            Err(err) => err.into_step_result(),
        };
        Ok(result)
    }
}
