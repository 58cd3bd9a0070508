use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use portal_processes::orchestration::{
    InitializationResult, ProcessContext, ProcessTypeExecutor, StepExecutionResult,
};
use portal_processes::portal::mailing::MailBatch;
use portal_processes::portal::offer_subscription::ProviderTriggered;
use portal_processes::portal::{
    CollaboratorError, MailSender, OfferSubscriptionProvider, ProcessStepTypeId, ProcessTypeId,
    SubscriptionDetails,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Offer subscription collaborators with scriptable failures and a call log
pub struct FakeOfferSubscriptionProvider {
    details: Mutex<SubscriptionDetails>,
    autosetup: AtomicBool,
    failures: Mutex<HashMap<&'static str, CollaboratorError>>,
    calls: Mutex<Vec<&'static str>>,
}

impl Default for FakeOfferSubscriptionProvider {
    fn default() -> Self {
        Self {
            details: Mutex::new(SubscriptionDetails {
                offer_subscription_id: Uuid::new_v4(),
                offer_name: "Connector as a Service".to_string(),
                is_single_instance: false,
                needs_technical_user: true,
            }),
            autosetup: AtomicBool::new(false),
            failures: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl FakeOfferSubscriptionProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn without_technical_user(self) -> Self {
        self.details.lock().needs_technical_user = false;
        self
    }

    pub fn single_instance(self) -> Self {
        self.details.lock().is_single_instance = true;
        self
    }

    pub fn with_autosetup(self) -> Self {
        self.autosetup.store(true, Ordering::SeqCst);
        self
    }

    /// Fail every call of `operation` until cleared
    pub fn fail(&self, operation: &'static str, error: CollaboratorError) {
        self.failures.lock().insert(operation, error);
    }

    pub fn clear_failures(&self) {
        self.failures.lock().clear();
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self, operation: &str) -> usize {
        self.calls.lock().iter().filter(|c| **c == operation).count()
    }

    fn record(&self, operation: &'static str) -> Result<(), CollaboratorError> {
        self.calls.lock().push(operation);
        match self.failures.lock().get(operation) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl OfferSubscriptionProvider for FakeOfferSubscriptionProvider {
    async fn get_subscription_details(
        &self,
        _process_id: Uuid,
        cancellation_token: &CancellationToken,
    ) -> Result<SubscriptionDetails, CollaboratorError> {
        self.record("get_subscription_details")?;
        if cancellation_token.is_cancelled() {
            return Err(CollaboratorError::Unavailable {
                service: "provider",
                message: "request cancelled".to_string(),
            });
        }
        Ok(self.details.lock().clone())
    }

    async fn trigger_provider(
        &self,
        _details: &SubscriptionDetails,
        _cancellation_token: &CancellationToken,
    ) -> Result<ProviderTriggered, CollaboratorError> {
        self.record("trigger_provider")?;
        if self.autosetup.load(Ordering::SeqCst) {
            Ok(ProviderTriggered::AutosetupStarted)
        } else {
            Ok(ProviderTriggered::Notified)
        }
    }

    async fn create_single_instance_subscription_details(
        &self,
        _details: &SubscriptionDetails,
        _cancellation_token: &CancellationToken,
    ) -> Result<(), CollaboratorError> {
        self.record("create_single_instance_subscription_details")
    }

    async fn create_client(
        &self,
        _details: &SubscriptionDetails,
        _cancellation_token: &CancellationToken,
    ) -> Result<String, CollaboratorError> {
        self.record("create_client")?;
        Ok("sa-client-1".to_string())
    }

    async fn create_technical_user(
        &self,
        _details: &SubscriptionDetails,
        _cancellation_token: &CancellationToken,
    ) -> Result<String, CollaboratorError> {
        self.record("create_technical_user")?;
        Ok("tu-1".to_string())
    }

    async fn activate_subscription(
        &self,
        _details: &SubscriptionDetails,
        _cancellation_token: &CancellationToken,
    ) -> Result<(), CollaboratorError> {
        self.record("activate_subscription")
    }

    async fn trigger_provider_callback(
        &self,
        _details: &SubscriptionDetails,
        _cancellation_token: &CancellationToken,
    ) -> Result<(), CollaboratorError> {
        self.record("trigger_provider_callback")
    }
}

/// Mail sender that sends one mail per call and records overlapping calls per process
#[derive(Default)]
pub struct TrackingMailSender {
    queued: DashMap<Uuid, usize>,
    in_flight: DashMap<Uuid, usize>,
    overlaps: AtomicUsize,
    sent: AtomicUsize,
    delay: Duration,
}

impl TrackingMailSender {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn queue(&self, process_id: Uuid, mails: usize) {
        self.queued.insert(process_id, mails);
    }

    pub fn overlaps(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> usize {
        self.sent.load(Ordering::SeqCst)
    }
}

struct InFlight<'a> {
    in_flight: &'a DashMap<Uuid, usize>,
    process_id: Uuid,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(mut running) = self.in_flight.get_mut(&self.process_id) {
            *running -= 1;
        }
    }
}

#[async_trait]
impl MailSender for TrackingMailSender {
    async fn send_mails(
        &self,
        process_id: Uuid,
        _cancellation_token: &CancellationToken,
    ) -> Result<MailBatch, CollaboratorError> {
        {
            let mut running = self.in_flight.entry(process_id).or_insert(0);
            *running += 1;
            if *running > 1 {
                self.overlaps.fetch_add(1, Ordering::SeqCst);
            }
        }
        // leaves the in-flight count even when the send is dropped mid-delay
        let _in_flight = InFlight {
            in_flight: &self.in_flight,
            process_id,
        };

        tokio::time::sleep(self.delay).await;

        let remaining = {
            let mut queued = self.queued.entry(process_id).or_insert(1);
            *queued = queued.saturating_sub(1);
            *queued
        };
        self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(MailBatch { sent: 1, remaining })
    }
}

/// What a [`ScriptedExecutor`] does on its next call
pub enum Behavior {
    Return(StepExecutionResult<ProcessStepTypeId>),
    Error(&'static str),
    Panic(&'static str),
    /// Block until the cancellation token fires
    WaitForCancel,
    /// Sleep, then return DONE with no follow-up
    Sleep(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutedStep {
    pub process_id: Uuid,
    pub stored_step_type: ProcessStepTypeId,
    pub step_type: ProcessStepTypeId,
    pub is_retrigger: bool,
}

/// Mailing executor whose results are scripted per call. Unscripted calls return DONE with no
/// follow-up.
#[derive(Default)]
pub struct ScriptedExecutor {
    script: Mutex<VecDeque<Behavior>>,
    executed: Mutex<Vec<ExecutedStep>>,
    initialized: Mutex<Vec<Uuid>>,
    forgotten: Mutex<Vec<Uuid>>,
    skip_on_init: Mutex<Vec<ProcessStepTypeId>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(self, behavior: Behavior) -> Self {
        self.script.lock().push_back(behavior);
        self
    }

    pub fn push(&self, behavior: Behavior) {
        self.script.lock().push_back(behavior);
    }

    pub fn skipping_on_init(self, step_types: Vec<ProcessStepTypeId>) -> Self {
        *self.skip_on_init.lock() = step_types;
        self
    }

    pub fn executed(&self) -> Vec<ExecutedStep> {
        self.executed.lock().clone()
    }

    pub fn initialized(&self) -> Vec<Uuid> {
        self.initialized.lock().clone()
    }

    pub fn forgotten(&self) -> Vec<Uuid> {
        self.forgotten.lock().clone()
    }
}

#[async_trait]
impl ProcessTypeExecutor<ProcessTypeId, ProcessStepTypeId> for ScriptedExecutor {
    fn process_type_id(&self) -> ProcessTypeId {
        ProcessTypeId::Mailing
    }

    fn is_executable_step_type_id(&self, _step_type: ProcessStepTypeId) -> bool {
        true
    }

    async fn initialize_process(
        &self,
        process_id: Uuid,
        _step_type_ids: &[ProcessStepTypeId],
        _cancellation_token: &CancellationToken,
    ) -> anyhow::Result<InitializationResult<ProcessStepTypeId>> {
        self.initialized.lock().push(process_id);
        Ok(InitializationResult::skipping(self.skip_on_init.lock().clone()))
    }

    fn forget_process(&self, process_id: Uuid) {
        self.forgotten.lock().push(process_id);
    }

    async fn execute_process_step(
        &self,
        step_type: ProcessStepTypeId,
        context: &ProcessContext<ProcessTypeId, ProcessStepTypeId>,
        cancellation_token: &CancellationToken,
    ) -> anyhow::Result<StepExecutionResult<ProcessStepTypeId>> {
        self.executed.lock().push(ExecutedStep {
            process_id: context.process_id,
            stored_step_type: context.step.process_step_type_id,
            step_type,
            is_retrigger: context.is_retrigger,
        });

        let behavior = self.script.lock().pop_front();
        match behavior {
            None => Ok(StepExecutionResult::done([])),
            Some(Behavior::Return(result)) => Ok(result),
            Some(Behavior::Error(message)) => Err(anyhow::anyhow!(message)),
            Some(Behavior::Panic(message)) => panic!("{}", message),
            Some(Behavior::WaitForCancel) => {
                cancellation_token.cancelled().await;
                Ok(StepExecutionResult::done([ProcessStepTypeId::SendMail]))
            }
            Some(Behavior::Sleep(duration)) => {
                tokio::time::sleep(duration).await;
                Ok(StepExecutionResult::done([]))
            }
        }
    }
}
