//! Retrigger and manual step completion against the in-memory repository.

mod common;

use async_trait::async_trait;
use common::*;
use parking_lot::Mutex;
use portal_processes::orchestration::{ManualStepService, RetriggerService};
use portal_processes::portal::{
    self, OfferSubscriptionProcessTypeExecutor, ProcessStepTypeId, ProcessTypeId,
};
use portal_processes::repository::{
    ClaimedProcess, ExecutableStepFilter, PersistedOutcome, ProcessRepository, StepOutcome,
};
use portal_processes::{Process, ProcessResult, ProcessStep, ProcessStepStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use ProcessStepStatus::{Done, Failed, Todo};
use ProcessStepTypeId::*;

type PortalRetrigger = RetriggerService<ProcessTypeId, ProcessStepTypeId>;
type PortalManualSteps = ManualStepService<ProcessTypeId, ProcessStepTypeId>;

fn retrigger_service(repo: &Arc<PortalRepository>) -> PortalRetrigger {
    RetriggerService::new(repo.clone(), portal::taxonomy())
}

/// A mailing process whose SendMail step failed
async fn failed_mailing(
    repo: &Arc<PortalRepository>,
    executor: &Arc<ScriptedExecutor>,
) -> (PortalDispatcher, Uuid) {
    executor.push(Behavior::Error("smtp relay refused connection"));
    let dispatcher = dispatcher(repo.clone(), executor.clone());
    let (process, _) = start_process(repo, ProcessTypeId::Mailing, SendMail).await;
    dispatcher
        .run_cycle(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(
        step_statuses(repo, process.id).await,
        vec![(SendMail, Failed)]
    );
    (dispatcher, process.id)
}

#[tokio::test]
async fn test_retrigger_runs_original_step_logic() {
    let repo = repository();
    let executor = Arc::new(ScriptedExecutor::new());
    let (dispatcher, process_id) = failed_mailing(&repo, &executor).await;

    let retrigger_step = retrigger_service(&repo)
        .retrigger(process_id, SendMail)
        .await
        .unwrap();
    assert_eq!(retrigger_step.process_step_type_id, RetriggerSendMail);
    assert_eq!(retrigger_step.process_step_status_id, Todo);

    dispatcher
        .run_cycle(&CancellationToken::new())
        .await
        .unwrap();

    let executed = executor.executed();
    assert_eq!(executed.len(), 2);
    assert_eq!(
        executed[1],
        ExecutedStep {
            process_id,
            stored_step_type: RetriggerSendMail,
            step_type: SendMail,
            is_retrigger: true,
        }
    );
    assert!(!executed[0].is_retrigger);
    // the failed step stays as history
    assert_eq!(
        step_statuses(&repo, process_id).await,
        vec![(SendMail, Failed), (RetriggerSendMail, Done)]
    );
}

#[tokio::test]
async fn test_step_without_retrigger_companion_conflicts() {
    let repo = repository();
    let (process, _) =
        start_process(&repo, ProcessTypeId::OfferSubscription, ActivateSubscription).await;

    let err = retrigger_service(&repo)
        .retrigger(process.id, ActivateSubscription)
        .await
        .unwrap_err();
    assert!(err.is_conflict());
    assert!(err.to_string().contains("is not retriggerable"));
}

#[tokio::test]
async fn test_retrigger_of_unknown_process_is_not_found() {
    let repo = repository();
    let err = retrigger_service(&repo)
        .retrigger(Uuid::new_v4(), SendMail)
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_retrigger_type_must_be_executable_for_process_type() {
    let repo = repository();
    let (process, _) = start_process(&repo, ProcessTypeId::Mailing, SendMail).await;

    let err = retrigger_service(&repo)
        .retrigger(process.id, TriggerProvider)
        .await
        .unwrap_err();
    assert!(err.is_conflict());
}

#[tokio::test]
async fn test_done_step_cannot_be_retriggered() {
    let repo = repository();
    let dispatcher = dispatcher(repo.clone(), Arc::new(ScriptedExecutor::new()));
    let (process, _) = start_process(&repo, ProcessTypeId::Mailing, SendMail).await;
    dispatcher
        .run_cycle(&CancellationToken::new())
        .await
        .unwrap();

    let err = retrigger_service(&repo)
        .retrigger(process.id, SendMail)
        .await
        .unwrap_err();
    assert!(err.is_conflict());
    assert!(err.to_string().contains("not FAILED"));
    assert_eq!(repo.step_count(), 1);
}

#[tokio::test]
async fn test_pending_step_cannot_be_retriggered() {
    let repo = repository();
    let (process, _) = start_process(&repo, ProcessTypeId::Mailing, SendMail).await;

    let err = retrigger_service(&repo)
        .retrigger(process.id, SendMail)
        .await
        .unwrap_err();
    assert!(err.is_conflict());
    assert!(err.to_string().contains("still pending"));
}

#[tokio::test]
async fn test_leased_process_cannot_be_retriggered() {
    let repo = repository();
    let (process, _) = start_process(&repo, ProcessTypeId::Mailing, SendMail).await;
    let filter = ExecutableStepFilter::new().with(ProcessTypeId::Mailing, [SendMail]);
    repo.get_process_with_next_executable_step(&filter, LONG_LEASE)
        .await
        .unwrap()
        .expect("process should be claimable");

    let err = retrigger_service(&repo)
        .retrigger(process.id, SendMail)
        .await
        .unwrap_err();
    assert!(err.is_conflict());
    assert!(err.to_string().contains("being executed"));
}

#[tokio::test]
async fn test_pending_retrigger_step_is_reused() {
    let repo = repository();
    let executor = Arc::new(ScriptedExecutor::new());
    let (_dispatcher, process_id) = failed_mailing(&repo, &executor).await;
    let service = retrigger_service(&repo);

    let first = service.retrigger(process_id, SendMail).await.unwrap();
    let second = service.retrigger(process_id, SendMail).await.unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(
        step_statuses(&repo, process_id).await,
        vec![(SendMail, Failed), (RetriggerSendMail, Todo)]
    );
}

#[tokio::test]
async fn test_failed_retrigger_step_is_requeued() {
    let repo = repository();
    let executor = Arc::new(ScriptedExecutor::new());
    let (dispatcher, process_id) = failed_mailing(&repo, &executor).await;
    let service = retrigger_service(&repo);

    let retrigger_step = service.retrigger(process_id, SendMail).await.unwrap();
    executor.push(Behavior::Error("smtp relay still down"));
    dispatcher
        .run_cycle(&CancellationToken::new())
        .await
        .unwrap();
    let failed = repo
        .get_process_step(retrigger_step.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(failed.process_step_status_id, Failed);
    assert_eq!(
        failed.message.as_deref(),
        Some("unexpected error: smtp relay still down")
    );

    let requeued = service.retrigger(process_id, SendMail).await.unwrap();
    assert_eq!(requeued.id, retrigger_step.id);
    assert_eq!(requeued.process_step_status_id, Todo);
    assert!(requeued.message.is_none());
    assert_eq!(repo.step_count(), 2);

    dispatcher
        .run_cycle(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(
        step_statuses(&repo, process_id).await,
        vec![(SendMail, Failed), (RetriggerSendMail, Done)]
    );
}

#[tokio::test]
async fn test_manually_failed_step_recovers_through_retrigger() {
    let repo = repository();
    let provider = Arc::new(FakeOfferSubscriptionProvider::new());
    let dispatcher = dispatcher(
        repo.clone(),
        Arc::new(OfferSubscriptionProcessTypeExecutor::new(provider.clone())),
    );
    let (process, _) =
        start_process(&repo, ProcessTypeId::OfferSubscription, TriggerProvider).await;
    let manual: PortalManualSteps = ManualStepService::new(repo.clone());

    manual
        .fail_step(
            process.id,
            TriggerProvider,
            "provider endpoint not configured".to_string(),
        )
        .await
        .unwrap();
    let failed = &repo.get_process_steps(process.id).await.unwrap()[0];
    assert_eq!(failed.process_step_status_id, Failed);
    assert_eq!(
        failed.message.as_deref(),
        Some("provider endpoint not configured")
    );

    retrigger_service(&repo)
        .retrigger(process.id, TriggerProvider)
        .await
        .unwrap();
    dispatcher
        .run_cycle(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        step_statuses(&repo, process.id).await,
        vec![
            (TriggerProvider, Failed),
            (RetriggerProvider, Done),
            (OfferSubscriptionClientCreation, Todo),
        ]
    );
    assert_eq!(provider.call_count("trigger_provider"), 1);
}

#[tokio::test]
async fn test_manual_completion_requires_pending_step() {
    let repo = repository();
    let (process, _) =
        start_process(&repo, ProcessTypeId::OfferSubscription, TriggerProvider).await;
    let manual: PortalManualSteps = ManualStepService::new(repo.clone());

    let err = manual
        .complete_step(process.id, AwaitStartAutosetup, vec![], None)
        .await
        .unwrap_err();
    assert!(err.is_conflict());

    let err = manual
        .complete_step(Uuid::new_v4(), AwaitStartAutosetup, vec![], None)
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_manual_completion_marks_extra_pending_steps_duplicate() {
    let repo = repository();
    let (process, _) =
        start_process(&repo, ProcessTypeId::OfferSubscription, AwaitStartAutosetup).await;
    repo.create_process_step(process.id, AwaitStartAutosetup, Todo)
        .await
        .unwrap();
    let manual: PortalManualSteps = ManualStepService::new(repo.clone());

    let persisted = manual
        .complete_step(
            process.id,
            AwaitStartAutosetup,
            vec![OfferSubscriptionClientCreation],
            None,
        )
        .await
        .unwrap();

    assert!(!persisted.process.is_locked());
    assert_eq!(
        step_statuses(&repo, process.id).await,
        vec![
            (AwaitStartAutosetup, Done),
            (AwaitStartAutosetup, ProcessStepStatus::Duplicate),
            (OfferSubscriptionClientCreation, Todo),
        ]
    );
}

/// Repository that lets one competing write land right after a step list is read
struct InterleavingRepository {
    inner: Arc<PortalRepository>,
    competing_step: Mutex<Option<(Uuid, ProcessStepTypeId)>>,
}

#[async_trait]
impl ProcessRepository<ProcessTypeId, ProcessStepTypeId> for InterleavingRepository {
    async fn create_process(
        &self,
        process_type_id: ProcessTypeId,
    ) -> ProcessResult<Process<ProcessTypeId>> {
        self.inner.create_process(process_type_id).await
    }

    async fn create_process_step(
        &self,
        process_id: Uuid,
        process_step_type_id: ProcessStepTypeId,
        status: ProcessStepStatus,
    ) -> ProcessResult<ProcessStep<ProcessStepTypeId>> {
        self.inner
            .create_process_step(process_id, process_step_type_id, status)
            .await
    }

    async fn create_process_step_at_version(
        &self,
        process_id: Uuid,
        process_step_type_id: ProcessStepTypeId,
        status: ProcessStepStatus,
        expected_version: i64,
    ) -> ProcessResult<ProcessStep<ProcessStepTypeId>> {
        self.inner
            .create_process_step_at_version(
                process_id,
                process_step_type_id,
                status,
                expected_version,
            )
            .await
    }

    async fn get_process(
        &self,
        process_id: Uuid,
    ) -> ProcessResult<Option<Process<ProcessTypeId>>> {
        self.inner.get_process(process_id).await
    }

    async fn get_process_steps(
        &self,
        process_id: Uuid,
    ) -> ProcessResult<Vec<ProcessStep<ProcessStepTypeId>>> {
        let steps = self.inner.get_process_steps(process_id).await?;
        let competing = self.competing_step.lock().take();
        if let Some((process_id, step_type)) = competing {
            self.inner
                .create_process_step(process_id, step_type, Todo)
                .await?;
        }
        Ok(steps)
    }

    async fn get_process_step(
        &self,
        step_id: Uuid,
    ) -> ProcessResult<Option<ProcessStep<ProcessStepTypeId>>> {
        self.inner.get_process_step(step_id).await
    }

    async fn get_process_with_next_executable_step(
        &self,
        filter: &ExecutableStepFilter<ProcessTypeId, ProcessStepTypeId>,
        lock_expiry: Duration,
    ) -> ProcessResult<Option<ClaimedProcess<ProcessTypeId, ProcessStepTypeId>>> {
        self.inner
            .get_process_with_next_executable_step(filter, lock_expiry)
            .await
    }

    async fn update_process_step_status(
        &self,
        step_id: Uuid,
        status: ProcessStepStatus,
        message: Option<String>,
        expected_version: i64,
    ) -> ProcessResult<Process<ProcessTypeId>> {
        self.inner
            .update_process_step_status(step_id, status, message, expected_version)
            .await
    }

    async fn requeue_step(
        &self,
        step_id: Uuid,
        expected_version: i64,
    ) -> ProcessResult<ProcessStep<ProcessStepTypeId>> {
        self.inner.requeue_step(step_id, expected_version).await
    }

    async fn persist_step_outcome(
        &self,
        outcome: StepOutcome<ProcessStepTypeId>,
    ) -> ProcessResult<PersistedOutcome<ProcessTypeId, ProcessStepTypeId>> {
        self.inner.persist_step_outcome(outcome).await
    }

    async fn release_lock(
        &self,
        process_id: Uuid,
        expected_version: i64,
    ) -> ProcessResult<Process<ProcessTypeId>> {
        self.inner.release_lock(process_id, expected_version).await
    }
}

#[tokio::test]
async fn test_concurrent_retrigger_conflicts_instead_of_adding_a_second_step() {
    let repo = repository();
    let executor = Arc::new(ScriptedExecutor::new());
    let (_dispatcher, process_id) = failed_mailing(&repo, &executor).await;
    let interleaving = Arc::new(InterleavingRepository {
        inner: repo.clone(),
        competing_step: Mutex::new(Some((process_id, RetriggerSendMail))),
    });
    let service: PortalRetrigger = RetriggerService::new(interleaving, portal::taxonomy());

    let err = service.retrigger(process_id, SendMail).await.unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(
        step_statuses(&repo, process_id).await,
        vec![(SendMail, Failed), (RetriggerSendMail, Todo)]
    );

    // a retry finds the step the other caller enqueued
    let pending = retrigger_service(&repo)
        .retrigger(process_id, SendMail)
        .await
        .unwrap();
    assert_eq!(pending.process_step_type_id, RetriggerSendMail);
    assert_eq!(repo.step_count(), 2);
}
