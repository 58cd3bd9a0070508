#![allow(dead_code)]

pub mod fakes;
pub mod strategies;

pub use fakes::*;

use portal_processes::orchestration::{
    DispatcherConfig, ExecutorRegistry, ProcessDispatcher, ProcessTypeExecutor,
};
use portal_processes::portal::{self, ProcessStepTypeId, ProcessTypeId};
use portal_processes::repository::{InMemoryProcessRepository, ProcessRepository};
use portal_processes::{Process, ProcessStep, ProcessStepStatus};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub type PortalRepository = InMemoryProcessRepository<ProcessTypeId, ProcessStepTypeId>;
pub type PortalDispatcher = ProcessDispatcher<ProcessTypeId, ProcessStepTypeId>;

pub const LONG_LEASE: Duration = Duration::from_secs(300);

pub fn repository() -> Arc<PortalRepository> {
    Arc::new(PortalRepository::new())
}

pub fn dispatcher_config(worker_id: &str, lock_expiry: Duration) -> DispatcherConfig {
    DispatcherConfig {
        worker_id: worker_id.to_string(),
        poll_interval: Duration::from_millis(10),
        lock_expiry,
        error_backoff: Duration::from_millis(10),
    }
}

pub fn dispatcher_with(
    repository: Arc<PortalRepository>,
    executors: Vec<Arc<dyn ProcessTypeExecutor<ProcessTypeId, ProcessStepTypeId>>>,
    config: DispatcherConfig,
) -> PortalDispatcher {
    let registry = executors
        .into_iter()
        .fold(ExecutorRegistry::builder(portal::taxonomy()), |builder, executor| {
            builder.register(executor)
        })
        .build()
        .expect("portal registry should build");
    ProcessDispatcher::new(repository, Arc::new(registry), config)
}

pub fn dispatcher(
    repository: Arc<PortalRepository>,
    executor: Arc<dyn ProcessTypeExecutor<ProcessTypeId, ProcessStepTypeId>>,
) -> PortalDispatcher {
    dispatcher_with(
        repository,
        vec![executor],
        dispatcher_config("test-worker", LONG_LEASE),
    )
}

/// A process with a single TODO step, the way business logic starts one
pub async fn start_process(
    repository: &PortalRepository,
    process_type: ProcessTypeId,
    step_type: ProcessStepTypeId,
) -> (Process<ProcessTypeId>, ProcessStep<ProcessStepTypeId>) {
    let process = repository
        .create_process(process_type)
        .await
        .expect("create process");
    let step = repository
        .create_process_step(process.id, step_type, ProcessStepStatus::Todo)
        .await
        .expect("create step");
    (process, step)
}

/// Step types and statuses of a process in creation order
pub async fn step_statuses(
    repository: &PortalRepository,
    process_id: Uuid,
) -> Vec<(ProcessStepTypeId, ProcessStepStatus)> {
    repository
        .get_process_steps(process_id)
        .await
        .expect("load steps")
        .into_iter()
        .map(|s| (s.process_step_type_id, s.process_step_status_id))
        .collect()
}

pub async fn todo_steps(
    repository: &PortalRepository,
    process_id: Uuid,
) -> Vec<ProcessStep<ProcessStepTypeId>> {
    repository
        .get_process_steps(process_id)
        .await
        .expect("load steps")
        .into_iter()
        .filter(|s| s.is_todo())
        .collect()
}
