//! # Orchestration
//!
//! The engine proper: the executor contract, the registry that routes processes to executors,
//! the dispatcher loop, and the two ways a process is moved forward from outside the loop
//! (retrigger of a failed step, manual completion of a callback step).

pub mod dispatcher;
pub mod executor;
pub mod manual;
pub mod registry;
pub mod retrigger;

pub use dispatcher::{CycleOutcome, DispatcherConfig, ProcessDispatcher};
pub use executor::{InitializationResult, ProcessContext, ProcessTypeExecutor, StepExecutionResult};
pub use manual::ManualStepService;
pub use registry::{ExecutorRegistry, ExecutorRegistryBuilder};
pub use retrigger::RetriggerService;
