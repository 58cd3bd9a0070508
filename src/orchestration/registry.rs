//! # Executor Registry
//!
//! Static routing table from process type to executor, built once by composition-root code
//! and read-only afterwards. Building it validates the step taxonomy, so a misdeclared
//! retrigger mapping stops a worker at startup instead of surfacing on the first retrigger.

use super::executor::ProcessTypeExecutor;
use crate::error::{ProcessError, ProcessResult};
use crate::repository::ExecutableStepFilter;
use crate::taxonomy::{StepTaxonomy, TypeCode};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

pub struct ExecutorRegistry<P, S> {
    executors: HashMap<P, Arc<dyn ProcessTypeExecutor<P, S>>>,
    taxonomy: Arc<StepTaxonomy<P, S>>,
    filter: ExecutableStepFilter<P, S>,
}

impl<P: TypeCode, S: TypeCode> std::fmt::Debug for ExecutorRegistry<P, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("process_types", &self.process_types().collect::<Vec<_>>())
            .field("filter", &self.filter)
            .finish()
    }
}

pub struct ExecutorRegistryBuilder<P, S> {
    taxonomy: Arc<StepTaxonomy<P, S>>,
    executors: Vec<Arc<dyn ProcessTypeExecutor<P, S>>>,
}

impl<P: TypeCode, S: TypeCode> ExecutorRegistryBuilder<P, S> {
    pub fn register(mut self, executor: Arc<dyn ProcessTypeExecutor<P, S>>) -> Self {
        self.executors.push(executor);
        self
    }

    pub fn build(self) -> ProcessResult<ExecutorRegistry<P, S>> {
        self.taxonomy.validate()?;

        let mut executors: HashMap<P, Arc<dyn ProcessTypeExecutor<P, S>>> = HashMap::new();
        let mut filter = ExecutableStepFilter::new();
        for executor in self.executors {
            let process_type = executor.process_type_id();
            let step_types: Vec<S> = self
                .taxonomy
                .executable_step_types(process_type)
                .filter(|step_type| executor.is_executable_step_type_id(*step_type))
                .collect();
            if executors.insert(process_type, executor).is_some() {
                return Err(ProcessError::Configuration(format!(
                    "more than one executor registered for process type {process_type}"
                )));
            }
            info!(
                process_type = %process_type,
                step_types = ?step_types,
                "Registered process type executor"
            );
            filter.insert(process_type, step_types);
        }

        Ok(ExecutorRegistry {
            executors,
            taxonomy: self.taxonomy,
            filter,
        })
    }
}

impl<P: TypeCode, S: TypeCode> ExecutorRegistry<P, S> {
    pub fn builder(taxonomy: Arc<StepTaxonomy<P, S>>) -> ExecutorRegistryBuilder<P, S> {
        ExecutorRegistryBuilder {
            taxonomy,
            executors: Vec::new(),
        }
    }

    pub fn get(&self, process_type: P) -> Option<&Arc<dyn ProcessTypeExecutor<P, S>>> {
        self.executors.get(&process_type)
    }

    pub fn taxonomy(&self) -> &Arc<StepTaxonomy<P, S>> {
        &self.taxonomy
    }

    /// Step types this worker instance can execute, per registered process type
    pub fn executable_filter(&self) -> &ExecutableStepFilter<P, S> {
        &self.filter
    }

    pub fn process_types(&self) -> impl Iterator<Item = P> + '_ {
        self.executors.keys().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::executor::{ProcessContext, StepExecutionResult};
    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    crate::type_code_enum! {
        enum Flow {
            Signup = 1 => "SIGNUP",
            Export = 2 => "EXPORT",
        }
    }

    crate::type_code_enum! {
        enum Step {
            Verify = 10 => "VERIFY",
            Welcome = 11 => "WELCOME",
            RetriggerVerify = 12 => "RETRIGGER_VERIFY",
            Dump = 20 => "DUMP",
        }
    }

    struct StaticExecutor {
        process_type: Flow,
        excluded: Option<Step>,
    }

    #[async_trait]
    impl ProcessTypeExecutor<Flow, Step> for StaticExecutor {
        fn process_type_id(&self) -> Flow {
            self.process_type
        }

        fn is_executable_step_type_id(&self, step_type: Step) -> bool {
            Some(step_type) != self.excluded
        }

        async fn execute_process_step(
            &self,
            _step_type: Step,
            _context: &ProcessContext<Flow, Step>,
            _cancellation_token: &CancellationToken,
        ) -> anyhow::Result<StepExecutionResult<Step>> {
            Ok(StepExecutionResult::done([]))
        }
    }

    fn taxonomy() -> Arc<StepTaxonomy<Flow, Step>> {
        Arc::new(
            StepTaxonomy::builder()
                .executable(
                    Flow::Signup,
                    [Step::Verify, Step::Welcome, Step::RetriggerVerify],
                )
                .executable(Flow::Export, [Step::Dump])
                .retrigger(Step::Verify, Step::RetriggerVerify)
                .build(),
        )
    }

    #[test]
    fn test_filter_is_narrowed_by_executor() {
        let registry = ExecutorRegistry::builder(taxonomy())
            .register(Arc::new(StaticExecutor {
                process_type: Flow::Signup,
                excluded: Some(Step::Welcome),
            }))
            .build()
            .unwrap();

        let filter = registry.executable_filter();
        assert!(filter.contains(Flow::Signup, Step::Verify));
        assert!(filter.contains(Flow::Signup, Step::RetriggerVerify));
        assert!(!filter.contains(Flow::Signup, Step::Welcome));
        assert!(!filter.contains(Flow::Export, Step::Dump));
        assert!(registry.get(Flow::Export).is_none());
    }

    #[test]
    fn test_rejects_second_executor_for_process_type() {
        let err = ExecutorRegistry::builder(taxonomy())
            .register(Arc::new(StaticExecutor {
                process_type: Flow::Export,
                excluded: None,
            }))
            .register(Arc::new(StaticExecutor {
                process_type: Flow::Export,
                excluded: None,
            }))
            .build()
            .unwrap_err();
        assert!(matches!(err, ProcessError::Configuration(_)));
    }

    #[test]
    fn test_rejects_invalid_taxonomy() {
        let broken = Arc::new(
            StepTaxonomy::builder()
                .executable(Flow::Signup, [Step::Verify])
                .retrigger(Step::Verify, Step::RetriggerVerify)
                .build(),
        );
        assert!(ExecutorRegistry::builder(broken).build().is_err());
    }
}
