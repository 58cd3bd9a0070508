use super::TypeCode;
use crate::error::{ProcessError, ProcessResult};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Static, read-only step metadata for one process domain.
///
/// Built once at startup from explicit declarations; never mutated afterwards, so lookups need
/// no synchronization.
#[derive(Debug, Clone)]
pub struct StepTaxonomy<P, S> {
    executable: HashMap<P, BTreeSet<S>>,
    retrigger_steps: HashMap<S, S>,
    retriggered_steps: HashMap<S, S>,
    declared_retriggers: Vec<(S, S)>,
}

/// Collects the declarations of a [`StepTaxonomy`]
#[derive(Debug)]
pub struct StepTaxonomyBuilder<P, S> {
    executable: HashMap<P, BTreeSet<S>>,
    retriggers: Vec<(S, S)>,
}

impl<P: TypeCode, S: TypeCode> Default for StepTaxonomyBuilder<P, S> {
    fn default() -> Self {
        Self {
            executable: HashMap::new(),
            retriggers: Vec::new(),
        }
    }
}

impl<P: TypeCode, S: TypeCode> StepTaxonomyBuilder<P, S> {
    /// Declare step types the process type may execute
    pub fn executable<I>(mut self, process_type: P, step_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
    {
        self.executable
            .entry(process_type)
            .or_default()
            .extend(step_types);
        self
    }

    /// Declare `retrigger_step` as the companion that re-runs a failed `step`
    pub fn retrigger(mut self, step: S, retrigger_step: S) -> Self {
        self.retriggers.push((step, retrigger_step));
        self
    }

    pub fn build(self) -> StepTaxonomy<P, S> {
        let retrigger_steps = self.retriggers.iter().copied().collect();
        let retriggered_steps = self.retriggers.iter().map(|(s, r)| (*r, *s)).collect();
        StepTaxonomy {
            executable: self.executable,
            retrigger_steps,
            retriggered_steps,
            declared_retriggers: self.retriggers,
        }
    }
}

impl<P: TypeCode, S: TypeCode> StepTaxonomy<P, S> {
    pub fn builder() -> StepTaxonomyBuilder<P, S> {
        StepTaxonomyBuilder::default()
    }

    /// True iff `step_type` is declared executable for `process_type`
    pub fn is_executable(&self, process_type: P, step_type: S) -> bool {
        self.executable
            .get(&process_type)
            .is_some_and(|steps| steps.contains(&step_type))
    }

    /// Executable step types of a process type, in code order
    pub fn executable_step_types(&self, process_type: P) -> impl Iterator<Item = S> + '_ {
        self.executable
            .get(&process_type)
            .into_iter()
            .flat_map(|steps| steps.iter().copied())
    }

    pub fn process_types(&self) -> impl Iterator<Item = P> + '_ {
        self.executable.keys().copied()
    }

    /// The companion retrigger step type of a failable step, if it has one
    pub fn retrigger_step(&self, step_type: S) -> Option<S> {
        self.retrigger_steps.get(&step_type).copied()
    }

    /// The step type a retrigger step re-runs.
    ///
    /// Fails with a conflict when `retrigger_step_type` has no mapping.
    pub fn step_to_retrigger(&self, retrigger_step_type: S) -> ProcessResult<S> {
        self.retriggered_steps
            .get(&retrigger_step_type)
            .copied()
            .ok_or_else(|| {
                ProcessError::Conflict(format!(
                    "step {retrigger_step_type} is not retriggerable"
                ))
            })
    }

    pub fn is_retrigger_step(&self, step_type: S) -> bool {
        self.retriggered_steps.contains_key(&step_type)
    }

    /// The step type whose executor logic runs for a stored step type
    pub fn resolve_execution_step(&self, step_type: S) -> S {
        self.retriggered_steps
            .get(&step_type)
            .copied()
            .unwrap_or(step_type)
    }

    /// Startup validation of the declarations.
    ///
    /// Retrigger declarations must form a bijection between failable and retrigger step
    /// types, must not chain, and a retrigger step must be executable for exactly the process
    /// types its target step is executable for.
    pub fn validate(&self) -> ProcessResult<()> {
        let mut problems = Vec::new();
        let mut sources = HashSet::new();
        let mut targets = HashSet::new();

        for (step, retrigger_step) in &self.declared_retriggers {
            if step == retrigger_step {
                problems.push(format!("{step} cannot retrigger itself"));
            }
            if !sources.insert(*step) {
                problems.push(format!("{step} declares more than one retrigger step"));
            }
            if !targets.insert(*retrigger_step) {
                problems.push(format!(
                    "{retrigger_step} is the retrigger step of more than one step"
                ));
            }
        }

        for chained in sources.intersection(&targets) {
            problems.push(format!(
                "{chained} is both a retrigger step and retriggerable"
            ));
        }

        for (process_type, steps) in &self.executable {
            for (step, retrigger_step) in &self.declared_retriggers {
                match (steps.contains(step), steps.contains(retrigger_step)) {
                    (true, false) => problems.push(format!(
                        "{retrigger_step} must be executable for {process_type} like {step}"
                    )),
                    (false, true) => problems.push(format!(
                        "{retrigger_step} is executable for {process_type} but {step} is not"
                    )),
                    _ => {}
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            problems.sort();
            Err(ProcessError::Configuration(format!(
                "invalid step taxonomy: {}",
                problems.join("; ")
            )))
        }
    }
}
