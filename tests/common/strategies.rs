use portal_processes::portal::{ProcessStepTypeId, ProcessTypeId};
use proptest::prelude::*;

/// Any declared step type, executable or not
pub fn step_type_strategy() -> impl Strategy<Value = ProcessStepTypeId> {
    prop::sample::select(ProcessStepTypeId::ALL.to_vec())
}

pub fn process_type_strategy() -> impl Strategy<Value = ProcessTypeId> {
    prop::sample::select(ProcessTypeId::ALL.to_vec())
}

/// Processes, each with the step types of its initial TODO steps
pub fn process_population_strategy(
) -> impl Strategy<Value = Vec<(ProcessTypeId, Vec<ProcessStepTypeId>)>> {
    prop::collection::vec(
        (
            process_type_strategy(),
            prop::collection::vec(step_type_strategy(), 1..4),
        ),
        1..12,
    )
}

/// Integer codes that are not declared step types
pub fn unknown_code_strategy() -> impl Strategy<Value = i32> {
    any::<i32>().prop_filter("declared step type code", |code| {
        !ProcessStepTypeId::ALL
            .iter()
            .any(|step| portal_processes::TypeCode::code(*step) == *code)
    })
}
