//! Process step status state machine.
//!
//! Step statuses are mutated only by the dispatcher commit, the retrigger flow and manual
//! step completion; every mutation goes through [`ProcessStepStatus::transition_to`].

pub mod states;

pub use states::ProcessStepStatus;
