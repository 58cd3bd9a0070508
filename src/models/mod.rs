//! Persisted process state: the [`Process`] aggregate root and the [`ProcessStep`]s it owns.

pub mod process;
pub mod process_step;

pub use process::Process;
pub use process_step::ProcessStep;
