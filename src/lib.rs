#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Portal Processes
//!
//! Persistent process/step orchestration engine for the portal backend workers.
//!
//! ## Overview
//!
//! A business workflow is persisted as a [`Process`](models::Process) owning a growing list of
//! typed [`ProcessStep`](models::ProcessStep)s. Workers poll for processes with an executable
//! TODO step, run the step through the executor registered for the process type, and commit the
//! outcome (new status, follow-up steps) in one versioned write. Any number of workers may run
//! against the same database: the claim leases a process to a single worker, and every commit
//! is conditioned on the version the worker read.
//!
//! ## Module Organization
//!
//! - [`taxonomy`] - Type code capability trait and the static step tables of a domain
//! - [`state_machine`] - Step statuses and their legal transitions
//! - [`models`] - Process and process step
//! - [`repository`] - Persistence contract with PostgreSQL and in-memory implementations
//! - [`orchestration`] - Executor contract, registry, dispatcher loop, retrigger and manual steps
//! - [`portal`] - The portal's process domains and executors
//! - [`config`] - Layered configuration
//! - [`database`] - Pool creation and migrations
//! - [`logging`] - Structured logging setup
//! - [`error`] - Structured error handling
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use portal_processes::config::ConfigManager;
//! use portal_processes::orchestration::{DispatcherConfig, ExecutorRegistry, ProcessDispatcher};
//! use portal_processes::portal::{self, MailSender, MailingProcessTypeExecutor};
//! use portal_processes::repository::PgProcessRepository;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example(mail_sender: Arc<dyn MailSender>) -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! portal_processes::logging::init_structured_logging(&manager.config().logging);
//!
//! let pool = portal_processes::database::create_pool(&manager.config().database).await?;
//! let registry = ExecutorRegistry::builder(portal::taxonomy())
//!     .register(Arc::new(MailingProcessTypeExecutor::new(mail_sender)))
//!     .build()?;
//!
//! let dispatcher = ProcessDispatcher::new(
//!     Arc::new(PgProcessRepository::new(pool)),
//!     Arc::new(registry),
//!     DispatcherConfig::from(&manager.config().worker),
//! );
//! dispatcher.run(CancellationToken::new()).await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Testing
//!
//! ```bash
//! cargo test --lib                                  # Unit tests
//! cargo test                                        # All in-memory tests
//! DATABASE_URL=postgres://... cargo test -- --ignored   # PostgreSQL repository tests
//! ```

pub mod config;
pub mod database;
pub mod error;
pub mod logging;
pub mod models;
pub mod orchestration;
pub mod portal;
pub mod repository;
pub mod state_machine;
pub mod taxonomy;

pub use config::{ConfigManager, ProcessesConfig};
pub use error::{ProcessError, ProcessResult};
pub use models::{Process, ProcessStep};
pub use orchestration::{
    CycleOutcome, DispatcherConfig, ExecutorRegistry, ManualStepService, ProcessDispatcher,
    ProcessTypeExecutor, RetriggerService, StepExecutionResult,
};
pub use repository::{InMemoryProcessRepository, PgProcessRepository, ProcessRepository};
pub use state_machine::ProcessStepStatus;
pub use taxonomy::{StepTaxonomy, TypeCode};
