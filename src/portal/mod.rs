//! # Portal Processes
//!
//! The process domains of the portal backend and their executors. External systems are
//! reached through the collaborator traits of each executor module; workers supply the
//! HTTP-backed implementations.
//!
//! ```rust
//! use portal_processes::portal::{self, ProcessStepTypeId, ProcessTypeId};
//!
//! let taxonomy = portal::taxonomy();
//! assert!(taxonomy.is_executable(ProcessTypeId::OfferSubscription, ProcessStepTypeId::TriggerProvider));
//! assert_eq!(
//!     taxonomy.retrigger_step(ProcessStepTypeId::TriggerProvider),
//!     Some(ProcessStepTypeId::RetriggerProvider)
//! );
//! ```

pub mod collaborator;
pub mod mailing;
pub mod offer_subscription;
pub mod types;

pub use collaborator::CollaboratorError;
pub use mailing::{MailSender, MailingProcessTypeExecutor};
pub use offer_subscription::{
    OfferSubscriptionProcessTypeExecutor, OfferSubscriptionProvider, SubscriptionDetails,
};
pub use types::{ProcessStepTypeId, ProcessTypeId};

use crate::taxonomy::StepTaxonomy;
use std::sync::{Arc, OnceLock};

pub type PortalStepTaxonomy = StepTaxonomy<ProcessTypeId, ProcessStepTypeId>;

static TAXONOMY: OnceLock<Arc<PortalStepTaxonomy>> = OnceLock::new();

/// The portal step tables, built on first use
pub fn taxonomy() -> Arc<PortalStepTaxonomy> {
    TAXONOMY.get_or_init(|| Arc::new(build_taxonomy())).clone()
}

fn build_taxonomy() -> PortalStepTaxonomy {
    use ProcessStepTypeId::*;

    StepTaxonomy::builder()
        .executable(
            ProcessTypeId::OfferSubscription,
            [
                TriggerProvider,
                SingleInstanceSubscriptionDetailsCreation,
                OfferSubscriptionClientCreation,
                OfferSubscriptionTechnicalUserCreation,
                ActivateSubscription,
                TriggerProviderCallback,
                RetriggerProvider,
                RetriggerOfferSubscriptionClientCreation,
                RetriggerOfferSubscriptionTechnicalUserCreation,
                RetriggerProviderCallback,
            ],
        )
        .executable(ProcessTypeId::Mailing, [SendMail, RetriggerSendMail])
        .retrigger(TriggerProvider, RetriggerProvider)
        .retrigger(
            OfferSubscriptionClientCreation,
            RetriggerOfferSubscriptionClientCreation,
        )
        .retrigger(
            OfferSubscriptionTechnicalUserCreation,
            RetriggerOfferSubscriptionTechnicalUserCreation,
        )
        .retrigger(TriggerProviderCallback, RetriggerProviderCallback)
        .retrigger(SendMail, RetriggerSendMail)
        .build()
}
