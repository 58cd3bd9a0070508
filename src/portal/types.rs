//! Process and step type codes of the portal backend. Codes are persisted; never renumber.

crate::type_code_enum! {
    /// Process domains run by portal workers
    pub enum ProcessTypeId {
        OfferSubscription = 3 => "OFFER_SUBSCRIPTION",
        Mailing = 9 => "MAILING",
    }
}

crate::type_code_enum! {
    pub enum ProcessStepTypeId {
        TriggerProvider = 100 => "TRIGGER_PROVIDER",
        SingleInstanceSubscriptionDetailsCreation = 101 => "SINGLE_INSTANCE_SUBSCRIPTION_DETAILS_CREATION",
        OfferSubscriptionClientCreation = 102 => "OFFERSUBSCRIPTION_CLIENT_CREATION",
        OfferSubscriptionTechnicalUserCreation = 103 => "OFFERSUBSCRIPTION_TECHNICALUSER_CREATION",
        ActivateSubscription = 104 => "ACTIVATE_SUBSCRIPTION",
        TriggerProviderCallback = 105 => "TRIGGER_PROVIDER_CALLBACK",
        RetriggerProvider = 106 => "RETRIGGER_PROVIDER",
        RetriggerOfferSubscriptionClientCreation = 107 => "RETRIGGER_OFFERSUBSCRIPTION_CLIENT_CREATION",
        RetriggerOfferSubscriptionTechnicalUserCreation = 108 => "RETRIGGER_OFFERSUBSCRIPTION_TECHNICALUSER_CREATION",
        RetriggerProviderCallback = 109 => "RETRIGGER_PROVIDER_CALLBACK",
        /// Completed by the provider's autosetup callback, never executed by a worker
        AwaitStartAutosetup = 110 => "AWAIT_START_AUTOSETUP",
        SendMail = 400 => "SEND_MAIL",
        RetriggerSendMail = 401 => "RETRIGGER_SEND_MAIL",
    }
}
