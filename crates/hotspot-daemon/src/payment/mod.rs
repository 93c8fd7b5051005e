//! Payments: provider client, notification payloads and the settlement flow.

pub mod flow;
pub mod notification;
pub mod provider;

#[cfg(test)]
mod tests;

pub use flow::{
    EFFECT_DEBT_SETTLEMENT, EFFECT_PACKAGE_APPLY, EffectResult, Initiation, NotificationOutcome,
    PaymentDeps, PaymentFlow, PollReport,
};
pub use notification::{Notification, PaymentAction, VaNumber};
pub use provider::{
    ChargeRequest, HttpProvider, MemoryProvider, PROVIDER_NAME, PaymentProvider, ProviderConfig,
    ProviderError,
};
