//! Subscription state transitions
//!
//! The processor is the source of truth for subscription status; this module
//! only decides how an incoming partial update folds into the stored
//! projection. Every field coalesces: a value absent from the update leaves
//! the stored value untouched. Termination is the one unconditional override.

use iva_shared::{SubscriptionProjection, SubscriptionStatus};

/// Partial update extracted from a payment event
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionUpdate {
    pub customer_ref: Option<String>,
    pub subscription_ref: Option<String>,
    pub price_ref: Option<String>,
    pub status: Option<SubscriptionStatus>,
    /// Applied directly only when `status` is absent
    pub is_subscribed: Option<bool>,
    /// The processor reports the subscription as terminated
    pub terminate: bool,
}

impl SubscriptionUpdate {
    pub fn status(status: SubscriptionStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn termination() -> Self {
        Self {
            terminate: true,
            ..Default::default()
        }
    }

    pub fn with_customer(mut self, customer_ref: Option<String>) -> Self {
        self.customer_ref = customer_ref;
        self
    }

    pub fn with_subscription(mut self, subscription_ref: Option<String>) -> Self {
        self.subscription_ref = subscription_ref;
        self
    }

    pub fn with_price(mut self, price_ref: Option<String>) -> Self {
        self.price_ref = price_ref;
        self
    }
}

/// Next projection of a tenant given its current one and an update
pub fn apply(current: &SubscriptionProjection, update: &SubscriptionUpdate) -> SubscriptionProjection {
    let customer_ref = update.customer_ref.clone().or_else(|| current.customer_ref.clone());
    let subscription_ref = update
        .subscription_ref
        .clone()
        .or_else(|| current.subscription_ref.clone());
    let price_ref = update.price_ref.clone().or_else(|| current.price_ref.clone());

    if update.terminate {
        return SubscriptionProjection {
            customer_ref,
            subscription_ref,
            price_ref,
            status: SubscriptionStatus::Canceled,
            is_subscribed: false,
        };
    }

    let (status, is_subscribed) = match (update.status, update.is_subscribed) {
        (Some(status), _) => (status, status.grants_access()),
        (None, Some(is_subscribed)) => (current.status, is_subscribed),
        (None, None) => (current.status, current.is_subscribed),
    };

    SubscriptionProjection {
        customer_ref,
        subscription_ref,
        price_ref,
        status,
        is_subscribed,
    }
}
