//! Tenant and ledger models

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;

/// Subscription status as asserted by the payment processor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    /// No payment relationship yet
    #[default]
    None,
    Active,
    Trialing,
    PastDue,
    Canceled,
    Incomplete,
    IncompleteExpired,
    Unpaid,
    Paused,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::None => "none",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Incomplete => "incomplete",
            SubscriptionStatus::IncompleteExpired => "incomplete_expired",
            SubscriptionStatus::Unpaid => "unpaid",
            SubscriptionStatus::Paused => "paused",
        }
    }

    /// Whether a tenant in this status counts as subscribed
    ///
    /// `incomplete` and `incomplete_expired` count as subscribed: checkout has
    /// been completed and the processor is still settling the first payment.
    pub fn grants_access(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Active
                | SubscriptionStatus::Trialing
                | SubscriptionStatus::Incomplete
                | SubscriptionStatus::IncompleteExpired
        )
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a status string is not one the processor documents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStatus(pub String);

impl fmt::Display for UnknownStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown subscription status '{}'", self.0)
    }
}

impl std::error::Error for UnknownStatus {}

impl FromStr for SubscriptionStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(SubscriptionStatus::None),
            "active" => Ok(SubscriptionStatus::Active),
            "trialing" => Ok(SubscriptionStatus::Trialing),
            "past_due" => Ok(SubscriptionStatus::PastDue),
            "canceled" | "cancelled" => Ok(SubscriptionStatus::Canceled),
            "incomplete" => Ok(SubscriptionStatus::Incomplete),
            "incomplete_expired" => Ok(SubscriptionStatus::IncompleteExpired),
            "unpaid" => Ok(SubscriptionStatus::Unpaid),
            "paused" => Ok(SubscriptionStatus::Paused),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// A tenant
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Business {
    pub id: Uuid,
    /// Owning user; `None` only for legacy rows that were never claimed
    pub owner_user_id: Option<String>,
    pub name: String,
    pub timezone: String,
    /// Auto-created on first resolution (at most one per owner)
    pub is_default: bool,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub stripe_price_id: Option<String>,
    pub subscription_status: SubscriptionStatus,
    pub is_subscribed: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Business {
    /// Subscription fields of this tenant
    pub fn subscription(&self) -> SubscriptionProjection {
        SubscriptionProjection {
            customer_ref: self.stripe_customer_id.clone(),
            subscription_ref: self.stripe_subscription_id.clone(),
            price_ref: self.stripe_price_id.clone(),
            status: self.subscription_status,
            is_subscribed: self.is_subscribed,
        }
    }

    /// Copy of this row with the given subscription fields applied
    pub fn with_subscription(&self, projection: &SubscriptionProjection, now: OffsetDateTime) -> Self {
        Self {
            stripe_customer_id: projection.customer_ref.clone(),
            stripe_subscription_id: projection.subscription_ref.clone(),
            stripe_price_id: projection.price_ref.clone(),
            subscription_status: projection.status,
            is_subscribed: projection.is_subscribed,
            updated_at: now,
            ..self.clone()
        }
    }
}

/// The subscription-related columns of a tenant
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct SubscriptionProjection {
    pub customer_ref: Option<String>,
    pub subscription_ref: Option<String>,
    pub price_ref: Option<String>,
    pub status: SubscriptionStatus,
    pub is_subscribed: bool,
}

/// Input for creating the default tenant of a user
#[derive(Debug, Clone)]
pub struct NewBusiness {
    pub owner_user_id: String,
    pub name: String,
    pub timezone: String,
}

/// Dedup ledger entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct PaymentEventRecord {
    pub event_id: String,
    pub event_type: String,
    pub event_created_at: Option<OffsetDateTime>,
    pub received_at: OffsetDateTime,
}

/// Input for claiming an event id in the ledger
#[derive(Debug, Clone)]
pub struct NewPaymentEvent {
    pub event_id: String,
    pub event_type: String,
    pub event_created_at: Option<OffsetDateTime>,
}
