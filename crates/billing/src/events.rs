//! Payment event envelopes
//!
//! Only the handful of fields the ingester needs are modelled. Unknown fields
//! are ignored so new processor API versions keep parsing.

use iva_shared::NewPaymentEvent;
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::fmt;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};

/// Top-level event as delivered to the webhook endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct EventEnvelope {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    /// Unix seconds at which the processor created the event
    #[serde(default)]
    pub created: Option<i64>,
    pub data: EventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventData {
    pub object: serde_json::Value,
}

impl EventEnvelope {
    /// Parse a verified payload
    pub fn parse(payload: &[u8]) -> BillingResult<Self> {
        let envelope: EventEnvelope = serde_json::from_slice(payload)
            .map_err(|e| BillingError::WebhookPayloadInvalid(e.to_string()))?;

        if envelope.id.trim().is_empty() {
            return Err(BillingError::WebhookPayloadInvalid(
                "event id is empty".to_string(),
            ));
        }

        Ok(envelope)
    }

    pub fn kind(&self) -> PaymentEventType {
        PaymentEventType::parse(&self.event_type)
    }

    pub fn created_at(&self) -> Option<OffsetDateTime> {
        self.created
            .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok())
    }

    /// Dedup ledger entry for this event
    pub fn ledger_entry(&self) -> NewPaymentEvent {
        NewPaymentEvent {
            event_id: self.id.clone(),
            event_type: self.event_type.clone(),
            event_created_at: self.created_at(),
        }
    }

    /// Decode the event object into the variant its type calls for
    ///
    /// Returns the decoding error message when the object does not have the
    /// expected shape.
    pub fn classify(&self) -> Result<PaymentEvent, String> {
        fn decode<T: serde::de::DeserializeOwned>(object: &serde_json::Value) -> Result<T, String> {
            T::deserialize(object).map_err(|e| e.to_string())
        }

        let object = &self.data.object;
        Ok(match self.kind() {
            PaymentEventType::CheckoutSessionCompleted => {
                PaymentEvent::CheckoutCompleted(decode(object)?)
            }
            PaymentEventType::SubscriptionCreated | PaymentEventType::SubscriptionUpdated => {
                PaymentEvent::SubscriptionChanged(decode(object)?)
            }
            PaymentEventType::SubscriptionDeleted => PaymentEvent::SubscriptionDeleted(decode(object)?),
            PaymentEventType::InvoicePaid | PaymentEventType::InvoicePaymentSucceeded => {
                PaymentEvent::InvoicePaid(decode(object)?)
            }
            PaymentEventType::InvoicePaymentFailed => {
                PaymentEvent::InvoicePaymentFailed(decode(object)?)
            }
            PaymentEventType::Other(_) => PaymentEvent::Ignored,
        })
    }
}

/// Event types the ingester distinguishes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentEventType {
    CheckoutSessionCompleted,
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionDeleted,
    InvoicePaid,
    InvoicePaymentSucceeded,
    InvoicePaymentFailed,
    Other(String),
}

impl PaymentEventType {
    pub fn parse(s: &str) -> Self {
        match s {
            "checkout.session.completed" => Self::CheckoutSessionCompleted,
            "customer.subscription.created" => Self::SubscriptionCreated,
            "customer.subscription.updated" => Self::SubscriptionUpdated,
            "customer.subscription.deleted" => Self::SubscriptionDeleted,
            "invoice.paid" => Self::InvoicePaid,
            "invoice.payment_succeeded" => Self::InvoicePaymentSucceeded,
            "invoice.payment_failed" => Self::InvoicePaymentFailed,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::CheckoutSessionCompleted => "checkout.session.completed",
            Self::SubscriptionCreated => "customer.subscription.created",
            Self::SubscriptionUpdated => "customer.subscription.updated",
            Self::SubscriptionDeleted => "customer.subscription.deleted",
            Self::InvoicePaid => "invoice.paid",
            Self::InvoicePaymentSucceeded => "invoice.payment_succeeded",
            Self::InvoicePaymentFailed => "invoice.payment_failed",
            Self::Other(s) => s,
        }
    }
}

impl fmt::Display for PaymentEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded event, one variant per handled type
#[derive(Debug, Clone)]
pub enum PaymentEvent {
    CheckoutCompleted(CheckoutSession),
    /// Created or updated
    SubscriptionChanged(Subscription),
    SubscriptionDeleted(Subscription),
    InvoicePaid(Invoice),
    InvoicePaymentFailed(Invoice),
    Ignored,
}

/// A reference that is either a bare id or an expanded object carrying one
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Expandable {
    Id(String),
    Object { id: String },
}

impl Expandable {
    pub fn id(&self) -> &str {
        match self {
            Expandable::Id(id) => id,
            Expandable::Object { id } => id,
        }
    }
}

fn expandable_id(value: &Option<Expandable>) -> Option<String> {
    value.as_ref().and_then(|v| non_empty(v.id()))
}

fn non_empty(s: &str) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Free-form metadata attached to processor objects
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct Metadata(HashMap<String, serde_json::Value>);

impl Metadata {
    fn first_of(&self, keys: &[&str]) -> Option<String> {
        keys.iter()
            .filter_map(|key| self.0.get(*key))
            .filter_map(|value| value.as_str())
            .find_map(non_empty)
    }

    pub fn business_id(&self) -> Option<String> {
        self.first_of(&["business_id", "businessId"])
    }

    pub fn owner_user_id(&self) -> Option<String> {
        self.first_of(&["auth_user_id", "userId", "user_id"])
    }

    pub fn price_ref(&self) -> Option<String> {
        self.first_of(&["price_id", "priceId", "plan", "line_item_price_id"])
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct List<T> {
    #[serde(default = "Vec::new", deserialize_with = "null_as_default")]
    pub data: Vec<T>,
}

impl<T> Default for List<T> {
    fn default() -> Self {
        Self { data: Vec::new() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutSession {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub customer: Option<Expandable>,
    #[serde(default)]
    pub subscription: Option<Expandable>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub metadata: Metadata,
}

impl CheckoutSession {
    pub fn customer_ref(&self) -> Option<String> {
        expandable_id(&self.customer)
    }

    pub fn subscription_ref(&self) -> Option<String> {
        expandable_id(&self.subscription)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Subscription {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub customer: Option<Expandable>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub items: List<PricedItem>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub metadata: Metadata,
}

impl Subscription {
    pub fn subscription_ref(&self) -> Option<String> {
        self.id.as_deref().and_then(non_empty)
    }

    pub fn customer_ref(&self) -> Option<String> {
        expandable_id(&self.customer)
    }

    /// Price of the first item, falling back to metadata
    pub fn price_ref(&self) -> Option<String> {
        self.items
            .data
            .first()
            .and_then(PricedItem::price_ref)
            .or_else(|| self.metadata.price_ref())
    }
}

/// Subscription item or invoice line
#[derive(Debug, Clone, Deserialize)]
pub struct PricedItem {
    #[serde(default)]
    pub price: Option<Expandable>,
    #[serde(default)]
    pub pricing: Option<LinePricing>,
}

impl PricedItem {
    fn price_ref(&self) -> Option<String> {
        expandable_id(&self.price).or_else(|| {
            self.pricing
                .as_ref()
                .and_then(|p| p.price_details.as_ref())
                .and_then(|d| d.price.as_deref())
                .and_then(non_empty)
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LinePricing {
    #[serde(default)]
    pub price_details: Option<PriceDetails>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PriceDetails {
    #[serde(default)]
    pub price: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Invoice {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub customer: Option<Expandable>,
    #[serde(default)]
    pub subscription: Option<Expandable>,
    #[serde(default)]
    pub parent: Option<InvoiceParent>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub lines: List<PricedItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceParent {
    #[serde(default)]
    pub subscription_details: Option<SubscriptionDetails>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionDetails {
    #[serde(default)]
    pub subscription: Option<Expandable>,
}

impl Invoice {
    pub fn customer_ref(&self) -> Option<String> {
        expandable_id(&self.customer)
    }

    /// Subscription of the invoice; newer API versions nest it under `parent`
    pub fn subscription_ref(&self) -> Option<String> {
        expandable_id(&self.subscription).or_else(|| {
            self.parent
                .as_ref()
                .and_then(|p| p.subscription_details.as_ref())
                .and_then(|d| expandable_id(&d.subscription))
        })
    }

    pub fn price_ref(&self) -> Option<String> {
        self.lines.data.first().and_then(PricedItem::price_ref)
    }
}
