//! Payment processor webhook handling
//!
//! Events are verified against the raw body, claimed in the dedup ledger and
//! applied to the matching tenant inside one transaction, so an event is
//! either recorded and applied or neither. A redelivered event finds its
//! ledger row and is acknowledged without touching the tenant again.

use iva_shared::{SharedStore, StoreTx, SubscriptionStatus};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::events::{CheckoutSession, EventEnvelope, Invoice, PaymentEvent, Subscription};
use crate::resolver::{resolve_business, Resolution, ResolutionKeys, ResolvedBy};
use crate::signature::{verify_signature, DEFAULT_TOLERANCE_SECS};
use crate::state_machine::{self, SubscriptionUpdate};

/// Webhook endpoint settings
#[derive(Clone)]
pub struct WebhookConfig {
    /// Signing secret; `None` rejects every event
    pub secret: Option<String>,
    pub tolerance_secs: i64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            secret: None,
            tolerance_secs: DEFAULT_TOLERANCE_SECS,
        }
    }
}

impl std::fmt::Debug for WebhookConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookConfig")
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .field("tolerance_secs", &self.tolerance_secs)
            .finish()
    }
}

/// What happened to an authentic event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// The tenant's subscription fields were updated
    Applied {
        business_id: Uuid,
        resolved_by: ResolvedBy,
    },
    /// Event id already in the ledger
    Duplicate,
    /// Event type has no handler
    Ignored,
    /// No single tenant matches the event's identifiers
    Unresolved,
    /// Event lacks the identifiers its handler needs, or its object is malformed
    Skipped(String),
}

/// Identifiers and update derived from one event
enum Plan {
    Apply {
        keys: ResolutionKeys,
        update: SubscriptionUpdate,
    },
    Skip(String),
}

/// Webhook handler for payment processor events
pub struct WebhookHandler {
    store: SharedStore,
    config: WebhookConfig,
}

impl WebhookHandler {
    pub fn new(store: SharedStore, config: WebhookConfig) -> Self {
        if config.secret.is_none() {
            tracing::warn!("Webhook secret not configured; all webhook events will be rejected");
        }
        Self { store, config }
    }

    pub fn is_configured(&self) -> bool {
        self.config.secret.is_some()
    }

    /// Verify the signature over the raw body and parse the event
    pub fn verify_event(&self, payload: &[u8], signature: Option<&str>) -> BillingResult<EventEnvelope> {
        let secret = self
            .config
            .secret
            .as_deref()
            .ok_or(BillingError::WebhookSecretMissing)?;
        let signature = signature
            .ok_or_else(|| BillingError::WebhookSignatureInvalid("missing header".to_string()))?;

        verify_signature(payload, signature, secret, self.config.tolerance_secs)?;
        EventEnvelope::parse(payload)
    }

    /// Verify, deduplicate and apply one delivery
    pub async fn ingest(&self, payload: &[u8], signature: Option<&str>) -> BillingResult<IngestOutcome> {
        let event = self.verify_event(payload, signature).map_err(|e| {
            tracing::warn!(error = %e, "Rejected webhook delivery");
            e
        })?;
        self.handle_event(&event).await
    }

    /// Handle a verified event
    ///
    /// The ledger claim and the tenant update share one transaction. If
    /// anything fails the transaction is dropped, the claim disappears with
    /// it, and the processor's redelivery gets a clean second attempt.
    pub async fn handle_event(&self, event: &EventEnvelope) -> BillingResult<IngestOutcome> {
        let mut tx = self.store.begin().await?;

        if !tx.record_payment_event(&event.ledger_entry()).await? {
            tx.rollback().await?;
            tracing::info!(
                event_id = %event.id,
                event_type = %event.event_type,
                "Duplicate webhook event - already recorded"
            );
            return Ok(IngestOutcome::Duplicate);
        }

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            "Processing payment webhook event"
        );

        let outcome = self.process_event_internal(tx.as_mut(), event).await?;
        tx.commit().await?;

        Ok(outcome)
    }

    async fn process_event_internal(
        &self,
        tx: &mut dyn StoreTx,
        event: &EventEnvelope,
    ) -> BillingResult<IngestOutcome> {
        let decoded = match event.classify() {
            Ok(decoded) => decoded,
            Err(reason) => {
                tracing::warn!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    reason = %reason,
                    "Webhook event object has unexpected shape"
                );
                return Ok(IngestOutcome::Skipped(reason));
            }
        };

        let plan = match &decoded {
            PaymentEvent::CheckoutCompleted(session) => plan_checkout_completed(session),
            PaymentEvent::SubscriptionChanged(subscription) => {
                plan_subscription_changed(&event.id, subscription)
            }
            PaymentEvent::SubscriptionDeleted(subscription) => {
                plan_subscription_deleted(subscription)
            }
            PaymentEvent::InvoicePaid(invoice) => plan_invoice_paid(invoice),
            PaymentEvent::InvoicePaymentFailed(invoice) => plan_invoice_payment_failed(invoice),
            PaymentEvent::Ignored => {
                tracing::info!(
                    event_type = %event.event_type,
                    event_id = %event.id,
                    "Received unhandled payment event type - no handler configured"
                );
                return Ok(IngestOutcome::Ignored);
            }
        };

        let (keys, update) = match plan {
            Plan::Apply { keys, update } => (keys, update),
            Plan::Skip(reason) => {
                tracing::warn!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    reason = %reason,
                    "Skipping webhook event"
                );
                return Ok(IngestOutcome::Skipped(reason));
            }
        };

        let (business, resolved_by) = match resolve_business(tx, &keys).await? {
            Resolution::Found(business, resolved_by) => (business, resolved_by),
            Resolution::NotFound => {
                tracing::warn!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    customer_ref = ?keys.customer_ref,
                    subscription_ref = ?keys.subscription_ref,
                    "Could not map webhook event to a business"
                );
                return Ok(IngestOutcome::Unresolved);
            }
            Resolution::Ambiguous(level) => {
                tracing::warn!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    level = %level,
                    "Webhook event matches several businesses; refusing to guess"
                );
                return Ok(IngestOutcome::Unresolved);
            }
        };

        // Re-read under the row lock so concurrent events for the same tenant
        // coalesce against each other's committed state
        let Some(current) = tx.lock_business(business.id).await? else {
            tracing::warn!(
                event_id = %event.id,
                business_id = %business.id,
                "Business disappeared before update"
            );
            return Ok(IngestOutcome::Unresolved);
        };

        let next = state_machine::apply(&current.subscription(), &update);
        tx.update_subscription(current.id, &next).await?;

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            business_id = %current.id,
            resolved_by = %resolved_by,
            previous_status = %current.subscription_status,
            status = %next.status,
            is_subscribed = next.is_subscribed,
            "Applied subscription update"
        );

        Ok(IngestOutcome::Applied {
            business_id: current.id,
            resolved_by,
        })
    }
}

fn plan_checkout_completed(session: &CheckoutSession) -> Plan {
    let Some(customer_ref) = session.customer_ref() else {
        return Plan::Skip("checkout session has no customer".to_string());
    };
    let subscription_ref = session.subscription_ref();

    Plan::Apply {
        keys: ResolutionKeys {
            business_id: session.metadata.business_id(),
            customer_ref: Some(customer_ref.clone()),
            subscription_ref: subscription_ref.clone(),
            owner_user_id: session.metadata.owner_user_id(),
        },
        update: SubscriptionUpdate::status(SubscriptionStatus::Active)
            .with_customer(Some(customer_ref))
            .with_subscription(subscription_ref)
            .with_price(session.metadata.price_ref()),
    }
}

fn plan_subscription_changed(event_id: &str, subscription: &Subscription) -> Plan {
    let (Some(customer_ref), Some(subscription_ref)) =
        (subscription.customer_ref(), subscription.subscription_ref())
    else {
        return Plan::Skip("subscription is missing customer or id".to_string());
    };

    let status = match subscription.status.as_deref().map(str::parse::<SubscriptionStatus>) {
        Some(Ok(status)) => Some(status),
        Some(Err(e)) => {
            tracing::warn!(event_id = %event_id, error = %e, "Keeping stored status");
            None
        }
        None => None,
    };

    Plan::Apply {
        keys: ResolutionKeys {
            business_id: subscription.metadata.business_id(),
            customer_ref: Some(customer_ref.clone()),
            subscription_ref: Some(subscription_ref.clone()),
            owner_user_id: subscription.metadata.owner_user_id(),
        },
        update: SubscriptionUpdate {
            status,
            ..Default::default()
        }
        .with_customer(Some(customer_ref))
        .with_subscription(Some(subscription_ref))
        .with_price(subscription.price_ref()),
    }
}

fn plan_subscription_deleted(subscription: &Subscription) -> Plan {
    let customer_ref = subscription.customer_ref();
    let subscription_ref = subscription.subscription_ref();
    if customer_ref.is_none() && subscription_ref.is_none() {
        return Plan::Skip("deleted subscription has no identifiers".to_string());
    }

    // Metadata and status of a deleted subscription are not trusted
    Plan::Apply {
        keys: ResolutionKeys {
            customer_ref: customer_ref.clone(),
            subscription_ref: subscription_ref.clone(),
            ..Default::default()
        },
        update: SubscriptionUpdate::termination()
            .with_customer(customer_ref)
            .with_subscription(subscription_ref),
    }
}

fn invoice_keys(invoice: &Invoice) -> Result<(String, String), String> {
    match (invoice.customer_ref(), invoice.subscription_ref()) {
        (Some(customer_ref), Some(subscription_ref)) => Ok((customer_ref, subscription_ref)),
        _ => Err("invoice is not tied to a customer subscription".to_string()),
    }
}

fn plan_invoice_paid(invoice: &Invoice) -> Plan {
    let (customer_ref, subscription_ref) = match invoice_keys(invoice) {
        Ok(refs) => refs,
        Err(reason) => return Plan::Skip(reason),
    };

    Plan::Apply {
        keys: ResolutionKeys {
            customer_ref: Some(customer_ref.clone()),
            subscription_ref: Some(subscription_ref.clone()),
            ..Default::default()
        },
        update: SubscriptionUpdate::status(SubscriptionStatus::Active)
            .with_customer(Some(customer_ref))
            .with_subscription(Some(subscription_ref))
            .with_price(invoice.price_ref()),
    }
}

fn plan_invoice_payment_failed(invoice: &Invoice) -> Plan {
    let (customer_ref, subscription_ref) = match invoice_keys(invoice) {
        Ok(refs) => refs,
        Err(reason) => return Plan::Skip(reason),
    };

    // Only the status moves; references stay as the subscription events set them
    Plan::Apply {
        keys: ResolutionKeys {
            customer_ref: Some(customer_ref),
            subscription_ref: Some(subscription_ref),
            ..Default::default()
        },
        update: SubscriptionUpdate::status(SubscriptionStatus::PastDue),
    }
}
