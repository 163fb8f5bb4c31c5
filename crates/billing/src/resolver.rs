//! Map event identifiers to a tenant
//!
//! Lookups run from the most to the least specific identifier: explicit
//! business id, customer reference, subscription reference, owning user.
//! The first level with exactly one match wins. A level with several matches
//! stops the search: picking one of them, or a less specific match further
//! down, could bill the wrong tenant.

use iva_shared::{Business, StoreResult, StoreTx};
use std::fmt;
use uuid::Uuid;

/// Identifiers an event carries (all optional)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolutionKeys {
    /// Raw value from event metadata; parsed during resolution
    pub business_id: Option<String>,
    pub customer_ref: Option<String>,
    pub subscription_ref: Option<String>,
    pub owner_user_id: Option<String>,
}

impl ResolutionKeys {
    pub fn is_empty(&self) -> bool {
        self.business_id.is_none()
            && self.customer_ref.is_none()
            && self.subscription_ref.is_none()
            && self.owner_user_id.is_none()
    }
}

/// Which identifier produced the match
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedBy {
    BusinessId,
    CustomerRef,
    SubscriptionRef,
    OwnerUserId,
}

impl fmt::Display for ResolvedBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolvedBy::BusinessId => write!(f, "business_id"),
            ResolvedBy::CustomerRef => write!(f, "customer_ref"),
            ResolvedBy::SubscriptionRef => write!(f, "subscription_ref"),
            ResolvedBy::OwnerUserId => write!(f, "owner_user_id"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Found(Business, ResolvedBy),
    NotFound,
    /// More than one tenant matched at this level
    Ambiguous(ResolvedBy),
}

fn single(mut candidates: Vec<Business>, level: ResolvedBy) -> Option<Resolution> {
    match candidates.len() {
        0 => None,
        1 => candidates.pop().map(|b| Resolution::Found(b, level)),
        _ => Some(Resolution::Ambiguous(level)),
    }
}

/// Resolve `keys` to a single tenant inside `tx`
pub async fn resolve_business(
    tx: &mut dyn StoreTx,
    keys: &ResolutionKeys,
) -> StoreResult<Resolution> {
    if let Some(raw) = keys.business_id.as_deref() {
        match Uuid::parse_str(raw) {
            Ok(id) => {
                if let Some(business) = tx.business_by_id(id).await? {
                    return Ok(Resolution::Found(business, ResolvedBy::BusinessId));
                }
                tracing::debug!(business_id = %id, "Explicit business id not found, falling back");
            }
            Err(_) => {
                tracing::warn!(business_id = %raw, "Ignoring unparsable business id in event metadata");
            }
        }
    }

    if let Some(customer_ref) = keys.customer_ref.as_deref() {
        let candidates = tx.businesses_by_customer_ref(customer_ref, 2).await?;
        if let Some(resolution) = single(candidates, ResolvedBy::CustomerRef) {
            return Ok(resolution);
        }
    }

    if let Some(subscription_ref) = keys.subscription_ref.as_deref() {
        let candidates = tx.businesses_by_subscription_ref(subscription_ref, 2).await?;
        if let Some(resolution) = single(candidates, ResolvedBy::SubscriptionRef) {
            return Ok(resolution);
        }
    }

    if let Some(user_id) = keys.owner_user_id.as_deref() {
        if let Some(business) = tx.earliest_business_owned_by(user_id).await? {
            return Ok(Resolution::Found(business, ResolvedBy::OwnerUserId));
        }
    }

    Ok(Resolution::NotFound)
}
