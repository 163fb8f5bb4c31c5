//! Storage seam
//!
//! Tenant provisioning and payment event ingestion both run their
//! read-then-write sequences inside a [`StoreTx`]. Dropping a transaction
//! without calling [`StoreTx::commit`] rolls it back and releases any
//! transaction-scoped locks it holds.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use std::sync::Arc;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::StoreResult;
use crate::models::{Business, NewBusiness, NewPaymentEvent, SubscriptionProjection};

/// Result of inserting a default tenant
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Row was written
    Inserted(Uuid),
    /// A uniqueness constraint rejected the row; only the insert was undone
    Conflict,
}

/// Shared handle injected into request handlers and background jobs
pub type SharedStore = Arc<dyn Store>;

#[async_trait]
pub trait Store: Send + Sync {
    /// Open a transaction
    async fn begin(&self) -> StoreResult<Box<dyn StoreTx>>;

    /// Businesses owned by `user_id`, earliest first (read-only, no locking)
    async fn list_businesses_for_owner(&self, user_id: &str) -> StoreResult<Vec<Business>>;

    /// Delete ledger entries received before `cutoff`; returns how many were removed
    async fn prune_payment_events(&self, cutoff: OffsetDateTime) -> StoreResult<u64>;

    /// Cheap liveness check
    async fn ping(&self) -> StoreResult<()>;
}

#[async_trait]
pub trait StoreTx: Send {
    /// Take the transaction-scoped advisory lock `key`, waiting at most the
    /// store's lock timeout
    async fn acquire_advisory_lock(&mut self, key: i64) -> StoreResult<()>;

    /// Businesses owned by `user_id`, earliest first
    async fn businesses_owned_by(&mut self, user_id: &str) -> StoreResult<Vec<Business>>;

    /// Insert the default tenant inside a savepoint
    async fn insert_default_business(&mut self, new: &NewBusiness) -> StoreResult<InsertOutcome>;

    /// Claim an event id in the dedup ledger; `false` means it was already claimed
    async fn record_payment_event(&mut self, event: &NewPaymentEvent) -> StoreResult<bool>;

    async fn business_by_id(&mut self, id: Uuid) -> StoreResult<Option<Business>>;

    /// Businesses whose stored customer reference equals `customer_ref`
    /// (at most `limit` rows)
    async fn businesses_by_customer_ref(
        &mut self,
        customer_ref: &str,
        limit: i64,
    ) -> StoreResult<Vec<Business>>;

    /// Businesses whose stored subscription reference equals `subscription_ref`
    /// (at most `limit` rows)
    async fn businesses_by_subscription_ref(
        &mut self,
        subscription_ref: &str,
        limit: i64,
    ) -> StoreResult<Vec<Business>>;

    /// Earliest-created business owned by `user_id`
    async fn earliest_business_owned_by(&mut self, user_id: &str) -> StoreResult<Option<Business>>;

    /// Re-read a business and hold its row lock until the transaction ends
    async fn lock_business(&mut self, id: Uuid) -> StoreResult<Option<Business>>;

    /// Overwrite the subscription columns of a business and bump `updated_at`
    async fn update_subscription(
        &mut self,
        id: Uuid,
        projection: &SubscriptionProjection,
    ) -> StoreResult<Option<Business>>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;

    async fn rollback(self: Box<Self>) -> StoreResult<()>;
}
