// Test code patterns:
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! IVA shared crate
//!
//! Tenant data model and the storage seam used by both the API server
//! (tenant provisioning) and the billing crate (payment event ingestion).
//!
//! ## Contents
//!
//! - **Models**: `Business`, `SubscriptionStatus`, `PaymentEventRecord`
//! - **Store**: `Store` / `StoreTx` traits with a PostgreSQL and an in-memory backend
//! - **Database**: pool construction and embedded migrations
//! - **Locking**: stable advisory lock keys for per-user provisioning

pub mod db;
pub mod error;
pub mod lock;
pub mod models;
pub mod store;

pub use db::{create_migration_pool, create_pool, run_migrations, PoolSettings};
pub use error::{StoreError, StoreResult};
pub use lock::{advisory_lock_key, PROVISIONING_LOCK_NAMESPACE};
pub use models::{
    Business, NewBusiness, NewPaymentEvent, PaymentEventRecord, SubscriptionProjection,
    SubscriptionStatus,
};
pub use store::{
    memory::MemoryStore, postgres::PgStore, InsertOutcome, SharedStore, Store, StoreTx,
};
