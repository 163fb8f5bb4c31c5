//! PostgreSQL store
//!
//! Advisory locks are `pg_advisory_xact_lock`, row locks are `SELECT ... FOR UPDATE`,
//! and every transaction runs with `SET LOCAL lock_timeout` so a contended
//! lock surfaces as [`StoreError::LockTimeout`] instead of hanging the request.

use async_trait::async_trait;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use std::time::Duration;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{InsertOutcome, Store, StoreTx};
use crate::error::{StoreError, StoreResult};
use crate::models::{Business, NewBusiness, NewPaymentEvent, SubscriptionProjection};

/// Raw `businesses` row
#[derive(Debug, FromRow)]
struct BusinessRow {
    id: Uuid,
    auth_user_id: Option<String>,
    name: String,
    timezone: String,
    is_default: bool,
    stripe_customer_id: Option<String>,
    stripe_subscription_id: Option<String>,
    stripe_price_id: Option<String>,
    stripe_subscription_status: String,
    is_subscribed: bool,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<BusinessRow> for Business {
    type Error = StoreError;

    fn try_from(row: BusinessRow) -> Result<Self, Self::Error> {
        let subscription_status = row.stripe_subscription_status.parse().map_err(|e| {
            StoreError::CorruptRow(format!("business {}: {}", row.id, e))
        })?;

        Ok(Business {
            id: row.id,
            owner_user_id: row.auth_user_id,
            name: row.name,
            timezone: row.timezone,
            is_default: row.is_default,
            stripe_customer_id: row.stripe_customer_id,
            stripe_subscription_id: row.stripe_subscription_id,
            stripe_price_id: row.stripe_price_id,
            subscription_status,
            is_subscribed: row.is_subscribed,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn into_businesses(rows: Vec<BusinessRow>) -> StoreResult<Vec<Business>> {
    rows.into_iter().map(Business::try_from).collect()
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .map(|db| db.is_unique_violation())
        .unwrap_or(false)
}

/// PostgreSQL-backed store
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    lock_timeout: Duration,
}

impl PgStore {
    pub fn new(pool: PgPool, lock_timeout: Duration) -> Self {
        Self { pool, lock_timeout }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> StoreResult<Box<dyn StoreTx>> {
        let mut tx = self.pool.begin().await?;

        // SET LOCAL does not accept bind parameters
        let timeout_ms = self.lock_timeout.as_millis();
        sqlx::query(&format!("SET LOCAL lock_timeout = '{}ms'", timeout_ms))
            .execute(&mut *tx)
            .await?;

        Ok(Box::new(PgStoreTx { tx }))
    }

    async fn list_businesses_for_owner(&self, user_id: &str) -> StoreResult<Vec<Business>> {
        let rows: Vec<BusinessRow> = sqlx::query_as(
            r#"
            SELECT id, auth_user_id, name, timezone, is_default,
                   stripe_customer_id, stripe_subscription_id, stripe_price_id,
                   stripe_subscription_status, is_subscribed, created_at, updated_at
            FROM businesses
            WHERE auth_user_id = $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        into_businesses(rows)
    }

    async fn prune_payment_events(&self, cutoff: OffsetDateTime) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM stripe_events WHERE received_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// An open PostgreSQL transaction
pub struct PgStoreTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTx for PgStoreTx {
    async fn acquire_advisory_lock(&mut self, key: i64) -> StoreResult<()> {
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(key)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn businesses_owned_by(&mut self, user_id: &str) -> StoreResult<Vec<Business>> {
        let rows: Vec<BusinessRow> = sqlx::query_as(
            r#"
            SELECT id, auth_user_id, name, timezone, is_default,
                   stripe_customer_id, stripe_subscription_id, stripe_price_id,
                   stripe_subscription_status, is_subscribed, created_at, updated_at
            FROM businesses
            WHERE auth_user_id = $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(&mut *self.tx)
        .await?;

        into_businesses(rows)
    }

    async fn insert_default_business(&mut self, new: &NewBusiness) -> StoreResult<InsertOutcome> {
        sqlx::query("SAVEPOINT create_default_business")
            .execute(&mut *self.tx)
            .await?;

        let inserted: Result<Uuid, sqlx::Error> = sqlx::query_scalar(
            r#"
            INSERT INTO businesses (
                auth_user_id, name, timezone, is_default,
                stripe_subscription_status, is_subscribed, created_at, updated_at
            )
            VALUES ($1, $2, $3, TRUE, 'none', FALSE, NOW(), NOW())
            RETURNING id
            "#,
        )
        .bind(&new.owner_user_id)
        .bind(&new.name)
        .bind(&new.timezone)
        .fetch_one(&mut *self.tx)
        .await;

        match inserted {
            Ok(id) => {
                sqlx::query("RELEASE SAVEPOINT create_default_business")
                    .execute(&mut *self.tx)
                    .await?;
                Ok(InsertOutcome::Inserted(id))
            }
            Err(e) if is_unique_violation(&e) => {
                tracing::info!(
                    user_id = %new.owner_user_id,
                    "Default business insert hit unique constraint, rolling back savepoint"
                );
                sqlx::query("ROLLBACK TO SAVEPOINT create_default_business")
                    .execute(&mut *self.tx)
                    .await?;
                sqlx::query("RELEASE SAVEPOINT create_default_business")
                    .execute(&mut *self.tx)
                    .await?;
                Ok(InsertOutcome::Conflict)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn record_payment_event(&mut self, event: &NewPaymentEvent) -> StoreResult<bool> {
        let claimed: Option<String> = sqlx::query_scalar(
            r#"
            INSERT INTO stripe_events (event_id, event_type, event_created_at, received_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (event_id) DO NOTHING
            RETURNING event_id
            "#,
        )
        .bind(&event.event_id)
        .bind(&event.event_type)
        .bind(event.event_created_at)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(claimed.is_some())
    }

    async fn business_by_id(&mut self, id: Uuid) -> StoreResult<Option<Business>> {
        let row: Option<BusinessRow> = sqlx::query_as(
            r#"
            SELECT id, auth_user_id, name, timezone, is_default,
                   stripe_customer_id, stripe_subscription_id, stripe_price_id,
                   stripe_subscription_status, is_subscribed, created_at, updated_at
            FROM businesses
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(Business::try_from).transpose()
    }

    async fn businesses_by_customer_ref(
        &mut self,
        customer_ref: &str,
        limit: i64,
    ) -> StoreResult<Vec<Business>> {
        let rows: Vec<BusinessRow> = sqlx::query_as(
            r#"
            SELECT id, auth_user_id, name, timezone, is_default,
                   stripe_customer_id, stripe_subscription_id, stripe_price_id,
                   stripe_subscription_status, is_subscribed, created_at, updated_at
            FROM businesses
            WHERE stripe_customer_id = $1
            ORDER BY created_at ASC, id ASC
            LIMIT $2
            "#,
        )
        .bind(customer_ref)
        .bind(limit)
        .fetch_all(&mut *self.tx)
        .await?;

        into_businesses(rows)
    }

    async fn businesses_by_subscription_ref(
        &mut self,
        subscription_ref: &str,
        limit: i64,
    ) -> StoreResult<Vec<Business>> {
        let rows: Vec<BusinessRow> = sqlx::query_as(
            r#"
            SELECT id, auth_user_id, name, timezone, is_default,
                   stripe_customer_id, stripe_subscription_id, stripe_price_id,
                   stripe_subscription_status, is_subscribed, created_at, updated_at
            FROM businesses
            WHERE stripe_subscription_id = $1
            ORDER BY created_at ASC, id ASC
            LIMIT $2
            "#,
        )
        .bind(subscription_ref)
        .bind(limit)
        .fetch_all(&mut *self.tx)
        .await?;

        into_businesses(rows)
    }

    async fn earliest_business_owned_by(&mut self, user_id: &str) -> StoreResult<Option<Business>> {
        let row: Option<BusinessRow> = sqlx::query_as(
            r#"
            SELECT id, auth_user_id, name, timezone, is_default,
                   stripe_customer_id, stripe_subscription_id, stripe_price_id,
                   stripe_subscription_status, is_subscribed, created_at, updated_at
            FROM businesses
            WHERE auth_user_id = $1
            ORDER BY created_at ASC, id ASC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(Business::try_from).transpose()
    }

    async fn lock_business(&mut self, id: Uuid) -> StoreResult<Option<Business>> {
        let row: Option<BusinessRow> = sqlx::query_as(
            r#"
            SELECT id, auth_user_id, name, timezone, is_default,
                   stripe_customer_id, stripe_subscription_id, stripe_price_id,
                   stripe_subscription_status, is_subscribed, created_at, updated_at
            FROM businesses
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(Business::try_from).transpose()
    }

    async fn update_subscription(
        &mut self,
        id: Uuid,
        projection: &SubscriptionProjection,
    ) -> StoreResult<Option<Business>> {
        let row: Option<BusinessRow> = sqlx::query_as(
            r#"
            UPDATE businesses
            SET stripe_customer_id = $2,
                stripe_subscription_id = $3,
                stripe_price_id = $4,
                stripe_subscription_status = $5,
                is_subscribed = $6,
                updated_at = NOW()
            WHERE id = $1
            RETURNING id, auth_user_id, name, timezone, is_default,
                      stripe_customer_id, stripe_subscription_id, stripe_price_id,
                      stripe_subscription_status, is_subscribed, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(&projection.customer_ref)
        .bind(&projection.subscription_ref)
        .bind(&projection.price_ref)
        .bind(projection.status.as_str())
        .bind(projection.is_subscribed)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(Business::try_from).transpose()
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::advisory_lock_key;

    /// Setup test database pool with migrations applied
    async fn setup_test_store() -> PgStore {
        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgresql://localhost/iva_test".to_string());

        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(5)
            .connect(&database_url)
            .await
            .expect("Failed to connect to test database");

        crate::db::run_migrations(&pool)
            .await
            .expect("Failed to run migrations");

        PgStore::new(pool, Duration::from_secs(5))
    }

    fn new_business(user_id: &str) -> NewBusiness {
        NewBusiness {
            owner_user_id: user_id.to_string(),
            name: "Test Salon".to_string(),
            timezone: "Europe/Prague".to_string(),
        }
    }

    #[tokio::test]
    #[ignore = "requires a PostgreSQL database in DATABASE_URL"]
    async fn test_second_default_insert_conflicts_without_aborting_tx() {
        let store = setup_test_store().await;
        let user_id = format!("pg-user-{}", Uuid::new_v4());

        let mut tx = store.begin().await.unwrap();
        tx.acquire_advisory_lock(advisory_lock_key(&user_id))
            .await
            .unwrap();

        let first = tx.insert_default_business(&new_business(&user_id)).await.unwrap();
        assert!(matches!(first, InsertOutcome::Inserted(_)));

        let second = tx.insert_default_business(&new_business(&user_id)).await.unwrap();
        assert_eq!(second, InsertOutcome::Conflict);

        // Transaction is still usable after the savepoint rollback
        let owned = tx.businesses_owned_by(&user_id).await.unwrap();
        assert_eq!(owned.len(), 1);
        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires a PostgreSQL database in DATABASE_URL"]
    async fn test_event_ledger_rejects_duplicate_ids() {
        let store = setup_test_store().await;
        let event = NewPaymentEvent {
            event_id: format!("evt_{}", Uuid::new_v4().simple()),
            event_type: "invoice.paid".to_string(),
            event_created_at: None,
        };

        let mut tx = store.begin().await.unwrap();
        assert!(tx.record_payment_event(&event).await.unwrap());
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        assert!(!tx.record_payment_event(&event).await.unwrap());
        tx.rollback().await.unwrap();
    }
}
