//! Tenant invariants
//!
//! Runnable consistency checks over `businesses`. They only read, so the
//! worker can run them on a schedule against the live database.
//!
//! ## Checks
//!
//! 1. **subscribed_flag_matches_status**: `is_subscribed` agrees with the stored status
//! 2. **single_default_per_owner**: at most one auto-created business per user
//! 3. **legacy_owner_backfilled**: no row still relies on the legacy owner column
//! 4. **customer_ref_unique**: a processor customer maps to one business
//! 5. **subscribed_has_customer**: subscribed businesses have a customer reference

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Business(es) affected
    pub business_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Tenant access is wrong right now
    Critical,
    /// Data inconsistency that will misroute future events
    High,
    /// Cleanup needed
    Medium,
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

impl InvariantCheckSummary {
    fn from_violations(checked_at: OffsetDateTime, checks_run: usize, violations: Vec<InvariantViolation>) -> Self {
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();

        Self {
            checked_at,
            checks_run,
            checks_passed: checks_run.saturating_sub(checks_failed),
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct FlagMismatchRow {
    id: Uuid,
    stripe_subscription_status: String,
    is_subscribed: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct DuplicateDefaultRow {
    auth_user_id: String,
    business_ids: Vec<Uuid>,
}

#[derive(Debug, sqlx::FromRow)]
struct LegacyOwnerRow {
    id: Uuid,
    owner_id: String,
}

#[derive(Debug, sqlx::FromRow)]
struct SharedCustomerRow {
    stripe_customer_id: String,
    business_ids: Vec<Uuid>,
}

#[derive(Debug, sqlx::FromRow)]
struct MissingCustomerRow {
    id: Uuid,
    name: String,
    stripe_subscription_status: String,
}

/// Service for running tenant invariant checks
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_subscribed_flag_matches_status().await?);
        violations.extend(self.check_single_default_per_owner().await?);
        violations.extend(self.check_legacy_owner_backfilled().await?);
        violations.extend(self.check_customer_ref_unique().await?);
        violations.extend(self.check_subscribed_has_customer().await?);

        Ok(InvariantCheckSummary::from_violations(
            now,
            Self::available_checks().len(),
            violations,
        ))
    }

    /// Invariant 1: `is_subscribed` is true iff the status grants access
    async fn check_subscribed_flag_matches_status(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<FlagMismatchRow> = sqlx::query_as(
            r#"
            SELECT id, stripe_subscription_status, is_subscribed
            FROM businesses
            WHERE is_subscribed <> (
                stripe_subscription_status IN ('active', 'trialing', 'incomplete', 'incomplete_expired')
            )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "subscribed_flag_matches_status".to_string(),
                business_ids: vec![row.id],
                description: format!(
                    "Business has status '{}' but is_subscribed = {}",
                    row.stripe_subscription_status, row.is_subscribed
                ),
                context: serde_json::json!({
                    "status": row.stripe_subscription_status,
                    "is_subscribed": row.is_subscribed,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: at most one default business per owner
    ///
    /// Backed by a partial unique index; a hit here means the index was dropped.
    async fn check_single_default_per_owner(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<DuplicateDefaultRow> = sqlx::query_as(
            r#"
            SELECT auth_user_id, ARRAY_AGG(id ORDER BY created_at) AS business_ids
            FROM businesses
            WHERE is_default AND auth_user_id IS NOT NULL
            GROUP BY auth_user_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_default_per_owner".to_string(),
                description: format!(
                    "User has {} auto-created businesses (expected 1)",
                    row.business_ids.len()
                ),
                context: serde_json::json!({
                    "auth_user_id": row.auth_user_id,
                }),
                business_ids: row.business_ids,
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 3: legacy owner column has been backfilled
    async fn check_legacy_owner_backfilled(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<LegacyOwnerRow> = sqlx::query_as(
            r#"
            SELECT id, owner_id
            FROM businesses
            WHERE auth_user_id IS NULL AND owner_id IS NOT NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "legacy_owner_backfilled".to_string(),
                business_ids: vec![row.id],
                description: "Business is owned only through the legacy owner column".to_string(),
                context: serde_json::json!({
                    "owner_id": row.owner_id,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Invariant 4: a customer reference belongs to one business
    ///
    /// Shared references make customer-based resolution ambiguous, so events
    /// for these tenants go unapplied.
    async fn check_customer_ref_unique(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<SharedCustomerRow> = sqlx::query_as(
            r#"
            SELECT stripe_customer_id, ARRAY_AGG(id ORDER BY created_at) AS business_ids
            FROM businesses
            WHERE stripe_customer_id IS NOT NULL
            GROUP BY stripe_customer_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "customer_ref_unique".to_string(),
                description: format!(
                    "Customer '{}' is linked to {} businesses",
                    row.stripe_customer_id,
                    row.business_ids.len()
                ),
                context: serde_json::json!({
                    "stripe_customer_id": row.stripe_customer_id,
                }),
                business_ids: row.business_ids,
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 5: subscribed businesses carry a customer reference
    async fn check_subscribed_has_customer(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MissingCustomerRow> = sqlx::query_as(
            r#"
            SELECT id, name, stripe_subscription_status
            FROM businesses
            WHERE is_subscribed AND stripe_customer_id IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "subscribed_has_customer".to_string(),
                business_ids: vec![row.id],
                description: format!("Business '{}' is subscribed without a customer", row.name),
                context: serde_json::json!({
                    "name": row.name,
                    "status": row.stripe_subscription_status,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "subscribed_flag_matches_status" => self.check_subscribed_flag_matches_status().await,
            "single_default_per_owner" => self.check_single_default_per_owner().await,
            "legacy_owner_backfilled" => self.check_legacy_owner_backfilled().await,
            "customer_ref_unique" => self.check_customer_ref_unique().await,
            "subscribed_has_customer" => self.check_subscribed_has_customer().await,
            _ => Ok(vec![]),
        }
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "subscribed_flag_matches_status",
            "single_default_per_owner",
            "legacy_owner_backfilled",
            "customer_ref_unique",
            "subscribed_has_customer",
        ]
    }
}
