//! Tenant provisioning
//!
//! Every authenticated user owns at least one business. The first request
//! that finds none creates a default one under a per-user advisory lock, so
//! concurrent first requests from the same user converge on a single row.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use iva_shared::{
    advisory_lock_key, Business, InsertOutcome, NewBusiness, SharedStore, StoreError, StoreTx,
};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use uuid::Uuid;

/// Longest timezone hint accepted from a client
const MAX_TIMEZONE_LEN: usize = 64;

/// Upper bound on the pause between provisioning attempts
const MAX_RETRY_DELAY: Duration = Duration::from_millis(250);

#[derive(Debug, thiserror::Error)]
pub enum TenancyError {
    #[error("user id is empty")]
    InvalidUser,

    /// Provisioning could not complete; the caller should retry later
    #[error("no tenant available after {attempts} attempt(s): {reason}")]
    Unavailable { attempts: u32, reason: String },

    #[error(transparent)]
    Store(StoreError),
}

impl TenancyError {
    fn from_store(e: StoreError, attempts: u32) -> Self {
        if e.is_transient() {
            TenancyError::Unavailable {
                attempts,
                reason: e.to_string(),
            }
        } else {
            TenancyError::Store(e)
        }
    }
}

/// Failure of a single provisioning transaction
#[derive(Debug)]
enum AttemptError {
    Store(StoreError),
    /// The default insert hit a uniqueness conflict but the winning row is not visible yet
    UnresolvedConflict,
}

impl AttemptError {
    fn is_retryable(&self) -> bool {
        match self {
            AttemptError::Store(e) => e.is_transient(),
            AttemptError::UnresolvedConflict => true,
        }
    }
}

impl From<StoreError> for AttemptError {
    fn from(e: StoreError) -> Self {
        AttemptError::Store(e)
    }
}

/// Values used when auto-creating a tenant
#[derive(Debug, Clone)]
pub struct TenantSettings {
    pub default_timezone: String,
    pub default_business_name: String,
    /// Provisioning transactions tried before giving up (at least 1)
    pub max_attempts: u32,
}

impl Default for TenantSettings {
    fn default() -> Self {
        Self {
            default_timezone: "Europe/Prague".to_string(),
            default_business_name: "Můj nový salon".to_string(),
            max_attempts: 3,
        }
    }
}

/// Businesses of a user and whether this call created one
#[derive(Debug, Clone)]
pub struct TenantResolution {
    /// Earliest first
    pub businesses: Vec<Business>,
    pub created: bool,
}

pub struct TenantResolver {
    store: SharedStore,
    settings: TenantSettings,
}

impl TenantResolver {
    pub fn new(store: SharedStore, settings: TenantSettings) -> Self {
        Self { store, settings }
    }

    /// Businesses owned by `user_id`, creating the default one if there are none
    pub async fn resolve(
        &self,
        user_id: &str,
        timezone_hint: Option<&str>,
    ) -> Result<TenantResolution, TenancyError> {
        self.resolve_with(user_id, timezone_hint, None).await
    }

    /// Like [`resolve`](Self::resolve), naming the business if one gets created
    pub async fn resolve_with(
        &self,
        user_id: &str,
        timezone_hint: Option<&str>,
        name: Option<&str>,
    ) -> Result<TenantResolution, TenancyError> {
        if user_id.trim().is_empty() {
            return Err(TenancyError::InvalidUser);
        }

        // Unlocked read; the locked path re-checks before inserting
        let existing = self
            .store
            .list_businesses_for_owner(user_id)
            .await
            .map_err(|e| TenancyError::from_store(e, 0))?;
        if !existing.is_empty() {
            return Ok(TenantResolution {
                businesses: existing,
                created: false,
            });
        }

        let new = NewBusiness {
            owner_user_id: user_id.to_string(),
            name: name
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .unwrap_or(&self.settings.default_business_name)
                .to_string(),
            timezone: sanitize_timezone_hint(timezone_hint)
                .unwrap_or(&self.settings.default_timezone)
                .to_string(),
        };

        let attempts = AtomicU32::new(0);
        let strategy = ExponentialBackoff::from_millis(2)
            .factor(10)
            .max_delay(MAX_RETRY_DELAY)
            .map(jitter)
            .take(self.settings.max_attempts.saturating_sub(1) as usize);

        let result = RetryIf::spawn(
            strategy,
            || {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                let new = &new;
                async move {
                    self.provision_once(new).await.map_err(|e| {
                        tracing::warn!(
                            user_id = %new.owner_user_id,
                            attempt,
                            error = ?e,
                            "Tenant provisioning attempt failed"
                        );
                        e
                    })
                }
            },
            AttemptError::is_retryable,
        )
        .await;

        let attempts = attempts.load(Ordering::SeqCst);
        match result {
            Ok(resolution) => {
                if resolution.created {
                    tracing::info!(
                        user_id = %user_id,
                        business_id = ?resolution.businesses.first().map(|b| b.id),
                        timezone = %new.timezone,
                        "Created default business"
                    );
                }
                Ok(resolution)
            }
            Err(AttemptError::UnresolvedConflict) => {
                tracing::error!(user_id = %user_id, attempts, "Tenant provisioning kept conflicting");
                Err(TenancyError::Unavailable {
                    attempts,
                    reason: "concurrent creation did not settle".to_string(),
                })
            }
            Err(AttemptError::Store(e)) => {
                tracing::error!(user_id = %user_id, attempts, error = %e, "Tenant provisioning failed");
                Err(TenancyError::from_store(e, attempts))
            }
        }
    }

    /// Read-only listing; never creates
    pub async fn list(&self, user_id: &str) -> Result<Vec<Business>, TenancyError> {
        if user_id.trim().is_empty() {
            return Err(TenancyError::InvalidUser);
        }
        self.store
            .list_businesses_for_owner(user_id)
            .await
            .map_err(|e| TenancyError::from_store(e, 0))
    }

    /// One locked provisioning transaction
    ///
    /// The transaction is dropped on every error path, which rolls it back
    /// and releases the advisory lock.
    async fn provision_once(&self, new: &NewBusiness) -> Result<TenantResolution, AttemptError> {
        let user_id = new.owner_user_id.as_str();
        let mut tx = self.store.begin().await?;
        tx.acquire_advisory_lock(advisory_lock_key(user_id)).await?;

        let existing = tx.businesses_owned_by(user_id).await?;
        if !existing.is_empty() {
            tx.commit().await?;
            return Ok(TenantResolution {
                businesses: existing,
                created: false,
            });
        }

        match tx.insert_default_business(new).await? {
            InsertOutcome::Inserted(id) => {
                let businesses = tx.businesses_owned_by(user_id).await?;
                tx.commit().await?;
                tracing::debug!(user_id = %user_id, business_id = %id, "Default business inserted");
                Ok(TenantResolution {
                    businesses,
                    created: true,
                })
            }
            InsertOutcome::Conflict => {
                let businesses = tx.businesses_owned_by(user_id).await?;
                if businesses.is_empty() {
                    return Err(AttemptError::UnresolvedConflict);
                }
                tx.commit().await?;
                tracing::info!(user_id = %user_id, "Default business created concurrently, using existing row");
                Ok(TenantResolution {
                    businesses,
                    created: false,
                })
            }
        }
    }
}

/// Loose IANA zone shape check (`Area/Location`, `UTC`)
pub fn is_plausible_timezone(candidate: &str) -> bool {
    if candidate == "UTC" {
        return true;
    }
    if candidate.is_empty() || candidate.len() > MAX_TIMEZONE_LEN {
        return false;
    }
    if !candidate.contains('/')
        || candidate.starts_with('/')
        || candidate.ends_with('/')
        || candidate.contains("//")
    {
        return false;
    }
    candidate
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '_' | '-' | '+'))
}

/// The hint, trimmed, if it looks like a timezone
pub fn sanitize_timezone_hint(hint: Option<&str>) -> Option<&str> {
    hint.map(str::trim).filter(|h| is_plausible_timezone(h))
}

/// Pick the active tenant: the remembered one if still owned, else the earliest
pub fn select_active_business(remembered: Option<Uuid>, businesses: &[Business]) -> Option<&Business> {
    remembered
        .and_then(|id| businesses.iter().find(|b| b.id == id))
        .or_else(|| {
            businesses
                .iter()
                .min_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use iva_shared::store::memory::business_fixture;
    use iva_shared::MemoryStore;
    use std::sync::Arc;
    use tokio::sync::Barrier;

    fn resolver(store: &MemoryStore) -> TenantResolver {
        TenantResolver::new(Arc::new(store.clone()), TenantSettings::default())
    }

    #[tokio::test]
    async fn test_first_call_creates_default_business() {
        let store = MemoryStore::new();
        let resolution = resolver(&store)
            .resolve("u1", Some("Europe/Prague"))
            .await
            .unwrap();

        assert!(resolution.created);
        assert_eq!(resolution.businesses.len(), 1);
        let business = &resolution.businesses[0];
        assert_eq!(business.owner_user_id.as_deref(), Some("u1"));
        assert_eq!(business.timezone, "Europe/Prague");
        assert_eq!(business.name, "Můj nový salon");
        assert!(business.is_default);
        assert!(!business.is_subscribed);
    }

    #[tokio::test]
    async fn test_second_call_returns_existing() {
        let store = MemoryStore::new();
        let resolver = resolver(&store);

        let first = resolver.resolve("u1", None).await.unwrap();
        let second = resolver.resolve("u1", Some("America/New_York")).await.unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.businesses[0].id, second.businesses[0].id);
        assert_eq!(second.businesses[0].timezone, "Europe/Prague");
        assert_eq!(store.businesses().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_first_calls_create_exactly_one() {
        const CALLERS: usize = 16;
        let store = MemoryStore::new();
        let resolver = Arc::new(resolver(&store));
        let barrier = Arc::new(Barrier::new(CALLERS));

        let handles: Vec<_> = (0..CALLERS)
            .map(|_| {
                let resolver = resolver.clone();
                let barrier = barrier.clone();
                tokio::spawn(async move {
                    barrier.wait().await;
                    resolver.resolve("u-race", Some("Europe/Prague")).await
                })
            })
            .collect();

        let mut created = 0;
        let mut ids = std::collections::HashSet::new();
        for handle in handles {
            let resolution = handle.await.unwrap().unwrap();
            assert_eq!(resolution.businesses.len(), 1);
            ids.insert(resolution.businesses[0].id);
            if resolution.created {
                created += 1;
            }
        }

        assert_eq!(created, 1);
        assert_eq!(ids.len(), 1);
        assert_eq!(store.businesses().len(), 1);
    }

    #[tokio::test]
    async fn test_unrelated_users_do_not_share_tenants() {
        let store = MemoryStore::new();
        let resolver = resolver(&store);

        let a = resolver.resolve("user-a", None).await.unwrap();
        let b = resolver.resolve("user-b", None).await.unwrap();

        assert!(a.created && b.created);
        assert_ne!(a.businesses[0].id, b.businesses[0].id);
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_closed() {
        let store = MemoryStore::new();
        store.set_unavailable(true);

        let err = resolver(&store).resolve("u1", None).await.unwrap_err();
        assert!(matches!(err, TenancyError::Unavailable { .. }));

        store.set_unavailable(false);
        assert!(store.businesses().is_empty());
    }

    #[tokio::test]
    async fn test_insert_conflict_recovers_with_racing_row() {
        let store = MemoryStore::new();
        let mut racer = business_fixture(Some("u1"), "Racer");
        racer.is_default = true;
        store.inject_insert_conflict("u1", racer.clone());

        let resolution = resolver(&store).resolve("u1", None).await.unwrap();

        assert!(!resolution.created);
        assert_eq!(resolution.businesses.len(), 1);
        assert_eq!(resolution.businesses[0].id, racer.id);
        assert_eq!(store.businesses().len(), 1);
    }

    #[tokio::test]
    async fn test_lock_timeout_exhausts_attempts() {
        let store = MemoryStore::with_lock_timeout(Duration::from_millis(20));
        let settings = TenantSettings {
            max_attempts: 2,
            ..TenantSettings::default()
        };
        let resolver = TenantResolver::new(Arc::new(store.clone()), settings);

        // Hold the user's provisioning lock in another transaction
        let mut holder = iva_shared::Store::begin(&store).await.unwrap();
        holder
            .acquire_advisory_lock(advisory_lock_key("u1"))
            .await
            .unwrap();

        let err = resolver.resolve("u1", None).await.unwrap_err();
        match err {
            TenancyError::Unavailable { attempts, .. } => assert_eq!(attempts, 2),
            other => panic!("unexpected error: {other:?}"),
        }

        holder.rollback().await.unwrap();
        assert!(store.businesses().is_empty());
    }

    #[tokio::test]
    async fn test_empty_user_is_rejected() {
        let store = MemoryStore::new();
        let err = resolver(&store).resolve("  ", None).await.unwrap_err();
        assert!(matches!(err, TenancyError::InvalidUser));
    }

    #[tokio::test]
    async fn test_explicit_name_used_on_creation_only() {
        let store = MemoryStore::new();
        let resolver = resolver(&store);

        let created = resolver
            .resolve_with("u1", None, Some("  Studio Nova "))
            .await
            .unwrap();
        assert_eq!(created.businesses[0].name, "Studio Nova");

        let again = resolver
            .resolve_with("u1", None, Some("Other"))
            .await
            .unwrap();
        assert!(!again.created);
        assert_eq!(again.businesses[0].name, "Studio Nova");
    }

    #[tokio::test]
    async fn test_list_never_creates() {
        let store = MemoryStore::new();
        let businesses = resolver(&store).list("u1").await.unwrap();
        assert!(businesses.is_empty());
        assert!(store.businesses().is_empty());
    }

    #[test]
    fn test_timezone_hint_validation() {
        assert_eq!(sanitize_timezone_hint(Some("Europe/Prague")), Some("Europe/Prague"));
        assert_eq!(
            sanitize_timezone_hint(Some(" America/Argentina/Buenos_Aires ")),
            Some("America/Argentina/Buenos_Aires")
        );
        assert_eq!(sanitize_timezone_hint(Some("Etc/GMT+1")), Some("Etc/GMT+1"));
        assert_eq!(sanitize_timezone_hint(Some("UTC")), Some("UTC"));
        assert_eq!(sanitize_timezone_hint(Some("Prague")), None);
        assert_eq!(sanitize_timezone_hint(Some("Europe/ Prague")), None);
        assert_eq!(sanitize_timezone_hint(Some("Europe//Prague")), None);
        assert_eq!(sanitize_timezone_hint(Some("'; DROP TABLE x;--/a")), None);
        assert_eq!(sanitize_timezone_hint(Some(&format!("Europe/{}", "x".repeat(80)))), None);
        assert_eq!(sanitize_timezone_hint(None), None);
    }

    #[tokio::test]
    async fn test_invalid_hint_falls_back_to_default_zone() {
        let store = MemoryStore::new();
        let resolution = resolver(&store)
            .resolve("u1", Some("not a zone"))
            .await
            .unwrap();
        assert_eq!(resolution.businesses[0].timezone, "Europe/Prague");
    }

    #[test]
    fn test_select_active_prefers_remembered() {
        let older = business_fixture(Some("u1"), "Older");
        let mut newer = business_fixture(Some("u1"), "Newer");
        newer.created_at = older.created_at + time::Duration::seconds(10);
        let businesses = vec![older.clone(), newer.clone()];

        assert_eq!(select_active_business(Some(newer.id), &businesses).unwrap().id, newer.id);
        assert_eq!(select_active_business(None, &businesses).unwrap().id, older.id);
        assert_eq!(
            select_active_business(Some(Uuid::new_v4()), &businesses).unwrap().id,
            older.id
        );
        assert!(select_active_business(None, &[]).is_none());
    }

    #[test]
    fn test_select_active_orders_by_creation_not_position() {
        let older = business_fixture(Some("u1"), "Older");
        let mut newer = business_fixture(Some("u1"), "Newer");
        newer.created_at = older.created_at + time::Duration::seconds(10);

        let reversed = vec![newer, older.clone()];
        assert_eq!(select_active_business(None, &reversed).unwrap().id, older.id);
    }
}
