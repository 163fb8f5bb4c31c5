//! In-memory store
//!
//! Backs the unit and route tests of every crate. Writes are applied immediately and
//! recorded in a per-transaction undo log; a transaction that is dropped or
//! rolled back replays the log in reverse. Rows written by an open transaction
//! are visible to other transactions, so callers must serialize through the
//! advisory and row locks exactly as they do against PostgreSQL.
//!
//! The default-per-owner unique index and the ledger primary key are both
//! enforced here. An event id claimed by a transaction that has not committed
//! yet already counts as claimed.
//!
//! Lock entries live only while some transaction holds or awaits them.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

use super::{InsertOutcome, Store, StoreTx};
use crate::error::{StoreError, StoreResult};
use crate::models::{
    Business, NewBusiness, NewPaymentEvent, PaymentEventRecord, SubscriptionProjection,
    SubscriptionStatus,
};

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct State {
    businesses: Vec<Business>,
    events: HashMap<String, PaymentEventRecord>,
}

type LockMap<K> = Mutex<HashMap<K, Arc<AsyncMutex<()>>>>;

/// Lock entry for `key`, created on first use
fn lock_entry<K: Eq + Hash + Copy>(locks: &LockMap<K>, key: K) -> Arc<AsyncMutex<()>> {
    locks.lock().entry(key).or_default().clone()
}

/// Drop the entry for `key` once only the map references it
fn release_entry<K: Eq + Hash>(locks: &LockMap<K>, key: &K) {
    let mut locks = locks.lock();
    if locks.get(key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
        locks.remove(key);
    }
}

struct Inner {
    state: Mutex<State>,
    advisory_locks: LockMap<i64>,
    row_locks: LockMap<Uuid>,
    lock_timeout: Duration,
    unavailable: AtomicBool,
    injected_conflicts: Mutex<HashMap<String, Business>>,
}

/// In-memory [`Store`]
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }

    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                advisory_locks: Mutex::new(HashMap::new()),
                row_locks: Mutex::new(HashMap::new()),
                lock_timeout,
                unavailable: AtomicBool::new(false),
                injected_conflicts: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Insert a row directly, bypassing transactions
    pub fn seed_business(&self, business: Business) {
        self.inner.state.lock().businesses.push(business);
    }

    pub fn business(&self, id: Uuid) -> Option<Business> {
        self.inner
            .state
            .lock()
            .businesses
            .iter()
            .find(|b| b.id == id)
            .cloned()
    }

    pub fn businesses(&self) -> Vec<Business> {
        self.inner.state.lock().businesses.clone()
    }

    pub fn payment_event(&self, event_id: &str) -> Option<PaymentEventRecord> {
        self.inner.state.lock().events.get(event_id).cloned()
    }

    pub fn payment_event_count(&self) -> usize {
        self.inner.state.lock().events.len()
    }

    /// Make `begin` and lock acquisition fail as if the database were unreachable
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// The next default insert for `user_id` finds `racer` already committed
    /// and reports a uniqueness conflict
    pub fn inject_insert_conflict(&self, user_id: &str, racer: Business) {
        self.inner
            .injected_conflicts
            .lock()
            .insert(user_id.to_string(), racer);
    }

    #[cfg(test)]
    fn lock_entry_count(&self) -> usize {
        self.inner.advisory_locks.lock().len() + self.inner.row_locks.lock().len()
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(
                "memory store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

/// Fresh business row for seeding a [`MemoryStore`]
pub fn business_fixture(owner_user_id: Option<&str>, name: &str) -> Business {
    let now = OffsetDateTime::now_utc();
    Business {
        id: Uuid::new_v4(),
        owner_user_id: owner_user_id.map(str::to_string),
        name: name.to_string(),
        timezone: "Europe/Prague".to_string(),
        is_default: false,
        stripe_customer_id: None,
        stripe_subscription_id: None,
        stripe_price_id: None,
        subscription_status: SubscriptionStatus::None,
        is_subscribed: false,
        created_at: now,
        updated_at: now,
    }
}

fn sorted_by_creation(mut businesses: Vec<Business>) -> Vec<Business> {
    businesses.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    businesses
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> StoreResult<Box<dyn StoreTx>> {
        self.check_available()?;
        Ok(Box::new(MemoryStoreTx {
            store: self.clone(),
            undo: Vec::new(),
            held_advisory: HashSet::new(),
            held_rows: HashSet::new(),
            guards: Vec::new(),
            committed: false,
        }))
    }

    async fn list_businesses_for_owner(&self, user_id: &str) -> StoreResult<Vec<Business>> {
        self.check_available()?;
        let owned = self
            .inner
            .state
            .lock()
            .businesses
            .iter()
            .filter(|b| b.owner_user_id.as_deref() == Some(user_id))
            .cloned()
            .collect();
        Ok(sorted_by_creation(owned))
    }

    async fn prune_payment_events(&self, cutoff: OffsetDateTime) -> StoreResult<u64> {
        self.check_available()?;
        let mut state = self.inner.state.lock();
        let before = state.events.len();
        state.events.retain(|_, e| e.received_at >= cutoff);
        Ok((before - state.events.len()) as u64)
    }

    async fn ping(&self) -> StoreResult<()> {
        self.check_available()
    }
}

enum Undo {
    InsertedBusiness(Uuid),
    UpdatedBusiness(Business),
    RecordedEvent(String),
}

/// An open in-memory transaction
pub struct MemoryStoreTx {
    store: MemoryStore,
    undo: Vec<Undo>,
    held_advisory: HashSet<i64>,
    held_rows: HashSet<Uuid>,
    // Released in `Drop::drop` after the undo log is replayed
    guards: Vec<OwnedMutexGuard<()>>,
    committed: bool,
}

impl MemoryStoreTx {
    async fn acquire(&mut self, lock: Arc<AsyncMutex<()>>) -> StoreResult<()> {
        self.store.check_available()?;
        let guard = tokio::time::timeout(self.store.inner.lock_timeout, lock.lock_owned())
            .await
            .map_err(|_| StoreError::LockTimeout)?;
        self.guards.push(guard);
        Ok(())
    }

    fn undo_all(&mut self) {
        let mut state = self.store.inner.state.lock();
        while let Some(entry) = self.undo.pop() {
            match entry {
                Undo::InsertedBusiness(id) => state.businesses.retain(|b| b.id != id),
                Undo::UpdatedBusiness(previous) => {
                    if let Some(row) = state.businesses.iter_mut().find(|b| b.id == previous.id) {
                        *row = previous;
                    }
                }
                Undo::RecordedEvent(event_id) => {
                    state.events.remove(&event_id);
                }
            }
        }
    }

    fn find(&self, predicate: impl Fn(&Business) -> bool) -> Vec<Business> {
        let owned = self
            .store
            .inner
            .state
            .lock()
            .businesses
            .iter()
            .filter(|b| predicate(b))
            .cloned()
            .collect();
        sorted_by_creation(owned)
    }
}

impl Drop for MemoryStoreTx {
    fn drop(&mut self) {
        if !self.committed {
            self.undo_all();
        }

        self.guards.clear();
        let inner = &self.store.inner;
        for key in &self.held_advisory {
            release_entry(&inner.advisory_locks, key);
        }
        for id in &self.held_rows {
            release_entry(&inner.row_locks, id);
        }
    }
}

#[async_trait]
impl StoreTx for MemoryStoreTx {
    async fn acquire_advisory_lock(&mut self, key: i64) -> StoreResult<()> {
        if self.held_advisory.contains(&key) {
            return Ok(());
        }
        let lock = lock_entry(&self.store.inner.advisory_locks, key);
        if let Err(e) = self.acquire(lock).await {
            release_entry(&self.store.inner.advisory_locks, &key);
            return Err(e);
        }
        self.held_advisory.insert(key);
        Ok(())
    }

    async fn businesses_owned_by(&mut self, user_id: &str) -> StoreResult<Vec<Business>> {
        Ok(self.find(|b| b.owner_user_id.as_deref() == Some(user_id)))
    }

    async fn insert_default_business(&mut self, new: &NewBusiness) -> StoreResult<InsertOutcome> {
        if let Some(racer) = self
            .store
            .inner
            .injected_conflicts
            .lock()
            .remove(&new.owner_user_id)
        {
            self.store.seed_business(racer);
            return Ok(InsertOutcome::Conflict);
        }

        let mut state = self.store.inner.state.lock();
        let has_default = state
            .businesses
            .iter()
            .any(|b| b.is_default && b.owner_user_id.as_deref() == Some(new.owner_user_id.as_str()));
        if has_default {
            return Ok(InsertOutcome::Conflict);
        }

        let now = OffsetDateTime::now_utc();
        let business = Business {
            id: Uuid::new_v4(),
            owner_user_id: Some(new.owner_user_id.clone()),
            name: new.name.clone(),
            timezone: new.timezone.clone(),
            is_default: true,
            stripe_customer_id: None,
            stripe_subscription_id: None,
            stripe_price_id: None,
            subscription_status: SubscriptionStatus::None,
            is_subscribed: false,
            created_at: now,
            updated_at: now,
        };
        let id = business.id;
        state.businesses.push(business);
        drop(state);

        self.undo.push(Undo::InsertedBusiness(id));
        Ok(InsertOutcome::Inserted(id))
    }

    async fn record_payment_event(&mut self, event: &NewPaymentEvent) -> StoreResult<bool> {
        let mut state = self.store.inner.state.lock();
        if state.events.contains_key(&event.event_id) {
            return Ok(false);
        }
        state.events.insert(
            event.event_id.clone(),
            PaymentEventRecord {
                event_id: event.event_id.clone(),
                event_type: event.event_type.clone(),
                event_created_at: event.event_created_at,
                received_at: OffsetDateTime::now_utc(),
            },
        );
        drop(state);

        self.undo.push(Undo::RecordedEvent(event.event_id.clone()));
        Ok(true)
    }

    async fn business_by_id(&mut self, id: Uuid) -> StoreResult<Option<Business>> {
        Ok(self.store.business(id))
    }

    async fn businesses_by_customer_ref(
        &mut self,
        customer_ref: &str,
        limit: i64,
    ) -> StoreResult<Vec<Business>> {
        let mut found = self.find(|b| b.stripe_customer_id.as_deref() == Some(customer_ref));
        found.truncate(limit.max(0) as usize);
        Ok(found)
    }

    async fn businesses_by_subscription_ref(
        &mut self,
        subscription_ref: &str,
        limit: i64,
    ) -> StoreResult<Vec<Business>> {
        let mut found =
            self.find(|b| b.stripe_subscription_id.as_deref() == Some(subscription_ref));
        found.truncate(limit.max(0) as usize);
        Ok(found)
    }

    async fn earliest_business_owned_by(&mut self, user_id: &str) -> StoreResult<Option<Business>> {
        Ok(self
            .find(|b| b.owner_user_id.as_deref() == Some(user_id))
            .into_iter()
            .next())
    }

    async fn lock_business(&mut self, id: Uuid) -> StoreResult<Option<Business>> {
        if !self.held_rows.contains(&id) {
            let lock = lock_entry(&self.store.inner.row_locks, id);
            if let Err(e) = self.acquire(lock).await {
                release_entry(&self.store.inner.row_locks, &id);
                return Err(e);
            }
            self.held_rows.insert(id);
        }
        Ok(self.store.business(id))
    }

    async fn update_subscription(
        &mut self,
        id: Uuid,
        projection: &SubscriptionProjection,
    ) -> StoreResult<Option<Business>> {
        let mut state = self.store.inner.state.lock();
        let Some(row) = state.businesses.iter_mut().find(|b| b.id == id) else {
            return Ok(None);
        };

        let previous = row.clone();
        *row = previous.with_subscription(projection, OffsetDateTime::now_utc());
        let updated = row.clone();
        drop(state);

        self.undo.push(Undo::UpdatedBusiness(previous));
        Ok(Some(updated))
    }

    async fn commit(mut self: Box<Self>) -> StoreResult<()> {
        self.committed = true;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        // Drop replays the undo log
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_business(user_id: &str) -> NewBusiness {
        NewBusiness {
            owner_user_id: user_id.to_string(),
            name: "Salon".to_string(),
            timezone: "Europe/Prague".to_string(),
        }
    }

    #[tokio::test]
    async fn test_dropped_tx_undoes_insert() {
        let store = MemoryStore::new();
        {
            let mut tx = store.begin().await.unwrap();
            let outcome = tx.insert_default_business(&new_business("u1")).await.unwrap();
            assert!(matches!(outcome, InsertOutcome::Inserted(_)));
        }
        assert!(store.businesses().is_empty());
    }

    #[tokio::test]
    async fn test_committed_insert_survives() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.insert_default_business(&new_business("u1")).await.unwrap();
        tx.commit().await.unwrap();

        let owned = store.list_businesses_for_owner("u1").await.unwrap();
        assert_eq!(owned.len(), 1);
        assert!(owned[0].is_default);
    }

    #[tokio::test]
    async fn test_second_default_is_a_conflict() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.insert_default_business(&new_business("u1")).await.unwrap();
        let second = tx.insert_default_business(&new_business("u1")).await.unwrap();
        assert_eq!(second, InsertOutcome::Conflict);

        // First insert is still part of the transaction
        assert_eq!(tx.businesses_owned_by("u1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rollback_restores_updated_row() {
        let store = MemoryStore::new();
        let business = business_fixture(Some("u1"), "Salon");
        let id = business.id;
        store.seed_business(business);

        let mut tx = store.begin().await.unwrap();
        let projection = SubscriptionProjection {
            customer_ref: Some("cus_1".into()),
            status: SubscriptionStatus::Active,
            is_subscribed: true,
            ..Default::default()
        };
        tx.update_subscription(id, &projection).await.unwrap();
        tx.rollback().await.unwrap();

        let row = store.business(id).unwrap();
        assert_eq!(row.stripe_customer_id, None);
        assert!(!row.is_subscribed);
    }

    #[tokio::test]
    async fn test_advisory_lock_times_out_while_held() {
        let store = MemoryStore::with_lock_timeout(Duration::from_millis(50));

        let mut holder = store.begin().await.unwrap();
        holder.acquire_advisory_lock(42).await.unwrap();
        // Re-entrant within the same transaction
        holder.acquire_advisory_lock(42).await.unwrap();

        let mut waiter = store.begin().await.unwrap();
        let err = waiter.acquire_advisory_lock(42).await.unwrap_err();
        assert!(matches!(err, StoreError::LockTimeout));

        drop(holder);
        waiter.acquire_advisory_lock(42).await.unwrap();
    }

    #[tokio::test]
    async fn test_lock_entries_are_released_with_the_transaction() {
        let store = MemoryStore::with_lock_timeout(Duration::from_millis(50));
        let business = business_fixture(Some("u1"), "Salon");
        let id = business.id;
        store.seed_business(business);

        for key in 0..100 {
            let mut tx = store.begin().await.unwrap();
            tx.acquire_advisory_lock(key).await.unwrap();
            tx.lock_business(id).await.unwrap();
            if key % 2 == 0 {
                tx.commit().await.unwrap();
            } else {
                tx.rollback().await.unwrap();
            }
        }
        assert_eq!(store.lock_entry_count(), 0);

        // A held entry survives a timed-out waiter and goes away with its holder
        let mut holder = store.begin().await.unwrap();
        holder.acquire_advisory_lock(7).await.unwrap();
        let mut waiter = store.begin().await.unwrap();
        assert!(waiter.acquire_advisory_lock(7).await.is_err());
        assert_eq!(store.lock_entry_count(), 1);
        drop(waiter);
        holder.commit().await.unwrap();
        assert_eq!(store.lock_entry_count(), 0);
    }

    #[tokio::test]
    async fn test_event_claim_is_released_on_rollback() {
        let store = MemoryStore::new();
        let event = NewPaymentEvent {
            event_id: "evt_1".into(),
            event_type: "invoice.paid".into(),
            event_created_at: None,
        };

        let mut tx = store.begin().await.unwrap();
        assert!(tx.record_payment_event(&event).await.unwrap());
        assert!(!tx.record_payment_event(&event).await.unwrap());
        tx.rollback().await.unwrap();
        assert_eq!(store.payment_event_count(), 0);

        let mut tx = store.begin().await.unwrap();
        assert!(tx.record_payment_event(&event).await.unwrap());
        tx.commit().await.unwrap();
        assert!(store.payment_event("evt_1").is_some());
    }

    #[tokio::test]
    async fn test_prune_removes_old_events() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.record_payment_event(&NewPaymentEvent {
            event_id: "evt_old".into(),
            event_type: "invoice.paid".into(),
            event_created_at: None,
        })
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let future = OffsetDateTime::now_utc() + time::Duration::seconds(1);
        assert_eq!(store.prune_payment_events(future).await.unwrap(), 1);
        assert_eq!(store.payment_event_count(), 0);
    }

    #[tokio::test]
    async fn test_unavailable_store_rejects_begin() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.begin().await.err(),
            Some(StoreError::Unavailable(_))
        ));
        store.set_unavailable(false);
        assert!(store.begin().await.is_ok());
    }
}
