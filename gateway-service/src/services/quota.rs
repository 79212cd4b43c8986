//! Per-identity daily allowance on top of a [`UsageStore`].

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::models::{normalize_identity, IdentityRecord, UsageStats};
use crate::services::clock::Clock;
use crate::services::usage_store::{StoreError, UsageStore};

/// Queries admitted for one identity that have not completed yet.
#[derive(Default)]
struct ReservationSlot {
    gate: Mutex<()>,
    in_flight: AtomicU64,
}

#[derive(Clone)]
pub struct QuotaLedger {
    store: Arc<dyn UsageStore>,
    clock: Arc<dyn Clock>,
    daily_limit: u32,
    reservations: Arc<DashMap<String, Arc<ReservationSlot>>>,
}

/// One admitted query. Committing records it; dropping it frees the slot.
pub struct QuotaReservation {
    ledger: QuotaLedger,
    identity: String,
    slot: Option<Arc<ReservationSlot>>,
    remaining: u64,
}

impl QuotaReservation {
    /// Allowance left once this query is spent.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Record the query and return today's new count.
    pub async fn commit(mut self) -> Result<u64, StoreError> {
        let Some(slot) = self.slot.take() else {
            return self.ledger.increment(&self.identity).await;
        };

        let result = {
            let _gate = slot.gate.lock().await;
            let result = self.ledger.increment(&self.identity).await;
            slot.in_flight.fetch_sub(1, Ordering::AcqRel);
            result
        };

        drop(slot);
        self.ledger.forget_idle(&self.identity);
        result
    }
}

impl Drop for QuotaReservation {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            slot.in_flight.fetch_sub(1, Ordering::AcqRel);
            drop(slot);
            tracing::debug!(identity = %self.identity, "Quota reservation released");
            self.ledger.forget_idle(&self.identity);
        }
    }
}

impl QuotaLedger {
    pub fn new(store: Arc<dyn UsageStore>, clock: Arc<dyn Clock>, daily_limit: u32) -> Self {
        Self {
            store,
            clock,
            daily_limit,
            reservations: Arc::new(DashMap::new()),
        }
    }

    pub fn daily_limit(&self) -> u32 {
        self.daily_limit
    }

    pub fn seconds_until_reset(&self) -> u64 {
        self.clock.seconds_until_reset()
    }

    fn remaining_from(&self, used: u64) -> u64 {
        u64::from(self.daily_limit).saturating_sub(used)
    }

    /// Allowance left for today; a fresh day starts at the full limit.
    pub async fn remaining(&self, identity: &str) -> Result<u64, StoreError> {
        let identity = normalize_identity(identity);
        let used = self.store.count(&identity, self.clock.today()).await?;
        Ok(self.remaining_from(used))
    }

    /// Record one completed query and return today's new count.
    pub async fn increment(&self, identity: &str) -> Result<u64, StoreError> {
        let identity = normalize_identity(identity);
        let count = self.store.increment(&identity, self.clock.today()).await?;
        tracing::debug!(identity = %identity, count, "Usage incremented");
        Ok(count)
    }

    pub async fn has_quota(&self, identity: &str) -> Result<(bool, u64), StoreError> {
        let remaining = self.remaining(identity).await?;
        Ok((remaining > 0, remaining))
    }

    /// Admit one query if today's count plus queries still in flight is under the limit.
    /// `None` means the allowance is spent.
    pub async fn reserve(&self, identity: &str) -> Result<Option<QuotaReservation>, StoreError> {
        let identity = normalize_identity(identity);
        let slot = self
            .reservations
            .entry(identity.clone())
            .or_default()
            .clone();

        match self.admit(&identity, &slot).await {
            Ok(Some(remaining)) => Ok(Some(QuotaReservation {
                ledger: self.clone(),
                identity,
                slot: Some(slot),
                remaining,
            })),
            other => {
                drop(slot);
                self.forget_idle(&identity);
                other.map(|_| None)
            }
        }
    }

    async fn admit(&self, identity: &str, slot: &ReservationSlot) -> Result<Option<u64>, StoreError> {
        let _gate = slot.gate.lock().await;
        let used = self.store.count(identity, self.clock.today()).await?;
        let pending = slot.in_flight.load(Ordering::Acquire);

        let remaining = self.remaining_from(used.saturating_add(pending));
        if remaining == 0 {
            return Ok(None);
        }

        slot.in_flight.fetch_add(1, Ordering::AcqRel);
        tracing::debug!(identity = %identity, used, pending, "Quota reserved");
        Ok(Some(remaining - 1))
    }

    /// Drop an identity's slot once no reservation or admission holds it.
    fn forget_idle(&self, identity: &str) {
        self.reservations.remove_if(identity, |_, slot| {
            Arc::strong_count(slot) == 1 && slot.in_flight.load(Ordering::Acquire) == 0
        });
    }

    /// Create or touch the identity record for an email.
    pub async fn register(&self, email: &str) -> Result<IdentityRecord, StoreError> {
        let identity = normalize_identity(email);
        let record = self
            .store
            .upsert_identity(&identity, self.clock.now())
            .await?;
        tracing::info!(identity = %identity, "Identity registered");
        Ok(record)
    }

    pub async fn lookup(&self, identity: &str) -> Result<Option<IdentityRecord>, StoreError> {
        self.store.get_identity(&normalize_identity(identity)).await
    }

    pub async fn stats(&self, identity: &str) -> Result<Option<UsageStats>, StoreError> {
        let identity = normalize_identity(identity);
        let Some(record) = self.store.get_identity(&identity).await? else {
            return Ok(None);
        };

        let used_today = self.store.count(&identity, self.clock.today()).await?;
        let total_all_time = self.store.total(&identity).await?;

        Ok(Some(UsageStats {
            identity: record.identity,
            created_at: record.created_at,
            last_access_at: record.last_access_at,
            used_today,
            remaining_today: self.remaining_from(used_today),
            daily_limit: self.daily_limit,
            total_all_time,
        }))
    }

    pub async fn health_check(&self) -> Result<(), StoreError> {
        self.store.health_check().await
    }
}
