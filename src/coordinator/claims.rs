// ABOUTME: Lease-based claim registry giving one holder exclusive ownership of a work item.
// ABOUTME: Expiry is lazy; reconcile force-releases claims whose item changed externally.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use crate::clock::Clock;
use crate::source::{CandidateFilter, ExternalState, ItemId};

/// Time-bounded exclusive ownership of a work item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub item_id: ItemId,
    pub holder_id: String,
    pub acquired_at: Instant,
    pub renewed_at: Instant,
    pub lease_duration: Duration,
}

impl Claim {
    /// The instant the lease lapses unless renewed.
    pub fn expires_at(&self) -> Instant {
        self.renewed_at + self.lease_duration
    }

    /// A claim is live strictly before its expiry instant.
    pub fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at()
    }
}

/// Result of `try_claim`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed(Claim),
    AlreadyClaimed { holder: String, expires_at: Instant },
}

impl ClaimOutcome {
    pub fn is_claimed(&self) -> bool {
        matches!(self, ClaimOutcome::Claimed(_))
    }
}

/// Result of `renew`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewOutcome {
    Renewed { expires_at: Instant },
    NotHolder,
    Expired,
}

/// Result of `release`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    NotHolder,
}

type Slot = Arc<Mutex<Option<Claim>>>;

/// Registry of claims over work items.
///
/// # Claim Semantics
///
/// - **Exclusive:** a live claim is never granted again, not even to its holder.
/// - **Lazy expiry:** a lapsed record is treated as absent by the next call
///   that touches it; there is no background timer.
/// - **Per-item locking:** the table lock is held only to find a slot; each
///   mutation happens under that item's own lock.
pub struct ClaimRegistry {
    slots: RwLock<HashMap<ItemId, Slot>>,
    clock: Arc<dyn Clock>,
}

impl ClaimRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            clock,
        }
    }

    fn slot(&self, item_id: &ItemId) -> Slot {
        if let Some(slot) = self.slots.read().get(item_id) {
            return Arc::clone(slot);
        }
        Arc::clone(self.slots.write().entry(item_id.clone()).or_default())
    }

    fn existing_slot(&self, item_id: &ItemId) -> Option<Slot> {
        self.slots.read().get(item_id).cloned()
    }

    /// Attempt to claim an item.
    ///
    /// Exactly one of any number of concurrent callers for the same item
    /// receives `Claimed`.
    pub fn try_claim(
        &self,
        item_id: &ItemId,
        holder_id: &str,
        lease_duration: Duration,
    ) -> ClaimOutcome {
        let slot = self.slot(item_id);
        let mut current = slot.lock();
        let now = self.clock.now();

        if let Some(claim) = current.as_ref() {
            if claim.is_live(now) {
                return ClaimOutcome::AlreadyClaimed {
                    holder: claim.holder_id.clone(),
                    expires_at: claim.expires_at(),
                };
            }
            tracing::info!(
                item = %item_id,
                previous_holder = %claim.holder_id,
                "lease expired, reclaiming"
            );
        }

        let claim = Claim {
            item_id: item_id.clone(),
            holder_id: holder_id.to_string(),
            acquired_at: now,
            renewed_at: now,
            lease_duration,
        };
        *current = Some(claim.clone());
        tracing::debug!(item = %item_id, holder = holder_id, "claimed");
        ClaimOutcome::Claimed(claim)
    }

    /// Extend a live claim held by `holder_id`.
    pub fn renew(&self, item_id: &ItemId, holder_id: &str) -> RenewOutcome {
        let Some(slot) = self.existing_slot(item_id) else {
            return RenewOutcome::NotHolder;
        };
        let mut current = slot.lock();
        let now = self.clock.now();

        let Some(claim) = current.as_mut() else {
            return RenewOutcome::NotHolder;
        };
        if !claim.is_live(now) {
            *current = None;
            return RenewOutcome::Expired;
        }
        if claim.holder_id != holder_id {
            return RenewOutcome::NotHolder;
        }
        claim.renewed_at = now;
        RenewOutcome::Renewed {
            expires_at: claim.expires_at(),
        }
    }

    /// Release a claim held by `holder_id`.
    pub fn release(&self, item_id: &ItemId, holder_id: &str) -> ReleaseOutcome {
        let Some(slot) = self.existing_slot(item_id) else {
            return ReleaseOutcome::NotHolder;
        };
        let mut current = slot.lock();

        if !current.as_ref().is_some_and(|c| c.holder_id == holder_id) {
            return ReleaseOutcome::NotHolder;
        }
        *current = None;
        tracing::debug!(item = %item_id, holder = holder_id, "released");
        ReleaseOutcome::Released
    }

    /// Whether `holder_id` still holds a live claim on the item.
    pub fn is_still_holder(&self, item_id: &ItemId, holder_id: &str) -> bool {
        let now = self.clock.now();
        let Some(slot) = self.existing_slot(item_id) else {
            return false;
        };
        let current = slot.lock();
        current
            .as_ref()
            .is_some_and(|claim| claim.holder_id == holder_id && claim.is_live(now))
    }

    /// Snapshot of the live claim on an item, if any.
    pub fn claim_of(&self, item_id: &ItemId) -> Option<Claim> {
        let now = self.clock.now();
        let slot = self.existing_slot(item_id)?;
        let current = slot.lock();
        current.as_ref().filter(|c| c.is_live(now)).cloned()
    }

    /// Snapshot of all live claims, ordered by item.
    pub fn active_claims(&self) -> Vec<Claim> {
        let now = self.clock.now();
        let slots: Vec<Slot> = self.slots.read().values().cloned().collect();
        let mut claims: Vec<Claim> = slots
            .iter()
            .filter_map(|slot| {
                let current = slot.lock();
                current.as_ref().filter(|c| c.is_live(now)).cloned()
            })
            .collect();
        claims.sort_by(|a, b| a.item_id.cmp(&b.item_id));
        claims
    }

    /// Number of live claims.
    pub fn len(&self) -> usize {
        self.active_claims().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Force-release claims whose item no longer satisfies the trigger.
    ///
    /// This is the only operation that overrides a live claim, regardless of
    /// holder. Returns the claims that were live when released. Also drops
    /// lapsed records and unused slots.
    pub fn reconcile<I>(&self, observations: I, filter: &CandidateFilter) -> Vec<Claim>
    where
        I: IntoIterator<Item = (ItemId, ExternalState)>,
    {
        let now = self.clock.now();
        let mut released = Vec::new();

        for (item_id, state) in observations {
            if filter.matches(&state) {
                continue;
            }
            let Some(slot) = self.existing_slot(&item_id) else {
                continue;
            };
            let taken = slot.lock().take();
            if let Some(claim) = taken.filter(|c| c.is_live(now)) {
                tracing::info!(
                    item = %item_id,
                    holder = %claim.holder_id,
                    open = state.open,
                    "claim force-released by reconciliation"
                );
                released.push(claim);
            }
        }

        self.prune(now);
        released
    }

    /// Drop slots nobody references whose record is absent or lapsed.
    ///
    /// Callers obtain a slot only under the table lock, so with the write lock
    /// held a strong count of one means no caller holds it.
    fn prune(&self, now: Instant) {
        let mut slots = self.slots.write();
        slots.retain(|_, slot| {
            if Arc::strong_count(slot) > 1 {
                return true;
            }
            let mut current = slot.lock();
            if current.as_ref().is_some_and(|c| c.is_live(now)) {
                return true;
            }
            *current = None;
            false
        });
    }
}
