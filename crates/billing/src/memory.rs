//! In-memory implementations of the engine's ports
//!
//! Used by the unit tests in this crate and, through the `test-support`
//! feature, by the API and worker test suites. They apply the same upsert
//! rules as the Postgres store so the ordering and idempotency behaviour can
//! be exercised without a database.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use larder_shared::SubscriptionTier;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::family::FamilyMembership;
use crate::ledger::{EventLedger, LedgerEntry, LedgerOutcome};
use crate::processor::{
    BillingProcessor, ProcessorCharge, ProcessorRefund, ProcessorSubscription, RefundContext,
};
use crate::profiles::{Profile, ProfileStore};
use crate::refund::{RefundAuditEntry, RefundAuditLog};
use crate::store::{
    decide_upsert, merge_for_write, SubscriptionRecord, SubscriptionStore, UpsertDecision,
    UpsertOutcome,
};

// A panicking test thread must not wedge every other test sharing the port
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn injected(what: &str) -> BillingError {
    BillingError::UpstreamFailure(format!("database: injected {} failure", what))
}

#[derive(Default)]
struct SubscriptionState {
    records: HashMap<Uuid, SubscriptionRecord>,
    writes: usize,
    fail_writes: bool,
}

/// [`SubscriptionStore`] backed by a map
#[derive(Default)]
pub struct InMemorySubscriptionStore {
    state: Mutex<SubscriptionState>,
}

impl InMemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a record without counting it as a write
    pub fn insert(&self, record: SubscriptionRecord) {
        lock(&self.state).records.insert(record.user_id, record);
    }

    pub fn snapshot(&self, user_id: Uuid) -> Option<SubscriptionRecord> {
        lock(&self.state).records.get(&user_id).cloned()
    }

    /// Number of upserts that actually changed a record
    pub fn write_count(&self) -> usize {
        lock(&self.state).writes
    }

    pub fn fail_writes(&self, fail: bool) {
        lock(&self.state).fail_writes = fail;
    }
}

#[async_trait]
impl SubscriptionStore for InMemorySubscriptionStore {
    async fn get(&self, user_id: Uuid) -> BillingResult<Option<SubscriptionRecord>> {
        Ok(self.snapshot(user_id))
    }

    async fn upsert(&self, record: &SubscriptionRecord) -> BillingResult<UpsertOutcome> {
        let mut state = lock(&self.state);
        if state.fail_writes {
            return Err(injected("subscription write"));
        }

        let existing = state.records.get(&record.user_id).cloned();
        match decide_upsert(existing.as_ref(), record) {
            UpsertDecision::Write => {
                let merged = merge_for_write(existing.as_ref(), record);
                state.records.insert(merged.user_id, merged.clone());
                state.writes += 1;
                Ok(UpsertOutcome::Applied(merged))
            }
            UpsertDecision::Unchanged => Ok(UpsertOutcome::Unchanged(
                existing.unwrap_or_else(|| record.clone()),
            )),
            UpsertDecision::Stale => Ok(UpsertOutcome::Stale(
                existing.unwrap_or_else(|| record.clone()),
            )),
        }
    }
}

#[derive(Default)]
struct ProfileState {
    profiles: HashMap<Uuid, Profile>,
    failing: HashSet<Uuid>,
    fail_lookups: bool,
}

/// [`ProfileStore`] backed by a map
#[derive(Default)]
pub struct InMemoryProfileStore {
    state: Mutex<ProfileState>,
}

impl InMemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, profile: Profile) {
        lock(&self.state).profiles.insert(profile.id, profile);
    }

    pub fn profile(&self, user_id: Uuid) -> Option<Profile> {
        lock(&self.state).profiles.get(&user_id).cloned()
    }

    /// Make every write to this profile fail
    pub fn fail_writes_for(&self, user_id: Uuid) {
        lock(&self.state).failing.insert(user_id);
    }

    /// Make customer lookups fail as if storage were down
    pub fn fail_lookups(&self, fail: bool) {
        lock(&self.state).fail_lookups = fail;
    }

    pub fn set_credits_used(&self, user_id: Uuid, credits: i32) {
        if let Some(profile) = lock(&self.state).profiles.get_mut(&user_id) {
            profile.credits_used_this_month = credits;
        }
    }

    fn write<F>(&self, user_id: Uuid, apply: F) -> BillingResult<()>
    where
        F: FnOnce(&mut Profile),
    {
        let mut state = lock(&self.state);
        if state.failing.contains(&user_id) {
            return Err(injected("profile write"));
        }
        let profile = state
            .profiles
            .get_mut(&user_id)
            .ok_or_else(|| BillingError::NotFound(format!("profile {}", user_id)))?;
        apply(profile);
        Ok(())
    }
}

#[async_trait]
impl ProfileStore for InMemoryProfileStore {
    async fn get_profile(&self, user_id: Uuid) -> BillingResult<Option<Profile>> {
        Ok(self.profile(user_id))
    }

    async fn set_subscription_tier(
        &self,
        user_id: Uuid,
        tier: SubscriptionTier,
        credits_reset_at: Option<OffsetDateTime>,
    ) -> BillingResult<()> {
        self.write(user_id, |profile| {
            profile.subscription_tier = tier;
            if let Some(at) = credits_reset_at {
                profile.credits_used_this_month = 0;
                profile.credits_reset_date = Some(at);
            }
        })
    }

    async fn reset_credits(&self, user_id: Uuid, reset_at: OffsetDateTime) -> BillingResult<()> {
        self.write(user_id, |profile| {
            profile.credits_used_this_month = 0;
            profile.credits_reset_date = Some(reset_at);
        })
    }

    async fn find_user_by_customer(&self, customer_id: &str) -> BillingResult<Option<Uuid>> {
        let state = lock(&self.state);
        if state.fail_lookups {
            return Err(injected("customer lookup"));
        }
        Ok(state
            .profiles
            .values()
            .find(|p| p.stripe_customer_id.as_deref() == Some(customer_id))
            .map(|p| p.id))
    }

    async fn stamp_last_refunded(&self, user_id: Uuid, at: OffsetDateTime) -> BillingResult<()> {
        self.write(user_id, |profile| profile.last_refunded_date = Some(at))
    }
}

#[derive(Default)]
struct FamilyState {
    // owner -> members in join order
    members: HashMap<Uuid, Vec<Uuid>>,
    failing: HashSet<Uuid>,
    fail_listing: bool,
}

/// [`FamilyMembership`] that writes member tiers into an [`InMemoryProfileStore`]
pub struct InMemoryFamilyMembership {
    profiles: Arc<InMemoryProfileStore>,
    state: Mutex<FamilyState>,
}

impl InMemoryFamilyMembership {
    pub fn new(profiles: Arc<InMemoryProfileStore>) -> Self {
        Self {
            profiles,
            state: Mutex::new(FamilyState::default()),
        }
    }

    pub fn add_member(&self, owner_id: Uuid, member_id: Uuid) {
        lock(&self.state)
            .members
            .entry(owner_id)
            .or_default()
            .push(member_id);
    }

    pub fn fail_member(&self, member_id: Uuid) {
        lock(&self.state).failing.insert(member_id);
    }

    pub fn fail_listing(&self) {
        lock(&self.state).fail_listing = true;
    }
}

#[async_trait]
impl FamilyMembership for InMemoryFamilyMembership {
    async fn list_members(&self, owner_id: Uuid) -> BillingResult<Vec<Uuid>> {
        let state = lock(&self.state);
        if state.fail_listing {
            return Err(injected("family listing"));
        }
        Ok(state
            .members
            .get(&owner_id)
            .map(|members| members.iter().copied().filter(|m| *m != owner_id).collect())
            .unwrap_or_default())
    }

    async fn set_member_tier(&self, member_id: Uuid, tier: SubscriptionTier) -> BillingResult<()> {
        if lock(&self.state).failing.contains(&member_id) {
            return Err(injected("member tier"));
        }
        self.profiles
            .write(member_id, |profile| profile.subscription_tier = tier)
    }
}

#[derive(Default)]
struct AuditState {
    entries: Vec<RefundAuditEntry>,
    fail_appends: bool,
}

/// Append-only [`RefundAuditLog`] held in a vector
#[derive(Default)]
pub struct InMemoryRefundAuditLog {
    state: Mutex<AuditState>,
}

impl InMemoryRefundAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<RefundAuditEntry> {
        lock(&self.state).entries.clone()
    }

    pub fn fail_appends(&self, fail: bool) {
        lock(&self.state).fail_appends = fail;
    }
}

#[async_trait]
impl RefundAuditLog for InMemoryRefundAuditLog {
    async fn append(&self, entry: &RefundAuditEntry) -> BillingResult<()> {
        let mut state = lock(&self.state);
        if state.fail_appends {
            return Err(injected("audit append"));
        }
        state.entries.push(entry.clone());
        Ok(())
    }
}

#[derive(Default)]
struct LedgerState {
    entries: Vec<LedgerEntry>,
    fail_records: bool,
}

/// [`EventLedger`] that keeps one entry per provider event id
#[derive(Default)]
pub struct InMemoryEventLedger {
    state: Mutex<LedgerState>,
}

impl InMemoryEventLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<LedgerEntry> {
        lock(&self.state).entries.clone()
    }

    pub fn fail_records(&self, fail: bool) {
        lock(&self.state).fail_records = fail;
    }
}

#[async_trait]
impl EventLedger for InMemoryEventLedger {
    async fn record(&self, entry: &LedgerEntry) -> BillingResult<()> {
        let mut state = lock(&self.state);
        if state.fail_records {
            return Err(injected("ledger write"));
        }

        let position = entry.event_id.as_ref().and_then(|id| {
            state
                .entries
                .iter()
                .position(|e| e.provider == entry.provider && e.event_id.as_ref() == Some(id))
        });
        match position {
            Some(index) => {
                let stored = &mut state.entries[index];
                stored.outcome = entry.outcome;
                stored.error_message = entry.error_message.clone();
                stored.user_id = entry.user_id.or(stored.user_id);
            }
            None => state.entries.push(entry.clone()),
        }
        Ok(())
    }

    async fn list_failed(&self, limit: i64) -> BillingResult<Vec<LedgerEntry>> {
        let limit = usize::try_from(limit).unwrap_or(0);
        Ok(lock(&self.state)
            .entries
            .iter()
            .rev()
            .filter(|e| e.outcome == LedgerOutcome::Failed)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
struct ProcessorState {
    subscriptions: HashMap<String, ProcessorSubscription>,
    charges: HashMap<String, ProcessorCharge>,
    refunds: Vec<ProcessorRefund>,
    fail_calls: bool,
}

/// [`BillingProcessor`] with one subscription and one charge per customer
#[derive(Default)]
pub struct InMemoryBillingProcessor {
    state: Mutex<ProcessorState>,
}

impl InMemoryBillingProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_subscription(&self, customer_id: &str, subscription: ProcessorSubscription) {
        lock(&self.state)
            .subscriptions
            .insert(customer_id.to_string(), subscription);
    }

    pub fn set_charge(&self, customer_id: &str, charge: ProcessorCharge) {
        lock(&self.state)
            .charges
            .insert(customer_id.to_string(), charge);
    }

    pub fn refund_count(&self) -> usize {
        lock(&self.state).refunds.len()
    }

    pub fn fail_calls(&self, fail: bool) {
        lock(&self.state).fail_calls = fail;
    }

    fn check(state: &ProcessorState) -> BillingResult<()> {
        if state.fail_calls {
            return Err(BillingError::UpstreamFailure(
                "stripe: injected processor failure".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl BillingProcessor for InMemoryBillingProcessor {
    async fn latest_subscription(
        &self,
        customer_id: &str,
    ) -> BillingResult<Option<ProcessorSubscription>> {
        let state = lock(&self.state);
        Self::check(&state)?;
        Ok(state.subscriptions.get(customer_id).cloned())
    }

    async fn latest_charge(&self, customer_id: &str) -> BillingResult<Option<ProcessorCharge>> {
        let state = lock(&self.state);
        Self::check(&state)?;
        Ok(state.charges.get(customer_id).cloned())
    }

    async fn refund_charge(
        &self,
        charge: &ProcessorCharge,
        _context: RefundContext,
    ) -> BillingResult<ProcessorRefund> {
        let mut state = lock(&self.state);
        Self::check(&state)?;

        let refund = ProcessorRefund {
            id: format!("re_{}", state.refunds.len() + 1),
            amount: charge.amount,
            currency: charge.currency.clone(),
            status: "succeeded".to_string(),
        };
        for stored in state.charges.values_mut() {
            if stored.id == charge.id {
                stored.refunded = true;
            }
        }
        state.refunds.push(refund.clone());
        Ok(refund)
    }
}
