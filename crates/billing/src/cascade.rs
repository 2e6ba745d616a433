//! Cascade propagation
//!
//! After a record write lands, the owner's entitlement is pushed to the
//! denormalized profile tier, then to every family-plan member, then (on
//! renewal only) to the monthly credit counters. Each step is best effort:
//! failures are logged and reported, never rolled back, and never change the
//! outcome of the record write that triggered them.

use std::sync::Arc;

use larder_shared::SubscriptionTier;
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::family::FamilyMembership;
use crate::profiles::ProfileStore;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CascadeReport {
    pub owner_updated: bool,
    pub owner_credits_reset: bool,
    pub member_listing_failed: bool,
    pub members_synced: Vec<Uuid>,
    pub members_failed: Vec<Uuid>,
    pub members_credits_reset: usize,
}

impl CascadeReport {
    /// Every profile now mirrors the owner's tier
    pub fn is_complete(&self) -> bool {
        self.owner_updated && !self.member_listing_failed && self.members_failed.is_empty()
    }
}

#[derive(Clone)]
pub struct CascadePropagator {
    profiles: Arc<dyn ProfileStore>,
    family: Arc<dyn FamilyMembership>,
}

impl CascadePropagator {
    pub fn new(profiles: Arc<dyn ProfileStore>, family: Arc<dyn FamilyMembership>) -> Self {
        Self { profiles, family }
    }

    pub async fn propagate(
        &self,
        owner_id: Uuid,
        tier: SubscriptionTier,
        is_renewal: bool,
    ) -> CascadeReport {
        let mut report = CascadeReport::default();
        let now = OffsetDateTime::now_utc();
        let credits_reset_at = is_renewal.then_some(now);

        // Owner tier and (on renewal) credit reset in one write
        if let Err(e) = self
            .profiles
            .set_subscription_tier(owner_id, tier, credits_reset_at)
            .await
        {
            tracing::error!(
                user_id = %owner_id,
                tier = %tier,
                error = %e,
                "RECONCILIATION NEEDED: Failed to update owner profile tier; skipping family sync"
            );
            return report;
        }
        report.owner_updated = true;
        report.owner_credits_reset = is_renewal;

        let members = match self.family.list_members(owner_id).await {
            Ok(members) => members,
            Err(e) => {
                tracing::error!(
                    user_id = %owner_id,
                    error = %e,
                    "RECONCILIATION NEEDED: Failed to list family members"
                );
                report.member_listing_failed = true;
                return report;
            }
        };

        for member_id in members {
            match self.family.set_member_tier(member_id, tier).await {
                Ok(()) => report.members_synced.push(member_id),
                Err(e) => {
                    tracing::warn!(
                        owner_id = %owner_id,
                        member_id = %member_id,
                        error = %e,
                        "Failed to sync family member tier"
                    );
                    report.members_failed.push(member_id);
                }
            }
        }

        if is_renewal {
            for member_id in &report.members_synced {
                match self.profiles.reset_credits(*member_id, now).await {
                    Ok(()) => report.members_credits_reset += 1,
                    Err(e) => tracing::warn!(
                        owner_id = %owner_id,
                        member_id = %member_id,
                        error = %e,
                        "Failed to reset family member credits"
                    ),
                }
            }
        }

        tracing::info!(
            user_id = %owner_id,
            tier = %tier,
            renewal = is_renewal,
            members_synced = report.members_synced.len(),
            members_failed = report.members_failed.len(),
            "Entitlement cascade complete"
        );

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryFamilyMembership, InMemoryProfileStore};
    use crate::profiles::Profile;

    struct Fixture {
        profiles: Arc<InMemoryProfileStore>,
        family: Arc<InMemoryFamilyMembership>,
        propagator: CascadePropagator,
        owner: Uuid,
        members: Vec<Uuid>,
    }

    fn fixture(member_count: usize) -> Fixture {
        let profiles = Arc::new(InMemoryProfileStore::new());
        let family = Arc::new(InMemoryFamilyMembership::new(profiles.clone()));

        let owner = Uuid::new_v4();
        let mut owner_profile = Profile::new(owner);
        owner_profile.credits_used_this_month = 40;
        profiles.insert(owner_profile);

        let members: Vec<Uuid> = (0..member_count).map(|_| Uuid::new_v4()).collect();
        for member in &members {
            let mut p = Profile::new(*member);
            p.credits_used_this_month = 12;
            profiles.insert(p);
            family.add_member(owner, *member);
        }

        let propagator = CascadePropagator::new(profiles.clone(), family.clone());
        Fixture {
            profiles,
            family,
            propagator,
            owner,
            members,
        }
    }

    #[tokio::test]
    async fn test_tier_reaches_owner_and_members() {
        let f = fixture(2);

        let report = f
            .propagator
            .propagate(f.owner, SubscriptionTier::Premium, false)
            .await;

        assert!(report.is_complete());
        assert_eq!(report.members_synced.len(), 2);
        for id in std::iter::once(&f.owner).chain(&f.members) {
            assert_eq!(
                f.profiles.profile(*id).unwrap().subscription_tier,
                SubscriptionTier::Premium
            );
        }
        // Not a renewal: counters untouched
        assert_eq!(f.profiles.profile(f.owner).unwrap().credits_used_this_month, 40);
        assert_eq!(report.members_credits_reset, 0);
    }

    #[tokio::test]
    async fn test_renewal_resets_credits_everywhere() {
        let f = fixture(2);

        let report = f
            .propagator
            .propagate(f.owner, SubscriptionTier::Premium, true)
            .await;

        assert!(report.owner_credits_reset);
        assert_eq!(report.members_credits_reset, 2);
        for id in std::iter::once(&f.owner).chain(&f.members) {
            let p = f.profiles.profile(*id).unwrap();
            assert_eq!(p.credits_used_this_month, 0);
            assert!(p.credits_reset_date.is_some());
        }
    }

    #[tokio::test]
    async fn test_member_failure_is_isolated() {
        let f = fixture(3);
        f.family.fail_member(f.members[1]);

        let report = f
            .propagator
            .propagate(f.owner, SubscriptionTier::Pro, false)
            .await;

        assert!(report.owner_updated);
        assert!(!report.is_complete());
        assert_eq!(report.members_failed, vec![f.members[1]]);
        assert_eq!(report.members_synced, vec![f.members[0], f.members[2]]);
        assert_eq!(
            f.profiles.profile(f.members[2]).unwrap().subscription_tier,
            SubscriptionTier::Pro
        );
        assert_eq!(
            f.profiles.profile(f.members[1]).unwrap().subscription_tier,
            SubscriptionTier::Free
        );
    }

    #[tokio::test]
    async fn test_owner_failure_skips_members() {
        let f = fixture(2);
        f.profiles.fail_writes_for(f.owner);

        let report = f
            .propagator
            .propagate(f.owner, SubscriptionTier::Premium, true)
            .await;

        assert!(!report.owner_updated);
        assert!(report.members_synced.is_empty());
        assert_eq!(
            f.profiles.profile(f.members[0]).unwrap().subscription_tier,
            SubscriptionTier::Free
        );
    }

    #[tokio::test]
    async fn test_member_listing_failure_is_reported() {
        let f = fixture(1);
        f.family.fail_listing();

        let report = f
            .propagator
            .propagate(f.owner, SubscriptionTier::Premium, false)
            .await;

        assert!(report.owner_updated);
        assert!(report.member_listing_failed);
        assert!(!report.is_complete());
    }
}
