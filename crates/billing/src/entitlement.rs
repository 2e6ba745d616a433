//! Entitlement query
//!
//! Answers "what is this user entitled to right now". The view is derived
//! from the subscription record alone; users who predate subscription records
//! fall back to the Stripe fields on their profile, and users with neither
//! get the free default.

use std::sync::Arc;

use larder_shared::{Provider, SubscriptionStatus, SubscriptionTier};
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::authenticator::{authorize_self_or_admin, Caller};
use crate::error::BillingResult;
use crate::profiles::{LegacyStripeSubscription, Profile, ProfileStore};
use crate::store::{SubscriptionRecord, SubscriptionStore};

/// Subscription status as reported to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntitlementStatus {
    Active,
    Trialing,
    Cancelled,
    Expired,
    BillingIssue,
    /// No subscription on record
    Inactive,
}

impl From<SubscriptionStatus> for EntitlementStatus {
    fn from(status: SubscriptionStatus) -> Self {
        match status {
            SubscriptionStatus::Active => Self::Active,
            SubscriptionStatus::Trialing => Self::Trialing,
            SubscriptionStatus::Cancelled => Self::Cancelled,
            SubscriptionStatus::Expired => Self::Expired,
            SubscriptionStatus::BillingIssue => Self::BillingIssue,
        }
    }
}

impl EntitlementStatus {
    /// Only active and trialing subscriptions count as holding one
    pub fn has_subscription(&self) -> bool {
        matches!(self, Self::Active | Self::Trialing)
    }
}

impl std::fmt::Display for EntitlementStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Trialing => write!(f, "trialing"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Expired => write!(f, "expired"),
            Self::BillingIssue => write!(f, "billing_issue"),
            Self::Inactive => write!(f, "inactive"),
        }
    }
}

/// Where an entitlement view was derived from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntitlementSource {
    Subscription,
    LegacyProfile,
    Default,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitlementView {
    pub user_id: Uuid,
    pub tier: SubscriptionTier,
    pub status: EntitlementStatus,
    pub provider: Option<Provider>,
    pub product_id: Option<String>,
    pub has_subscription: bool,
    pub is_premium: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_end: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub cancelled_at: Option<OffsetDateTime>,
    pub source: EntitlementSource,
}

impl EntitlementView {
    pub fn from_record(record: &SubscriptionRecord) -> Self {
        let status = EntitlementStatus::from(record.status);
        Self {
            user_id: record.user_id,
            tier: record.tier,
            status,
            provider: Some(record.provider.clone()),
            product_id: record.product_id.clone(),
            has_subscription: status.has_subscription(),
            is_premium: record.tier.is_premium(),
            current_period_end: record.current_period_end,
            cancelled_at: record.cancelled_at,
            source: EntitlementSource::Subscription,
        }
    }

    /// Treat the profile's Stripe fields as an implicit Stripe record
    pub fn from_legacy(profile: &Profile, legacy: &LegacyStripeSubscription) -> Self {
        let status = match legacy.status.parse::<SubscriptionStatus>() {
            Ok(status) => EntitlementStatus::from(status),
            Err(_) if matches!(legacy.status.as_str(), "past_due" | "unpaid") => {
                EntitlementStatus::BillingIssue
            }
            Err(_) => EntitlementStatus::Inactive,
        };

        Self {
            user_id: profile.id,
            tier: profile.subscription_tier,
            status,
            provider: Some(Provider::Stripe),
            product_id: None,
            has_subscription: status.has_subscription(),
            is_premium: profile.subscription_tier.is_premium(),
            current_period_end: legacy.current_period_end,
            cancelled_at: None,
            source: EntitlementSource::LegacyProfile,
        }
    }

    pub fn free(user_id: Uuid) -> Self {
        Self {
            user_id,
            tier: SubscriptionTier::Free,
            status: EntitlementStatus::Inactive,
            provider: None,
            product_id: None,
            has_subscription: false,
            is_premium: false,
            current_period_end: None,
            cancelled_at: None,
            source: EntitlementSource::Default,
        }
    }
}

#[derive(Clone)]
pub struct EntitlementService {
    store: Arc<dyn SubscriptionStore>,
    profiles: Arc<dyn ProfileStore>,
}

impl EntitlementService {
    pub fn new(store: Arc<dyn SubscriptionStore>, profiles: Arc<dyn ProfileStore>) -> Self {
        Self { store, profiles }
    }

    pub async fn get_status(&self, caller: &Caller, target: Uuid) -> BillingResult<EntitlementView> {
        authorize_self_or_admin(caller, target)?;

        if let Some(record) = self.store.get(target).await? {
            return Ok(EntitlementView::from_record(&record));
        }

        let view = match self.profiles.get_profile(target).await? {
            Some(profile) => match &profile.legacy_subscription {
                Some(legacy) => EntitlementView::from_legacy(&profile, legacy),
                None => EntitlementView::free(target),
            },
            None => EntitlementView::free(target),
        };

        tracing::debug!(
            user_id = %target,
            source = ?view.source,
            "No subscription record, served fallback entitlement"
        );
        Ok(view)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BillingError;
    use crate::memory::{InMemoryProfileStore, InMemorySubscriptionStore};
    use time::macros::datetime;

    fn record(user_id: Uuid, status: SubscriptionStatus, tier: SubscriptionTier) -> SubscriptionRecord {
        SubscriptionRecord {
            user_id,
            provider: Provider::Apple,
            status,
            tier,
            product_id: Some("larder_premium_monthly".into()),
            current_period_end: Some(datetime!(2026-01-01 0:00 UTC)),
            cancelled_at: None,
            last_event_at: None,
            updated_at: datetime!(2025-12-01 0:00 UTC),
        }
    }

    fn service() -> (
        EntitlementService,
        Arc<InMemorySubscriptionStore>,
        Arc<InMemoryProfileStore>,
    ) {
        let store = Arc::new(InMemorySubscriptionStore::new());
        let profiles = Arc::new(InMemoryProfileStore::new());
        (
            EntitlementService::new(store.clone(), profiles.clone()),
            store,
            profiles,
        )
    }

    #[test]
    fn test_view_flags_follow_status_and_tier() {
        let user = Uuid::new_v4();
        let cases = [
            (SubscriptionStatus::Active, SubscriptionTier::Premium, true, true),
            (SubscriptionStatus::Trialing, SubscriptionTier::Pro, true, true),
            (SubscriptionStatus::Cancelled, SubscriptionTier::Premium, false, true),
            (SubscriptionStatus::BillingIssue, SubscriptionTier::Premium, false, true),
            (SubscriptionStatus::Expired, SubscriptionTier::Free, false, false),
        ];

        for (status, tier, has_subscription, is_premium) in cases {
            let view = EntitlementView::from_record(&record(user, status, tier));
            assert_eq!(view.has_subscription, has_subscription, "{status}");
            assert_eq!(view.is_premium, is_premium, "{status}");
            assert_eq!(view.source, EntitlementSource::Subscription);
        }
    }

    #[test]
    fn test_view_serializes_camel_case() {
        let view = EntitlementView::from_record(&record(
            Uuid::nil(),
            SubscriptionStatus::BillingIssue,
            SubscriptionTier::Premium,
        ));
        let json = serde_json::to_value(&view).unwrap();

        assert_eq!(json["status"], "billing_issue");
        assert_eq!(json["tier"], "premium");
        assert_eq!(json["provider"], "apple");
        assert_eq!(json["hasSubscription"], false);
        assert_eq!(json["isPremium"], true);
        assert_eq!(json["currentPeriodEnd"], "2026-01-01T00:00:00Z");
    }

    #[tokio::test]
    async fn test_other_users_status_requires_admin() {
        let (service, store, _) = service();
        let owner = Uuid::new_v4();
        store.insert(record(owner, SubscriptionStatus::Active, SubscriptionTier::Premium));

        let stranger = Caller::user(Uuid::new_v4());
        assert!(matches!(
            service.get_status(&stranger, owner).await,
            Err(BillingError::Forbidden(_))
        ));

        let admin = Caller::admin(Uuid::new_v4());
        let view = service.get_status(&admin, owner).await.unwrap();
        assert!(view.has_subscription);

        let own = service.get_status(&Caller::user(owner), owner).await.unwrap();
        assert_eq!(own, view);
    }

    #[tokio::test]
    async fn test_falls_back_to_legacy_profile_fields() {
        let (service, _, profiles) = service();
        let user = Uuid::new_v4();
        let mut profile = Profile::new(user);
        profile.subscription_tier = SubscriptionTier::Premium;
        profile.legacy_subscription = Some(LegacyStripeSubscription {
            status: "active".into(),
            current_period_end: Some(datetime!(2026-02-01 0:00 UTC)),
        });
        profiles.insert(profile);

        let view = service.get_status(&Caller::user(user), user).await.unwrap();
        assert_eq!(view.source, EntitlementSource::LegacyProfile);
        assert_eq!(view.provider, Some(Provider::Stripe));
        assert!(view.has_subscription);
        assert!(view.is_premium);
    }

    #[tokio::test]
    async fn test_legacy_past_due_is_billing_issue() {
        let (service, _, profiles) = service();
        let user = Uuid::new_v4();
        let mut profile = Profile::new(user);
        profile.legacy_subscription = Some(LegacyStripeSubscription {
            status: "past_due".into(),
            current_period_end: None,
        });
        profiles.insert(profile);

        let view = service.get_status(&Caller::user(user), user).await.unwrap();
        assert_eq!(view.status, EntitlementStatus::BillingIssue);
        assert!(!view.has_subscription);
    }

    #[tokio::test]
    async fn test_defaults_to_free_inactive() {
        let (service, _, profiles) = service();

        let without_profile = Uuid::new_v4();
        let view = service
            .get_status(&Caller::user(without_profile), without_profile)
            .await
            .unwrap();
        assert_eq!(view, EntitlementView::free(without_profile));

        let with_profile = Uuid::new_v4();
        profiles.insert(Profile::new(with_profile));
        let view = service
            .get_status(&Caller::user(with_profile), with_profile)
            .await
            .unwrap();
        assert_eq!(view.status, EntitlementStatus::Inactive);
        assert_eq!(view.tier, SubscriptionTier::Free);
        assert_eq!(view.source, EntitlementSource::Default);
    }
}
