//! Reconciliation: record write, then cascade
//!
//! Every entry point (aggregator webhook, Stripe webhook, native store sync,
//! post-refund downgrade) funnels a [`CanonicalEvent`] through
//! [`ReconciliationService::apply_event`].

use std::sync::Arc;

use larder_shared::{Provider, SubscriptionStatus, SubscriptionTier};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::authenticator::{authorize_user_sync, Caller};
use crate::cascade::{CascadePropagator, CascadeReport};
use crate::classifier::CanonicalEvent;
use crate::error::{BillingError, BillingResult};
use crate::store::{SubscriptionRecord, SubscriptionStore, UpsertOutcome};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Applied {
        record: SubscriptionRecord,
        cascade: CascadeReport,
    },
    Unchanged(SubscriptionRecord),
    Stale(SubscriptionRecord),
}

impl ReconcileOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }

    pub fn record(&self) -> &SubscriptionRecord {
        match self {
            Self::Applied { record, .. } | Self::Unchanged(record) | Self::Stale(record) => record,
        }
    }
}

/// Body of a client-initiated native store sync
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NativeSyncRequest {
    pub provider: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expiration_date: Option<OffsetDateTime>,
    #[serde(default)]
    pub restored: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NativeSyncResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Clone)]
pub struct ReconciliationService {
    store: Arc<dyn SubscriptionStore>,
    cascade: CascadePropagator,
}

impl ReconciliationService {
    pub fn new(store: Arc<dyn SubscriptionStore>, cascade: CascadePropagator) -> Self {
        Self { store, cascade }
    }

    pub fn store(&self) -> &Arc<dyn SubscriptionStore> {
        &self.store
    }

    /// Write the record and, only if it changed, cascade the entitlement
    pub async fn apply_event(
        &self,
        user_id: Uuid,
        event: &CanonicalEvent,
    ) -> BillingResult<ReconcileOutcome> {
        let record = SubscriptionRecord::from_event(user_id, event, OffsetDateTime::now_utc());

        match self.store.upsert(&record).await? {
            UpsertOutcome::Applied(record) => {
                tracing::info!(
                    user_id = %user_id,
                    event_type = %event.event_type,
                    provider = %record.provider,
                    status = %record.status,
                    tier = %record.tier,
                    "Subscription record updated"
                );
                let cascade = self
                    .cascade
                    .propagate(user_id, record.tier, event.is_renewal)
                    .await;
                Ok(ReconcileOutcome::Applied { record, cascade })
            }
            UpsertOutcome::Unchanged(record) => {
                tracing::info!(
                    user_id = %user_id,
                    event_type = %event.event_type,
                    "Duplicate subscription event - record already current"
                );
                Ok(ReconcileOutcome::Unchanged(record))
            }
            UpsertOutcome::Stale(record) => {
                tracing::warn!(
                    user_id = %user_id,
                    event_type = %event.event_type,
                    event_at = ?event.event_at,
                    stored_event_at = ?record.last_event_at,
                    "Ignoring out-of-order subscription event older than stored state"
                );
                Ok(ReconcileOutcome::Stale(record))
            }
        }
    }

    /// Client-initiated sync after a native store purchase or restore
    pub async fn sync_native(
        &self,
        caller: &Caller,
        request: NativeSyncRequest,
    ) -> BillingResult<NativeSyncResponse> {
        let user_id = authorize_user_sync(caller);
        let provider = Provider::parse_native(&request.provider)?;

        let event = CanonicalEvent {
            event_type: if request.restored {
                "NATIVE_RESTORE".to_string()
            } else {
                "NATIVE_SYNC".to_string()
            },
            status: SubscriptionStatus::Active,
            tier: SubscriptionTier::Premium,
            provider,
            expiration: request.expiration_date,
            product_id: None,
            is_renewal: false,
            event_at: Some(OffsetDateTime::now_utc()),
            source_event_id: None,
        };

        self.apply_event(user_id, &event).await.map_err(|e| {
            tracing::error!(user_id = %user_id, error = %e, "Native subscription sync failed");
            match e {
                BillingError::UpstreamFailure(_) => e,
                other => BillingError::UpstreamFailure(other.to_string()),
            }
        })?;

        let message = if request.restored {
            "Subscription restored"
        } else {
            "Subscription synced"
        };

        Ok(NativeSyncResponse {
            success: true,
            message: message.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryFamilyMembership, InMemoryProfileStore, InMemorySubscriptionStore};
    use crate::profiles::Profile;
    use time::macros::datetime;

    struct Fixture {
        store: Arc<InMemorySubscriptionStore>,
        profiles: Arc<InMemoryProfileStore>,
        service: ReconciliationService,
        user: Uuid,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemorySubscriptionStore::new());
        let profiles = Arc::new(InMemoryProfileStore::new());
        let family = Arc::new(InMemoryFamilyMembership::new(profiles.clone()));
        let user = Uuid::new_v4();
        let mut profile = Profile::new(user);
        profile.credits_used_this_month = 25;
        profiles.insert(profile);

        let service = ReconciliationService::new(
            store.clone(),
            CascadePropagator::new(profiles.clone(), family),
        );
        Fixture {
            store,
            profiles,
            service,
            user,
        }
    }

    fn renewal(at: OffsetDateTime) -> CanonicalEvent {
        CanonicalEvent {
            event_type: "RENEWAL".into(),
            status: SubscriptionStatus::Active,
            tier: SubscriptionTier::Premium,
            provider: Provider::Apple,
            expiration: Some(at + time::Duration::days(30)),
            product_id: Some("larder_premium_monthly".into()),
            is_renewal: true,
            event_at: Some(at),
            source_event_id: Some("evt_renew".into()),
        }
    }

    #[tokio::test]
    async fn test_replayed_renewal_resets_credits_once() {
        let f = fixture();
        let event = renewal(datetime!(2025-12-01 0:00 UTC));

        let first = f.service.apply_event(f.user, &event).await.unwrap();
        assert!(first.is_applied());
        assert_eq!(f.profiles.profile(f.user).unwrap().credits_used_this_month, 0);

        // User spends credits, then the provider redelivers the same renewal
        f.profiles.set_credits_used(f.user, 9);
        let replay = f.service.apply_event(f.user, &event).await.unwrap();

        assert!(matches!(replay, ReconcileOutcome::Unchanged(_)));
        assert_eq!(f.profiles.profile(f.user).unwrap().credits_used_this_month, 9);
        assert_eq!(f.store.write_count(), 1);
    }

    #[tokio::test]
    async fn test_stale_event_does_not_cascade() {
        let f = fixture();
        let mut expiration = renewal(datetime!(2025-12-02 0:00 UTC));
        expiration.event_type = "EXPIRATION".into();
        expiration.status = SubscriptionStatus::Expired;
        expiration.tier = SubscriptionTier::Free;
        expiration.expiration = None;
        expiration.is_renewal = false;

        f.service.apply_event(f.user, &expiration).await.unwrap();
        let late = f
            .service
            .apply_event(f.user, &renewal(datetime!(2025-12-01 0:00 UTC)))
            .await
            .unwrap();

        assert!(matches!(late, ReconcileOutcome::Stale(_)));
        let stored = f.store.snapshot(f.user).unwrap();
        assert_eq!(stored.status, SubscriptionStatus::Expired);
        assert_eq!(
            f.profiles.profile(f.user).unwrap().subscription_tier,
            SubscriptionTier::Free
        );
    }

    #[tokio::test]
    async fn test_write_failure_surfaces_as_upstream_failure() {
        let f = fixture();
        f.store.fail_writes(true);

        let err = f
            .service
            .apply_event(f.user, &renewal(datetime!(2025-12-01 0:00 UTC)))
            .await
            .unwrap_err();

        assert!(err.is_upstream());
        // Nothing downstream ran
        assert_eq!(
            f.profiles.profile(f.user).unwrap().subscription_tier,
            SubscriptionTier::Free
        );
    }

    #[tokio::test]
    async fn test_native_sync_grants_premium() {
        let f = fixture();
        let request: NativeSyncRequest = serde_json::from_value(serde_json::json!({
            "provider": "google",
            "expirationDate": "2026-01-15T00:00:00Z",
            "restored": true
        }))
        .unwrap();

        let response = f
            .service
            .sync_native(&Caller::user(f.user), request)
            .await
            .unwrap();

        assert!(response.success);
        assert_eq!(response.message, "Subscription restored");
        let stored = f.store.snapshot(f.user).unwrap();
        assert_eq!(stored.provider, Provider::Google);
        assert_eq!(stored.status, SubscriptionStatus::Active);
        assert_eq!(stored.current_period_end, Some(datetime!(2026-01-15 0:00 UTC)));
        assert_eq!(
            f.profiles.profile(f.user).unwrap().subscription_tier,
            SubscriptionTier::Premium
        );
    }

    #[tokio::test]
    async fn test_native_sync_rejects_unknown_provider() {
        let f = fixture();
        for provider in ["stripe", "amazon", ""] {
            let request = NativeSyncRequest {
                provider: provider.to_string(),
                expiration_date: None,
                restored: false,
            };
            let err = f
                .service
                .sync_native(&Caller::user(f.user), request)
                .await
                .unwrap_err();
            assert!(matches!(err, BillingError::InvalidInput(_)), "{provider}");
        }
        assert!(f.store.snapshot(f.user).is_none());
    }
}
