//! Aggregator event classification
//!
//! Maps a RevenueCat webhook event onto the canonical
//! `(status, tier, provider, expiration, is_renewal)` tuple the store writes.
//! Classification is pure: it never reads the profile or the stored record.

use larder_shared::{Provider, SubscriptionStatus, SubscriptionTier};
use serde::Deserialize;
use time::OffsetDateTime;
use uuid::Uuid;

/// Webhook body sent by the subscription aggregator
#[derive(Debug, Clone, Deserialize)]
pub struct AggregatorWebhook {
    pub event: AggregatorEvent,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AggregatorEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub id: Option<String>,
    pub app_user_id: Option<String>,
    pub product_id: Option<String>,
    /// Epoch milliseconds
    pub expiration_at_ms: Option<i64>,
    /// Epoch milliseconds
    pub event_timestamp_ms: Option<i64>,
    pub store: Option<String>,
}

/// Provider-independent subscription transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalEvent {
    pub event_type: String,
    pub status: SubscriptionStatus,
    pub tier: SubscriptionTier,
    pub provider: Provider,
    pub expiration: Option<OffsetDateTime>,
    pub product_id: Option<String>,
    pub is_renewal: bool,
    /// When the provider says the event happened
    pub event_at: Option<OffsetDateTime>,
    pub source_event_id: Option<String>,
}

/// Why an event was acknowledged without touching any state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoOpReason {
    UnhandledEventType,
    UnhandledStatus(String),
    MissingUserId,
    InvalidUserId(String),
    UnknownCustomer(String),
}

impl std::fmt::Display for NoOpReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnhandledEventType => write!(f, "unhandled event type"),
            Self::UnhandledStatus(s) => write!(f, "unhandled subscription status: {}", s),
            Self::MissingUserId => write!(f, "missing user id"),
            Self::InvalidUserId(id) => write!(f, "user id is not a valid account id: {}", id),
            Self::UnknownCustomer(c) => write!(f, "no profile for customer {}", c),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Actionable { user_id: Uuid, event: CanonicalEvent },
    NotActionable { event_type: String, reason: NoOpReason },
}

/// Status, tier and renewal flag for each handled aggregator event type
fn aggregator_transition(
    event_type: &str,
) -> Option<(SubscriptionStatus, SubscriptionTier, bool)> {
    use SubscriptionStatus::*;
    use SubscriptionTier::*;

    match event_type {
        "INITIAL_PURCHASE" | "UNCANCELLATION" | "PRODUCT_CHANGE" => Some((Active, Premium, false)),
        "RENEWAL" => Some((Active, Premium, true)),
        "CANCELLATION" => Some((Cancelled, Premium, false)),
        "EXPIRATION" => Some((Expired, Free, false)),
        "BILLING_ISSUE" => Some((BillingIssue, Premium, false)),
        _ => None,
    }
}

/// `APP_STORE` and `PLAY_STORE` map to the native providers; anything else
/// is kept verbatim.
pub fn provider_for_store(store: Option<&str>) -> Provider {
    match store {
        Some("APP_STORE") => Provider::Apple,
        Some("PLAY_STORE") => Provider::Google,
        Some(other) => Provider::other(other),
        None => Provider::other("unknown"),
    }
}

pub(crate) fn from_epoch_millis(ms: i64) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000).ok()
}

pub fn classify_aggregator_event(event: &AggregatorEvent) -> Classification {
    let not_actionable = |reason| Classification::NotActionable {
        event_type: event.event_type.clone(),
        reason,
    };

    let Some((status, tier, is_renewal)) = aggregator_transition(&event.event_type) else {
        return not_actionable(NoOpReason::UnhandledEventType);
    };

    let raw_user = match event.app_user_id.as_deref().map(str::trim) {
        Some(id) if !id.is_empty() => id,
        _ => return not_actionable(NoOpReason::MissingUserId),
    };

    // Anonymous aggregator ids ($RCAnonymousID:...) are not accounts
    let Ok(user_id) = Uuid::parse_str(raw_user) else {
        return not_actionable(NoOpReason::InvalidUserId(raw_user.to_string()));
    };

    // Expiration clears the period end regardless of what the payload carries
    let expiration = if status == SubscriptionStatus::Expired {
        None
    } else {
        event.expiration_at_ms.and_then(from_epoch_millis)
    };

    Classification::Actionable {
        user_id,
        event: CanonicalEvent {
            event_type: event.event_type.clone(),
            status,
            tier,
            provider: provider_for_store(event.store.as_deref()),
            expiration,
            product_id: event.product_id.clone(),
            is_renewal,
            event_at: event.event_timestamp_ms.and_then(from_epoch_millis),
            source_event_id: event.id.clone(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(event_type: &str) -> AggregatorEvent {
        AggregatorEvent {
            event_type: event_type.to_string(),
            id: Some("evt_1".into()),
            app_user_id: Some(Uuid::new_v4().to_string()),
            product_id: Some("larder_premium_monthly".into()),
            expiration_at_ms: Some(1_767_225_600_000),
            event_timestamp_ms: Some(1_764_547_200_000),
            store: Some("APP_STORE".into()),
        }
    }

    fn actionable(c: Classification) -> CanonicalEvent {
        match c {
            Classification::Actionable { event, .. } => event,
            other => panic!("expected actionable, got {other:?}"),
        }
    }

    #[test]
    fn test_every_handled_type_maps_to_its_tuple() {
        use SubscriptionStatus::*;
        use SubscriptionTier::*;

        let table = [
            ("INITIAL_PURCHASE", Active, Premium, false),
            ("UNCANCELLATION", Active, Premium, false),
            ("RENEWAL", Active, Premium, true),
            ("CANCELLATION", Cancelled, Premium, false),
            ("EXPIRATION", Expired, Free, false),
            ("BILLING_ISSUE", BillingIssue, Premium, false),
            ("PRODUCT_CHANGE", Active, Premium, false),
        ];

        for (event_type, status, tier, renewal) in table {
            let canonical = actionable(classify_aggregator_event(&event(event_type)));
            assert_eq!(canonical.status, status, "{event_type}");
            assert_eq!(canonical.tier, tier, "{event_type}");
            assert_eq!(canonical.is_renewal, renewal, "{event_type}");
        }
    }

    #[test]
    fn test_unhandled_types_are_no_ops() {
        for event_type in ["TRANSFER", "SUBSCRIPTION_PAUSED", "TEST", ""] {
            assert_eq!(
                classify_aggregator_event(&event(event_type)),
                Classification::NotActionable {
                    event_type: event_type.to_string(),
                    reason: NoOpReason::UnhandledEventType,
                }
            );
        }
    }

    #[test]
    fn test_missing_or_anonymous_user_is_a_no_op() {
        let mut missing = event("INITIAL_PURCHASE");
        missing.app_user_id = None;
        assert!(matches!(
            classify_aggregator_event(&missing),
            Classification::NotActionable {
                reason: NoOpReason::MissingUserId,
                ..
            }
        ));

        let mut blank = event("INITIAL_PURCHASE");
        blank.app_user_id = Some("  ".into());
        assert!(matches!(
            classify_aggregator_event(&blank),
            Classification::NotActionable {
                reason: NoOpReason::MissingUserId,
                ..
            }
        ));

        let mut anonymous = event("RENEWAL");
        anonymous.app_user_id = Some("$RCAnonymousID:8f2a".into());
        assert!(matches!(
            classify_aggregator_event(&anonymous),
            Classification::NotActionable {
                reason: NoOpReason::InvalidUserId(_),
                ..
            }
        ));
    }

    #[test]
    fn test_store_mapping() {
        assert_eq!(provider_for_store(Some("APP_STORE")), Provider::Apple);
        assert_eq!(provider_for_store(Some("PLAY_STORE")), Provider::Google);
        assert_eq!(
            provider_for_store(Some("AMAZON")),
            Provider::Other("AMAZON".into())
        );
        assert_eq!(provider_for_store(None), Provider::Other("unknown".into()));
        assert_eq!(provider_for_store(Some("stripe")), Provider::Stripe);
    }

    #[test]
    fn test_expiration_clears_period_end() {
        let canonical = actionable(classify_aggregator_event(&event("EXPIRATION")));
        assert_eq!(canonical.expiration, None);

        let canonical = actionable(classify_aggregator_event(&event("RENEWAL")));
        assert_eq!(
            canonical.expiration.map(|t| t.unix_timestamp()),
            Some(1_767_225_600)
        );
        assert_eq!(
            canonical.event_at.map(|t| t.unix_timestamp()),
            Some(1_764_547_200)
        );
    }

    #[test]
    fn test_parses_aggregator_payload() {
        let user_id = Uuid::new_v4();
        let body = serde_json::json!({
            "api_version": "1.0",
            "event": {
                "type": "INITIAL_PURCHASE",
                "id": "A1B2",
                "app_user_id": user_id.to_string(),
                "product_id": "larder_premium_annual",
                "expiration_at_ms": null,
                "store": "PLAY_STORE",
                "environment": "PRODUCTION"
            }
        });

        let webhook: AggregatorWebhook = serde_json::from_value(body).unwrap();
        match classify_aggregator_event(&webhook.event) {
            Classification::Actionable { user_id: id, event } => {
                assert_eq!(id, user_id);
                assert_eq!(event.provider, Provider::Google);
                assert_eq!(event.expiration, None);
                assert_eq!(event.event_at, None);
                assert_eq!(event.source_event_id.as_deref(), Some("A1B2"));
            }
            other => panic!("expected actionable, got {other:?}"),
        }
    }
}
