//! Stripe web-checkout events
//!
//! Signature verification is done by hand (HMAC-SHA256 over `"{t}.{payload}"`)
//! and the event body is read as loose JSON, so new Stripe API versions that
//! move or add fields don't break parsing.

use hmac::{Hmac, Mac};
use larder_shared::{Provider, SubscriptionStatus, SubscriptionTier};
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::authenticator::constant_time_eq;
use crate::classifier::{CanonicalEvent, NoOpReason};
use crate::error::{BillingError, BillingResult};

type HmacSha256 = Hmac<Sha256>;

/// Signed payloads older (or newer) than this are rejected
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

#[derive(Debug, Clone, Deserialize)]
pub struct StripeEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub created: i64,
    pub data: StripeEventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeEventData {
    pub object: Value,
}

/// Verifies the `Stripe-Signature` header. Locked when no secret is configured.
#[derive(Clone)]
pub struct StripeSignatureVerifier {
    secret: Option<String>,
}

impl StripeSignatureVerifier {
    pub fn new(secret: Option<String>) -> Self {
        let secret = secret.filter(|s| !s.trim().is_empty());
        if secret.is_none() {
            tracing::warn!("STRIPE_WEBHOOK_SECRET not configured - Stripe webhooks will be rejected");
        }
        Self { secret }
    }

    pub fn is_configured(&self) -> bool {
        self.secret.is_some()
    }

    pub fn verify(&self, payload: &str, signature: Option<&str>) -> BillingResult<StripeEvent> {
        self.verify_at(payload, signature, OffsetDateTime::now_utc().unix_timestamp())
    }

    pub fn verify_at(
        &self,
        payload: &str,
        signature: Option<&str>,
        now: i64,
    ) -> BillingResult<StripeEvent> {
        let Some(secret) = &self.secret else {
            tracing::error!("Rejecting Stripe webhook: secret not configured");
            return Err(BillingError::NotConfigured(
                "Stripe webhook secret is not configured".to_string(),
            ));
        };
        let signature = signature.ok_or(BillingError::WebhookSignatureInvalid)?;

        // Header format: t=timestamp,v1=signature[,v1=signature...]
        let mut timestamp: Option<i64> = None;
        let mut v1_signatures: Vec<&str> = Vec::new();
        for part in signature.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = value.parse().ok(),
                Some(("v1", value)) => v1_signatures.push(value),
                _ => {}
            }
        }

        let timestamp = timestamp.ok_or_else(|| {
            tracing::warn!("Missing timestamp in Stripe signature header");
            BillingError::WebhookSignatureInvalid
        })?;
        if v1_signatures.is_empty() {
            tracing::warn!("Missing v1 signature in Stripe signature header");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        if now.abs_diff(timestamp) > SIGNATURE_TOLERANCE_SECS.unsigned_abs() {
            tracing::warn!(
                timestamp = timestamp,
                now = now,
                "Stripe webhook timestamp outside tolerance"
            );
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let expected = compute_signature(secret, timestamp, payload)?;
        if !v1_signatures
            .iter()
            .any(|candidate| constant_time_eq(candidate.as_bytes(), expected.as_bytes()))
        {
            tracing::warn!("Stripe webhook signature mismatch");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        serde_json::from_str(payload).map_err(|e| {
            tracing::warn!(parse_error = %e, "Failed to parse Stripe event JSON");
            BillingError::InvalidInput(format!("malformed Stripe event: {}", e))
        })
    }
}

/// Hex HMAC-SHA256 of `"{timestamp}.{payload}"`
pub fn compute_signature(secret: &str, timestamp: i64, payload: &str) -> BillingResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::Config("invalid Stripe webhook secret".to_string()))?;
    mac.update(format!("{}.{}", timestamp, payload).as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// How to find the account a Stripe object belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StripeUserRef {
    pub user_id: Option<Uuid>,
    pub customer_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StripeClassification {
    Transition {
        user: StripeUserRef,
        event: CanonicalEvent,
    },
    Ignored {
        event_type: String,
        reason: NoOpReason,
    },
}

fn str_at<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
    value.pointer(pointer).and_then(Value::as_str)
}

fn timestamp_at(value: &Value, pointer: &str) -> Option<OffsetDateTime> {
    value
        .pointer(pointer)
        .and_then(Value::as_i64)
        .and_then(|secs| OffsetDateTime::from_unix_timestamp(secs).ok())
}

/// Customer may arrive as an id or as an expanded object
fn customer_of(object: &Value) -> Option<String> {
    str_at(object, "/customer")
        .or_else(|| str_at(object, "/customer/id"))
        .map(String::from)
}

fn tier_from_metadata(raw: Option<&str>) -> SubscriptionTier {
    match raw.map(str::parse::<SubscriptionTier>) {
        Some(Ok(tier)) if tier.is_premium() => tier,
        _ => SubscriptionTier::Premium,
    }
}

fn user_ref(object: &Value, metadata_pointers: &[&str]) -> StripeUserRef {
    let user_id = metadata_pointers
        .iter()
        .find_map(|p| str_at(object, p))
        .and_then(|id| Uuid::parse_str(id).ok());
    StripeUserRef {
        user_id,
        customer_id: customer_of(object),
    }
}

pub fn classify_stripe_event(event: &StripeEvent) -> StripeClassification {
    let object = &event.data.object;
    let ignored = |reason| StripeClassification::Ignored {
        event_type: event.event_type.clone(),
        reason,
    };

    let canonical = |status, tier, expiration, product_id: Option<&str>, is_renewal| {
        CanonicalEvent {
            event_type: event.event_type.clone(),
            status,
            tier,
            provider: Provider::Stripe,
            expiration,
            product_id: product_id.map(String::from),
            is_renewal,
            event_at: OffsetDateTime::from_unix_timestamp(event.created).ok(),
            source_event_id: Some(event.id.clone()),
        }
    };

    match event.event_type.as_str() {
        "customer.subscription.created" | "customer.subscription.updated" => {
            let status = str_at(object, "/status").unwrap_or_default();
            let pending_cancel = object
                .pointer("/cancel_at_period_end")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let tier = tier_from_metadata(str_at(object, "/metadata/tier"));
            // Newer API versions moved the period end onto the subscription item
            let period_end = timestamp_at(object, "/current_period_end")
                .or_else(|| timestamp_at(object, "/items/data/0/current_period_end"));
            let product = str_at(object, "/items/data/0/price/product");

            let (status, tier, period_end) = match status {
                "active" | "trialing" if pending_cancel => {
                    (SubscriptionStatus::Cancelled, tier, period_end)
                }
                "active" => (SubscriptionStatus::Active, tier, period_end),
                "trialing" => (SubscriptionStatus::Trialing, tier, period_end),
                "past_due" | "unpaid" => (SubscriptionStatus::BillingIssue, tier, period_end),
                "canceled" | "incomplete_expired" => {
                    (SubscriptionStatus::Expired, SubscriptionTier::Free, None)
                }
                other => return ignored(NoOpReason::UnhandledStatus(other.to_string())),
            };

            StripeClassification::Transition {
                user: user_ref(object, &["/metadata/user_id"]),
                event: canonical(status, tier, period_end, product, false),
            }
        }
        "customer.subscription.deleted" => StripeClassification::Transition {
            user: user_ref(object, &["/metadata/user_id"]),
            event: canonical(
                SubscriptionStatus::Expired,
                SubscriptionTier::Free,
                None,
                str_at(object, "/items/data/0/price/product"),
                false,
            ),
        },
        "invoice.paid" | "invoice.payment_failed" => {
            let is_paid = event.event_type == "invoice.paid";
            if is_paid && str_at(object, "/billing_reason") != Some("subscription_cycle") {
                // First invoices are covered by customer.subscription.created
                return ignored(NoOpReason::UnhandledEventType);
            }

            let tier = tier_from_metadata(
                str_at(object, "/subscription_details/metadata/tier")
                    .or_else(|| str_at(object, "/lines/data/0/metadata/tier")),
            );
            let status = if is_paid {
                SubscriptionStatus::Active
            } else {
                SubscriptionStatus::BillingIssue
            };

            StripeClassification::Transition {
                user: user_ref(
                    object,
                    &[
                        "/subscription_details/metadata/user_id",
                        "/lines/data/0/metadata/user_id",
                    ],
                ),
                event: canonical(
                    status,
                    tier,
                    timestamp_at(object, "/lines/data/0/period/end"),
                    str_at(object, "/lines/data/0/price/product"),
                    is_paid,
                ),
            }
        }
        _ => ignored(NoOpReason::UnhandledEventType),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SECRET: &str = "whsec_test_secret";
    const NOW: i64 = 1_764_547_200;

    fn signed_header(payload: &str, timestamp: i64) -> String {
        format!(
            "t={},v1={}",
            timestamp,
            compute_signature(SECRET, timestamp, payload).unwrap()
        )
    }

    fn stripe_event(event_type: &str, object: Value) -> StripeEvent {
        serde_json::from_value(json!({
            "id": "evt_123",
            "type": event_type,
            "created": NOW,
            "data": { "object": object }
        }))
        .unwrap()
    }

    fn transition(c: StripeClassification) -> (StripeUserRef, CanonicalEvent) {
        match c {
            StripeClassification::Transition { user, event } => (user, event),
            other => panic!("expected transition, got {other:?}"),
        }
    }

    #[test]
    fn test_valid_signature_parses_event() {
        let payload = r#"{"id":"evt_1","type":"invoice.paid","created":1764547200,"data":{"object":{}}}"#;
        let verifier = StripeSignatureVerifier::new(Some(SECRET.into()));
        let header = signed_header(payload, NOW);

        let event = verifier.verify_at(payload, Some(&header), NOW + 10).unwrap();
        assert_eq!(event.id, "evt_1");
        assert_eq!(event.event_type, "invoice.paid");
    }

    #[test]
    fn test_rotated_secret_signature_is_accepted() {
        let payload = r#"{"id":"evt_1","type":"x","created":1,"data":{"object":{}}}"#;
        let verifier = StripeSignatureVerifier::new(Some(SECRET.into()));
        let good = compute_signature(SECRET, NOW, payload).unwrap();
        let header = format!("t={},v1={},v1={}", NOW, "00".repeat(32), good);

        assert!(verifier.verify_at(payload, Some(&header), NOW).is_ok());
    }

    #[test]
    fn test_tampered_payload_is_rejected() {
        let payload = r#"{"id":"evt_1","type":"invoice.paid","created":1,"data":{"object":{}}}"#;
        let verifier = StripeSignatureVerifier::new(Some(SECRET.into()));
        let header = signed_header(payload, NOW);
        let tampered = payload.replace("invoice.paid", "invoice.payment_failed");

        assert!(matches!(
            verifier.verify_at(&tampered, Some(&header), NOW),
            Err(BillingError::WebhookSignatureInvalid)
        ));
    }

    #[test]
    fn test_stale_timestamp_is_rejected() {
        let payload = r#"{"id":"evt_1","type":"x","created":1,"data":{"object":{}}}"#;
        let verifier = StripeSignatureVerifier::new(Some(SECRET.into()));
        let header = signed_header(payload, NOW - SIGNATURE_TOLERANCE_SECS - 1);

        assert!(matches!(
            verifier.verify_at(payload, Some(&header), NOW),
            Err(BillingError::WebhookSignatureInvalid)
        ));
    }

    #[test]
    fn test_extreme_timestamps_are_rejected_without_overflow() {
        let verifier = StripeSignatureVerifier::new(Some(SECRET.into()));
        for header in [
            format!("t={},v1=00", i64::MIN),
            format!("t={},v1=00", i64::MAX),
        ] {
            assert!(matches!(
                verifier.verify_at("{}", Some(&header), NOW),
                Err(BillingError::WebhookSignatureInvalid)
            ));
        }
        assert!(matches!(
            verifier.verify_at("{}", Some("t=0,v1=00"), i64::MAX),
            Err(BillingError::WebhookSignatureInvalid)
        ));
    }

    #[test]
    fn test_missing_header_parts_are_rejected() {
        let verifier = StripeSignatureVerifier::new(Some(SECRET.into()));
        for header in [None, Some("v1=abc"), Some("t=1764547200"), Some("garbage")] {
            assert!(matches!(
                verifier.verify_at("{}", header, NOW),
                Err(BillingError::WebhookSignatureInvalid)
            ));
        }
    }

    #[test]
    fn test_unconfigured_verifier_is_locked() {
        let payload = r#"{"id":"evt_1","type":"x","created":1,"data":{"object":{}}}"#;
        let header = signed_header(payload, NOW);
        let verifier = StripeSignatureVerifier::new(None);

        assert!(!verifier.is_configured());
        assert!(matches!(
            verifier.verify_at(payload, Some(&header), NOW),
            Err(BillingError::NotConfigured(_))
        ));
    }

    #[test]
    fn test_subscription_status_mapping() {
        let user_id = Uuid::new_v4();
        let cases = [
            ("active", false, SubscriptionStatus::Active, SubscriptionTier::Pro),
            ("active", true, SubscriptionStatus::Cancelled, SubscriptionTier::Pro),
            ("trialing", false, SubscriptionStatus::Trialing, SubscriptionTier::Pro),
            ("past_due", false, SubscriptionStatus::BillingIssue, SubscriptionTier::Pro),
            ("unpaid", false, SubscriptionStatus::BillingIssue, SubscriptionTier::Pro),
            ("canceled", false, SubscriptionStatus::Expired, SubscriptionTier::Free),
        ];

        for (stripe_status, pending_cancel, status, tier) in cases {
            let event = stripe_event(
                "customer.subscription.updated",
                json!({
                    "id": "sub_1",
                    "customer": "cus_1",
                    "status": stripe_status,
                    "cancel_at_period_end": pending_cancel,
                    "current_period_end": NOW + 86_400,
                    "metadata": { "user_id": user_id.to_string(), "tier": "pro" }
                }),
            );
            let (user, canonical) = transition(classify_stripe_event(&event));
            assert_eq!(user.user_id, Some(user_id));
            assert_eq!(user.customer_id.as_deref(), Some("cus_1"));
            assert_eq!(canonical.status, status, "{stripe_status}");
            assert_eq!(canonical.tier, tier, "{stripe_status}");
            assert_eq!(canonical.provider, Provider::Stripe);
            assert!(!canonical.is_renewal);
        }
    }

    #[test]
    fn test_incomplete_subscription_is_ignored() {
        let event = stripe_event(
            "customer.subscription.created",
            json!({ "customer": "cus_1", "status": "incomplete" }),
        );
        assert_eq!(
            classify_stripe_event(&event),
            StripeClassification::Ignored {
                event_type: "customer.subscription.created".into(),
                reason: NoOpReason::UnhandledStatus("incomplete".into()),
            }
        );
    }

    #[test]
    fn test_deleted_subscription_expires() {
        let event = stripe_event(
            "customer.subscription.deleted",
            json!({ "customer": { "id": "cus_9" }, "status": "canceled" }),
        );
        let (user, canonical) = transition(classify_stripe_event(&event));
        assert_eq!(user.user_id, None);
        assert_eq!(user.customer_id.as_deref(), Some("cus_9"));
        assert_eq!(canonical.status, SubscriptionStatus::Expired);
        assert_eq!(canonical.tier, SubscriptionTier::Free);
        assert_eq!(canonical.expiration, None);
    }

    #[test]
    fn test_cycle_invoice_is_a_renewal() {
        let event = stripe_event(
            "invoice.paid",
            json!({
                "customer": "cus_1",
                "billing_reason": "subscription_cycle",
                "lines": { "data": [ { "period": { "end": NOW + 2_592_000 } } ] }
            }),
        );
        let (_, canonical) = transition(classify_stripe_event(&event));
        assert!(canonical.is_renewal);
        assert_eq!(canonical.status, SubscriptionStatus::Active);
        assert_eq!(canonical.tier, SubscriptionTier::Premium);
        assert_eq!(
            canonical.expiration.map(|t| t.unix_timestamp()),
            Some(NOW + 2_592_000)
        );
        assert_eq!(canonical.event_at.map(|t| t.unix_timestamp()), Some(NOW));
    }

    #[test]
    fn test_first_invoice_is_ignored() {
        let event = stripe_event(
            "invoice.paid",
            json!({ "customer": "cus_1", "billing_reason": "subscription_create" }),
        );
        assert!(matches!(
            classify_stripe_event(&event),
            StripeClassification::Ignored { .. }
        ));
    }

    #[test]
    fn test_failed_invoice_flags_billing_issue() {
        let event = stripe_event(
            "invoice.payment_failed",
            json!({ "customer": "cus_1", "billing_reason": "subscription_cycle" }),
        );
        let (_, canonical) = transition(classify_stripe_event(&event));
        assert_eq!(canonical.status, SubscriptionStatus::BillingIssue);
        assert!(!canonical.is_renewal);
    }

    #[test]
    fn test_unrelated_event_is_ignored() {
        let event = stripe_event("charge.succeeded", json!({}));
        assert!(matches!(
            classify_stripe_event(&event),
            StripeClassification::Ignored {
                reason: NoOpReason::UnhandledEventType,
                ..
            }
        ));
    }
}
