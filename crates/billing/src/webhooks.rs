//! Webhook handling
//!
//! Two inbound channels feed reconciliation: the subscription aggregator
//! (bearer-secret authenticated JSON, covering App Store, Play Store and other
//! stores) and Stripe (HMAC-signed events). Both follow the same pipeline:
//! authenticate, parse, classify, resolve the account, apply, then leave a
//! row in the event ledger.
//!
//! Once a request has been authenticated and parsed it is always acknowledged.
//! A failed record write is logged and ledgered as `failed` for manual
//! reconciliation rather than surfaced to the provider.

use std::sync::Arc;

use larder_shared::Provider;
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::authenticator::WebhookAuthenticator;
use crate::classifier::{
    classify_aggregator_event, provider_for_store, AggregatorWebhook, CanonicalEvent,
    Classification, NoOpReason,
};
use crate::error::{BillingError, BillingResult};
use crate::ledger::{EventLedger, LedgerEntry, LedgerOutcome};
use crate::profiles::ProfileStore;
use crate::reconcile::ReconciliationService;
use crate::stripe_events::{
    classify_stripe_event, StripeClassification, StripeSignatureVerifier, StripeUserRef,
};

/// Response body for an accepted webhook
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WebhookAck {
    pub received: bool,
}

impl WebhookAck {
    fn received() -> Self {
        Self { received: true }
    }
}

/// Apply an actionable event and ledger the result
async fn apply_and_record(
    reconciliation: &ReconciliationService,
    ledger: &dyn EventLedger,
    user_id: Uuid,
    event: &CanonicalEvent,
) {
    let mut entry = LedgerEntry {
        provider: event.provider.clone(),
        event_id: event.source_event_id.clone(),
        event_type: event.event_type.clone(),
        user_id: Some(user_id),
        outcome: LedgerOutcome::Failed,
        error_message: None,
        received_at: OffsetDateTime::now_utc(),
    };

    match reconciliation.apply_event(user_id, event).await {
        Ok(outcome) => entry.outcome = LedgerOutcome::from(&outcome),
        Err(e) => {
            tracing::error!(
                user_id = %user_id,
                event_type = %event.event_type,
                event_id = ?event.source_event_id,
                provider = %event.provider,
                error = %e,
                "RECONCILIATION NEEDED: Failed to apply subscription event"
            );
            entry.error_message = Some(e.to_string());
        }
    }

    record(ledger, &entry).await;
}

async fn record_ignored(
    ledger: &dyn EventLedger,
    provider: Provider,
    event_id: Option<String>,
    event_type: String,
    reason: &NoOpReason,
) {
    tracing::info!(
        provider = %provider,
        event_type = %event_type,
        reason = %reason,
        "Acknowledged webhook without changes"
    );

    let entry = LedgerEntry {
        provider,
        event_id,
        event_type,
        user_id: None,
        outcome: LedgerOutcome::Ignored,
        error_message: Some(reason.to_string()),
        received_at: OffsetDateTime::now_utc(),
    };
    record(ledger, &entry).await;
}

/// Ledger an authenticated event that could not be applied
async fn record_failed(
    ledger: &dyn EventLedger,
    provider: Provider,
    event_id: Option<String>,
    event_type: String,
    error: &BillingError,
) {
    let entry = LedgerEntry {
        provider,
        event_id,
        event_type,
        user_id: None,
        outcome: LedgerOutcome::Failed,
        error_message: Some(error.to_string()),
        received_at: OffsetDateTime::now_utc(),
    };
    record(ledger, &entry).await;
}

// The ledger is bookkeeping; losing a row never fails the webhook
async fn record(ledger: &dyn EventLedger, entry: &LedgerEntry) {
    if let Err(e) = ledger.record(entry).await {
        tracing::warn!(
            provider = %entry.provider,
            event_type = %entry.event_type,
            outcome = entry.outcome.as_str(),
            error = %e,
            "Failed to write event ledger entry"
        );
    }
}

/// Handler for subscription aggregator webhooks
#[derive(Clone)]
pub struct AggregatorWebhookHandler {
    auth: WebhookAuthenticator,
    reconciliation: ReconciliationService,
    ledger: Arc<dyn EventLedger>,
}

impl AggregatorWebhookHandler {
    pub fn new(
        auth: WebhookAuthenticator,
        reconciliation: ReconciliationService,
        ledger: Arc<dyn EventLedger>,
    ) -> Self {
        Self {
            auth,
            reconciliation,
            ledger,
        }
    }

    pub async fn handle(&self, authorization: Option<&str>, body: &[u8]) -> BillingResult<WebhookAck> {
        // Authentication comes before any parsing
        self.auth.verify(authorization)?;

        let webhook: AggregatorWebhook = serde_json::from_slice(body)
            .map_err(|e| BillingError::InvalidInput(format!("malformed webhook body: {}", e)))?;
        let event = webhook.event;

        tracing::info!(
            event_type = %event.event_type,
            event_id = ?event.id,
            store = ?event.store,
            "Received aggregator webhook"
        );

        match classify_aggregator_event(&event) {
            Classification::Actionable { user_id, event } => {
                apply_and_record(&self.reconciliation, self.ledger.as_ref(), user_id, &event).await;
            }
            Classification::NotActionable { event_type, reason } => {
                record_ignored(
                    self.ledger.as_ref(),
                    provider_for_store(event.store.as_deref()),
                    event.id.clone(),
                    event_type,
                    &reason,
                )
                .await;
            }
        }

        Ok(WebhookAck::received())
    }
}

/// Why a Stripe event could not be tied to an account
enum Unresolved {
    /// Nothing to do for this event
    NoOp(NoOpReason),
    /// Storage failed; the event still needs applying
    LookupFailed(BillingError),
}

/// Handler for Stripe webhooks
#[derive(Clone)]
pub struct StripeWebhookHandler {
    verifier: StripeSignatureVerifier,
    profiles: Arc<dyn ProfileStore>,
    reconciliation: ReconciliationService,
    ledger: Arc<dyn EventLedger>,
}

impl StripeWebhookHandler {
    pub fn new(
        verifier: StripeSignatureVerifier,
        profiles: Arc<dyn ProfileStore>,
        reconciliation: ReconciliationService,
        ledger: Arc<dyn EventLedger>,
    ) -> Self {
        Self {
            verifier,
            profiles,
            reconciliation,
            ledger,
        }
    }

    pub async fn handle(&self, signature: Option<&str>, payload: &str) -> BillingResult<WebhookAck> {
        let stripe_event = self.verifier.verify(payload, signature)?;

        tracing::info!(
            event_id = %stripe_event.id,
            event_type = %stripe_event.event_type,
            "Received Stripe webhook"
        );

        match classify_stripe_event(&stripe_event) {
            StripeClassification::Transition { user, event } => match self.resolve_user(&user).await {
                Ok(user_id) => {
                    apply_and_record(&self.reconciliation, self.ledger.as_ref(), user_id, &event)
                        .await;
                }
                Err(Unresolved::NoOp(reason)) => {
                    record_ignored(
                        self.ledger.as_ref(),
                        Provider::Stripe,
                        Some(stripe_event.id.clone()),
                        stripe_event.event_type.clone(),
                        &reason,
                    )
                    .await;
                }
                Err(Unresolved::LookupFailed(error)) => {
                    record_failed(
                        self.ledger.as_ref(),
                        Provider::Stripe,
                        Some(stripe_event.id.clone()),
                        stripe_event.event_type.clone(),
                        &error,
                    )
                    .await;
                }
            },
            StripeClassification::Ignored { event_type, reason } => {
                record_ignored(
                    self.ledger.as_ref(),
                    Provider::Stripe,
                    Some(stripe_event.id.clone()),
                    event_type,
                    &reason,
                )
                .await;
            }
        }

        Ok(WebhookAck::received())
    }

    /// Metadata user id first, then the profile holding the customer id
    async fn resolve_user(&self, user: &StripeUserRef) -> Result<Uuid, Unresolved> {
        if let Some(user_id) = user.user_id {
            return Ok(user_id);
        }

        let customer_id = user
            .customer_id
            .as_deref()
            .ok_or(Unresolved::NoOp(NoOpReason::MissingUserId))?;
        match self.profiles.find_user_by_customer(customer_id).await {
            Ok(Some(user_id)) => Ok(user_id),
            Ok(None) => Err(Unresolved::NoOp(NoOpReason::UnknownCustomer(
                customer_id.to_string(),
            ))),
            Err(e) => {
                tracing::error!(
                    customer_id = %customer_id,
                    error = %e,
                    "RECONCILIATION NEEDED: Failed to look up Stripe customer"
                );
                Err(Unresolved::LookupFailed(e))
            }
        }
    }
}
