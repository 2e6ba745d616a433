// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError variants carry provider detail strings
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Larder Billing Module
//!
//! Reconciles subscription state reported by payment providers into one
//! authoritative record per user, and fans the resulting entitlement out to
//! profiles and family-plan members.
//!
//! ## Features
//!
//! - **Webhooks**: Subscription aggregator (App Store / Play Store) and Stripe events
//! - **Ordering guard**: Out-of-order and replayed events never regress state
//! - **Cascade**: Profile tier, family members, renewal credit resets
//! - **Native sync**: Client-reported store purchases and restores
//! - **Entitlement query**: Self-or-admin view of a user's subscription
//! - **Refunds**: Admin-initiated refund of the last payment with audit trail
//! - **Event ledger**: One row per provider event for manual reconciliation

pub mod authenticator;
pub mod cascade;
pub mod classifier;
pub mod client;
pub mod entitlement;
pub mod error;
pub mod family;
pub mod ledger;
#[cfg(any(test, feature = "test-support"))]
pub mod memory;
pub mod processor;
pub mod profiles;
pub mod reconcile;
pub mod refund;
pub mod store;
pub mod stripe_events;
pub mod webhooks;


use std::sync::Arc;

use sqlx::PgPool;

// Authentication
pub use authenticator::{
    authorize_admin, authorize_self_or_admin, authorize_user_sync, Caller, CallerResolver,
    IdentityVerifier, WebhookAuthenticator,
};

// Cascade
pub use cascade::{CascadePropagator, CascadeReport};

// Classification
pub use classifier::{
    classify_aggregator_event, AggregatorEvent, AggregatorWebhook, CanonicalEvent,
    Classification, NoOpReason,
};

// Client
pub use client::{StripeClient, StripeConfig};

// Entitlement
pub use entitlement::{EntitlementService, EntitlementSource, EntitlementStatus, EntitlementView};

// Error
pub use error::{BillingError, BillingResult};

// Collaborators
pub use family::{FamilyMembership, PgFamilyMembership};
pub use profiles::{LegacyStripeSubscription, PgProfileStore, Profile, ProfileStore};

// Ledger
pub use ledger::{EventLedger, LedgerEntry, LedgerOutcome, PgEventLedger};

// Processor
pub use processor::{
    BillingProcessor, ProcessorCharge, ProcessorHandle, ProcessorRefund, ProcessorSubscription,
    RefundContext, StripeProcessor,
};

// Reconciliation
pub use reconcile::{NativeSyncRequest, NativeSyncResponse, ReconcileOutcome, ReconciliationService};

// Refund
pub use refund::{PgRefundAuditLog, RefundAuditEntry, RefundAuditLog, RefundResult, RefundService};

// Store
pub use store::{PgSubscriptionStore, SubscriptionRecord, SubscriptionStore, UpsertOutcome};

// Stripe events
pub use stripe_events::{classify_stripe_event, StripeEvent, StripeSignatureVerifier};

// Webhooks
pub use webhooks::{AggregatorWebhookHandler, StripeWebhookHandler, WebhookAck};

/// Secrets and switches the engine is built with
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub aggregator_webhook_secret: Option<String>,
    pub stripe_webhook_secret: Option<String>,
    /// When false the refund workflow reports the processor as unavailable
    pub enable_billing: bool,
}

/// The ports the engine runs against
pub struct EngineParts {
    pub subscriptions: Arc<dyn SubscriptionStore>,
    pub profiles: Arc<dyn ProfileStore>,
    pub family: Arc<dyn FamilyMembership>,
    pub ledger: Arc<dyn EventLedger>,
    pub refund_audit: Arc<dyn RefundAuditLog>,
    pub processor: ProcessorHandle,
    pub identity: Arc<dyn IdentityVerifier>,
}

/// Every service of the reconciliation engine, wired to one set of ports
#[derive(Clone)]
pub struct EntitlementEngine {
    pub callers: CallerResolver,
    pub reconciliation: ReconciliationService,
    pub entitlements: EntitlementService,
    pub refunds: RefundService,
    pub aggregator_webhooks: AggregatorWebhookHandler,
    pub stripe_webhooks: StripeWebhookHandler,
    pub cascade: CascadePropagator,
    pub ledger: Arc<dyn EventLedger>,
}

impl EntitlementEngine {
    pub fn new(parts: EngineParts, config: EngineConfig) -> Self {
        let cascade = CascadePropagator::new(parts.profiles.clone(), parts.family.clone());
        let reconciliation =
            ReconciliationService::new(parts.subscriptions.clone(), cascade.clone());

        let processor = if config.enable_billing {
            parts.processor
        } else {
            tracing::info!("Billing disabled (ENABLE_BILLING=false), refunds unavailable");
            ProcessorHandle::unavailable("billing is disabled")
        };

        Self {
            callers: CallerResolver::new(parts.identity, parts.profiles.clone()),
            entitlements: EntitlementService::new(
                parts.subscriptions.clone(),
                parts.profiles.clone(),
            ),
            refunds: RefundService::new(
                processor,
                parts.profiles.clone(),
                parts.refund_audit,
                reconciliation.clone(),
            ),
            aggregator_webhooks: AggregatorWebhookHandler::new(
                WebhookAuthenticator::new(config.aggregator_webhook_secret),
                reconciliation.clone(),
                parts.ledger.clone(),
            ),
            stripe_webhooks: StripeWebhookHandler::new(
                StripeSignatureVerifier::new(config.stripe_webhook_secret),
                parts.profiles,
                reconciliation.clone(),
                parts.ledger.clone(),
            ),
            reconciliation,
            cascade,
            ledger: parts.ledger,
        }
    }

    /// Postgres-backed engine with the Stripe processor from the environment
    pub fn postgres(
        pool: PgPool,
        identity: Arc<dyn IdentityVerifier>,
        config: EngineConfig,
    ) -> Self {
        let processor = if config.enable_billing {
            ProcessorHandle::from_env()
        } else {
            ProcessorHandle::unavailable("billing is disabled")
        };

        Self::new(
            EngineParts {
                subscriptions: Arc::new(PgSubscriptionStore::new(pool.clone())),
                profiles: Arc::new(PgProfileStore::new(pool.clone())),
                family: Arc::new(PgFamilyMembership::new(pool.clone())),
                ledger: Arc::new(PgEventLedger::new(pool.clone())),
                refund_audit: Arc::new(PgRefundAuditLog::new(pool)),
                processor,
                identity,
            },
            config,
        )
    }
}
