//! Admin refund workflow
//!
//! Refunds the target user's most recent charge once their subscription has
//! been cancelled. On success the refund is stamped on the profile, recorded
//! in the append-only `admin_refunds` audit trail, and a Stripe-backed record
//! is downgraded by feeding a synthetic Stripe expiration through
//! reconciliation.

use std::sync::Arc;

use async_trait::async_trait;
use larder_shared::{Provider, SubscriptionStatus, SubscriptionTier};
use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::authenticator::{authorize_admin, Caller};
use crate::classifier::CanonicalEvent;
use crate::error::{BillingError, BillingResult};
use crate::processor::{ProcessorHandle, RefundContext};
use crate::profiles::ProfileStore;
use crate::reconcile::ReconciliationService;

/// Result of a refund operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundResult {
    pub success: bool,
    /// Stripe refund ID
    pub refund_id: String,
    /// Amount refunded in the currency's minor unit
    pub amount: i64,
    pub currency: String,
    pub status: String,
}

/// Admin refund record for audit trail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct RefundAuditEntry {
    pub id: Uuid,
    pub target_user_id: Uuid,
    pub admin_user_id: Uuid,
    pub stripe_charge_id: String,
    pub stripe_refund_id: String,
    pub amount_cents: i64,
    pub currency: String,
    pub status: String,
    pub created_at: OffsetDateTime,
}

/// Append-only refund audit trail
#[async_trait]
pub trait RefundAuditLog: Send + Sync {
    async fn append(&self, entry: &RefundAuditEntry) -> BillingResult<()>;
}

/// Postgres-backed [`RefundAuditLog`]
#[derive(Clone)]
pub struct PgRefundAuditLog {
    pool: PgPool,
}

impl PgRefundAuditLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RefundAuditLog for PgRefundAuditLog {
    async fn append(&self, entry: &RefundAuditEntry) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO admin_refunds (
                id, target_user_id, admin_user_id, stripe_charge_id, stripe_refund_id,
                amount_cents, currency, status, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(entry.id)
        .bind(entry.target_user_id)
        .bind(entry.admin_user_id)
        .bind(&entry.stripe_charge_id)
        .bind(&entry.stripe_refund_id)
        .bind(entry.amount_cents)
        .bind(&entry.currency)
        .bind(&entry.status)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Refund service for admin-initiated refunds
#[derive(Clone)]
pub struct RefundService {
    processor: ProcessorHandle,
    profiles: Arc<dyn ProfileStore>,
    audit: Arc<dyn RefundAuditLog>,
    reconciliation: ReconciliationService,
}

impl RefundService {
    pub fn new(
        processor: ProcessorHandle,
        profiles: Arc<dyn ProfileStore>,
        audit: Arc<dyn RefundAuditLog>,
        reconciliation: ReconciliationService,
    ) -> Self {
        Self {
            processor,
            profiles,
            audit,
            reconciliation,
        }
    }

    /// Refund the target user's latest charge
    ///
    /// Preconditions are checked in order: admin caller, profile exists with a
    /// Stripe customer, subscription cancelled (or cancelling at period end),
    /// latest charge succeeded and not yet refunded.
    pub async fn refund_last_payment(
        &self,
        caller: &Caller,
        target_user_id: Uuid,
    ) -> BillingResult<RefundResult> {
        authorize_admin(caller)?;

        let profile = self
            .profiles
            .get_profile(target_user_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("profile {}", target_user_id)))?;

        let customer_id = profile
            .stripe_customer_id
            .as_deref()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| {
                BillingError::InvalidState("user has no Stripe customer".to_string())
            })?;

        let processor = self.processor.get()?;

        let subscription = processor
            .latest_subscription(customer_id)
            .await?
            .ok_or_else(|| BillingError::InvalidState("user has no Stripe subscription".to_string()))?;
        if !subscription.is_cancelled_or_pending() {
            return Err(BillingError::InvalidState(
                "subscription is still active; cancel it before refunding".to_string(),
            ));
        }

        let charge = processor
            .latest_charge(customer_id)
            .await?
            .ok_or_else(|| BillingError::InvalidState("no charge to refund".to_string()))?;
        if charge.status != "succeeded" {
            return Err(BillingError::InvalidState(format!(
                "latest charge has status {}",
                charge.status
            )));
        }
        if charge.refunded {
            return Err(BillingError::InvalidState(
                "latest charge is already refunded".to_string(),
            ));
        }

        let refund = processor
            .refund_charge(
                &charge,
                RefundContext {
                    actor_user_id: caller.user_id,
                    target_user_id,
                },
            )
            .await?;

        tracing::info!(
            user_id = %target_user_id,
            admin_user_id = %caller.user_id,
            refund_id = %refund.id,
            charge_id = %charge.id,
            amount = refund.amount,
            currency = %refund.currency,
            "Issued refund"
        );

        // Money has moved; everything below is bookkeeping and must not fail the call
        let now = OffsetDateTime::now_utc();

        if let Err(e) = self.profiles.stamp_last_refunded(target_user_id, now).await {
            tracing::warn!(
                user_id = %target_user_id,
                error = %e,
                "Failed to stamp last refunded date"
            );
        }

        let entry = RefundAuditEntry {
            id: Uuid::new_v4(),
            target_user_id,
            admin_user_id: caller.user_id,
            stripe_charge_id: charge.id.clone(),
            stripe_refund_id: refund.id.clone(),
            amount_cents: refund.amount,
            currency: refund.currency.clone(),
            status: refund.status.clone(),
            created_at: now,
        };
        if let Err(e) = self.audit.append(&entry).await {
            tracing::error!(
                user_id = %target_user_id,
                refund_id = %refund.id,
                error = %e,
                "RECONCILIATION NEEDED: Refund issued but audit entry not written"
            );
        }

        self.downgrade_after_refund(target_user_id, &refund.id, now).await;

        Ok(RefundResult {
            success: true,
            refund_id: refund.id,
            amount: refund.amount,
            currency: refund.currency,
            status: refund.status,
        })
    }

    /// Expire a Stripe-backed record after its charge was refunded
    ///
    /// A record owned by another provider (App Store, Play Store) is left
    /// alone: refunding an old Stripe charge must not revoke that entitlement.
    async fn downgrade_after_refund(
        &self,
        target_user_id: Uuid,
        refund_id: &str,
        now: OffsetDateTime,
    ) {
        match self.reconciliation.store().get(target_user_id).await {
            Ok(Some(record)) if record.provider != Provider::Stripe => {
                tracing::info!(
                    user_id = %target_user_id,
                    refund_id = %refund_id,
                    provider = %record.provider,
                    "Skipping post-refund downgrade; subscription belongs to another provider"
                );
                return;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(
                    user_id = %target_user_id,
                    refund_id = %refund_id,
                    error = %e,
                    "RECONCILIATION NEEDED: Refund issued but subscription record unreadable; not downgraded"
                );
                return;
            }
        }

        let downgrade = CanonicalEvent {
            event_type: "REFUND_ISSUED".to_string(),
            status: SubscriptionStatus::Expired,
            tier: SubscriptionTier::Free,
            provider: Provider::Stripe,
            expiration: None,
            product_id: None,
            is_renewal: false,
            event_at: Some(now),
            source_event_id: Some(refund_id.to_string()),
        };
        if let Err(e) = self.reconciliation.apply_event(target_user_id, &downgrade).await {
            tracing::error!(
                user_id = %target_user_id,
                refund_id = %refund_id,
                error = %e,
                "RECONCILIATION NEEDED: Refund issued but subscription not downgraded"
            );
        }
    }
}
