//! Profile collaborator
//!
//! The profile row carries the denormalized entitlement tier, the monthly
//! credit counters, the role used for admin checks, and the pre-reconciliation
//! Stripe fields that the entitlement query falls back to.

use async_trait::async_trait;
use larder_shared::{SubscriptionTier, UserRole};
use serde::Serialize;
use sqlx::{FromRow, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Stripe subscription fields written on the profile before subscription
/// records existed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LegacyStripeSubscription {
    pub status: String,
    pub current_period_end: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Profile {
    pub id: Uuid,
    pub role: UserRole,
    pub subscription_tier: SubscriptionTier,
    pub credits_used_this_month: i32,
    pub credits_reset_date: Option<OffsetDateTime>,
    pub stripe_customer_id: Option<String>,
    pub legacy_subscription: Option<LegacyStripeSubscription>,
    pub last_refunded_date: Option<OffsetDateTime>,
}

impl Profile {
    /// A blank free-tier profile
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            role: UserRole::User,
            subscription_tier: SubscriptionTier::Free,
            credits_used_this_month: 0,
            credits_reset_date: None,
            stripe_customer_id: None,
            legacy_subscription: None,
            last_refunded_date: None,
        }
    }
}

#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn get_profile(&self, user_id: Uuid) -> BillingResult<Option<Profile>>;

    /// Write the tier; when `credits_reset_at` is set the same write zeroes the
    /// monthly credit counter and stamps the reset date.
    async fn set_subscription_tier(
        &self,
        user_id: Uuid,
        tier: SubscriptionTier,
        credits_reset_at: Option<OffsetDateTime>,
    ) -> BillingResult<()>;

    async fn reset_credits(&self, user_id: Uuid, reset_at: OffsetDateTime) -> BillingResult<()>;

    async fn find_user_by_customer(&self, customer_id: &str) -> BillingResult<Option<Uuid>>;

    async fn stamp_last_refunded(&self, user_id: Uuid, at: OffsetDateTime) -> BillingResult<()>;
}

#[derive(Debug, FromRow)]
struct ProfileRow {
    id: Uuid,
    role: Option<String>,
    subscription_tier: Option<String>,
    credits_used_this_month: i32,
    credits_reset_date: Option<OffsetDateTime>,
    stripe_customer_id: Option<String>,
    stripe_subscription_status: Option<String>,
    stripe_current_period_end: Option<OffsetDateTime>,
    last_refunded_date: Option<OffsetDateTime>,
}

impl From<ProfileRow> for Profile {
    fn from(row: ProfileRow) -> Self {
        let subscription_tier = match row.subscription_tier.as_deref() {
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                tracing::warn!(
                    user_id = %row.id,
                    tier = %raw,
                    "Unrecognised profile tier, treating as free"
                );
                SubscriptionTier::Free
            }),
            None => SubscriptionTier::Free,
        };

        Self {
            id: row.id,
            role: UserRole::from_db(row.role.as_deref()),
            subscription_tier,
            credits_used_this_month: row.credits_used_this_month,
            credits_reset_date: row.credits_reset_date,
            stripe_customer_id: row.stripe_customer_id,
            legacy_subscription: row.stripe_subscription_status.map(|status| {
                LegacyStripeSubscription {
                    status,
                    current_period_end: row.stripe_current_period_end,
                }
            }),
            last_refunded_date: row.last_refunded_date,
        }
    }
}

/// Postgres-backed [`ProfileStore`]
#[derive(Clone)]
pub struct PgProfileStore {
    pool: PgPool,
}

impl PgProfileStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProfileStore for PgProfileStore {
    async fn get_profile(&self, user_id: Uuid) -> BillingResult<Option<Profile>> {
        let row: Option<ProfileRow> = sqlx::query_as(
            r#"
            SELECT id, role, subscription_tier, credits_used_this_month, credits_reset_date,
                   stripe_customer_id, stripe_subscription_status, stripe_current_period_end,
                   last_refunded_date
            FROM profiles
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Profile::from))
    }

    async fn set_subscription_tier(
        &self,
        user_id: Uuid,
        tier: SubscriptionTier,
        credits_reset_at: Option<OffsetDateTime>,
    ) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE profiles
            SET subscription_tier = $2,
                credits_used_this_month = CASE WHEN $3::TIMESTAMPTZ IS NULL
                    THEN credits_used_this_month ELSE 0 END,
                credits_reset_date = COALESCE($3, credits_reset_date),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .bind(tier.as_str())
        .bind(credits_reset_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::NotFound(format!("profile {}", user_id)));
        }
        Ok(())
    }

    async fn reset_credits(&self, user_id: Uuid, reset_at: OffsetDateTime) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE profiles
            SET credits_used_this_month = 0, credits_reset_date = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .bind(reset_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::NotFound(format!("profile {}", user_id)));
        }
        Ok(())
    }

    async fn find_user_by_customer(&self, customer_id: &str) -> BillingResult<Option<Uuid>> {
        let result: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM profiles WHERE stripe_customer_id = $1")
                .bind(customer_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(result.map(|(id,)| id))
    }

    async fn stamp_last_refunded(&self, user_id: Uuid, at: OffsetDateTime) -> BillingResult<()> {
        let result = sqlx::query(
            "UPDATE profiles SET last_refunded_date = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(user_id)
        .bind(at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::NotFound(format!("profile {}", user_id)));
        }
        Ok(())
    }
}
