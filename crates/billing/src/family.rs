//! Family-plan membership collaborator

use async_trait::async_trait;
use larder_shared::SubscriptionTier;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

#[async_trait]
pub trait FamilyMembership: Send + Sync {
    /// Members of the family plan owned by `owner_id`, excluding the owner
    async fn list_members(&self, owner_id: Uuid) -> BillingResult<Vec<Uuid>>;

    async fn set_member_tier(&self, member_id: Uuid, tier: SubscriptionTier) -> BillingResult<()>;
}

/// Postgres-backed [`FamilyMembership`]
#[derive(Clone)]
pub struct PgFamilyMembership {
    pool: PgPool,
}

impl PgFamilyMembership {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FamilyMembership for PgFamilyMembership {
    async fn list_members(&self, owner_id: Uuid) -> BillingResult<Vec<Uuid>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT member_id
            FROM family_members
            WHERE owner_id = $1 AND member_id <> owner_id
            ORDER BY joined_at
            "#,
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn set_member_tier(&self, member_id: Uuid, tier: SubscriptionTier) -> BillingResult<()> {
        let result = sqlx::query(
            "UPDATE profiles SET subscription_tier = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(member_id)
        .bind(tier.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::NotFound(format!("member profile {}", member_id)));
        }
        Ok(())
    }
}
