//! Reconciliation store
//!
//! One authoritative [`SubscriptionRecord`] per user, written with an
//! idempotent keyed upsert. Two rules decide whether a write lands:
//!
//! - an event whose provider timestamp is older than the stored
//!   `last_event_at` watermark is **stale** and ignored;
//! - a replay of the stored canonical tuple is **unchanged** and skipped, so
//!   nothing downstream (credit resets in particular) runs twice.
//!
//! [`decide_upsert`] holds both rules; the Postgres upsert encodes the same
//! rules in its `ON CONFLICT ... WHERE` clause so concurrent deliveries are
//! resolved atomically by the database.

use async_trait::async_trait;
use larder_shared::{Provider, SubscriptionStatus, SubscriptionTier};
use serde::Serialize;
use sqlx::{FromRow, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::classifier::CanonicalEvent;
use crate::error::{BillingError, BillingResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionRecord {
    pub user_id: Uuid,
    pub provider: Provider,
    pub status: SubscriptionStatus,
    pub tier: SubscriptionTier,
    pub product_id: Option<String>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancelled_at: Option<OffsetDateTime>,
    pub last_event_at: Option<OffsetDateTime>,
    pub updated_at: OffsetDateTime,
}

impl SubscriptionRecord {
    /// The full record a canonical event replaces the stored one with
    pub fn from_event(user_id: Uuid, event: &CanonicalEvent, now: OffsetDateTime) -> Self {
        let cancelled_at = (event.status == SubscriptionStatus::Cancelled)
            .then(|| event.event_at.unwrap_or(now));

        Self {
            user_id,
            provider: event.provider.clone(),
            status: event.status,
            tier: event.tier,
            product_id: event.product_id.clone(),
            current_period_end: event.expiration,
            cancelled_at,
            last_event_at: event.event_at,
            updated_at: now,
        }
    }

    /// Same canonical tuple, ignoring bookkeeping timestamps
    pub fn same_state(&self, other: &SubscriptionRecord) -> bool {
        self.provider == other.provider
            && self.status == other.status
            && self.tier == other.tier
            && self.product_id == other.product_id
            && self.current_period_end == other.current_period_end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertDecision {
    Write,
    Unchanged,
    Stale,
}

pub fn decide_upsert(
    existing: Option<&SubscriptionRecord>,
    incoming: &SubscriptionRecord,
) -> UpsertDecision {
    let Some(stored) = existing else {
        return UpsertDecision::Write;
    };

    if let (Some(incoming_at), Some(stored_at)) = (incoming.last_event_at, stored.last_event_at) {
        if incoming_at < stored_at {
            return UpsertDecision::Stale;
        }
    }

    let replay = incoming.last_event_at.is_none() || incoming.last_event_at == stored.last_event_at;
    if replay && stored.same_state(incoming) {
        return UpsertDecision::Unchanged;
    }

    UpsertDecision::Write
}

/// Apply `incoming` over `existing`, keeping the ordering watermark when the
/// incoming event carries no timestamp
pub fn merge_for_write(
    existing: Option<&SubscriptionRecord>,
    incoming: &SubscriptionRecord,
) -> SubscriptionRecord {
    let mut merged = incoming.clone();
    if merged.last_event_at.is_none() {
        merged.last_event_at = existing.and_then(|s| s.last_event_at);
    }
    merged
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// The record was written; carries the stored result
    Applied(SubscriptionRecord),
    /// Replay of the stored state; carries the stored record
    Unchanged(SubscriptionRecord),
    /// Older than the stored watermark; carries the stored record
    Stale(SubscriptionRecord),
}

impl UpsertOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Applied(_) => "applied",
            Self::Unchanged(_) => "unchanged",
            Self::Stale(_) => "stale",
        }
    }
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn get(&self, user_id: Uuid) -> BillingResult<Option<SubscriptionRecord>>;

    async fn upsert(&self, record: &SubscriptionRecord) -> BillingResult<UpsertOutcome>;
}

#[derive(Debug, FromRow)]
struct SubscriptionRow {
    user_id: Uuid,
    provider: String,
    status: String,
    tier: String,
    product_id: Option<String>,
    current_period_end: Option<OffsetDateTime>,
    cancelled_at: Option<OffsetDateTime>,
    last_event_at: Option<OffsetDateTime>,
    updated_at: OffsetDateTime,
}

impl TryFrom<SubscriptionRow> for SubscriptionRecord {
    type Error = BillingError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        let corrupt = |e: larder_shared::SharedError| {
            BillingError::UpstreamFailure(format!(
                "corrupt subscription row for {}: {}",
                row.user_id, e
            ))
        };

        Ok(Self {
            user_id: row.user_id,
            provider: Provider::from(row.provider.clone()),
            status: row.status.parse().map_err(corrupt)?,
            tier: row.tier.parse().map_err(corrupt)?,
            product_id: row.product_id.clone(),
            current_period_end: row.current_period_end,
            cancelled_at: row.cancelled_at,
            last_event_at: row.last_event_at,
            updated_at: row.updated_at,
        })
    }
}

const SUBSCRIPTION_COLUMNS: &str = "user_id, provider, status, tier, product_id, \
    current_period_end, cancelled_at, last_event_at, updated_at";

/// Postgres-backed [`SubscriptionStore`]
#[derive(Clone)]
pub struct PgSubscriptionStore {
    pool: PgPool,
}

impl PgSubscriptionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SubscriptionStore for PgSubscriptionStore {
    async fn get(&self, user_id: Uuid) -> BillingResult<Option<SubscriptionRecord>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE user_id = $1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(SubscriptionRecord::try_from).transpose()
    }

    async fn upsert(&self, record: &SubscriptionRecord) -> BillingResult<UpsertOutcome> {
        // The WHERE clause mirrors decide_upsert: skip stale events and exact replays.
        let written: Option<SubscriptionRow> = sqlx::query_as(&format!(
            r#"
            INSERT INTO subscriptions ({columns})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (user_id) DO UPDATE SET
                provider = EXCLUDED.provider,
                status = EXCLUDED.status,
                tier = EXCLUDED.tier,
                product_id = EXCLUDED.product_id,
                current_period_end = EXCLUDED.current_period_end,
                cancelled_at = EXCLUDED.cancelled_at,
                last_event_at = COALESCE(EXCLUDED.last_event_at, subscriptions.last_event_at),
                updated_at = EXCLUDED.updated_at
            WHERE NOT (
                    EXCLUDED.last_event_at IS NOT NULL
                    AND subscriptions.last_event_at IS NOT NULL
                    AND EXCLUDED.last_event_at < subscriptions.last_event_at
                )
              AND NOT (
                    (subscriptions.provider, subscriptions.status, subscriptions.tier,
                     subscriptions.product_id, subscriptions.current_period_end)
                    IS NOT DISTINCT FROM
                    (EXCLUDED.provider, EXCLUDED.status, EXCLUDED.tier,
                     EXCLUDED.product_id, EXCLUDED.current_period_end)
                    AND (EXCLUDED.last_event_at IS NULL
                         OR EXCLUDED.last_event_at IS NOT DISTINCT FROM subscriptions.last_event_at)
                )
            RETURNING {columns}
            "#,
            columns = SUBSCRIPTION_COLUMNS
        ))
        .bind(record.user_id)
        .bind(record.provider.as_str())
        .bind(record.status.as_str())
        .bind(record.tier.as_str())
        .bind(&record.product_id)
        .bind(record.current_period_end)
        .bind(record.cancelled_at)
        .bind(record.last_event_at)
        .bind(record.updated_at)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = written {
            return Ok(UpsertOutcome::Applied(row.try_into()?));
        }

        // Conflict row was left alone; report why
        let stored = self.get(record.user_id).await?.ok_or_else(|| {
            BillingError::UpstreamFailure(format!(
                "subscription for {} vanished during upsert",
                record.user_id
            ))
        })?;

        Ok(match decide_upsert(Some(&stored), record) {
            UpsertDecision::Stale => UpsertOutcome::Stale(stored),
            // A concurrent writer got there first with the same or a newer state
            UpsertDecision::Unchanged | UpsertDecision::Write => UpsertOutcome::Unchanged(stored),
        })
    }
}
