//! Provider event ledger
//!
//! Every webhook the engine processes leaves one row in `provider_event_log`
//! with its outcome. Redeliveries of the same provider event id update that
//! row instead of adding a new one. `failed` rows are the manual
//! reconciliation queue.

use async_trait::async_trait;
use larder_shared::Provider;
use serde::Serialize;
use sqlx::{FromRow, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::reconcile::ReconcileOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerOutcome {
    Applied,
    Unchanged,
    Stale,
    Ignored,
    Failed,
}

impl LedgerOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Unchanged => "unchanged",
            Self::Stale => "stale",
            Self::Ignored => "ignored",
            Self::Failed => "failed",
        }
    }

    fn from_db(s: &str) -> Self {
        match s {
            "applied" => Self::Applied,
            "unchanged" => Self::Unchanged,
            "stale" => Self::Stale,
            "ignored" => Self::Ignored,
            _ => Self::Failed,
        }
    }
}

impl From<&ReconcileOutcome> for LedgerOutcome {
    fn from(outcome: &ReconcileOutcome) -> Self {
        match outcome {
            ReconcileOutcome::Applied { .. } => Self::Applied,
            ReconcileOutcome::Unchanged(_) => Self::Unchanged,
            ReconcileOutcome::Stale(_) => Self::Stale,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerEntry {
    pub provider: Provider,
    pub event_id: Option<String>,
    pub event_type: String,
    pub user_id: Option<Uuid>,
    pub outcome: LedgerOutcome,
    pub error_message: Option<String>,
    pub received_at: OffsetDateTime,
}

#[async_trait]
pub trait EventLedger: Send + Sync {
    async fn record(&self, entry: &LedgerEntry) -> BillingResult<()>;

    /// Most recent failures first
    async fn list_failed(&self, limit: i64) -> BillingResult<Vec<LedgerEntry>>;
}

#[derive(Debug, FromRow)]
struct LedgerRow {
    provider: String,
    event_id: Option<String>,
    event_type: String,
    user_id: Option<Uuid>,
    outcome: String,
    error_message: Option<String>,
    received_at: OffsetDateTime,
}

impl From<LedgerRow> for LedgerEntry {
    fn from(row: LedgerRow) -> Self {
        Self {
            provider: Provider::from(row.provider),
            event_id: row.event_id,
            event_type: row.event_type,
            user_id: row.user_id,
            outcome: LedgerOutcome::from_db(&row.outcome),
            error_message: row.error_message,
            received_at: row.received_at,
        }
    }
}

/// Postgres-backed [`EventLedger`]
#[derive(Clone)]
pub struct PgEventLedger {
    pool: PgPool,
}

impl PgEventLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventLedger for PgEventLedger {
    async fn record(&self, entry: &LedgerEntry) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO provider_event_log
                (provider, event_id, event_type, user_id, outcome, error_message, received_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
            ON CONFLICT (provider, event_id) WHERE event_id IS NOT NULL DO UPDATE SET
                outcome = EXCLUDED.outcome,
                error_message = EXCLUDED.error_message,
                user_id = COALESCE(EXCLUDED.user_id, provider_event_log.user_id),
                attempts = provider_event_log.attempts + 1,
                updated_at = NOW()
            "#,
        )
        .bind(entry.provider.as_str())
        .bind(&entry.event_id)
        .bind(&entry.event_type)
        .bind(entry.user_id)
        .bind(entry.outcome.as_str())
        .bind(&entry.error_message)
        .bind(entry.received_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_failed(&self, limit: i64) -> BillingResult<Vec<LedgerEntry>> {
        let rows: Vec<LedgerRow> = sqlx::query_as(
            r#"
            SELECT provider, event_id, event_type, user_id, outcome, error_message, received_at
            FROM provider_event_log
            WHERE outcome = 'failed'
            ORDER BY received_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(LedgerEntry::from).collect())
    }
}
