//! Profile drift sweep
//!
//! Cascade writes are best effort, so a profile (or a family member's
//! profile) can be left on a different tier than the owner's subscription
//! record. The sweep finds those owners and re-runs the cascade.

use std::time::Duration;

use larder_billing::{CascadePropagator, CascadeReport};
use larder_shared::SubscriptionTier;
use sqlx::PgPool;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use uuid::Uuid;

use crate::error::{WorkerError, WorkerResult};

/// Owners considered per sweep run
const SWEEP_BATCH_LIMIT: i64 = 500;

/// An owner whose profiles disagree with their subscription record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriftCandidate {
    pub owner_id: Uuid,
    pub tier: SubscriptionTier,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub scanned: usize,
    pub healed: usize,
    pub incomplete: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub attempts: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            attempts: 4,
        }
    }
}

impl RetryPolicy {
    fn strategy(&self) -> impl Iterator<Item = Duration> {
        ExponentialBackoff::from_millis(self.base_delay.as_millis() as u64)
            .max_delay(self.max_delay)
            .map(jitter)
            .take(self.attempts)
    }
}

/// Owners whose own profile tier, or any family member's tier, differs
/// from `subscriptions.tier`
pub async fn find_drifted_owners(pool: &PgPool) -> WorkerResult<Vec<DriftCandidate>> {
    let rows: Vec<(Uuid, String)> = sqlx::query_as(
        r#"
        SELECT s.user_id, s.tier
        FROM subscriptions s
        JOIN profiles p ON p.id = s.user_id
        WHERE p.subscription_tier <> s.tier
           OR EXISTS (
                SELECT 1
                FROM family_members fm
                JOIN profiles mp ON mp.id = fm.member_id
                WHERE fm.owner_id = s.user_id
                  AND fm.member_id <> fm.owner_id
                  AND mp.subscription_tier <> s.tier
           )
        ORDER BY s.updated_at
        LIMIT $1
        "#,
    )
    .bind(SWEEP_BATCH_LIMIT)
    .fetch_all(pool)
    .await?;

    Ok(parse_candidates(rows))
}

fn parse_candidates(rows: Vec<(Uuid, String)>) -> Vec<DriftCandidate> {
    rows.into_iter()
        .filter_map(|(owner_id, tier)| match tier.parse::<SubscriptionTier>() {
            Ok(tier) => Some(DriftCandidate { owner_id, tier }),
            Err(e) => {
                tracing::warn!(
                    user_id = %owner_id,
                    tier = %tier,
                    error = %e,
                    "Skipping subscription record with unknown tier"
                );
                None
            }
        })
        .collect()
}

/// Re-run the cascade for one owner, retrying until the owner write lands
pub async fn heal_owner(
    propagator: &CascadePropagator,
    candidate: DriftCandidate,
    policy: &RetryPolicy,
) -> WorkerResult<CascadeReport> {
    Retry::spawn(policy.strategy(), || async {
        let report = propagator
            .propagate(candidate.owner_id, candidate.tier, false)
            .await;
        if report.owner_updated {
            Ok(report)
        } else {
            Err(WorkerError::OwnerWriteFailed(candidate.owner_id))
        }
    })
    .await
}

pub async fn heal_all(
    propagator: &CascadePropagator,
    candidates: &[DriftCandidate],
    policy: &RetryPolicy,
) -> SweepSummary {
    let mut summary = SweepSummary {
        scanned: candidates.len(),
        ..Default::default()
    };

    for candidate in candidates {
        match heal_owner(propagator, *candidate, policy).await {
            Ok(report) if report.is_complete() => summary.healed += 1,
            Ok(report) => {
                tracing::warn!(
                    user_id = %candidate.owner_id,
                    members_failed = report.members_failed.len(),
                    member_listing_failed = report.member_listing_failed,
                    "Drift sweep left family members out of sync"
                );
                summary.incomplete += 1;
            }
            Err(e) => {
                tracing::error!(
                    user_id = %candidate.owner_id,
                    tier = %candidate.tier,
                    error = %e,
                    "RECONCILIATION NEEDED: drift sweep gave up on owner"
                );
                summary.failed += 1;
            }
        }
    }

    summary
}

pub async fn run_drift_sweep(
    pool: &PgPool,
    propagator: &CascadePropagator,
    policy: &RetryPolicy,
) -> WorkerResult<SweepSummary> {
    let candidates = find_drifted_owners(pool).await?;
    if candidates.is_empty() {
        tracing::debug!("No profile drift found");
        return Ok(SweepSummary::default());
    }

    tracing::info!(count = candidates.len(), "Found owners with profile drift");
    let summary = heal_all(propagator, &candidates, policy).await;
    tracing::info!(
        scanned = summary.scanned,
        healed = summary.healed,
        incomplete = summary.incomplete,
        failed = summary.failed,
        "Drift sweep complete"
    );
    Ok(summary)
}
