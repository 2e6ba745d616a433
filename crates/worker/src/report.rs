//! Failed event report
//!
//! Logs the `failed` rows of the provider event ledger. Those events were
//! acknowledged to the provider but never landed, so an operator has to
//! reconcile them by hand.

use larder_billing::EventLedger;
use time::OffsetDateTime;

use crate::error::WorkerResult;

/// Failures listed per report
pub const REPORT_LIMIT: i64 = 100;

pub async fn report_failed_events(ledger: &dyn EventLedger, limit: i64) -> WorkerResult<usize> {
    let failed = ledger.list_failed(limit).await?;
    if failed.is_empty() {
        tracing::debug!("No failed provider events");
        return Ok(0);
    }

    let now = OffsetDateTime::now_utc();
    for entry in &failed {
        tracing::error!(
            provider = %entry.provider,
            event_id = entry.event_id.as_deref().unwrap_or("-"),
            event_type = %entry.event_type,
            user_id = ?entry.user_id,
            age_minutes = (now - entry.received_at).whole_minutes(),
            error = entry.error_message.as_deref().unwrap_or(""),
            "RECONCILIATION NEEDED: provider event failed to apply"
        );
    }

    tracing::warn!(count = failed.len(), "Failed provider events awaiting reconciliation");
    Ok(failed.len())
}
