//! Startup reconciliation: find today's herd-tagged notes, find zap
//! receipts referencing them, and replay any whose ids are absent from
//! the processed-zap table (or stuck in `processing`/`failed`). Bounded
//! to keep a cold start predictable even with relay lag.

use crate::clock::midnight_today_utc;
use crate::model::{ZapStatus, STUCK_PROCESSING_SECS};
use crate::nostr_adapter::NostrAdapter;
use crate::store::Store;
use crate::zap_pipeline::ZapPipeline;
use nostr::JsonUtil;
use std::time::Duration;

const MAX_NOTES: usize = 10;
const MAX_RECEIPTS_PER_NOTE: usize = 20;
const PER_NOTE_TIMEOUT: Duration = Duration::from_secs(8);

/// Runs the recovery pass. Never fails the caller; logs and returns on
/// any transient error so a flaky relay can't block startup indefinitely.
pub async fn run(nostr: &NostrAdapter, store: &Store, pipeline: &ZapPipeline) {
    let since = midnight_today_utc();

    let notes = match nostr.find_herd_tagged_notes(since, MAX_NOTES).await {
        Ok(notes) => notes,
        Err(e) => {
            tracing::warn!(error = %e, "recovery: failed to list herd-tagged notes");
            return;
        }
    };

    let mut replayed = 0usize;
    for note_id in notes {
        let receipts = match tokio::time::timeout(PER_NOTE_TIMEOUT, nostr.find_zap_receipts_for_note(&note_id, MAX_RECEIPTS_PER_NOTE)).await {
            Ok(Ok(receipts)) => receipts,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, note = %note_id, "recovery: failed to fetch zap receipts for note");
                continue;
            }
            Err(_) => {
                tracing::warn!(note = %note_id, "recovery: zap receipt search timed out");
                continue;
            }
        };

        for receipt in receipts {
            if should_replay(store, &receipt.id.to_hex()).await {
                match pipeline.replay_zap_receipt(&receipt.as_json()).await {
                    Ok(()) => replayed += 1,
                    Err(e) => tracing::warn!(error = %e, receipt = %receipt.id, "recovery: failed to replay zap receipt"),
                }
            }
        }
    }

    tracing::info!(replayed, "recovery pass complete");
}

async fn should_replay(store: &Store, zap_event_id: &str) -> bool {
    match store.is_zap_processed(zap_event_id).await {
        Ok(None) => true,
        Ok(Some(record)) => match record.status {
            ZapStatus::Completed => false,
            ZapStatus::Failed => true,
            ZapStatus::Processing => crate::clock::now_epoch_secs() - record.processed_at > STUCK_PROCESSING_SECS,
        },
        Err(e) => {
            tracing::warn!(error = %e, "recovery: failed to check processed-zap state; skipping");
            false
        }
    }
}
