//! Idempotent zap ingestion: classifies each payment notification,
//! extracts an embedded zap request, routes to herd vs. generic-payment
//! handling, updates balance, and evaluates the feeder trigger condition.
//! A failure processing one payment must never block the next.

use crate::broadcast::Broadcast;
use crate::cache::Cache;
use crate::error::{HerdError, HerdResult};
use crate::feeder_adapter::FeederAdapter;
use crate::herd::{Candidate, HeadbuttResult, HerdEngine, Outcome};
use crate::messages::{EventTag, MessageTemplates};
use crate::metrics::Metrics;
use crate::model::{is_valid_lud16, DEFAULT_DISPLAY_NAME};
use crate::nostr_adapter::{encode_nprofile, NostrAdapter};
use crate::payout::PayoutOrchestrator;
use crate::split_sync::SplitSynchronizer;
use crate::store::Store;
use nostr::{EventId, PublicKey};
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};

const SEEN_HASHES_CAPACITY: usize = 1000;
const GENERIC_MESSAGE_MIN_SATS: i64 = 10;
const MAX_CONCURRENT_PAYMENTS: usize = 2;

#[derive(Clone, Debug)]
pub struct PaymentNotification {
    pub payment_hash: String,
    pub amount_msat: i64,
    pub description: Option<String>,
    pub extra_nostr: Option<String>,
    pub wallet_balance: Option<i64>,
}

#[derive(Clone, Debug)]
struct ExtractedZap {
    request: serde_json::Value,
    note_id: String,
}

/// Locates a kind-9734 zap request embedded in a payment notification,
/// either nested inside a kind-9735 receipt's `description` tag, or
/// directly in `extra.nostr`. Pure; operates on JSON only so it never
/// depends on a signature being valid.
fn extract_zap_request(payment: &PaymentNotification) -> Option<ExtractedZap> {
    if let Some(desc) = &payment.description {
        if let Ok(receipt) = serde_json::from_str::<serde_json::Value>(desc) {
            if receipt.get("kind").and_then(|k| k.as_i64()) == Some(9735) {
                let receipt_id = receipt.get("id").and_then(|v| v.as_str()).map(str::to_string);
                if let Some(request) = find_description_tag(&receipt).and_then(|content| serde_json::from_str::<serde_json::Value>(&content).ok()) {
                    if request.get("kind").and_then(|k| k.as_i64()) == Some(9734) {
                        return Some(ExtractedZap {
                            request,
                            note_id: receipt_id.unwrap_or_else(|| payment.payment_hash.clone()),
                        });
                    }
                }
            }
        }
    }
    if let Some(raw) = &payment.extra_nostr {
        if let Ok(request) = serde_json::from_str::<serde_json::Value>(raw) {
            if request.get("kind").and_then(|k| k.as_i64()) == Some(9734) {
                return Some(ExtractedZap { request, note_id: payment.payment_hash.clone() });
            }
        }
    }
    None
}

fn find_description_tag(receipt: &serde_json::Value) -> Option<String> {
    receipt.get("tags")?.as_array()?.iter().find_map(|tag| {
        let arr = tag.as_array()?;
        if arr.first()?.as_str()? == "description" {
            arr.get(1)?.as_str().map(str::to_string)
        } else {
            None
        }
    })
}

fn find_amount_msat_tag(receipt: &serde_json::Value) -> Option<i64> {
    receipt.get("tags")?.as_array()?.iter().find_map(|tag| {
        let arr = tag.as_array()?;
        if arr.first()?.as_str()? == "amount" {
            arr.get(1)?.as_str()?.parse::<i64>().ok()
        } else {
            None
        }
    })
}

fn find_e_tag(request: &serde_json::Value) -> Option<String> {
    request.get("tags")?.as_array()?.iter().find_map(|tag| {
        let arr = tag.as_array()?;
        if arr.first()?.as_str()? == "e" {
            arr.get(1)?.as_str().map(str::to_string)
        } else {
            None
        }
    })
}

/// Process-local bounded FIFO of recently seen payment hashes, filtering
/// duplicates before dispatch.
struct SeenHashes {
    order: VecDeque<String>,
    set: HashSet<String>,
}

impl SeenHashes {
    fn new() -> Self {
        SeenHashes { order: VecDeque::with_capacity(SEEN_HASHES_CAPACITY), set: HashSet::with_capacity(SEEN_HASHES_CAPACITY) }
    }

    /// Returns true if `hash` was already seen (caller should drop the
    /// payment); otherwise records it and returns false.
    fn check_and_insert(&mut self, hash: &str) -> bool {
        if self.set.contains(hash) {
            return true;
        }
        self.set.insert(hash.to_string());
        self.order.push_back(hash.to_string());
        if self.order.len() > SEEN_HASHES_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.set.remove(&oldest);
            }
        }
        false
    }
}

#[derive(Clone)]
pub struct ZapPipeline {
    store: Store,
    herd: Arc<HerdEngine>,
    nostr: Arc<NostrAdapter>,
    feeder: Arc<FeederAdapter>,
    split_sync: Arc<SplitSynchronizer>,
    payout: Arc<PayoutOrchestrator>,
    metrics: Arc<Metrics>,
    broadcast: Arc<Broadcast>,
    templates: Arc<dyn MessageTemplates>,
    daily_tag_cache: Cache,
    balance: Arc<Mutex<i64>>,
    trigger_amount_sats: i64,
    seen: Arc<Mutex<SeenHashes>>,
    payment_permits: Arc<Semaphore>,
}

impl ZapPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        herd: Arc<HerdEngine>,
        nostr: Arc<NostrAdapter>,
        feeder: Arc<FeederAdapter>,
        split_sync: Arc<SplitSynchronizer>,
        payout: Arc<PayoutOrchestrator>,
        metrics: Arc<Metrics>,
        broadcast: Arc<Broadcast>,
        templates: Arc<dyn MessageTemplates>,
        daily_tag_cache: Cache,
        balance: Arc<Mutex<i64>>,
        trigger_amount_sats: i64,
    ) -> Self {
        ZapPipeline {
            store,
            herd,
            nostr,
            feeder,
            split_sync,
            payout,
            metrics,
            broadcast,
            templates,
            daily_tag_cache,
            balance,
            trigger_amount_sats,
            seen: Arc::new(Mutex::new(SeenHashes::new())),
            payment_permits: Arc::new(Semaphore::new(MAX_CONCURRENT_PAYMENTS)),
        }
    }

    pub async fn handle_payment(&self, payment: PaymentNotification) -> HerdResult<()> {
        if self.seen.lock().await.check_and_insert(&payment.payment_hash) {
            return Ok(());
        }

        let _permit = self.payment_permits.acquire().await.expect("semaphore never closed");

        self.update_balance(&payment).await;
        let amount_sats = payment.amount_msat / 1000;
        let extracted = extract_zap_request(&payment);

        if let Some(extracted) = extracted.clone() {
            let pipeline = self.clone();
            tokio::spawn(async move {
                if let Err(e) = pipeline.handle_cyberherd_candidate(extracted, amount_sats, false).await {
                    tracing::warn!(error = %e, "cyberherd background task failed");
                }
            });
        }

        self.run_generic_path(amount_sats, extracted.is_some()).await
    }

    async fn update_balance(&self, payment: &PaymentNotification) {
        let mut balance = self.balance.lock().await;
        match payment.wallet_balance {
            Some(b) if b >= 0 => *balance = b,
            _ => *balance += payment.amount_msat / 1000,
        }
    }

    async fn run_generic_path(&self, amount_sats: i64, is_zap: bool) -> HerdResult<()> {
        let mut triggered = false;

        if amount_sats > 0 && self.feeder.is_override_off().await? {
            let balance = *self.balance.lock().await;
            if balance >= self.trigger_amount_sats {
                match self.feeder.trigger().await {
                    Ok(()) => {
                        self.metrics.record_feeder_trigger().await?;
                        self.payout.trigger_payout(balance).await?;
                        let rendered = self.templates.render(EventTag::FeederTriggered, &vec![("amount", balance.to_string())]);
                        self.broadcast.publish(rendered.text).await;
                        triggered = true;
                    }
                    Err(e) => tracing::warn!(error = %e, "feeder trigger failed"),
                }
            }
        }

        if !triggered && amount_sats >= GENERIC_MESSAGE_MIN_SATS && !is_zap {
            self.publish_generic_sats_message(amount_sats).await?;
        }

        Ok(())
    }

    async fn publish_generic_sats_message(&self, sats: i64) -> HerdResult<()> {
        let balance = *self.balance.lock().await;
        let difference = (self.trigger_amount_sats - balance).max(0);
        let rendered = self.templates.render(EventTag::SatsReceived, &vec![("new_amount", sats.to_string()), ("difference", difference.to_string())]);
        self.broadcast.publish(rendered.text).await;
        Ok(())
    }

    /// `is_recovery` restricts the effect to new admissions: an
    /// already-active herd member must not have `amount`/`payouts`
    /// accumulated a second time for a zap that live traffic already
    /// processed before the restart.
    async fn handle_cyberherd_candidate(&self, extracted: ExtractedZap, amount_sats: i64, is_recovery: bool) -> HerdResult<()> {
        let Some(pubkey_hex) = extracted.request.get("pubkey").and_then(|v| v.as_str()).map(str::to_string) else {
            return Ok(());
        };
        let Some(e_tag_hex) = find_e_tag(&extracted.request) else {
            return Ok(());
        };
        let zapped_event_id = EventId::from_hex(&e_tag_hex).map_err(|e| HerdError::protocol(format!("invalid e-tag: {e}")))?;
        let zapper_pubkey = PublicKey::from_hex(&pubkey_hex).map_err(|e| HerdError::protocol(format!("invalid zapper pubkey: {e}")))?;

        let existing_member = self.store.get_member(&pubkey_hex).await?;
        let is_active_member = existing_member.as_ref().map(|m| m.is_active).unwrap_or(false);

        if is_recovery && is_active_member {
            return Ok(());
        }

        let admissible = if is_active_member { true } else { self.is_herd_tagged(&zapped_event_id).await? };

        if !admissible {
            if amount_sats >= GENERIC_MESSAGE_MIN_SATS {
                self.publish_generic_sats_message(amount_sats).await?;
            }
            return Ok(());
        }

        let (display_name, lud16, nprofile, picture, relays) = match &existing_member {
            Some(m) => (m.display_name.clone(), m.lud16.clone(), m.nprofile.clone(), m.picture.clone(), m.relays.clone()),
            None => {
                let metadata = self.nostr.lookup_metadata(&zapper_pubkey).await?;
                let Some(lud16) = metadata.lud16.filter(|l| is_valid_lud16(l)) else {
                    tracing::warn!(pubkey = %pubkey_hex, "no resolvable lud16 for candidate; dropping");
                    return Ok(());
                };
                let relays = self.nostr.lookup_relay_list(&zapper_pubkey).await.unwrap_or_default();
                let nprofile = encode_nprofile(&zapper_pubkey, &relays).unwrap_or_default();
                (metadata.display_name.unwrap_or_else(|| DEFAULT_DISPLAY_NAME.to_string()), lud16, nprofile, metadata.picture, relays)
            }
        };

        let candidate = Candidate {
            pubkey: pubkey_hex,
            display_name,
            lud16,
            nprofile,
            picture,
            relays,
            event_id: zapped_event_id.to_hex(),
            note: Some(extracted.note_id),
            kinds: BTreeSet::from([9735]),
            amount: amount_sats,
        };

        let outcome = self.herd.process_candidate(candidate, false, existing_member).await?;
        self.metrics.record_cyberherd_payment().await?;
        self.handle_outcome(outcome).await
    }

    /// Replays a zap receipt discovered during startup recovery. Skips
    /// the feeder/generic-payment path entirely: recovery only concerns
    /// itself with herd admission for payments that were missed.
    pub async fn replay_zap_receipt(&self, receipt_json: &str) -> HerdResult<()> {
        let receipt: serde_json::Value = serde_json::from_str(receipt_json).map_err(|e| HerdError::protocol(format!("malformed zap receipt: {e}")))?;
        let receipt_id = receipt
            .get("id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| HerdError::protocol("zap receipt missing id"))?;
        let request = find_description_tag(&receipt)
            .and_then(|content| serde_json::from_str::<serde_json::Value>(&content).ok())
            .ok_or_else(|| HerdError::protocol("zap receipt missing embedded zap request"))?;
        let amount_sats = find_amount_msat_tag(&receipt).map(|msat| msat / 1000).unwrap_or(0);
        let extracted = ExtractedZap { request, note_id: receipt_id };
        self.handle_cyberherd_candidate(extracted, amount_sats, true).await
    }

    async fn is_herd_tagged(&self, event_id: &EventId) -> HerdResult<bool> {
        let cache_key = format!("herd_tag:{}", event_id.to_hex());
        if self.daily_tag_cache.has_fresh(&cache_key).await? {
            return Ok(true);
        }
        let tagged = self.nostr.has_cyberherd_tag(event_id).await?;
        if tagged {
            let ttl = crate::clock::duration_until_next_midnight().as_secs() as i64;
            self.daily_tag_cache.set(&cache_key, "1", ttl).await?;
        }
        Ok(tagged)
    }

    async fn handle_outcome(&self, outcome: Outcome) -> HerdResult<()> {
        match outcome {
            Outcome::DuplicateSkipped => {}
            Outcome::NewAdmission { pubkey, amount, payouts } => {
                self.split_sync.sync(false).await?;
                self.publish_welcome(&pubkey, amount, payouts).await;
            }
            Outcome::Accumulated { .. } | Outcome::Reactivated { .. } => {
                self.split_sync.sync(false).await?;
            }
            Outcome::HeadbuttQueued(candidate) => {
                let results = self.herd.process_headbutting_attempts(vec![candidate]).await?;
                for result in results {
                    self.publish_headbutt_result(result).await;
                }
                self.split_sync.sync(false).await?;
            }
        }
        Ok(())
    }

    async fn publish_welcome(&self, pubkey: &str, amount: i64, payouts: f64) {
        let rendered = self.templates.render(
            EventTag::CyberHerd,
            &vec![("pubkey", pubkey.to_string()), ("amount", amount.to_string()), ("payouts", payouts.to_string())],
        );
        self.broadcast.publish(rendered.text).await;
    }

    async fn publish_headbutt_result(&self, result: HeadbuttResult) {
        match result {
            HeadbuttResult::CooldownActive { .. } => {}
            HeadbuttResult::AdmittedFreeSlot { pubkey, amount } => {
                self.publish_welcome(&pubkey, amount, crate::payout_calc::calc(amount)).await;
            }
            HeadbuttResult::Success { winner, loser, amount } => {
                let rendered = self.templates.render(
                    EventTag::HeadbuttSuccess,
                    &vec![("winner", winner), ("loser", loser), ("amount", amount.to_string())],
                );
                self.broadcast.publish(rendered.text).await;
            }
            HeadbuttResult::Failure { pubkey, required } => {
                let rendered = self.templates.render(EventTag::HeadbuttFailure, &vec![("pubkey", pubkey), ("required", required.to_string())]);
                self.broadcast.publish(rendered.text).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notification(description: Option<&str>, extra_nostr: Option<&str>) -> PaymentNotification {
        PaymentNotification {
            payment_hash: "h".repeat(64),
            amount_msat: 50_000,
            description: description.map(str::to_string),
            extra_nostr: extra_nostr.map(str::to_string),
            wallet_balance: None,
        }
    }

    #[test]
    fn extracts_zap_request_from_receipt_description_tag() {
        let request = serde_json::json!({"kind": 9734, "pubkey": "abc", "tags": [["e", "deadbeef"]]});
        let receipt = serde_json::json!({
            "kind": 9735,
            "id": "receipt123",
            "tags": [["description", request.to_string()]],
        });
        let payment = notification(Some(&receipt.to_string()), None);
        let extracted = extract_zap_request(&payment).unwrap();
        assert_eq!(extracted.note_id, "receipt123");
        assert_eq!(extracted.request["pubkey"], "abc");
    }

    #[test]
    fn extracts_zap_request_directly_from_extra_nostr() {
        let request = serde_json::json!({"kind": 9734, "pubkey": "xyz", "tags": []});
        let payment = notification(None, Some(&request.to_string()));
        let extracted = extract_zap_request(&payment).unwrap();
        assert_eq!(extracted.note_id, payment.payment_hash);
        assert_eq!(extracted.request["pubkey"], "xyz");
    }

    #[test]
    fn no_zap_request_present_returns_none() {
        let payment = notification(None, None);
        assert!(extract_zap_request(&payment).is_none());
    }

    #[test]
    fn finds_e_tag_value() {
        let request = serde_json::json!({"tags": [["p", "someone"], ["e", "deadbeef"]]});
        assert_eq!(find_e_tag(&request), Some("deadbeef".to_string()));
    }

    #[test]
    fn seen_hashes_dedupes_and_evicts_oldest() {
        let mut seen = SeenHashes::new();
        assert!(!seen.check_and_insert("a"));
        assert!(seen.check_and_insert("a"));

        for i in 0..SEEN_HASHES_CAPACITY {
            seen.check_and_insert(&format!("h{i}"));
        }
        // "a" should have been evicted by now.
        assert!(!seen.check_and_insert("a"));
    }
}
