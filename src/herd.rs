//! Bounded-capacity herd admission: the decision table, accumulation,
//! competitive displacement ("headbutting"), and daily reset. All
//! admission decisions run under `herd_mutex` so the capacity invariant
//! holds across concurrent candidates.

use crate::cache::Cache;
use crate::error::HerdResult;
use crate::model::HerdMember;
use crate::payout_calc::calc;
use crate::store::{ClaimOutcome, Store};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::sync::Mutex;

const HEADBUTT_COOLDOWN_SECS: i64 = 5;
const HEADBUTT_COOLDOWN_CACHE_KEY: &str = "headbutt:cooldown";

#[derive(Clone, Debug)]
pub struct Candidate {
    pub pubkey: String,
    pub display_name: String,
    pub lud16: String,
    pub nprofile: String,
    pub picture: Option<String>,
    pub relays: Vec<String>,
    pub event_id: String,
    /// Zap receipt id, when this candidate arose from a zap. `None`
    /// candidates skip the duplicate guard entirely.
    pub note: Option<String>,
    pub kinds: BTreeSet<u16>,
    pub amount: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The duplicate guard found a completed or fresh-processing row;
    /// no herd mutation happened.
    DuplicateSkipped,
    NewAdmission { pubkey: String, amount: i64, payouts: f64 },
    Accumulated { pubkey: String, amount: i64, payouts: f64 },
    Reactivated { pubkey: String, amount: i64, payouts: f64 },
    /// Herd is full; candidate was handed to the headbutt queue.
    HeadbuttQueued(Candidate),
}

#[derive(Debug, Clone, PartialEq)]
pub enum HeadbuttResult {
    /// Global cooldown has not elapsed; attempt skipped entirely.
    CooldownActive { pubkey: String },
    /// A slot opened up (e.g. daily reset) since the candidate queued.
    AdmittedFreeSlot { pubkey: String, amount: i64 },
    Success { winner: String, loser: String, amount: i64 },
    Failure { pubkey: String, required: i64 },
}

pub struct HerdEngine {
    store: Store,
    cache: Cache,
    herd_mutex: Mutex<()>,
    max_herd_size: usize,
    headbutt_min_sats: i64,
}

impl HerdEngine {
    pub fn new(store: Store, cache: Cache, max_herd_size: usize, headbutt_min_sats: i64) -> Self {
        HerdEngine {
            store,
            cache,
            herd_mutex: Mutex::new(()),
            max_herd_size,
            headbutt_min_sats,
        }
    }

    /// The single admission/update entry point.
    ///
    /// `preloaded_record` lets callers that already hold the member row
    /// (e.g. recovery re-checking the same note repeatedly) skip a store
    /// round-trip.
    pub async fn process_candidate(
        &self,
        candidate: Candidate,
        skip_duplicate_check: bool,
        preloaded_record: Option<HerdMember>,
    ) -> HerdResult<Outcome> {
        if let Some(note) = candidate.note.as_deref() {
            if !skip_duplicate_check {
                match self.store.claim_zap(note, &candidate.pubkey, &candidate.event_id, candidate.amount).await? {
                    ClaimOutcome::ShouldProcess => {}
                    ClaimOutcome::AlreadyCompleted | ClaimOutcome::AlreadyProcessing => {
                        return Ok(Outcome::DuplicateSkipped);
                    }
                }
            }
        }

        let result = self.admit_locked(&candidate, preloaded_record).await;

        if let Some(note) = candidate.note.as_deref() {
            if !skip_duplicate_check {
                match &result {
                    Ok(_) => self.store.mark_zap_completed(note).await?,
                    Err(_) => self.store.mark_zap_failed(note).await?,
                }
            }
        }

        result
    }

    async fn admit_locked(&self, candidate: &Candidate, preloaded_record: Option<HerdMember>) -> HerdResult<Outcome> {
        let _guard = self.herd_mutex.lock().await;

        let existing = match preloaded_record {
            Some(m) => Some(m),
            None => self.store.get_member(&candidate.pubkey).await?,
        };

        match existing {
            Some(member) if member.is_active => {
                let updated = accumulate(&member, candidate);
                let (amount, payouts) = (updated.amount, updated.payouts);
                self.store.upsert_member(updated).await?;
                Ok(Outcome::Accumulated { pubkey: candidate.pubkey.clone(), amount, payouts })
            }
            Some(member) => {
                let active_count = self.store.active_count().await?;
                if (active_count as usize) < self.max_herd_size {
                    let updated = accumulate(&member, candidate);
                    let (amount, payouts) = (updated.amount, updated.payouts);
                    self.store.upsert_member(updated).await?;
                    Ok(Outcome::Reactivated { pubkey: candidate.pubkey.clone(), amount, payouts })
                } else {
                    Ok(Outcome::HeadbuttQueued(candidate.clone()))
                }
            }
            None => {
                let active_count = self.store.active_count().await?;
                if (active_count as usize) < self.max_herd_size {
                    let payouts = calc(candidate.amount);
                    let member = new_member(candidate, candidate.amount, payouts);
                    self.store.upsert_member(member).await?;
                    Ok(Outcome::NewAdmission { pubkey: candidate.pubkey.clone(), amount: candidate.amount, payouts })
                } else {
                    Ok(Outcome::HeadbuttQueued(candidate.clone()))
                }
            }
        }
    }

    /// Evaluates queued candidates in descending `amount` order. Candidates
    /// below `headbutt_min_sats` are dropped before the lowest-member
    /// computation and never produce a result (no failure message).
    pub async fn process_headbutting_attempts(&self, mut queued: Vec<Candidate>) -> HerdResult<Vec<HeadbuttResult>> {
        queued.retain(|c| c.amount >= self.headbutt_min_sats);
        queued.sort_by(|a, b| b.amount.cmp(&a.amount));
        let mut results = Vec::with_capacity(queued.len());
        for candidate in queued {
            results.push(self.attempt_headbutt(&candidate).await?);
        }
        Ok(results)
    }

    async fn attempt_headbutt(&self, candidate: &Candidate) -> HerdResult<HeadbuttResult> {
        let _guard = self.herd_mutex.lock().await;

        if self.cache.has_fresh(HEADBUTT_COOLDOWN_CACHE_KEY).await? {
            return Ok(HeadbuttResult::CooldownActive { pubkey: candidate.pubkey.clone() });
        }

        let active_count = self.store.active_count().await?;
        if (active_count as usize) < self.max_herd_size {
            let existing = self.store.get_member(&candidate.pubkey).await?;
            let member = match existing {
                Some(m) => accumulate(&m, candidate),
                None => new_member(candidate, candidate.amount, calc(candidate.amount)),
            };
            self.store.upsert_member(member).await?;
            return Ok(HeadbuttResult::AdmittedFreeSlot { pubkey: candidate.pubkey.clone(), amount: candidate.amount });
        }

        let mut active = self.store.active_members().await?;
        active.sort_by(|a, b| a.amount.cmp(&b.amount).then_with(|| a.pubkey.cmp(&b.pubkey)));
        let Some(lowest) = active.into_iter().next() else {
            // Shouldn't happen (active_count >= max_herd_size > 0), but fall
            // back to free-slot admission rather than panicking.
            let member = new_member(candidate, candidate.amount, calc(candidate.amount));
            self.store.upsert_member(member).await?;
            return Ok(HeadbuttResult::AdmittedFreeSlot { pubkey: candidate.pubkey.clone(), amount: candidate.amount });
        };

        let required = (lowest.amount + 1).max(self.headbutt_min_sats);
        if candidate.amount < required {
            return Ok(HeadbuttResult::Failure { pubkey: candidate.pubkey.clone(), required });
        }

        self.store.deactivate_member_and_zero(&lowest.pubkey).await?;
        let existing = self.store.get_member(&candidate.pubkey).await?;
        let member = match existing {
            Some(m) => accumulate(&m, candidate),
            None => new_member(candidate, candidate.amount, calc(candidate.amount)),
        };
        self.store.upsert_member(member).await?;
        self.cache.set(HEADBUTT_COOLDOWN_CACHE_KEY, "1", HEADBUTT_COOLDOWN_SECS).await?;

        Ok(HeadbuttResult::Success {
            winner: candidate.pubkey.clone(),
            loser: lowest.pubkey,
            amount: candidate.amount,
        })
    }

    /// Removes all herd rows for the new day (Open Question resolved in
    /// favor of deletion over deactivate-and-zero, see DESIGN.md).
    pub async fn daily_reset(&self) -> HerdResult<()> {
        let _guard = self.herd_mutex.lock().await;
        self.store.daily_reset_herd().await
    }
}

fn accumulate(existing: &HerdMember, candidate: &Candidate) -> HerdMember {
    let (increment, merged_kinds) = crate::payout_calc::calculate_member_update(&candidate.kinds, &existing.kinds, candidate.amount);
    HerdMember {
        pubkey: existing.pubkey.clone(),
        display_name: existing.display_name.clone(),
        lud16: existing.lud16.clone(),
        nprofile: existing.nprofile.clone(),
        picture: existing.picture.clone(),
        relays: existing.relays.clone(),
        event_id: existing.event_id.clone(),
        note: existing.note.clone(),
        kinds: merged_kinds,
        amount: existing.amount + candidate.amount,
        payouts: (existing.payouts + increment).min(1.0),
        is_active: true,
        notified: existing.notified.clone(),
    }
}

fn new_member(candidate: &Candidate, amount: i64, payouts: f64) -> HerdMember {
    HerdMember {
        pubkey: candidate.pubkey.clone(),
        display_name: candidate.display_name.clone(),
        lud16: candidate.lud16.clone(),
        nprofile: candidate.nprofile.clone(),
        picture: candidate.picture.clone(),
        relays: candidate.relays.clone(),
        event_id: candidate.event_id.clone(),
        note: candidate.note.clone().unwrap_or_default(),
        kinds: candidate.kinds.clone(),
        amount,
        payouts,
        is_active: true,
        notified: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(pubkey: &str, amount: i64) -> Candidate {
        Candidate {
            pubkey: pubkey.to_string(),
            display_name: "Anon".to_string(),
            lud16: "a@b.com".to_string(),
            nprofile: String::new(),
            picture: None,
            relays: vec![],
            event_id: "e".repeat(64),
            note: Some(format!("{pubkey}-{amount}-note").chars().cycle().take(64).collect()),
            kinds: BTreeSet::from([9735]),
            amount,
        }
    }

    async fn engine() -> HerdEngine {
        let store = Store::open(":memory:").unwrap();
        let cache = Cache::new(store.clone());
        HerdEngine::new(store, cache, 3, 10)
    }

    #[tokio::test]
    async fn new_candidate_is_admitted_when_space_available() {
        let engine = engine().await;
        let outcome = engine.process_candidate(candidate("A", 50), false, None).await.unwrap();
        assert_eq!(outcome, Outcome::NewAdmission { pubkey: "A".to_string(), amount: 50, payouts: 0.05 });
    }

    #[tokio::test]
    async fn active_member_accumulates() {
        let engine = engine().await;
        engine.process_candidate(candidate("A", 50), false, None).await.unwrap();
        let outcome = engine.process_candidate(candidate("A", 30), false, None).await.unwrap();
        assert_eq!(outcome, Outcome::Accumulated { pubkey: "A".to_string(), amount: 80, payouts: 0.08 });
    }

    #[tokio::test]
    async fn full_herd_queues_new_candidate_for_headbutt() {
        let engine = engine().await;
        engine.process_candidate(candidate("A", 80), false, None).await.unwrap();
        engine.process_candidate(candidate("B", 200), false, None).await.unwrap();
        engine.process_candidate(candidate("C", 500), false, None).await.unwrap();
        let outcome = engine.process_candidate(candidate("D", 9), false, None).await.unwrap();
        assert!(matches!(outcome, Outcome::HeadbuttQueued(_)));
    }

    #[tokio::test]
    async fn headbutt_below_min_sats_is_silently_dropped() {
        let engine = engine().await;
        engine.process_candidate(candidate("A", 80), false, None).await.unwrap();
        engine.process_candidate(candidate("B", 200), false, None).await.unwrap();
        engine.process_candidate(candidate("C", 500), false, None).await.unwrap();

        let results = engine.process_headbutting_attempts(vec![candidate("D", 9)]).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn headbutt_above_min_sats_but_below_lowest_fails() {
        let engine = engine().await;
        engine.process_candidate(candidate("A", 80), false, None).await.unwrap();
        engine.process_candidate(candidate("B", 200), false, None).await.unwrap();
        engine.process_candidate(candidate("C", 500), false, None).await.unwrap();

        let results = engine.process_headbutting_attempts(vec![candidate("D", 15)]).await.unwrap();
        assert_eq!(results, vec![HeadbuttResult::Failure { pubkey: "D".to_string(), required: 81 }]);
    }

    #[tokio::test]
    async fn headbutt_success_replaces_lowest_member() {
        let engine = engine().await;
        engine.process_candidate(candidate("A", 80), false, None).await.unwrap();
        engine.process_candidate(candidate("B", 200), false, None).await.unwrap();
        engine.process_candidate(candidate("C", 500), false, None).await.unwrap();

        let results = engine.process_headbutting_attempts(vec![candidate("D", 120)]).await.unwrap();
        assert_eq!(
            results,
            vec![HeadbuttResult::Success { winner: "D".to_string(), loser: "A".to_string(), amount: 120 }]
        );

        let loser = engine.store.get_member("A").await.unwrap().unwrap();
        assert!(!loser.is_active);
        assert_eq!(loser.amount, 0);

        assert_eq!(engine.store.active_count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn second_headbutt_within_cooldown_is_skipped() {
        let engine = engine().await;
        engine.process_candidate(candidate("A", 80), false, None).await.unwrap();
        engine.process_candidate(candidate("B", 200), false, None).await.unwrap();
        engine.process_candidate(candidate("C", 500), false, None).await.unwrap();

        engine.process_headbutting_attempts(vec![candidate("D", 120)]).await.unwrap();
        let results = engine.process_headbutting_attempts(vec![candidate("E", 999)]).await.unwrap();
        assert_eq!(results, vec![HeadbuttResult::CooldownActive { pubkey: "E".to_string() }]);
    }

    #[tokio::test]
    async fn duplicate_zap_id_is_skipped_on_second_delivery() {
        let engine = engine().await;
        let c = candidate("A", 50);
        engine.process_candidate(c.clone(), false, None).await.unwrap();
        let second = engine.process_candidate(c, false, None).await.unwrap();
        assert_eq!(second, Outcome::DuplicateSkipped);
    }

    #[tokio::test]
    async fn daily_reset_clears_herd() {
        let engine = engine().await;
        engine.process_candidate(candidate("A", 50), false, None).await.unwrap();
        engine.daily_reset().await.unwrap();
        assert_eq!(engine.store.active_count().await.unwrap(), 0);
    }
}
