//! Recomputes the 90/10 split between the predefined fallback wallet and
//! the active herd, proportional to `payouts`, and pushes it to the
//! Wallet Adapter. Rate-limited to one push per 3 s unless forced.

use crate::cache::Cache;
use crate::error::HerdResult;
use crate::model::HerdMember;
use crate::store::Store;
use crate::wallet_adapter::{SplitTarget, WalletAdapter};

const RATE_LIMIT_SECS: i64 = 3;
const RATE_LIMIT_CACHE_KEY: &str = "split_sync:last_push";
const MAX_MEMBER_TARGETS: usize = 10;
const MEMBER_POOL_PERCENT: u32 = 10;
const FALLBACK_PERCENT_WITH_MEMBERS: u32 = 90;

pub struct SplitSynchronizer {
    store: Store,
    cache: Cache,
    wallet: WalletAdapter,
    fallback_address: String,
    fallback_alias: String,
}

impl SplitSynchronizer {
    pub fn new(store: Store, cache: Cache, wallet: WalletAdapter, fallback_address: String, fallback_alias: String) -> Self {
        SplitSynchronizer { store, cache, wallet, fallback_address, fallback_alias }
    }

    /// Recomputes and pushes split targets. Returns `Ok(None)` when
    /// skipped by the rate limit (force=false and a push happened within
    /// the last `RATE_LIMIT_SECS`).
    pub async fn sync(&self, force: bool) -> HerdResult<Option<Vec<SplitTarget>>> {
        if !force && self.cache.has_fresh(RATE_LIMIT_CACHE_KEY).await? {
            return Ok(None);
        }

        let members = self.store.active_members().await?;
        let targets = build_targets(&members, &self.fallback_address, &self.fallback_alias);
        self.wallet.write_split_targets(&targets).await?;
        self.cache.set(RATE_LIMIT_CACHE_KEY, "1", RATE_LIMIT_SECS).await?;
        Ok(Some(targets))
    }
}

fn build_targets(members: &[HerdMember], fallback_address: &str, fallback_alias: &str) -> Vec<SplitTarget> {
    let eligible: Vec<&HerdMember> = members.iter().filter(|m| !m.lud16.is_empty()).collect();

    if eligible.is_empty() {
        return vec![SplitTarget { wallet: fallback_address.to_string(), alias: fallback_alias.to_string(), percent: 100 }];
    }

    let mut ranked = eligible;
    ranked.sort_by(|a, b| b.payouts.partial_cmp(&a.payouts).unwrap_or(std::cmp::Ordering::Equal));
    ranked.truncate(MAX_MEMBER_TARGETS);

    let total_payouts: f64 = ranked.iter().map(|m| m.payouts).sum();
    let mut percents = vec![1u32; ranked.len()];
    let mut remaining = MEMBER_POOL_PERCENT.saturating_sub(ranked.len() as u32);

    if total_payouts > 0.0 {
        let mut fractional = Vec::with_capacity(ranked.len());
        for (i, member) in ranked.iter().enumerate() {
            let share = (member.payouts / total_payouts) * remaining as f64;
            let whole = share.floor() as u32;
            percents[i] += whole;
            fractional.push((i, share - whole as f64));
        }
        let assigned: u32 = percents.iter().sum::<u32>() - ranked.len() as u32;
        let mut leftover = remaining.saturating_sub(assigned);
        fractional.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        for (i, _) in fractional {
            if leftover == 0 {
                break;
            }
            percents[i] += 1;
            leftover -= 1;
        }
        remaining = 0;
    }

    // No payouts recorded yet (shouldn't normally happen): leave the 1%
    // floors and dump the rest onto the top-ranked member.
    if remaining > 0 {
        percents[0] += remaining;
    }

    let mut targets = vec![SplitTarget {
        wallet: fallback_address.to_string(),
        alias: fallback_alias.to_string(),
        percent: FALLBACK_PERCENT_WITH_MEMBERS,
    }];
    for (member, percent) in ranked.iter().zip(percents) {
        targets.push(SplitTarget { wallet: member.lud16.clone(), alias: member.display_name.clone(), percent });
    }
    targets
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn member(lud16: &str, payouts: f64) -> HerdMember {
        HerdMember {
            pubkey: lud16.to_string(),
            display_name: lud16.to_string(),
            lud16: lud16.to_string(),
            nprofile: String::new(),
            picture: None,
            relays: vec![],
            event_id: "e".repeat(64),
            note: "n".repeat(64),
            kinds: BTreeSet::new(),
            amount: 0,
            payouts,
            is_active: true,
            notified: None,
        }
    }

    #[test]
    fn empty_herd_routes_everything_to_fallback() {
        let targets = build_targets(&[], "fallback@x.com", "Fallback");
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].percent, 100);
    }

    #[test]
    fn single_member_gets_remaining_ten_percent() {
        let members = vec![member("a@x.com", 0.5)];
        let targets = build_targets(&members, "fallback@x.com", "Fallback");
        let total: u32 = targets.iter().map(|t| t.percent).sum();
        assert_eq!(total, 100);
        assert_eq!(targets[0].percent, 90);
        assert_eq!(targets[1].percent, 10);
    }

    #[test]
    fn distribution_is_proportional_and_sums_to_one_hundred() {
        let members = vec![member("a@x.com", 0.8), member("b@x.com", 0.1), member("c@x.com", 0.1)];
        let targets = build_targets(&members, "fallback@x.com", "Fallback");
        let total: u32 = targets.iter().map(|t| t.percent).sum();
        assert_eq!(total, 100);
        assert!(targets.iter().skip(1).all(|t| t.percent >= 1));
        // highest payouts member should get the largest slice of the 10%.
        assert!(targets[1].percent >= targets[2].percent);
        assert!(targets[1].percent >= targets[3].percent);
    }

    #[test]
    fn caps_at_ten_members_by_payouts_descending() {
        let members: Vec<HerdMember> = (0..15).map(|i| member(&format!("m{i}@x.com"), i as f64 / 10.0)).collect();
        let targets = build_targets(&members, "fallback@x.com", "Fallback");
        assert_eq!(targets.len(), 1 + MAX_MEMBER_TARGETS);
        let total: u32 = targets.iter().map(|t| t.percent).sum();
        assert_eq!(total, 100);
    }
}
