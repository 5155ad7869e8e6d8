//! Pure payout-share arithmetic and per-event engagement crediting.

use std::collections::BTreeSet;

/// Payout-share increment for a zap of `sats`: one percentage point per 10
/// sats, floor division, capped at 1.0.
pub fn calc(sats: i64) -> f64 {
    if sats < 10 {
        return 0.0;
    }
    let units = (sats / 10) as f64;
    (units * 0.01).min(1.0)
}

/// Repost (kind 6) and reaction (kind 7) engagement increments, credited
/// only the first time a kind is seen for a member.
const REPOST_KIND: u16 = 6;
const REACTION_KIND: u16 = 7;

fn engagement_increment(kind: u16) -> f64 {
    match kind {
        REPOST_KIND => 0.2,
        REACTION_KIND => 0.0,
        _ => 0.0,
    }
}

/// Computes the payout increment and merged kinds set for an incoming
/// event against a member's current kinds. `zap_amount` is the sats amount
/// if kind 9735 (a zap receipt) is among `incoming_kinds`; ignored
/// otherwise.
pub fn calculate_member_update(
    incoming_kinds: &BTreeSet<u16>,
    current_kinds: &BTreeSet<u16>,
    zap_amount: i64,
) -> (f64, BTreeSet<u16>) {
    let mut increment = 0.0;

    if incoming_kinds.contains(&9735) {
        increment += calc(zap_amount);
    }

    for kind in incoming_kinds {
        if (*kind == REPOST_KIND || *kind == REACTION_KIND) && !current_kinds.contains(kind) {
            increment += engagement_increment(*kind);
        }
    }

    let merged = current_kinds.union(incoming_kinds).copied().collect();
    (increment, merged)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calc_below_minimum_is_zero() {
        assert_eq!(calc(9), 0.0);
    }

    #[test]
    fn calc_floors_to_whole_units_of_ten() {
        assert_eq!(calc(50), 0.05);
        assert_eq!(calc(55), 0.05);
        assert_eq!(calc(80), 0.08);
    }

    #[test]
    fn calc_caps_at_one() {
        assert_eq!(calc(100_000), 1.0);
    }

    #[test]
    fn repost_credited_once() {
        let current: BTreeSet<u16> = BTreeSet::new();
        let (inc, merged) = calculate_member_update(&[6].into_iter().collect(), &current, 0);
        assert_eq!(inc, 0.2);
        assert!(merged.contains(&6));

        let (inc2, _) = calculate_member_update(&[6].into_iter().collect(), &merged, 0);
        assert_eq!(inc2, 0.0, "repost already credited must not re-credit");
    }

    #[test]
    fn reaction_contributes_nothing_but_is_tracked() {
        let current: BTreeSet<u16> = BTreeSet::new();
        let (inc, merged) = calculate_member_update(&[7].into_iter().collect(), &current, 0);
        assert_eq!(inc, 0.0);
        assert!(merged.contains(&7));
    }

    #[test]
    fn zap_kind_uses_amount() {
        let current: BTreeSet<u16> = BTreeSet::new();
        let (inc, _) = calculate_member_update(&[9735].into_iter().collect(), &current, 50);
        assert_eq!(inc, 0.05);
    }
}
