//! Core data model. `HerdMember`, `ProcessedZap`, `CacheEntry`, and
//! `PaymentMetrics` map directly onto the `cyber_herd`,
//! `processed_zap_events`, `cache`, and `payment_metrics` tables.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub const DEFAULT_DISPLAY_NAME: &str = "Anon";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HerdMember {
    pub pubkey: String,
    pub display_name: String,
    pub lud16: String,
    pub nprofile: String,
    pub picture: Option<String>,
    pub relays: Vec<String>,
    pub event_id: String,
    pub note: String,
    pub kinds: BTreeSet<u16>,
    pub amount: i64,
    pub payouts: f64,
    pub is_active: bool,
    pub notified: Option<String>,
}

impl HerdMember {
    pub fn kinds_to_string(&self) -> String {
        self.kinds
            .iter()
            .map(|k| k.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn parse_kinds(s: &str) -> BTreeSet<u16> {
        s.split(',')
            .filter_map(|tok| tok.trim().parse::<u16>().ok())
            .collect()
    }
}

/// Validates `local@domain` with a non-empty TLD, lowercased comparison.
pub fn is_valid_lud16(lud16: &str) -> bool {
    let lud16 = lud16.trim();
    let Some((local, domain)) = lud16.split_once('@') else {
        return false;
    };
    if local.is_empty() || domain.is_empty() {
        return false;
    }
    if domain.contains('@') {
        return false;
    }
    match domain.rsplit_once('.') {
        Some((_, tld)) => !tld.is_empty(),
        None => false,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ZapStatus {
    Processing,
    Completed,
    Failed,
}

impl ZapStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ZapStatus::Processing => "processing",
            ZapStatus::Completed => "completed",
            ZapStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "processing" => Some(ZapStatus::Processing),
            "completed" => Some(ZapStatus::Completed),
            "failed" => Some(ZapStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessedZap {
    pub zap_event_id: String,
    pub pubkey: String,
    pub original_event_id: String,
    pub amount: i64,
    pub processed_at: i64,
    pub status: ZapStatus,
}

/// A zap is considered stuck in `processing` after this many seconds.
pub const STUCK_PROCESSING_SECS: i64 = 600;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub value: String,
    pub expires_at: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PaymentMetrics {
    pub total_payments: u64,
    pub cyberherd_payments_detected: u64,
    pub regular_payments_processed: u64,
    pub feeder_triggers: u64,
    pub failed_payments: u64,
    pub session_start: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lud16_requires_local_and_domain_with_tld() {
        assert!(is_valid_lud16("alice@getalby.com"));
        assert!(!is_valid_lud16("alice@"));
        assert!(!is_valid_lud16("@getalby.com"));
        assert!(!is_valid_lud16("alice@localhost"));
        assert!(!is_valid_lud16("not-an-address"));
    }

    #[test]
    fn kinds_roundtrip_through_canonical_string() {
        let mut m = sample_member();
        m.kinds = [9735, 6, 7].into_iter().collect();
        let s = m.kinds_to_string();
        assert_eq!(s, "6,7,9735");
        assert_eq!(HerdMember::parse_kinds(&s), m.kinds);
    }

    fn sample_member() -> HerdMember {
        HerdMember {
            pubkey: "a".repeat(64),
            display_name: DEFAULT_DISPLAY_NAME.to_string(),
            lud16: "a@b.com".to_string(),
            nprofile: String::new(),
            picture: None,
            relays: vec![],
            event_id: "e".repeat(64),
            note: "n".repeat(64),
            kinds: BTreeSet::new(),
            amount: 0,
            payouts: 0.0,
            is_active: true,
            notified: None,
        }
    }
}
