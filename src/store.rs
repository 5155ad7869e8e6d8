//! Durable key/value + relational store. One SQLite file (or `:memory:`)
//! behind a `tokio::task::spawn_blocking` facade that bridges the
//! synchronous `rusqlite` driver into async code. All multi-statement
//! writes run inside a single transaction; callers never nest transactions.

use crate::clock::now_epoch_secs;
use crate::error::{HerdError, HerdResult};
use crate::model::{CacheEntry, HerdMember, PaymentMetrics, ProcessedZap, ZapStatus, STUCK_PROCESSING_SECS};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Arc, Mutex};

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

/// Outcome of the atomic duplicate-zap claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// No prior row, or the prior row was stale/terminal-but-retryable:
    /// caller should proceed with processing.
    ShouldProcess,
    /// A `completed` row already exists: caller must return without side effects.
    AlreadyCompleted,
    /// A `processing` row exists and is still fresh: caller must return.
    AlreadyProcessing,
}

impl Store {
    /// Opens (and initializes the schema of) the store at `path`. Use
    /// `":memory:"` for ephemeral/test stores.
    pub fn open(path: &str) -> HerdResult<Self> {
        let conn = Connection::open(path)?;
        let store = Store {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> HerdResult<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        (|| -> rusqlite::Result<()> {
            conn.execute_batch(
                "
                CREATE TABLE IF NOT EXISTS cyber_herd (
                    pubkey TEXT PRIMARY KEY,
                    display_name TEXT NOT NULL,
                    lud16 TEXT NOT NULL,
                    nprofile TEXT NOT NULL,
                    picture TEXT,
                    relays TEXT NOT NULL,
                    event_id TEXT NOT NULL,
                    note TEXT NOT NULL,
                    kinds TEXT NOT NULL,
                    amount INTEGER NOT NULL,
                    payouts REAL NOT NULL,
                    is_active INTEGER NOT NULL,
                    notified TEXT
                );

                CREATE TABLE IF NOT EXISTS processed_zap_events (
                    zap_event_id TEXT PRIMARY KEY,
                    pubkey TEXT NOT NULL,
                    original_event_id TEXT NOT NULL,
                    amount INTEGER NOT NULL,
                    processed_at INTEGER NOT NULL,
                    status TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS cache (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL,
                    expires_at INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS payment_metrics (
                    id INTEGER PRIMARY KEY CHECK (id = 1),
                    total_payments INTEGER NOT NULL,
                    cyberherd_payments_detected INTEGER NOT NULL,
                    regular_payments_processed INTEGER NOT NULL,
                    feeder_triggers INTEGER NOT NULL,
                    failed_payments INTEGER NOT NULL,
                    session_start INTEGER NOT NULL
                );
                ",
            )?;
            Ok(())
        })()
        .map_err(HerdError::from)
    }

    // --- cyber_herd ---------------------------------------------------

    pub async fn get_member(&self, pubkey: &str) -> HerdResult<Option<HerdMember>> {
        let pubkey = pubkey.to_string();
        self.run(move |conn| {
            conn.query_row(
                "SELECT pubkey, display_name, lud16, nprofile, picture, relays, event_id, note, kinds, amount, payouts, is_active, notified
                 FROM cyber_herd WHERE pubkey = ?1",
                params![pubkey],
                row_to_member,
            )
            .optional()
        })
        .await
    }

    pub async fn active_members(&self) -> HerdResult<Vec<HerdMember>> {
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT pubkey, display_name, lud16, nprofile, picture, relays, event_id, note, kinds, amount, payouts, is_active, notified
                 FROM cyber_herd WHERE is_active = 1",
            )?;
            let rows = stmt.query_map([], row_to_member)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })
        .await
    }

    pub async fn active_count(&self) -> HerdResult<i64> {
        self.run(move |conn| {
            conn.query_row("SELECT COUNT(*) FROM cyber_herd WHERE is_active = 1", [], |r| r.get(0))
        })
        .await
    }

    pub async fn upsert_member(&self, member: HerdMember) -> HerdResult<()> {
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO cyber_herd (pubkey, display_name, lud16, nprofile, picture, relays, event_id, note, kinds, amount, payouts, is_active, notified)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                 ON CONFLICT(pubkey) DO UPDATE SET
                    display_name = excluded.display_name,
                    lud16 = excluded.lud16,
                    nprofile = excluded.nprofile,
                    picture = excluded.picture,
                    relays = excluded.relays,
                    event_id = excluded.event_id,
                    note = excluded.note,
                    kinds = excluded.kinds,
                    amount = excluded.amount,
                    payouts = excluded.payouts,
                    is_active = excluded.is_active,
                    notified = excluded.notified",
                params![
                    member.pubkey,
                    member.display_name,
                    member.lud16,
                    member.nprofile,
                    member.picture,
                    serde_json::to_string(&member.relays).unwrap_or_default(),
                    member.event_id,
                    member.note,
                    member.kinds_to_string(),
                    member.amount,
                    member.payouts,
                    member.is_active as i64,
                    member.notified,
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn deactivate_member_and_zero(&self, pubkey: &str) -> HerdResult<()> {
        let pubkey = pubkey.to_string();
        self.run(move |conn| {
            conn.execute(
                "UPDATE cyber_herd SET is_active = 0, amount = 0, payouts = 0.0 WHERE pubkey = ?1",
                params![pubkey],
            )?;
            Ok(())
        })
        .await
    }

    /// Daily reset: delete all herd rows (Open Question resolved in
    /// DESIGN.md in favor of deletion over deactivate-and-zero).
    pub async fn daily_reset_herd(&self) -> HerdResult<()> {
        self.run(|conn| {
            conn.execute("DELETE FROM cyber_herd", [])?;
            Ok(())
        })
        .await
    }

    // --- processed_zap_events ------------------------------------------

    pub async fn claim_zap(
        &self,
        zap_event_id: &str,
        pubkey: &str,
        original_event_id: &str,
        amount: i64,
    ) -> HerdResult<ClaimOutcome> {
        let zap_event_id = zap_event_id.to_string();
        let pubkey = pubkey.to_string();
        let original_event_id = original_event_id.to_string();
        self.run(move |conn| {
            let tx = conn.unchecked_transaction()?;
            let existing: Option<(String, i64)> = tx
                .query_row(
                    "SELECT status, processed_at FROM processed_zap_events WHERE zap_event_id = ?1",
                    params![zap_event_id],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()?;

            let now = now_epoch_secs();
            let outcome = match existing {
                None => {
                    tx.execute(
                        "INSERT INTO processed_zap_events (zap_event_id, pubkey, original_event_id, amount, processed_at, status)
                         VALUES (?1, ?2, ?3, ?4, ?5, 'processing')",
                        params![zap_event_id, pubkey, original_event_id, amount, now],
                    )?;
                    ClaimOutcome::ShouldProcess
                }
                Some((status, processed_at)) if status == ZapStatus::Completed.as_str() => {
                    ClaimOutcome::AlreadyCompleted
                }
                Some((status, processed_at))
                    if status == ZapStatus::Processing.as_str() && now - processed_at < STUCK_PROCESSING_SECS =>
                {
                    ClaimOutcome::AlreadyProcessing
                }
                Some(_) => {
                    tx.execute(
                        "UPDATE processed_zap_events SET pubkey = ?2, original_event_id = ?3, amount = ?4, processed_at = ?5, status = 'processing'
                         WHERE zap_event_id = ?1",
                        params![zap_event_id, pubkey, original_event_id, amount, now],
                    )?;
                    ClaimOutcome::ShouldProcess
                }
            };
            tx.commit()?;
            Ok(outcome)
        })
        .await
    }

    pub async fn mark_zap_completed(&self, zap_event_id: &str) -> HerdResult<()> {
        self.set_zap_status(zap_event_id, ZapStatus::Completed).await
    }

    pub async fn mark_zap_failed(&self, zap_event_id: &str) -> HerdResult<()> {
        self.set_zap_status(zap_event_id, ZapStatus::Failed).await
    }

    async fn set_zap_status(&self, zap_event_id: &str, status: ZapStatus) -> HerdResult<()> {
        let zap_event_id = zap_event_id.to_string();
        self.run(move |conn| {
            conn.execute(
                "UPDATE processed_zap_events SET status = ?2 WHERE zap_event_id = ?1",
                params![zap_event_id, status.as_str()],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn is_zap_processed(&self, zap_event_id: &str) -> HerdResult<Option<ProcessedZap>> {
        let zap_event_id = zap_event_id.to_string();
        self.run(move |conn| {
            conn.query_row(
                "SELECT zap_event_id, pubkey, original_event_id, amount, processed_at, status FROM processed_zap_events WHERE zap_event_id = ?1",
                params![zap_event_id],
                |r| {
                    let status: String = r.get(5)?;
                    Ok(ProcessedZap {
                        zap_event_id: r.get(0)?,
                        pubkey: r.get(1)?,
                        original_event_id: r.get(2)?,
                        amount: r.get(3)?,
                        processed_at: r.get(4)?,
                        status: ZapStatus::from_str(&status).unwrap_or(ZapStatus::Failed),
                    })
                },
            )
            .optional()
        })
        .await
    }

    /// Purges terminal (completed/failed) rows older than `older_than_secs`.
    pub async fn purge_processed_zaps(&self, older_than_secs: i64) -> HerdResult<usize> {
        self.run(move |conn| {
            let cutoff = now_epoch_secs() - older_than_secs;
            let n = conn.execute(
                "DELETE FROM processed_zap_events WHERE status IN ('completed','failed') AND processed_at < ?1",
                params![cutoff],
            )?;
            Ok(n)
        })
        .await
    }

    // --- cache -----------------------------------------------------------

    pub async fn cache_get(&self, key: &str) -> HerdResult<Option<String>> {
        let key = key.to_string();
        self.run(move |conn| {
            let row: Option<(String, i64)> = conn
                .query_row("SELECT value, expires_at FROM cache WHERE key = ?1", params![key], |r| {
                    Ok((r.get(0)?, r.get(1)?))
                })
                .optional()?;
            Ok(row.and_then(|(value, expires_at)| if expires_at > now_epoch_secs() { Some(value) } else { None }))
        })
        .await
    }

    pub async fn cache_set(&self, key: &str, value: &str, ttl_secs: i64) -> HerdResult<()> {
        let key = key.to_string();
        let value = value.to_string();
        self.run(move |conn| {
            let expires_at = now_epoch_secs() + ttl_secs;
            conn.execute(
                "INSERT INTO cache (key, value, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
                params![key, value, expires_at],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn cache_purge_expired(&self) -> HerdResult<usize> {
        self.run(move |conn| Ok(conn.execute("DELETE FROM cache WHERE expires_at <= ?1", params![now_epoch_secs()])?))
            .await
    }

    // --- payment_metrics ---------------------------------------------------

    pub async fn load_metrics(&self) -> HerdResult<PaymentMetrics> {
        self.run(|conn| {
            let existing = conn
                .query_row(
                    "SELECT total_payments, cyberherd_payments_detected, regular_payments_processed, feeder_triggers, failed_payments, session_start
                     FROM payment_metrics WHERE id = 1",
                    [],
                    |r| {
                        Ok(PaymentMetrics {
                            total_payments: r.get::<_, i64>(0)? as u64,
                            cyberherd_payments_detected: r.get::<_, i64>(1)? as u64,
                            regular_payments_processed: r.get::<_, i64>(2)? as u64,
                            feeder_triggers: r.get::<_, i64>(3)? as u64,
                            failed_payments: r.get::<_, i64>(4)? as u64,
                            session_start: r.get(5)?,
                        })
                    },
                )
                .optional()?;
            match existing {
                Some(m) => Ok(m),
                None => {
                    let fresh = PaymentMetrics {
                        session_start: now_epoch_secs(),
                        ..Default::default()
                    };
                    conn.execute(
                        "INSERT INTO payment_metrics (id, total_payments, cyberherd_payments_detected, regular_payments_processed, feeder_triggers, failed_payments, session_start)
                         VALUES (1, 0, 0, 0, 0, 0, ?1)",
                        params![fresh.session_start],
                    )?;
                    Ok(fresh)
                }
            }
        })
        .await
    }

    pub async fn save_metrics(&self, metrics: PaymentMetrics) -> HerdResult<()> {
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO payment_metrics (id, total_payments, cyberherd_payments_detected, regular_payments_processed, feeder_triggers, failed_payments, session_start)
                 VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(id) DO UPDATE SET
                    total_payments = excluded.total_payments,
                    cyberherd_payments_detected = excluded.cyberherd_payments_detected,
                    regular_payments_processed = excluded.regular_payments_processed,
                    feeder_triggers = excluded.feeder_triggers,
                    failed_payments = excluded.failed_payments,
                    session_start = excluded.session_start",
                params![
                    metrics.total_payments as i64,
                    metrics.cyberherd_payments_detected as i64,
                    metrics.regular_payments_processed as i64,
                    metrics.feeder_triggers as i64,
                    metrics.failed_payments as i64,
                    metrics.session_start,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn run<T, F>(&self, f: F) -> HerdResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("store mutex poisoned");
            f(&conn)
        })
        .await
        .map_err(|e| HerdError::Fatal(format!("store worker panicked: {e}")))?
        .map_err(HerdError::from)
    }
}

fn row_to_member(r: &rusqlite::Row) -> rusqlite::Result<HerdMember> {
    let kinds_str: String = r.get(8)?;
    let relays_json: String = r.get(5)?;
    Ok(HerdMember {
        pubkey: r.get(0)?,
        display_name: r.get(1)?,
        lud16: r.get(2)?,
        nprofile: r.get(3)?,
        picture: r.get(4)?,
        relays: serde_json::from_str(&relays_json).unwrap_or_default(),
        event_id: r.get(6)?,
        note: r.get(7)?,
        kinds: HerdMember::parse_kinds(&kinds_str),
        amount: r.get(9)?,
        payouts: r.get(10)?,
        is_active: r.get::<_, i64>(11)? != 0,
        notified: r.get(12)?,
    })
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn sample_member(pubkey: &str, amount: i64) -> HerdMember {
        HerdMember {
            pubkey: pubkey.to_string(),
            display_name: "Anon".to_string(),
            lud16: "a@b.com".to_string(),
            nprofile: "nprofile1...".to_string(),
            picture: None,
            relays: vec!["wss://relay.damus.io/".to_string()],
            event_id: "e".repeat(64),
            note: "n".repeat(64),
            kinds: BTreeSet::from([9735]),
            amount,
            payouts: crate::payout_calc::calc(amount),
            is_active: true,
            notified: None,
        }
    }

    #[tokio::test]
    async fn upsert_and_fetch_member_roundtrips() {
        let store = Store::open(":memory:").unwrap();
        let member = sample_member(&"a".repeat(64), 50);
        store.upsert_member(member.clone()).await.unwrap();
        let fetched = store.get_member(&member.pubkey).await.unwrap().unwrap();
        assert_eq!(fetched.amount, 50);
        assert_eq!(fetched.kinds, BTreeSet::from([9735]));
        assert_eq!(fetched.relays, member.relays);
    }

    #[tokio::test]
    async fn active_count_tracks_capacity() {
        let store = Store::open(":memory:").unwrap();
        for i in 0..3 {
            store.upsert_member(sample_member(&format!("{i}{}", "a".repeat(63)), 50)).await.unwrap();
        }
        assert_eq!(store.active_count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn deactivate_zeroes_counters() {
        let store = Store::open(":memory:").unwrap();
        let pubkey = "a".repeat(64);
        store.upsert_member(sample_member(&pubkey, 80)).await.unwrap();
        store.deactivate_member_and_zero(&pubkey).await.unwrap();
        let m = store.get_member(&pubkey).await.unwrap().unwrap();
        assert!(!m.is_active);
        assert_eq!(m.amount, 0);
        assert_eq!(m.payouts, 0.0);
    }

    #[tokio::test]
    async fn daily_reset_removes_all_members() {
        let store = Store::open(":memory:").unwrap();
        store.upsert_member(sample_member(&"a".repeat(64), 50)).await.unwrap();
        store.daily_reset_herd().await.unwrap();
        assert_eq!(store.active_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn claim_zap_is_idempotent_across_duplicates() {
        let store = Store::open(":memory:").unwrap();
        let zap_id = "z".repeat(64);
        let first = store.claim_zap(&zap_id, "pk", "orig", 50).await.unwrap();
        assert_eq!(first, ClaimOutcome::ShouldProcess);

        let second = store.claim_zap(&zap_id, "pk", "orig", 50).await.unwrap();
        assert_eq!(second, ClaimOutcome::AlreadyProcessing);

        store.mark_zap_completed(&zap_id).await.unwrap();
        let third = store.claim_zap(&zap_id, "pk", "orig", 50).await.unwrap();
        assert_eq!(third, ClaimOutcome::AlreadyCompleted);
    }

    #[tokio::test]
    async fn claim_zap_retries_after_failure() {
        let store = Store::open(":memory:").unwrap();
        let zap_id = "z".repeat(64);
        store.claim_zap(&zap_id, "pk", "orig", 50).await.unwrap();
        store.mark_zap_failed(&zap_id).await.unwrap();
        let retried = store.claim_zap(&zap_id, "pk", "orig", 50).await.unwrap();
        assert_eq!(retried, ClaimOutcome::ShouldProcess);
    }

    #[tokio::test]
    async fn cache_set_get_and_expiry() {
        let store = Store::open(":memory:").unwrap();
        store.cache_set("k", "v", 60).await.unwrap();
        assert_eq!(store.cache_get("k").await.unwrap(), Some("v".to_string()));

        store.cache_set("expired", "v", -1).await.unwrap();
        assert_eq!(store.cache_get("expired").await.unwrap(), None);
    }

    #[tokio::test]
    async fn metrics_persist_across_load_save() {
        let store = Store::open(":memory:").unwrap();
        let mut m = store.load_metrics().await.unwrap();
        m.feeder_triggers += 1;
        store.save_metrics(m.clone()).await.unwrap();
        let reloaded = store.load_metrics().await.unwrap();
        assert_eq!(reloaded.feeder_triggers, 1);
        assert_eq!(reloaded.session_start, m.session_start);
    }
}
