//! Monotonic time helpers and the daily-midnight reset scheduler: sleep
//! until the next UTC midnight, run the reset, loop forever.

use chrono::{DateTime, NaiveTime, Utc};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Seconds since the Unix epoch, for `ProcessedZap.processed_at` and other
/// fields stored as epoch seconds.
pub fn now_epoch_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Epoch seconds for the start (00:00:00 UTC) of the current day.
pub fn midnight_today_utc() -> i64 {
    let now: DateTime<Utc> = Utc::now();
    now.date_naive()
        .and_time(NaiveTime::MIN)
        .and_utc()
        .timestamp()
}

/// Duration until the next UTC midnight, used both to schedule the daily
/// reset and to TTL the daily cache of CyberHerd-tagged note ids.
pub fn duration_until_next_midnight() -> Duration {
    let now: DateTime<Utc> = Utc::now();
    let next_midnight = (now.date_naive() + chrono::Duration::days(1))
        .and_time(NaiveTime::MIN)
        .and_utc();
    let secs = (next_midnight - now).num_seconds().max(1);
    Duration::from_secs(secs as u64)
}

/// Cache key for "today", so the daily-tagged-note cache naturally expires
/// and regenerates across a midnight boundary.
pub fn today_key() -> String {
    Utc::now().date_naive().to_string()
}

/// Drives `reset` once per UTC day. Intended to be spawned as a background
/// task; never returns.
pub async fn run_daily_reset_loop<F, Fut>(mut reset: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    loop {
        tokio::time::sleep(duration_until_next_midnight()).await;
        reset().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn midnight_is_at_or_before_now() {
        assert!(midnight_today_utc() <= now_epoch_secs());
    }

    #[test]
    fn duration_until_midnight_is_at_most_a_day() {
        assert!(duration_until_next_midnight() <= Duration::from_secs(86_400));
    }
}
