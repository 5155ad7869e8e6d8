//! Lifetime payment counters, persisted as the store's singleton
//! `payment_metrics` row. Callers load once at startup, mutate the
//! in-memory copy, and save after each change; daily reset restarts
//! `session_start` rather than zeroing lifetime totals.

use crate::clock::now_epoch_secs;
use crate::error::HerdResult;
use crate::model::PaymentMetrics;
use crate::store::Store;
use tokio::sync::Mutex;

pub struct Metrics {
    store: Store,
    state: Mutex<PaymentMetrics>,
}

impl Metrics {
    pub async fn load(store: Store) -> HerdResult<Self> {
        let state = store.load_metrics().await?;
        Ok(Metrics {
            store,
            state: Mutex::new(state),
        })
    }

    pub async fn snapshot(&self) -> PaymentMetrics {
        self.state.lock().await.clone()
    }

    async fn save(&self, metrics: &PaymentMetrics) -> HerdResult<()> {
        self.store.save_metrics(metrics.clone()).await
    }

    pub async fn record_cyberherd_payment(&self) -> HerdResult<()> {
        let mut m = self.state.lock().await;
        m.total_payments += 1;
        m.cyberherd_payments_detected += 1;
        self.save(&m).await
    }

    pub async fn record_regular_payment(&self) -> HerdResult<()> {
        let mut m = self.state.lock().await;
        m.total_payments += 1;
        m.regular_payments_processed += 1;
        self.save(&m).await
    }

    pub async fn record_feeder_trigger(&self) -> HerdResult<()> {
        let mut m = self.state.lock().await;
        m.feeder_triggers += 1;
        self.save(&m).await
    }

    pub async fn record_failed_payment(&self) -> HerdResult<()> {
        let mut m = self.state.lock().await;
        m.failed_payments += 1;
        self.save(&m).await
    }

    /// Resets lifetime counters for a new day while keeping `session_start`
    /// current; called from the daily-reset loop alongside herd reset.
    pub async fn reset_session(&self) -> HerdResult<()> {
        let mut m = self.state.lock().await;
        *m = PaymentMetrics {
            session_start: now_epoch_secs(),
            ..Default::default()
        };
        self.save(&m).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn counters_increment_and_persist() {
        let store = Store::open(":memory:").unwrap();
        let metrics = Metrics::load(store.clone()).await.unwrap();
        metrics.record_cyberherd_payment().await.unwrap();
        metrics.record_feeder_trigger().await.unwrap();

        let snap = metrics.snapshot().await;
        assert_eq!(snap.total_payments, 1);
        assert_eq!(snap.cyberherd_payments_detected, 1);
        assert_eq!(snap.feeder_triggers, 1);

        let reloaded = store.load_metrics().await.unwrap();
        assert_eq!(reloaded.total_payments, 1);
    }

    #[tokio::test]
    async fn reset_session_clears_counters_but_bumps_session_start() {
        let store = Store::open(":memory:").unwrap();
        let metrics = Metrics::load(store).await.unwrap();
        metrics.record_regular_payment().await.unwrap();
        metrics.reset_session().await.unwrap();
        let snap = metrics.snapshot().await;
        assert_eq!(snap.total_payments, 0);
        assert_eq!(snap.regular_payments_processed, 0);
    }
}
