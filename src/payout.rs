//! On trigger: force-sync split targets, pay the captured balance into
//! the split wallet, and reset balance. Bounded by an overall 10 s
//! timeout; a short delay between invoice creation and payment reduces
//! races with wallet implementations that settle asynchronously.

use crate::error::{HerdError, HerdResult};
use crate::metrics::Metrics;
use crate::split_sync::SplitSynchronizer;
use crate::wallet_adapter::WalletAdapter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const PAYOUT_TIMEOUT: Duration = Duration::from_secs(10);
const INVOICE_TO_PAYMENT_DELAY: Duration = Duration::from_millis(500);

pub struct PayoutOrchestrator {
    split_sync: Arc<SplitSynchronizer>,
    wallet: Arc<WalletAdapter>,
    metrics: Arc<Metrics>,
    balance: Arc<Mutex<i64>>,
}

impl PayoutOrchestrator {
    pub fn new(split_sync: Arc<SplitSynchronizer>, wallet: Arc<WalletAdapter>, metrics: Arc<Metrics>, balance: Arc<Mutex<i64>>) -> Self {
        PayoutOrchestrator { split_sync, wallet, metrics, balance }
    }

    /// Runs the trigger→payout→reset cycle for a captured balance of
    /// `amount_sats`. On failure the balance is left untouched so the
    /// next zap re-evaluates the trigger condition.
    pub async fn trigger_payout(&self, amount_sats: i64) -> HerdResult<()> {
        match tokio::time::timeout(PAYOUT_TIMEOUT, self.run_payout(amount_sats)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.metrics.record_failed_payment().await?;
                Err(e)
            }
            Err(_) => {
                self.metrics.record_failed_payment().await?;
                Err(HerdError::transient("payout timed out"))
            }
        }
    }

    async fn run_payout(&self, amount_sats: i64) -> HerdResult<()> {
        self.split_sync.sync(true).await?;

        let bolt11 = self.wallet.create_invoice(amount_sats, "cyberherd payout").await?;
        tokio::time::sleep(INVOICE_TO_PAYMENT_DELAY).await;
        self.wallet.pay_invoice(&bolt11).await?;

        let mut balance = self.balance.lock().await;
        *balance = 0;
        drop(balance);

        Ok(())
    }
}
