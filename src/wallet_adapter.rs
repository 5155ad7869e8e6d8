//! Lightning wallet capability boundary: balance reads, invoice
//! create/pay, and split-target read/write against an LNbits-shaped HTTP
//! API. Every call goes through [`crate::retry::retry_with_backoff`].

use crate::error::{HerdError, HerdResult};
use crate::retry::{retry_with_backoff, RetryPolicy};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_CONCURRENT_REQUESTS: usize = 5;

#[derive(Clone)]
pub struct WalletAdapter {
    http: Client,
    base_url: String,
    main_wallet_key: String,
    split_wallet_key: String,
    retry_policy: RetryPolicy,
    permits: Arc<Semaphore>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SplitTarget {
    pub wallet: String,
    pub alias: String,
    pub percent: u32,
}

#[derive(Debug, Serialize)]
struct SplitTargetsDoc<'a> {
    targets: &'a [SplitTarget],
}

#[derive(Debug, Deserialize)]
struct CreateInvoiceResponse {
    bolt11: String,
}

impl WalletAdapter {
    pub fn new(base_url: String, main_wallet_key: String, split_wallet_key: String) -> HerdResult<Self> {
        let http = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(HerdError::from)?;
        Ok(WalletAdapter {
            http,
            base_url,
            main_wallet_key,
            split_wallet_key,
            retry_policy: RetryPolicy::default(),
            permits: Arc::new(Semaphore::new(MAX_CONCURRENT_REQUESTS)),
        })
    }

    pub async fn read_balance(&self) -> HerdResult<i64> {
        let _permit = self.permits.acquire().await.expect("semaphore never closed");
        retry_with_backoff(&self.retry_policy, || async {
            #[derive(Deserialize)]
            struct WalletDetails {
                balance: i64,
            }
            let resp = self
                .http
                .get(format!("{}/api/v1/wallet", self.base_url))
                .header("X-Api-Key", &self.main_wallet_key)
                .send()
                .await?;
            let details: WalletDetails = resp.json().await?;
            Ok(details.balance / 1000)
        })
        .await
    }

    /// Creates a bolt11 invoice for `amount_sats` on the split wallet.
    pub async fn create_invoice(&self, amount_sats: i64, memo: &str) -> HerdResult<String> {
        let _permit = self.permits.acquire().await.expect("semaphore never closed");
        retry_with_backoff(&self.retry_policy, || async {
            let resp = self
                .http
                .post(format!("{}/api/v1/payments", self.base_url))
                .header("X-Api-Key", &self.split_wallet_key)
                .json(&serde_json::json!({
                    "out": false,
                    "amount": amount_sats,
                    "unit": "sat",
                    "memo": memo,
                }))
                .send()
                .await?;
            let body: CreateInvoiceResponse = resp.json().await?;
            Ok(body.bolt11)
        })
        .await
    }

    /// Pays `bolt11` from the main wallet.
    pub async fn pay_invoice(&self, bolt11: &str) -> HerdResult<()> {
        let _permit = self.permits.acquire().await.expect("semaphore never closed");
        retry_with_backoff(&self.retry_policy, || async {
            self.http
                .post(format!("{}/api/v1/payments", self.base_url))
                .header("X-Api-Key", &self.main_wallet_key)
                .json(&serde_json::json!({
                    "out": true,
                    "unit": "sat",
                    "bolt11": bolt11,
                }))
                .send()
                .await?
                .error_for_status()
                .map_err(HerdError::from)?;
            Ok(())
        })
        .await
    }

    /// Pushes the split-target document. `targets` must already satisfy
    /// the sum-to-100 / per-target minimum invariants; this adapter does
    /// not enforce them.
    pub async fn write_split_targets(&self, targets: &[SplitTarget]) -> HerdResult<()> {
        let _permit = self.permits.acquire().await.expect("semaphore never closed");
        retry_with_backoff(&self.retry_policy, || async {
            self.http
                .put(format!("{}/api/v1/extensions/splitpayments/targets", self.base_url))
                .header("X-Api-Key", &self.split_wallet_key)
                .json(&SplitTargetsDoc { targets })
                .send()
                .await?
                .error_for_status()
                .map_err(HerdError::from)?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_targets_doc_serializes_percent_as_integer() {
        let targets = vec![SplitTarget {
            wallet: "fallback@getalby.com".to_string(),
            alias: "CyberHerd".to_string(),
            percent: 90,
        }];
        let doc = SplitTargetsDoc { targets: &targets };
        let json = serde_json::to_value(&doc).unwrap();
        assert_eq!(json["targets"][0]["percent"], 90);
    }
}
