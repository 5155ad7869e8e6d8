//! Feeder-control capability boundary: override-state read and the
//! basic-auth trigger call to the feeder appliance's rule endpoint.

use crate::error::{HerdError, HerdResult};
use crate::retry::{retry_with_backoff, RetryPolicy};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_CONCURRENT_REQUESTS: usize = 3;

#[derive(Clone)]
pub struct FeederAdapter {
    http: Client,
    base_url: String,
    username: String,
    password: String,
    retry_policy: RetryPolicy,
    permits: Arc<Semaphore>,
}

impl FeederAdapter {
    pub fn new(base_url: String, username: String, password: String) -> HerdResult<Self> {
        let http = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(HerdError::from)?;
        Ok(FeederAdapter {
            http,
            base_url,
            username,
            password,
            retry_policy: RetryPolicy::default(),
            permits: Arc::new(Semaphore::new(MAX_CONCURRENT_REQUESTS)),
        })
    }

    /// True when the override item reads `"OFF"` (feeder may be triggered).
    pub async fn is_override_off(&self) -> HerdResult<bool> {
        let _permit = self.permits.acquire().await.expect("semaphore never closed");
        retry_with_backoff(&self.retry_policy, || async {
            let body = self
                .http
                .get(format!("{}/rest/items/FeederOverride/state", self.base_url))
                .basic_auth(&self.username, Some(&self.password))
                .send()
                .await?
                .text()
                .await?;
            Ok(body.trim().eq_ignore_ascii_case("OFF"))
        })
        .await
    }

    /// Invokes the feeder-trigger rule. Returns `Ok(())` only on HTTP 2xx.
    pub async fn trigger(&self) -> HerdResult<()> {
        let _permit = self.permits.acquire().await.expect("semaphore never closed");
        retry_with_backoff(&self.retry_policy, || async {
            self.http
                .post(format!("{}/rest/rules/feeder-trigger/runnow", self.base_url))
                .basic_auth(&self.username, Some(&self.password))
                .send()
                .await?
                .error_for_status()
                .map_err(HerdError::from)?;
            Ok(())
        })
        .await
    }
}
