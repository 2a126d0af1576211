// src/fetch/http.rs

use anyhow::{Context, Result};
use reqwest::Client;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, warn};
use url::Url;

use super::Fetch;

/// Plain HTTP GET with exponential backoff between attempts.
#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
    max_retries: u32,
    initial_backoff_ms: u64,
}

impl HttpFetcher {
    pub fn new(client: Client, max_retries: u32, initial_backoff_ms: u64) -> Self {
        Self {
            client,
            max_retries,
            initial_backoff_ms,
        }
    }

    /// Delay before retry number `attempt` (1-based): `initial * 2^(attempt-1)`,
    /// saturating instead of overflowing.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.initial_backoff_ms.saturating_mul(factor))
    }

    async fn get_bytes_core(&self, url: &Url) -> Result<Vec<u8>> {
        debug!("Fetching bytes from {}", url);
        let bytes = self
            .client
            .get(url.clone())
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?
            .error_for_status()
            .with_context(|| format!("Non-success status {}", url))?
            .bytes()
            .await
            .with_context(|| format!("Reading body from {}", url))?;
        Ok(bytes.to_vec())
    }
}

impl Fetch for HttpFetcher {
    async fn fetch(&self, url: &Url) -> Result<Vec<u8>> {
        let mut attempts = 0;
        loop {
            match self.get_bytes_core(url).await {
                Ok(b) => return Ok(b),
                Err(e) if attempts < self.max_retries => {
                    attempts += 1;
                    let backoff = self.backoff_delay(attempts);
                    warn!(%url, attempt = attempts, delay = ?backoff, error = %e, "Retrying");
                    sleep(backoff).await;
                }
                Err(e) => {
                    error!(%url, error = %e, "Exhausted retries");
                    return Err(e);
                }
            }
        }
    }
}
