//! # Webhook Fan-Out
//!
//! Best-effort HTTPS notification of registered endpoints after a
//! commit. Failures are logged and retried with exponential backoff;
//! they never affect the transaction outcome or the caller.
//!
//! Delivery contract: POST `{event, timestamp, data, metadata}` with a
//! 5-second deadline, three retries, and an `X-Signature` HMAC-SHA-256
//! header when a secret is configured.

use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};

type HmacSha256 = Hmac<Sha256>;

/// Signature header name.
pub const SIGNATURE_HEADER: &str = "X-Signature";

// =============================================================================
// Configuration
// =============================================================================

/// Webhook delivery knobs.
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    /// Registered endpoint URLs.
    pub endpoints: Vec<String>,

    /// HMAC secret; unset means unsigned deliveries.
    pub secret: Option<String>,

    /// Per-attempt deadline.
    pub timeout: Duration,

    /// Retries after the first attempt.
    pub max_retries: u32,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        WebhookConfig {
            endpoints: Vec::new(),
            secret: None,
            timeout: Duration::from_secs(5),
            max_retries: 3,
        }
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Delivers events to every registered endpoint in parallel.
pub struct WebhookDispatcher {
    client: reqwest::Client,
    config: WebhookConfig,
}

impl WebhookDispatcher {
    pub fn new(config: WebhookConfig) -> EngineResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| EngineError::Config(format!("webhook client: {e}")))?;
        Ok(WebhookDispatcher { client, config })
    }

    /// Whether any endpoints are registered.
    pub fn is_active(&self) -> bool {
        !self.config.endpoints.is_empty()
    }

    /// Fires `event` at every endpoint concurrently and waits for the
    /// fan-out to settle. Every failure is logged; none propagate.
    pub async fn dispatch(&self, event: &str, data: &Value, metadata: &Value) {
        if !self.is_active() {
            return;
        }

        let body = json!({
            "event": event,
            "timestamp": Utc::now().to_rfc3339(),
            "data": data,
            "metadata": metadata,
        });
        let bytes = serde_json::to_vec(&body).expect("webhook body serialization is infallible");
        let signature = self
            .config
            .secret
            .as_deref()
            .map(|secret| sign(secret, &bytes));

        let deliveries = self.config.endpoints.iter().map(|endpoint| {
            self.deliver_with_retry(endpoint, bytes.clone(), signature.clone())
        });
        futures_util::future::join_all(deliveries).await;
    }

    async fn deliver_with_retry(&self, endpoint: &str, body: Vec<u8>, signature: Option<String>) {
        let mut backoff = ExponentialBackoff {
            initial_interval: Duration::from_millis(200),
            max_interval: Duration::from_secs(2),
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        };

        for attempt in 0..=self.config.max_retries {
            match self.deliver_once(endpoint, &body, signature.as_deref()).await {
                Ok(()) => {
                    debug!(endpoint, attempt, "Webhook delivered");
                    return;
                }
                Err(error) => {
                    warn!(endpoint, attempt, %error, "Webhook delivery failed");
                }
            }

            if attempt < self.config.max_retries {
                let delay = backoff
                    .next_backoff()
                    .unwrap_or_else(|| Duration::from_secs(2));
                tokio::time::sleep(delay).await;
            }
        }

        warn!(
            endpoint,
            retries = self.config.max_retries,
            "Webhook delivery abandoned"
        );
    }

    async fn deliver_once(
        &self,
        endpoint: &str,
        body: &[u8],
        signature: Option<&str>,
    ) -> EngineResult<()> {
        let mut request = self
            .client
            .post(endpoint)
            .header("Content-Type", "application/json")
            .body(body.to_vec());
        if let Some(signature) = signature {
            request = request.header(SIGNATURE_HEADER, signature);
        }

        let response = request
            .send()
            .await
            .map_err(|e| EngineError::Webhook(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(EngineError::Webhook(format!(
                "endpoint returned {}",
                response.status()
            )))
        }
    }
}

// =============================================================================
// Signing
// =============================================================================

/// HMAC-SHA-256 over the exact request body, lower-case hex.
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(body);
    let digest = mac.finalize().into_bytes();

    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

// =============================================================================
// Unit Tests
// =============================================================================
