//! At-least-once webhook delivery with exponential backoff.

use chrono::{Duration, Utc};
use ring::hmac;
use streampay_payments::store::EventStore;
use streampay_payments::WebhookEvent;
use tracing::{debug, error, warn};

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub url: String,
    /// HMAC key for the signature header; no header is sent when unset
    pub secret: Option<Vec<u8>>,
    pub attempt_timeout: std::time::Duration,
    pub max_attempts: u32,
    pub backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        WebhookConfig {
            url: String::new(),
            secret: None,
            attempt_timeout: std::time::Duration::from_secs(10),
            max_attempts: 10,
            backoff: Duration::seconds(10),
            max_backoff: Duration::hours(1),
        }
    }
}

/// Posts due events to the configured endpoint. Successful deliveries are
/// garbage-collected; failures reschedule with `backoff × 2^attempts` until
/// `max_attempts`, after which the event is parked and logged.
pub struct WebhookDispatcher<S> {
    store: S,
    client: reqwest::Client,
    config: WebhookConfig,
}

impl<S: EventStore> WebhookDispatcher<S> {
    pub fn new(store: S, config: WebhookConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.attempt_timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        WebhookDispatcher {
            store,
            client,
            config,
        }
    }

    /// Delivers every due event once. Returns how many were attempted.
    pub async fn process_due(&self, limit: usize) -> usize {
        let due = self.store.events_due(Utc::now(), limit).await;
        let count = due.len();
        for event in due {
            self.deliver(event).await;
        }
        count
    }

    async fn deliver(&self, mut event: WebhookEvent) {
        let body = match serde_json::to_string(&event) {
            Ok(body) => body,
            Err(err) => {
                error!("Unable to serialize webhook event {}: {}", event.id, err);
                return;
            }
        };

        let mut request = self
            .client
            .post(&self.config.url)
            .header("Content-Type", "application/json");
        if let Some(ref secret) = self.config.secret {
            let timestamp = Utc::now().timestamp();
            let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
            let digest = hmac::sign(&key, format!("{}.{}", timestamp, body).as_bytes());
            request = request.header(
                "Streampay-Signature",
                format!("t={}, v1={}", timestamp, hex::encode(digest.as_ref())),
            );
        }

        let outcome = request.body(body).send().await;
        event.attempts += 1;
        match outcome {
            Ok(response) if response.status().is_success() => {
                debug!(
                    "Delivered webhook {} ({:?}) after {} attempts",
                    event.id, event.kind, event.attempts
                );
                // delivered events are garbage-collected
                self.store.delete_event(event.id).await.ok();
            }
            Ok(response) => {
                event.status_code = Some(response.status().as_u16());
                self.reschedule(event).await;
            }
            Err(err) => {
                warn!("Webhook delivery error for {}: {}", event.id, err);
                event.status_code = None;
                self.reschedule(event).await;
            }
        }
    }

    async fn reschedule(&self, mut event: WebhookEvent) {
        if event.attempts >= self.config.max_attempts {
            error!(
                "Webhook event {} abandoned after {} attempts (last status: {:?})",
                event.id, event.attempts, event.status_code
            );
            event.process_at = None;
        } else {
            let exponent = event.attempts.min(30);
            let backoff = (self.config.backoff * 2i32.pow(exponent)).min(self.config.max_backoff);
            event.process_at = Some(Utc::now() + backoff);
        }
        self.store.update_event(event).await.ok();
    }
}
