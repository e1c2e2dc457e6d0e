//! Record publishing to the message bus.
//!
//! The executor only sees [`RecordPublisher`]; the Kafka backend lives
//! behind the `kafka` feature, and a logging fallback keeps the daemon
//! usable without a broker. Retries are owned here: the executor treats
//! a publisher outcome as final.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::types::TenantRecord;

/// Errors produced by a publisher.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// Programming error on the caller's side; never retried.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Transport-level failure, retried up to the policy's attempt budget.
    #[error("bus error: {0}")]
    Backend(String),
}

/// Receipt for one delivered record.
#[derive(Debug, Clone)]
pub struct PublishAck {
    pub key: String,
    pub delivered_at: DateTime<Utc>,
}

/// Single-record publish. Per-record ordering within a fire is unspecified;
/// callers may issue these concurrently.
#[async_trait]
pub trait RecordPublisher: Send + Sync {
    async fn publish(&self, record: &TenantRecord) -> Result<PublishAck, PublishError>;
}

fn validate(record: &TenantRecord) -> Result<(), PublishError> {
    if record.payload.is_null() {
        return Err(PublishError::InvalidArgument(
            "record payload must not be null".to_string(),
        ));
    }
    if record.id.is_empty() || record.client_id.is_empty() {
        return Err(PublishError::InvalidArgument(
            "record id and client_id must be non-empty".to_string(),
        ));
    }
    Ok(())
}

/// Exponential backoff policy for transient publish failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based): 1s, 2s, 4s, ...
    fn delay(&self, attempt: u32) -> Duration {
        self.base_delay * (1u32 << attempt.min(16))
    }
}

/// Wraps a publisher with retry-on-backend-error semantics.
pub struct RetryingPublisher<P> {
    inner: P,
    policy: RetryPolicy,
}

impl<P> RetryingPublisher<P> {
    pub fn new(inner: P, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl<P: RecordPublisher> RecordPublisher for RetryingPublisher<P> {
    async fn publish(&self, record: &TenantRecord) -> Result<PublishAck, PublishError> {
        let mut last = None;
        for attempt in 0..self.policy.attempts {
            match self.inner.publish(record).await {
                Ok(ack) => return Ok(ack),
                Err(PublishError::InvalidArgument(msg)) => {
                    return Err(PublishError::InvalidArgument(msg));
                }
                Err(PublishError::Backend(msg)) => {
                    tracing::warn!(
                        key = %record.message_key(),
                        attempt,
                        "publish attempt failed: {msg}"
                    );
                    last = Some(msg);
                    if attempt + 1 < self.policy.attempts {
                        tokio::time::sleep(self.policy.delay(attempt)).await;
                    }
                }
            }
        }
        Err(PublishError::Backend(format!(
            "failed after {} attempts: {}",
            self.policy.attempts,
            last.unwrap_or_default()
        )))
    }
}

/// Fallback publisher that writes each record to the structured log. Keeps
/// the daemon runnable with no broker configured.
#[derive(Debug, Default)]
pub struct LogPublisher;

#[async_trait]
impl RecordPublisher for LogPublisher {
    async fn publish(&self, record: &TenantRecord) -> Result<PublishAck, PublishError> {
        validate(record)?;
        let key = record.message_key();
        tracing::info!(key = %key, payload = %record.payload, "publish (log backend)");
        Ok(PublishAck {
            key,
            delivered_at: Utc::now(),
        })
    }
}

/// In-memory publisher recording every delivery; failure injection for tests.
#[derive(Default)]
pub struct MemoryPublisher {
    sent: Mutex<Vec<(String, serde_json::Value)>>,
    fail_keys: Mutex<Vec<String>>,
    fail_all: Mutex<bool>,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything delivered so far, in completion order.
    pub fn sent(&self) -> Vec<(String, serde_json::Value)> {
        self.sent.lock().clone()
    }

    /// Fail every publish whose message key equals `key`.
    pub fn fail_key(&self, key: impl Into<String>) {
        self.fail_keys.lock().push(key.into());
    }

    pub fn fail_all(&self, fail: bool) {
        *self.fail_all.lock() = fail;
    }
}

#[async_trait]
impl RecordPublisher for MemoryPublisher {
    async fn publish(&self, record: &TenantRecord) -> Result<PublishAck, PublishError> {
        validate(record)?;
        let key = record.message_key();
        if *self.fail_all.lock() || self.fail_keys.lock().iter().any(|k| k == &key) {
            return Err(PublishError::Backend(format!("injected failure for {key}")));
        }
        self.sent.lock().push((key.clone(), record.payload.clone()));
        Ok(PublishAck {
            key,
            delivered_at: Utc::now(),
        })
    }
}

#[cfg(feature = "kafka")]
pub use kafka::KafkaPublisher;

#[cfg(feature = "kafka")]
mod kafka {
    use super::*;
    use rdkafka::config::ClientConfig;
    use rdkafka::producer::{FutureProducer, FutureRecord};
    use rdkafka::util::Timeout;

    /// Kafka-backed publisher. The producer is idempotent with bounded
    /// in-flight requests so broker-side retries cannot reorder a key.
    pub struct KafkaPublisher {
        producer: FutureProducer,
        topic: String,
        send_timeout: Duration,
    }

    impl KafkaPublisher {
        pub fn new(
            brokers: &str,
            topic: impl Into<String>,
            send_timeout: Duration,
        ) -> Result<Self, PublishError> {
            let producer = ClientConfig::new()
                .set("bootstrap.servers", brokers)
                .set("enable.idempotence", "true")
                .set("acks", "all")
                .set("max.in.flight.requests.per.connection", "5")
                .set("retries", "10")
                .set("message.timeout.ms", send_timeout.as_millis().to_string())
                .create()
                .map_err(|e| PublishError::Backend(format!("producer init: {e}")))?;
            Ok(Self {
                producer,
                topic: topic.into(),
                send_timeout,
            })
        }
    }

    #[async_trait]
    impl RecordPublisher for KafkaPublisher {
        async fn publish(&self, record: &TenantRecord) -> Result<PublishAck, PublishError> {
            validate(record)?;
            let key = record.message_key();
            let payload = serde_json::to_string(&record.payload)
                .map_err(|e| PublishError::InvalidArgument(e.to_string()))?;
            let message = FutureRecord::to(&self.topic).key(&key).payload(&payload);
            self.producer
                .send(message, Timeout::After(self.send_timeout))
                .await
                .map_err(|(e, _)| PublishError::Backend(e.to_string()))?;
            Ok(PublishAck {
                key,
                delivered_at: Utc::now(),
            })
        }
    }
}
