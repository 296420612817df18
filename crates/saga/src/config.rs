//! Runtime settings loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use payment::RandomSettlement;
use transport::{DEFAULT_EXCHANGE, OutboxRelay, QueueSpec};

/// Saga runtime settings with defaults.
///
/// Reads from environment variables:
/// - `EXCHANGE_NAME` (default: `"microservice.events"`)
/// - `QUEUE_PREFETCH` (default: `10`)
/// - `MAX_DELIVERIES` (default: `5`)
/// - `RETRY_BACKOFF_MS` (default: `100`)
/// - `OUTBOX_POLL_INTERVAL_MS` (default: `50`)
/// - `OUTBOX_BATCH_SIZE` (default: `100`)
/// - `PAYMENT_SUCCESS_PROBABILITY` (default: `0.9`)
/// - `PAYMENT_SEED` (default: unset, seeded from entropy)
/// - `LOCK_TIMEOUT_MS` (default: `5000`)
#[derive(Debug, Clone, PartialEq)]
pub struct SagaConfig {
    pub exchange: String,
    pub prefetch: usize,
    pub max_deliveries: u32,
    pub retry_backoff: Duration,
    pub outbox_poll_interval: Duration,
    pub outbox_batch_size: usize,
    pub payment_success_probability: f64,
    pub payment_seed: Option<u64>,
    pub lock_timeout: Duration,
}

impl SagaConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the settings from an arbitrary key lookup. Unparseable values
    /// fall back to the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());
        let millis = |key: &str, default: Duration| {
            parsed(key).map(Duration::from_millis).unwrap_or(default)
        };

        Self {
            exchange: lookup("EXCHANGE_NAME")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.exchange),
            prefetch: parse_or(&lookup, "QUEUE_PREFETCH", defaults.prefetch),
            max_deliveries: parse_or(&lookup, "MAX_DELIVERIES", defaults.max_deliveries),
            retry_backoff: millis("RETRY_BACKOFF_MS", defaults.retry_backoff),
            outbox_poll_interval: millis("OUTBOX_POLL_INTERVAL_MS", defaults.outbox_poll_interval),
            outbox_batch_size: parse_or(&lookup, "OUTBOX_BATCH_SIZE", defaults.outbox_batch_size),
            payment_success_probability: parse_or(
                &lookup,
                "PAYMENT_SUCCESS_PROBABILITY",
                defaults.payment_success_probability,
            ),
            payment_seed: parsed("PAYMENT_SEED"),
            lock_timeout: millis("LOCK_TIMEOUT_MS", defaults.lock_timeout),
        }
    }

    /// Applies the prefetch and delivery limit to a queue declaration.
    pub fn queue(&self, spec: QueueSpec) -> QueueSpec {
        spec.with_prefetch(self.prefetch)
            .with_max_deliveries(self.max_deliveries)
    }
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            exchange: DEFAULT_EXCHANGE.to_string(),
            prefetch: QueueSpec::DEFAULT_PREFETCH,
            max_deliveries: QueueSpec::DEFAULT_MAX_DELIVERIES,
            retry_backoff: Duration::from_millis(100),
            outbox_poll_interval: OutboxRelay::DEFAULT_POLL_INTERVAL,
            outbox_batch_size: OutboxRelay::DEFAULT_BATCH_SIZE,
            payment_success_probability: RandomSettlement::DEFAULT_SUCCESS_PROBABILITY,
            payment_seed: None,
            lock_timeout: Duration::from_secs(5),
        }
    }
}
