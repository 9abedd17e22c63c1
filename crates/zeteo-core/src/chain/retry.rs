//! ============================================================================
//! RPC Retry Logic - Exponential Backoff on Rate Limiting
//! ============================================================================
//! Provides bounded retries for ledger calls:
//! - Error classification (rate-limited vs everything else)
//! - Exponential backoff `base * 2^attempt`, capped, optional jitter
//! - Non rate-limit errors propagate on the first attempt
//! ============================================================================

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use super::RpcError;

/// JSON-RPC code several node providers use for "limit exceeded"
const LIMIT_EXCEEDED_CODE: i64 = -32005;

/// Configuration for RPC retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,
    /// Base delay between retries (will be multiplied by 2^attempt)
    pub base_delay_ms: u64,
    /// Maximum delay between retries
    pub max_delay_ms: u64,
    /// Whether to add jitter to delays
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 10_000,
            jitter: false,
        }
    }
}

/// Error classification for retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Throttled by the endpoint, back off and retry
    RateLimited,
    /// Anything else, surface immediately
    Permanent,
}

/// Classify an RPC error to determine if retry is appropriate
pub fn classify_error(error: &RpcError) -> ErrorKind {
    match error {
        RpcError::Rpc { code, .. } if *code == 429 || *code == LIMIT_EXCEEDED_CODE => {
            return ErrorKind::RateLimited;
        }
        RpcError::Http { status: 429, .. } => return ErrorKind::RateLimited,
        _ => {}
    }

    // Transport and decode errors embed request URLs and bodies, never a
    // provider verdict
    match error {
        RpcError::Rpc { message, .. } | RpcError::Http { message, .. } => classify_message(message),
        RpcError::Transport(_) | RpcError::Decode(_) => ErrorKind::Permanent,
    }
}

/// Phrases providers use for throttling. `429` only counts as a status.
const RATE_LIMIT_PATTERNS: [&str; 7] = [
    "rate limit",
    "too many requests",
    "limit exceeded",
    "status 429",
    "http 429",
    "code 429",
    "error 429",
];

fn classify_message(message: &str) -> ErrorKind {
    let lower = message.to_lowercase();

    if RATE_LIMIT_PATTERNS.iter().any(|p| lower.contains(p)) {
        return ErrorKind::RateLimited;
    }

    ErrorKind::Permanent
}

/// Calculate delay with exponential backoff and optional jitter
pub fn calculate_delay(attempt: u32, config: &RetryConfig) -> Duration {
    let multiplier = 2u64.saturating_pow(attempt.min(63));
    let base_delay = config.base_delay_ms.saturating_mul(multiplier);
    let capped_delay = base_delay.min(config.max_delay_ms);

    let final_delay = if config.jitter {
        // 0-50% extra
        let jitter_factor = 1.0 + rand::random::<f64>() * 0.5;
        (capped_delay as f64 * jitter_factor) as u64
    } else {
        capped_delay
    };

    Duration::from_millis(final_delay)
}

/// Run `op` until it succeeds, fails with a non rate-limit error, or the
/// attempt budget is spent. The last error is returned on exhaustion.
pub async fn retry_with_backoff<T, F, Fut>(
    config: &RetryConfig,
    label: &str,
    mut op: F,
) -> Result<T, RpcError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RpcError>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        match op().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!("{} succeeded on attempt {}", label, attempt + 1);
                }
                return Ok(value);
            }
            Err(e) => {
                let kind = classify_error(&e);

                if kind == ErrorKind::Permanent {
                    debug!("{} failed without retry: {}", label, e);
                    return Err(e);
                }

                if attempt + 1 >= max_attempts {
                    warn!("{} still rate limited after {} attempts: {}", label, max_attempts, e);
                    return Err(e);
                }

                let delay = calculate_delay(attempt, config);
                warn!(
                    "{} rate limited (attempt {}), retrying in {:?}",
                    label,
                    attempt + 1,
                    delay
                );
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
