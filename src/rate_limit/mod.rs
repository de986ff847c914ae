//! Rate limiting for vision backend requests.
//!
//! Each backend policy couples a token bucket (requests per minute, refilled
//! fractionally) with a concurrency semaphore. A separate process-global
//! semaphore caps in-flight OCR requests across all jobs on the host.
//!
//! Limiters are process-local by design: backend quotas are generously
//! provisioned and over-rate is tolerated by retry.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("rate limiter acquire timed out after {0:?}")]
    Timeout(Duration),
    #[error("rate limiter closed")]
    Closed,
}

/// Limits for one backend (or provider) policy. Zero disables a dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatePolicy {
    pub max_rpm: u32,
    pub max_concurrent: usize,
}

impl RatePolicy {
    pub fn new(max_rpm: u32, max_concurrent: usize) -> Self {
        Self {
            max_rpm,
            max_concurrent,
        }
    }

    /// No limits at all.
    pub fn unlimited() -> Self {
        Self {
            max_rpm: 0,
            max_concurrent: 0,
        }
    }
}

struct Bucket {
    /// Fractional token accumulator, capped at `max_rpm`.
    tokens: f64,
    last_refill: Instant,
}

/// A granted request slot. Dropping it returns the concurrency permit; the
/// consumed token is never returned.
pub struct RatePermit {
    _concurrency: Option<OwnedSemaphorePermit>,
}

/// Token bucket plus concurrency semaphore for a single policy.
pub struct RateLimiter {
    policy: RatePolicy,
    bucket: Mutex<Bucket>,
    semaphore: Arc<Semaphore>,
}

impl RateLimiter {
    pub fn new(policy: RatePolicy) -> Self {
        let permits = if policy.max_concurrent == 0 {
            Semaphore::MAX_PERMITS
        } else {
            policy.max_concurrent
        };
        Self {
            policy,
            // The bucket starts empty: a newly booted worker must not burst
            // past the provider quota.
            bucket: Mutex::new(Bucket {
                tokens: 0.0,
                last_refill: Instant::now(),
            }),
            semaphore: Arc::new(Semaphore::new(permits)),
        }
    }

    pub fn policy(&self) -> RatePolicy {
        self.policy
    }

    /// Block until both a concurrency slot and a token are available, or the
    /// timeout elapses.
    pub async fn acquire(&self, timeout: Duration) -> Result<RatePermit, RateLimitError> {
        let deadline = Instant::now() + timeout;

        let concurrency = match tokio::time::timeout_at(
            deadline,
            self.semaphore.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => Some(permit),
            Ok(Err(_)) => return Err(RateLimitError::Closed),
            Err(_) => return Err(RateLimitError::Timeout(timeout)),
        };

        if self.policy.max_rpm == 0 {
            return Ok(RatePermit {
                _concurrency: concurrency,
            });
        }

        let rate_per_sec = f64::from(self.policy.max_rpm) / 60.0;
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
                bucket.tokens =
                    (bucket.tokens + elapsed * rate_per_sec).min(f64::from(self.policy.max_rpm));
                bucket.last_refill = now;
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    None
                } else {
                    Some(Duration::from_secs_f64(
                        (1.0 - bucket.tokens) / rate_per_sec,
                    ))
                }
            };

            match wait {
                None => {
                    return Ok(RatePermit {
                        _concurrency: concurrency,
                    })
                }
                Some(delay) => {
                    if Instant::now() + delay > deadline {
                        return Err(RateLimitError::Timeout(timeout));
                    }
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Registry of named limiters plus the process-global in-flight ceiling.
pub struct RateLimiters {
    limiters: RwLock<HashMap<String, Arc<RateLimiter>>>,
    policies: HashMap<String, RatePolicy>,
    default_policy: RatePolicy,
    global: Arc<Semaphore>,
}

impl RateLimiters {
    pub fn new(
        default_policy: RatePolicy,
        policies: HashMap<String, RatePolicy>,
        max_global_requests: usize,
    ) -> Self {
        let global = if max_global_requests == 0 {
            Semaphore::MAX_PERMITS
        } else {
            max_global_requests
        };
        Self {
            limiters: RwLock::new(HashMap::new()),
            policies,
            default_policy,
            global: Arc::new(Semaphore::new(global)),
        }
    }

    /// The limiter for a named policy, created on first use.
    pub fn get(&self, name: &str) -> Arc<RateLimiter> {
        if let Some(limiter) = self.limiters.read().expect("lock poisoned").get(name) {
            return limiter.clone();
        }
        let mut limiters = self.limiters.write().expect("lock poisoned");
        limiters
            .entry(name.to_string())
            .or_insert_with(|| {
                let policy = self
                    .policies
                    .get(name)
                    .copied()
                    .unwrap_or(self.default_policy);
                Arc::new(RateLimiter::new(policy))
            })
            .clone()
    }

    /// Acquire a slot against the process-wide request ceiling.
    pub async fn acquire_global(&self) -> Result<OwnedSemaphorePermit, RateLimitError> {
        self.global
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| RateLimitError::Closed)
    }
}

/// Exponential backoff delay for retry attempt `attempt` (0-based).
pub fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(2u64.pow(attempt.min(6)))
}
