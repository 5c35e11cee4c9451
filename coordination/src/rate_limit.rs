//! Per-endpoint token-bucket rate limiting
//!
//! [`RateLimiter::acquire`] never fails: a caller short on tokens sleeps for
//! exactly the time the bucket needs to refill the deficit. Each bucket sits
//! behind one async mutex that is held across that sleep, so concurrent
//! callers on one endpoint queue up while other endpoints proceed.

use crate::error::{CoordinationError, CoordinationResult};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Admission timestamps kept per bucket for statistics
const HISTORY_LEN: usize = 100;

/// Window reported by [`RateLimiter::stats`]
const STATS_WINDOW: Duration = Duration::from_secs(60);

/// Bucket parameters for one endpoint
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum tokens (burst size)
    pub capacity: f64,
    /// Tokens added per second
    pub refill_rate: f64,
}

impl RateLimitConfig {
    pub fn new(capacity: f64, refill_rate: f64) -> Self {
        Self {
            capacity,
            refill_rate,
        }
    }

    /// `requests` per minute with a burst of the same size
    pub fn per_minute(requests: u32) -> Self {
        let requests = f64::from(requests);
        Self::new(requests, requests / 60.0)
    }

    pub fn validate(&self) -> CoordinationResult<()> {
        if !self.capacity.is_finite() || self.capacity <= 0.0 {
            return Err(CoordinationError::config(format!(
                "rate limit capacity must be > 0, got {}",
                self.capacity
            )));
        }
        if !self.refill_rate.is_finite() || self.refill_rate <= 0.0 {
            return Err(CoordinationError::config(format!(
                "rate limit refill_rate must be > 0, got {}",
                self.refill_rate
            )));
        }
        Ok(())
    }
}

/// Mutable bucket state, only touched under its mutex
#[derive(Debug)]
struct RateBucket {
    tokens: f64,
    capacity: f64,
    refill_rate: f64,
    last_refill: Instant,
    history: VecDeque<Instant>,
}

impl RateBucket {
    fn new(config: RateLimitConfig) -> Self {
        Self {
            tokens: config.capacity,
            capacity: config.capacity,
            refill_rate: config.refill_rate,
            last_refill: Instant::now(),
            history: VecDeque::with_capacity(HISTORY_LEN),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    fn admit(&mut self, at: Instant) {
        if self.history.len() == HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back(at);
    }
}

/// Snapshot of one bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitStats {
    pub endpoint: String,
    /// Admissions during the last 60 seconds
    pub requests_last_minute: usize,
    pub tokens_available: f64,
    pub capacity: f64,
}

/// Token buckets keyed by endpoint name
#[derive(Debug, Clone, Default)]
pub struct RateLimiter {
    buckets: HashMap<String, Arc<Mutex<RateBucket>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a bucket for `endpoint`
    pub fn with_bucket(
        mut self,
        endpoint: impl Into<String>,
        config: RateLimitConfig,
    ) -> CoordinationResult<Self> {
        config.validate()?;
        self.buckets
            .insert(endpoint.into(), Arc::new(Mutex::new(RateBucket::new(config))));
        Ok(self)
    }

    /// Whether `endpoint` is rate limited
    pub fn is_limited(&self, endpoint: &str) -> bool {
        self.buckets.contains_key(endpoint)
    }

    /// Take `cost` tokens from `endpoint`'s bucket, sleeping for any deficit.
    ///
    /// Returns how long the caller waited. Endpoints without a bucket pass
    /// straight through.
    pub async fn acquire(&self, endpoint: &str, cost: f64) -> Duration {
        let Some(bucket) = self.buckets.get(endpoint) else {
            return Duration::ZERO;
        };
        let cost = cost.max(0.0);

        let started = Instant::now();
        let mut bucket = bucket.lock().await;
        bucket.refill(Instant::now());

        if bucket.tokens >= cost {
            bucket.tokens -= cost;
        } else {
            let deficit = cost - bucket.tokens;
            let wait = Duration::from_secs_f64(deficit / bucket.refill_rate);
            tracing::debug!(
                endpoint,
                deficit,
                wait_ms = wait.as_millis() as u64,
                "Rate limit reached, waiting for refill"
            );
            tokio::time::sleep(wait).await;
            // The sleep refilled exactly the deficit; all of it is spent now.
            bucket.tokens = 0.0;
            bucket.last_refill = Instant::now();
        }

        let now = Instant::now();
        bucket.admit(now);
        now.saturating_duration_since(started)
    }

    /// Statistics for one endpoint, or `None` if it has no bucket
    pub async fn stats(&self, endpoint: &str) -> Option<RateLimitStats> {
        let bucket = self.buckets.get(endpoint)?;
        let mut bucket = bucket.lock().await;
        let now = Instant::now();
        bucket.refill(now);
        let requests_last_minute = bucket
            .history
            .iter()
            .filter(|t| now.saturating_duration_since(**t) < STATS_WINDOW)
            .count();
        Some(RateLimitStats {
            endpoint: endpoint.to_string(),
            requests_last_minute,
            tokens_available: bucket.tokens,
            capacity: bucket.capacity,
        })
    }

    /// Statistics for every bucket, sorted by endpoint
    pub async fn all_stats(&self) -> Vec<RateLimitStats> {
        let mut names: Vec<&String> = self.buckets.keys().collect();
        names.sort();
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            if let Some(stats) = self.stats(name).await {
                out.push(stats);
            }
        }
        out
    }
}
