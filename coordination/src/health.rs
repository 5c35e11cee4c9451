//! Health: Endpoint probing with degraded-confidence fallbacks
//!
//! Each endpoint is checked with an ordered chain of probe methods. The first
//! method that answers decides the outcome; passing only through a fallback
//! method still counts as healthy, at the fallback's confidence.
//!
//! # Design
//!
//! ```text
//! probe(endpoint)
//!   ├─ liveness answers ok        → Healthy  (confidence 1.0)
//!   ├─ capability answers ok      → Healthy  (confidence 0.7, warning)
//!   ├─ tcp reachability ok        → Healthy  (confidence 0.4, warnings)
//!   ├─ any method reports impaired → Degraded
//!   └─ every method fails          → Down
//! ```
//!
//! Each method gets a fixed number of attempts with a fixed backoff before
//! the chain falls through to the next one.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Aggregate health of one endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Down,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Down => write!(f, "down"),
        }
    }
}

/// Probe methods, highest fidelity first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeMethod {
    /// Dedicated liveness query (e.g. `GET /health`)
    Liveness,
    /// Capability or introspection query (e.g. listing tools)
    Capability,
    /// Raw TCP connect
    Reachability,
}

impl ProbeMethod {
    pub const CHAIN: [ProbeMethod; 3] = [
        ProbeMethod::Liveness,
        ProbeMethod::Capability,
        ProbeMethod::Reachability,
    ];

    /// Confidence when this method decides the outcome
    pub fn confidence(&self) -> f64 {
        match self {
            Self::Liveness => 1.0,
            Self::Capability => 0.7,
            Self::Reachability => 0.4,
        }
    }
}

impl std::fmt::Display for ProbeMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Liveness => write!(f, "liveness"),
            Self::Capability => write!(f, "capability"),
            Self::Reachability => write!(f, "reachability"),
        }
    }
}

/// What a probe method observed when the endpoint answered
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeSignal {
    Ok,
    /// Answered, but reported a problem (non-2xx health, error payload)
    Impaired(String),
}

/// An endpoint to probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeTarget {
    pub name: String,
    /// Base URL or `host:port`, interpreted by the probe implementation
    pub address: String,
    /// Critical endpoints block pre-flight when down
    pub critical: bool,
}

impl ProbeTarget {
    pub fn new(name: impl Into<String>, address: impl Into<String>, critical: bool) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            critical,
        }
    }
}

/// Transport-specific probe implementation
#[async_trait]
pub trait EndpointProbe: Send + Sync {
    /// Run one check. `Err` means the endpoint did not answer.
    async fn check(&self, target: &ProbeTarget, method: ProbeMethod) -> anyhow::Result<ProbeSignal>;
}

/// Retry policy for probes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    pub attempts_per_method: u32,
    /// Fixed pause between attempts of one method
    pub retry_backoff: Duration,
    /// Upper bound for a single check
    pub check_timeout: Duration,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            attempts_per_method: 3,
            retry_backoff: Duration::from_secs(2),
            check_timeout: Duration::from_secs(5),
        }
    }
}

/// Result of probing one endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeOutcome {
    pub endpoint: String,
    pub critical: bool,
    pub status: HealthStatus,
    /// Method that decided the outcome; `None` when down
    pub served_by: Option<ProbeMethod>,
    /// Confidence in the outcome (0.0–1.0)
    pub confidence: f64,
    /// Checks issued across all methods
    pub attempts: u32,
    pub warnings: Vec<String>,
    pub checked_at: DateTime<Utc>,
}

impl ProbeOutcome {
    /// Healthy via a fallback method
    pub fn is_reduced_confidence(&self) -> bool {
        self.status == HealthStatus::Healthy && self.confidence < 1.0
    }
}

/// Health of every configured endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub outcomes: Vec<ProbeOutcome>,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    /// Critical endpoints that are down
    pub fn blocking(&self) -> Vec<&ProbeOutcome> {
        self.outcomes
            .iter()
            .filter(|o| o.critical && o.status == HealthStatus::Down)
            .collect()
    }

    /// Whether pre-flight may proceed
    pub fn is_ready(&self) -> bool {
        self.blocking().is_empty()
    }

    pub fn get(&self, endpoint: &str) -> Option<&ProbeOutcome> {
        self.outcomes.iter().find(|o| o.endpoint == endpoint)
    }
}

/// Probes endpoints through the fallback chain
#[derive(Clone)]
pub struct HealthMonitor {
    probe: Arc<dyn EndpointProbe>,
    config: HealthCheckConfig,
}

impl HealthMonitor {
    pub fn new(probe: Arc<dyn EndpointProbe>, config: HealthCheckConfig) -> Self {
        Self { probe, config }
    }

    /// Probe one endpoint through liveness, capability, then reachability
    pub async fn probe(&self, target: &ProbeTarget) -> ProbeOutcome {
        let mut warnings = Vec::new();
        let mut attempts = 0;
        let per_method = self.config.attempts_per_method.max(1);

        for (idx, method) in ProbeMethod::CHAIN.into_iter().enumerate() {
            for attempt in 1..=per_method {
                attempts += 1;
                let result =
                    tokio::time::timeout(self.config.check_timeout, self.probe.check(target, method))
                        .await;

                let failure = match result {
                    Ok(Ok(ProbeSignal::Ok)) => {
                        if idx > 0 {
                            warnings.push(format!(
                                "{}: primary method(s) failed, passed via {}",
                                target.name, method
                            ));
                        }
                        return self.outcome(
                            target,
                            HealthStatus::Healthy,
                            Some(method),
                            method.confidence(),
                            attempts,
                            warnings,
                        );
                    }
                    Ok(Ok(ProbeSignal::Impaired(reason))) => {
                        warnings.push(format!("{} {} impaired: {}", target.name, method, reason));
                        return self.outcome(
                            target,
                            HealthStatus::Degraded,
                            Some(method),
                            method.confidence(),
                            attempts,
                            warnings,
                        );
                    }
                    Ok(Err(e)) => e.to_string(),
                    Err(_) => format!("timed out after {:?}", self.config.check_timeout),
                };

                tracing::debug!(
                    endpoint = %target.name,
                    method = %method,
                    attempt,
                    error = %failure,
                    "Health check failed"
                );
                if attempt == per_method {
                    warnings.push(format!("{} {} failed: {}", target.name, method, failure));
                } else {
                    tokio::time::sleep(self.config.retry_backoff).await;
                }
            }
        }

        warnings.push(format!(
            "{}: all {} probe methods exhausted",
            target.name,
            ProbeMethod::CHAIN.len()
        ));
        self.outcome(target, HealthStatus::Down, None, 0.0, attempts, warnings)
    }

    /// Probe every target concurrently
    pub async fn check_all(&self, targets: &[ProbeTarget]) -> HealthReport {
        let outcomes = futures::future::join_all(targets.iter().map(|t| self.probe(t))).await;
        for o in &outcomes {
            match o.status {
                HealthStatus::Healthy if o.is_reduced_confidence() => tracing::warn!(
                    endpoint = %o.endpoint,
                    confidence = o.confidence,
                    "Endpoint healthy via fallback probe"
                ),
                HealthStatus::Healthy => {
                    tracing::info!(endpoint = %o.endpoint, "Endpoint healthy")
                }
                HealthStatus::Degraded => {
                    tracing::warn!(endpoint = %o.endpoint, "Endpoint degraded")
                }
                HealthStatus::Down => tracing::error!(
                    endpoint = %o.endpoint,
                    critical = o.critical,
                    "Endpoint down"
                ),
            }
        }
        HealthReport {
            outcomes,
            checked_at: Utc::now(),
        }
    }

    fn outcome(
        &self,
        target: &ProbeTarget,
        status: HealthStatus,
        served_by: Option<ProbeMethod>,
        confidence: f64,
        attempts: u32,
        warnings: Vec<String>,
    ) -> ProbeOutcome {
        ProbeOutcome {
            endpoint: target.name.clone(),
            critical: target.critical,
            status,
            served_by,
            confidence,
            attempts,
            warnings,
            checked_at: Utc::now(),
        }
    }
}
