//! Lease management for stateful tool endpoints
//!
//! Each endpoint owns one async lock guarding its optional lease. Callers go
//! through [`SessionManager::ensure_valid`], which lazily (re)initializes an
//! absent or expired lease while holding that lock, so concurrent callers on
//! an expired endpoint trigger exactly one initialization. A background task
//! started with [`SessionManager::spawn_refresh`] replaces every active lease
//! on a fixed interval and reports to the control loop over a channel.

use crate::error::{CoordinationError, CoordinationResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// An opaque session token with a bounded lifetime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionLease {
    token: String,
    created_at: Instant,
    expires_at: Instant,
}

impl SessionLease {
    /// Lease valid for `ttl` from now
    pub fn new(token: impl Into<String>, ttl: Duration) -> Self {
        let created_at = Instant::now();
        Self {
            token: token.into(),
            created_at,
            expires_at: created_at + ttl,
        }
    }

    /// Valid strictly before expiry
    pub fn is_valid_at(&self, now: Instant) -> bool {
        now < self.expires_at
    }

    pub fn age(&self) -> Duration {
        Instant::now().saturating_duration_since(self.created_at)
    }
}

/// Endpoint-specific lease factory
#[async_trait]
pub trait LeaseInitializer: Send + Sync {
    /// Open a new session against `endpoint`
    async fn initialize(&self, endpoint: &str) -> anyhow::Result<SessionLease>;
}

/// Notifications from the lease machinery to the control loop
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    Initialized { endpoint: String },
    Refreshed { endpoint: String },
    RefreshFailed { endpoint: String, message: String },
    Unavailable { endpoint: String, message: String },
}

/// Retry and refresh timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Initialization attempts before giving up
    pub init_attempts: u32,
    /// Linear backoff unit: attempt `n` waits `n * init_backoff` before retrying
    pub init_backoff: Duration,
    /// Period of the background refresh task
    pub refresh_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            init_attempts: 3,
            init_backoff: Duration::from_secs(1),
            refresh_interval: Duration::from_secs(120),
        }
    }
}

type LeaseSlot = Arc<Mutex<Option<SessionLease>>>;

/// Lease holder for every endpoint of one build session
pub struct SessionManager {
    initializer: Arc<dyn LeaseInitializer>,
    config: SessionConfig,
    leases: std::sync::Mutex<HashMap<String, LeaseSlot>>,
    events: Option<mpsc::UnboundedSender<SessionEvent>>,
    initializations: AtomicU64,
}

impl SessionManager {
    pub fn new(initializer: Arc<dyn LeaseInitializer>, config: SessionConfig) -> Self {
        Self {
            initializer,
            config,
            leases: std::sync::Mutex::new(HashMap::new()),
            events: None,
            initializations: AtomicU64::new(0),
        }
    }

    /// Report lease events on `tx`
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Successful initializations so far (including refreshes)
    pub fn initialization_count(&self) -> u64 {
        self.initializations.load(Ordering::SeqCst)
    }

    fn slot(&self, endpoint: &str) -> LeaseSlot {
        let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        leases
            .entry(endpoint.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    fn slots(&self) -> Vec<(String, LeaseSlot)> {
        let leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        let mut slots: Vec<_> = leases.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        slots.sort_by(|a, b| a.0.cmp(&b.0));
        slots
    }

    fn emit(&self, event: SessionEvent) {
        if let Some(tx) = &self.events {
            // Receiver gone means the loop finished; nothing left to notify.
            let _ = tx.send(event);
        }
    }

    /// Token for `endpoint`, initializing or reinitializing the lease as needed
    pub async fn ensure_valid(&self, endpoint: &str) -> CoordinationResult<String> {
        let slot = self.slot(endpoint);
        let mut guard = slot.lock().await;

        if let Some(lease) = guard.as_ref() {
            if lease.is_valid_at(Instant::now()) {
                return Ok(lease.token.clone());
            }
            tracing::debug!(endpoint, age_secs = lease.age().as_secs(), "Lease expired");
        }

        match self.initialize_with_retry(endpoint).await {
            Ok(lease) => {
                let token = lease.token.clone();
                *guard = Some(lease);
                tracing::info!(endpoint, "Session initialized");
                self.emit(SessionEvent::Initialized {
                    endpoint: endpoint.to_string(),
                });
                Ok(token)
            }
            Err(e) => {
                *guard = None;
                self.emit(SessionEvent::Unavailable {
                    endpoint: endpoint.to_string(),
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Drop the lease so the next `ensure_valid` reinitializes
    pub async fn invalidate(&self, endpoint: &str) {
        let slot = self.slot(endpoint);
        let mut guard = slot.lock().await;
        if guard.take().is_some() {
            tracing::info!(endpoint, "Session invalidated");
        }
    }

    /// Replace every active lease. Returns the number refreshed.
    ///
    /// A failed refresh keeps the old lease; it stays usable until it expires.
    pub async fn refresh_all(&self) -> usize {
        let mut refreshed = 0;
        for (endpoint, slot) in self.slots() {
            let mut guard = slot.lock().await;
            if guard.is_none() {
                continue;
            }
            match self.initialize_with_retry(&endpoint).await {
                Ok(lease) => {
                    *guard = Some(lease);
                    refreshed += 1;
                    tracing::debug!(endpoint = %endpoint, "Session refreshed");
                    self.emit(SessionEvent::Refreshed { endpoint });
                }
                Err(e) => {
                    tracing::warn!(endpoint = %endpoint, error = %e, "Session refresh failed");
                    self.emit(SessionEvent::RefreshFailed {
                        endpoint,
                        message: e.to_string(),
                    });
                }
            }
        }
        refreshed
    }

    /// Start the periodic refresh task; it stops when `cancel` fires
    pub fn spawn_refresh(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = self.config.refresh_interval;
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!("Session refresh task shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        let n = self.refresh_all().await;
                        tracing::debug!(refreshed = n, "Session refresh cycle complete");
                    }
                }
            }
        })
    }

    async fn initialize_with_retry(&self, endpoint: &str) -> CoordinationResult<SessionLease> {
        let attempts = self.config.init_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match self.initializer.initialize(endpoint).await {
                Ok(lease) => {
                    self.initializations.fetch_add(1, Ordering::SeqCst);
                    return Ok(lease);
                }
                Err(e) => {
                    last_error = format!("{e:#}");
                    tracing::warn!(
                        endpoint,
                        attempt,
                        max_attempts = attempts,
                        error = %last_error,
                        "Session initialization failed"
                    );
                    if attempt < attempts {
                        tokio::time::sleep(self.config.init_backoff * attempt).await;
                    }
                }
            }
        }

        Err(CoordinationError::session_unavailable(endpoint, attempts, last_error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct CountingInit {
        ttl: Duration,
        calls: AtomicU32,
        fail_first: u32,
    }

    impl CountingInit {
        fn new(ttl: Duration, fail_first: u32) -> Self {
            Self {
                ttl,
                calls: AtomicU32::new(0),
                fail_first,
            }
        }
    }

    #[async_trait]
    impl LeaseInitializer for CountingInit {
        async fn initialize(&self, endpoint: &str) -> anyhow::Result<SessionLease> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.fail_first {
                anyhow::bail!("connection refused");
            }
            Ok(SessionLease::new(format!("{endpoint}-{n}"), self.ttl))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_lazy_init_and_reuse() {
        let init = Arc::new(CountingInit::new(Duration::from_secs(300), 0));
        let manager = SessionManager::new(init.clone(), SessionConfig::default());

        let t1 = manager.ensure_valid("quantconnect").await.unwrap();
        let t2 = manager.ensure_valid("quantconnect").await.unwrap();
        assert_eq!(t1, t2);
        assert_eq!(init.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_reinitializes() {
        let init = Arc::new(CountingInit::new(Duration::from_secs(300), 0));
        let manager = SessionManager::new(init.clone(), SessionConfig::default());

        manager.ensure_valid("quantconnect").await.unwrap();
        tokio::time::advance(Duration::from_secs(299)).await;
        manager.ensure_valid("quantconnect").await.unwrap();
        assert_eq!(init.calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(1)).await;
        let token = manager.ensure_valid("quantconnect").await.unwrap();
        assert_eq!(token, "quantconnect-2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_unavailable() {
        let init = Arc::new(CountingInit::new(Duration::from_secs(300), 10));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let manager = SessionManager::new(init.clone(), SessionConfig::default()).with_events(tx);

        let started = Instant::now();
        let err = manager.ensure_valid("linear").await.unwrap_err();
        assert!(matches!(
            err,
            CoordinationError::SessionUnavailable { attempts: 3, .. }
        ));
        assert_eq!(init.calls.load(Ordering::SeqCst), 3);
        // Linear backoff: 1s + 2s between the three attempts.
        assert_eq!(started.elapsed(), Duration::from_secs(3));
        assert!(matches!(rx.try_recv(), Ok(SessionEvent::Unavailable { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_within_retry_budget() {
        let init = Arc::new(CountingInit::new(Duration::from_secs(300), 2));
        let manager = SessionManager::new(init.clone(), SessionConfig::default());
        let token = manager.ensure_valid("memory").await.unwrap();
        assert_eq!(token, "memory-3");
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_forces_reinit() {
        let init = Arc::new(CountingInit::new(Duration::from_secs(3600), 0));
        let manager = SessionManager::new(init.clone(), SessionConfig::default());
        manager.ensure_valid("github").await.unwrap();
        manager.invalidate("github").await;
        let token = manager.ensure_valid("github").await.unwrap();
        assert_eq!(token, "github-2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_only_touches_active_leases() {
        let init = Arc::new(CountingInit::new(Duration::from_secs(3600), 0));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let manager = SessionManager::new(init.clone(), SessionConfig::default()).with_events(tx);

        manager.ensure_valid("memory").await.unwrap();
        manager.invalidate("thinking").await;
        assert_eq!(manager.refresh_all().await, 1);
        assert_eq!(manager.initialization_count(), 2);

        assert!(matches!(rx.try_recv(), Ok(SessionEvent::Initialized { .. })));
        assert_eq!(
            rx.try_recv().unwrap(),
            SessionEvent::Refreshed {
                endpoint: "memory".into()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_refresh_stops_on_cancel() {
        let init = Arc::new(CountingInit::new(Duration::from_secs(300), 0));
        let manager = Arc::new(SessionManager::new(init.clone(), SessionConfig::default()));
        manager.ensure_valid("quantconnect").await.unwrap();

        let cancel = CancellationToken::new();
        let handle = manager.clone().spawn_refresh(cancel.clone());

        tokio::time::sleep(Duration::from_secs(250)).await;
        // Two refresh cycles (t=120, t=240) plus the initial lease.
        assert_eq!(manager.initialization_count(), 3);

        cancel.cancel();
        handle.await.unwrap();
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(manager.initialization_count(), 3);
    }
}
