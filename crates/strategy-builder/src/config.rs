use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use coordination::{
    BackendDescriptor, EscalationConfig, HealthCheckConfig, ProbeTarget, RateLimitConfig,
    RateLimiter, SessionConfig,
};
use serde::{Deserialize, Serialize};

/// Session lifetime for endpoints that don't set one.
pub const DEFAULT_SESSION_TTL_SECS: u64 = 3600;

/// Backtest sessions expire much faster than the other tools.
pub const BACKTEST_SESSION_TTL_SECS: u64 = 300;

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.into())
}

fn default_session_ttl() -> u64 {
    DEFAULT_SESSION_TTL_SECS
}

/// A JSON-RPC tool endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub name: String,
    /// Base URL; requests go to `{url}/mcp`
    pub url: String,
    /// Pre-flight blocks when a critical endpoint is down
    #[serde(default)]
    pub critical: bool,
    #[serde(default = "default_session_ttl")]
    pub session_ttl_secs: u64,
    /// Token bucket for quota-limited endpoints
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
}

impl EndpointConfig {
    fn local(host: &str, name: &str, port: u16) -> Self {
        Self {
            name: name.into(),
            url: format!("{host}:{port}"),
            critical: false,
            session_ttl_secs: DEFAULT_SESSION_TTL_SECS,
            rate_limit: None,
        }
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }
}

/// `host:port` part of a URL, with the scheme's default port filled in.
pub fn socket_address(url: &str) -> Option<String> {
    let (scheme, rest) = url.split_once("://").unwrap_or(("http", url));
    let authority = rest.split('/').next()?;
    if authority.is_empty() {
        None
    } else if authority.contains(':') {
        Some(authority.to_string())
    } else {
        let port = if scheme == "https" { 443 } else { 80 };
        Some(format!("{authority}:{port}"))
    }
}

/// One rung of the generation-backend ladder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub name: String,
    pub model: String,
    /// Estimated USD per generation call, reserved before each call
    pub cost_per_call: f64,
}

/// Top-level build configuration.
///
/// Precedence: CLI flags > TOML file > `ACB_*` environment > built-in defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    pub endpoints: Vec<EndpointConfig>,
    /// Cheapest first
    pub backends: Vec<BackendConfig>,

    /// Generation agent command line; `{model}` and `{prompt_file}` are substituted
    pub generator_command: String,
    /// Working copy the agent edits
    pub workdir: PathBuf,
    /// Checkpoints, stored artifacts and build history
    pub state_dir: PathBuf,
    /// Artifact file submitted for backtesting
    pub entry_file: String,

    /// Endpoint that scores artifacts
    pub backtest_endpoint: String,
    /// Endpoint receiving status updates; `None` disables tracking
    pub tracker_endpoint: Option<String>,

    pub max_iterations: u32,
    pub wall_clock_timeout_secs: u64,
    pub per_call_timeout_secs: u64,
    pub cost_ceiling: f64,
    /// Checkpoint every K iterations
    pub checkpoint_interval: u32,
    /// Fitness score that ends the build successfully
    pub target_score: f64,

    pub similarity_threshold: f64,
    pub escalation_window: usize,
    pub top_tier_rounds: u32,

    pub session_refresh_secs: u64,
    pub session_init_attempts: u32,
    pub session_init_backoff_secs: u64,

    pub health_attempts: u32,
    pub health_backoff_secs: u64,
    pub health_timeout_secs: u64,
    pub skip_preflight: bool,

    pub tool_call_attempts: u32,
    pub tool_call_backoff_secs: u64,

    /// Slack-compatible incoming webhook
    pub slack_webhook: Option<String>,
    /// Push the branch and open a pull request at the end
    pub publish: bool,
    pub base_branch: String,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            endpoints: Self::default_endpoints(),
            backends: vec![
                BackendConfig {
                    name: "fast".into(),
                    model: env_string("ACB_FAST_MODEL", "claude-3-5-haiku-latest"),
                    cost_per_call: env_or("ACB_FAST_COST", 0.10),
                },
                BackendConfig {
                    name: "balanced".into(),
                    model: env_string("ACB_BALANCED_MODEL", "claude-sonnet-4-5"),
                    cost_per_call: env_or("ACB_BALANCED_COST", 0.50),
                },
                BackendConfig {
                    name: "deep".into(),
                    model: env_string("ACB_DEEP_MODEL", "claude-opus-4-1"),
                    cost_per_call: env_or("ACB_DEEP_COST", 2.00),
                },
            ],
            generator_command: env_string(
                "ACB_GENERATOR_CMD",
                "aider --model {model} --yes-always --no-auto-commits --message-file {prompt_file}",
            ),
            workdir: PathBuf::from(env_string("ACB_WORKDIR", ".")),
            state_dir: PathBuf::from(env_string("ACB_STATE_DIR", ".strategy-builder")),
            entry_file: env_string("ACB_ENTRY_FILE", "main.py"),
            backtest_endpoint: env_string("ACB_BACKTEST_ENDPOINT", "quantconnect"),
            tracker_endpoint: Some(env_string("ACB_TRACKER_ENDPOINT", "linear"))
                .filter(|s| !s.is_empty()),
            max_iterations: env_or("ACB_MAX_ITERATIONS", 20),
            wall_clock_timeout_secs: env_or("ACB_WALL_CLOCK_SECS", 4 * 3600),
            per_call_timeout_secs: env_or("ACB_CALL_TIMEOUT_SECS", 900),
            cost_ceiling: env_or("ACB_COST_CEILING", 20.0),
            checkpoint_interval: env_or("ACB_CHECKPOINT_INTERVAL", 3),
            target_score: env_or("ACB_TARGET_SCORE", 1.0),
            similarity_threshold: env_or("ACB_SIMILARITY_THRESHOLD", 0.8),
            escalation_window: env_or("ACB_ESCALATION_WINDOW", 3),
            top_tier_rounds: env_or("ACB_TOP_TIER_ROUNDS", 3),
            session_refresh_secs: env_or("ACB_SESSION_REFRESH_SECS", 120),
            session_init_attempts: 3,
            session_init_backoff_secs: 1,
            health_attempts: 3,
            health_backoff_secs: 2,
            health_timeout_secs: 5,
            skip_preflight: false,
            tool_call_attempts: 3,
            tool_call_backoff_secs: 2,
            slack_webhook: std::env::var("SLACK_WEBHOOK").ok().filter(|s| !s.is_empty()),
            publish: env_or("ACB_PUBLISH", true),
            base_branch: env_string("ACB_BASE_BRANCH", "main"),
        }
    }
}

impl BuildConfig {
    /// Default tool endpoints on the local host.
    fn default_endpoints() -> Vec<EndpointConfig> {
        let host = env_string("ACB_MCP_HOST", "http://localhost");
        let mut endpoints: Vec<EndpointConfig> = [
            ("quantconnect", 8000),
            ("linear", 8001),
            ("memory", 8002),
            ("thinking", 8003),
            ("github", 8004),
            ("knowledge", 8005),
            ("alpaca", 8006),
        ]
        .into_iter()
        .map(|(name, port)| EndpointConfig::local(&host, name, port))
        .collect();

        for ep in &mut endpoints {
            match ep.name.as_str() {
                "quantconnect" => {
                    ep.critical = true;
                    ep.session_ttl_secs = BACKTEST_SESSION_TTL_SECS;
                }
                "alpaca" => ep.rate_limit = Some(RateLimitConfig::per_minute(40)),
                _ => {}
            }
        }
        endpoints
    }

    /// Defaults, overlaid with a TOML file when given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config {}", path.display()))?;
                Self::from_toml(&raw)
                    .with_context(|| format!("Failed to parse config {}", path.display()))?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.backends.is_empty() {
            anyhow::bail!("at least one backend is required");
        }
        for b in &self.backends {
            if !b.cost_per_call.is_finite() || b.cost_per_call < 0.0 {
                anyhow::bail!("backend '{}' has invalid cost_per_call {}", b.name, b.cost_per_call);
            }
        }
        if !self.cost_ceiling.is_finite() || self.cost_ceiling <= 0.0 {
            anyhow::bail!("cost_ceiling must be > 0, got {}", self.cost_ceiling);
        }
        if self.max_iterations == 0 {
            anyhow::bail!("max_iterations must be >= 1");
        }
        if self.checkpoint_interval == 0 {
            anyhow::bail!("checkpoint_interval must be >= 1");
        }
        if self.per_call_timeout_secs == 0 || self.wall_clock_timeout_secs == 0 {
            anyhow::bail!("timeouts must be > 0");
        }
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            anyhow::bail!(
                "similarity_threshold must be within [0, 1], got {}",
                self.similarity_threshold
            );
        }
        if !self.generator_command.contains("{model}") {
            anyhow::bail!("generator_command must contain a {{model}} placeholder");
        }
        if self.endpoint(&self.backtest_endpoint).is_none() {
            anyhow::bail!("backtest endpoint '{}' is not configured", self.backtest_endpoint);
        }
        if let Some(tracker) = &self.tracker_endpoint {
            if self.endpoint(tracker).is_none() {
                anyhow::bail!("tracker endpoint '{tracker}' is not configured");
            }
        }
        for ep in &self.endpoints {
            if let Some(rl) = &ep.rate_limit {
                rl.validate()
                    .with_context(|| format!("endpoint '{}' rate limit", ep.name))?;
            }
        }
        Ok(())
    }

    pub fn endpoint(&self, name: &str) -> Option<&EndpointConfig> {
        self.endpoints.iter().find(|e| e.name == name)
    }

    pub fn per_call_timeout(&self) -> Duration {
        Duration::from_secs(self.per_call_timeout_secs)
    }

    pub fn wall_clock_timeout(&self) -> Duration {
        Duration::from_secs(self.wall_clock_timeout_secs)
    }

    pub fn tool_call_backoff(&self) -> Duration {
        Duration::from_secs(self.tool_call_backoff_secs)
    }

    pub fn backend_ladder(&self) -> Vec<BackendDescriptor> {
        self.backends
            .iter()
            .map(|b| BackendDescriptor::new(&b.name, &b.model, b.cost_per_call))
            .collect()
    }

    pub fn escalation_config(&self) -> EscalationConfig {
        EscalationConfig {
            window_size: self.escalation_window,
            similarity_threshold: self.similarity_threshold,
            top_tier_rounds: self.top_tier_rounds,
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            init_attempts: self.session_init_attempts,
            init_backoff: Duration::from_secs(self.session_init_backoff_secs),
            refresh_interval: Duration::from_secs(self.session_refresh_secs),
        }
    }

    pub fn health_config(&self) -> HealthCheckConfig {
        HealthCheckConfig {
            attempts_per_method: self.health_attempts,
            retry_backoff: Duration::from_secs(self.health_backoff_secs),
            check_timeout: Duration::from_secs(self.health_timeout_secs),
        }
    }

    pub fn probe_targets(&self) -> Vec<ProbeTarget> {
        self.endpoints
            .iter()
            .map(|e| ProbeTarget::new(&e.name, &e.url, e.critical))
            .collect()
    }

    pub fn rate_limiter(&self) -> Result<RateLimiter> {
        let mut limiter = RateLimiter::new();
        for ep in &self.endpoints {
            if let Some(rl) = ep.rate_limit {
                limiter = limiter.with_bucket(&ep.name, rl)?;
            }
        }
        Ok(limiter)
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.state_dir.join("checkpoints")
    }

    pub fn artifact_dir(&self) -> PathBuf {
        self.state_dir.join("artifacts")
    }

    pub fn history_path(&self) -> PathBuf {
        self.state_dir.join("build-history.jsonl")
    }
}
