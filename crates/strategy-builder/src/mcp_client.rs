//! JSON-RPC 2.0 client for the tool endpoints.
//!
//! Every endpoint accepts `POST {url}/mcp`. Calls go through the session
//! manager (token in `X-Session-Token`) and the rate limiter, and are retried
//! with a fixed pause; a session-related failure drops the lease first so the
//! retry starts with a fresh one.
//!
//! The same module provides the transport-specific pieces the coordination
//! crate needs: [`McpLeaseInitializer`] and [`McpProbe`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use coordination::{
    EndpointProbe, LeaseInitializer, ProbeMethod, ProbeSignal, ProbeTarget, RateLimiter,
    SessionLease, SessionManager,
};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::{socket_address, BuildConfig, EndpointConfig};
use crate::errors::McpError;

/// Header carrying the session token.
pub const SESSION_HEADER: &str = "X-Session-Token";

const INIT_TIMEOUT: Duration = Duration::from_secs(10);
const CALL_TIMEOUT: Duration = Duration::from_secs(30);

fn rpc_url(base: &str) -> String {
    format!("{}/mcp", base.trim_end_matches('/'))
}

/// Generic tool call surface, routed through sessions and rate limits.
#[async_trait]
pub trait ToolClient: Send + Sync {
    async fn call(&self, endpoint: &str, method: &str, params: Value) -> Result<Value, McpError>;
}

/// Session-aware, rate-limited JSON-RPC client.
pub struct McpClient {
    http: reqwest::Client,
    endpoints: HashMap<String, EndpointConfig>,
    sessions: Arc<SessionManager>,
    limiter: Arc<RateLimiter>,
    attempts: u32,
    backoff: Duration,
    next_id: AtomicU64,
}

impl McpClient {
    pub fn new(
        config: &BuildConfig,
        sessions: Arc<SessionManager>,
        limiter: Arc<RateLimiter>,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(CALL_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            endpoints: config
                .endpoints
                .iter()
                .map(|e| (e.name.clone(), e.clone()))
                .collect(),
            sessions,
            limiter,
            attempts: config.tool_call_attempts.max(1),
            backoff: config.tool_call_backoff(),
            next_id: AtomicU64::new(1),
        })
    }

    async fn call_once(
        &self,
        endpoint: &EndpointConfig,
        method: &str,
        params: &Value,
    ) -> Result<Value, McpError> {
        let token = self.sessions.ensure_valid(&endpoint.name).await?;
        self.limiter.acquire(&endpoint.name, 1.0).await;

        let body = json!({
            "jsonrpc": "2.0",
            "id": self.next_id.fetch_add(1, Ordering::Relaxed),
            "method": method,
            "params": params,
        });
        let mut request = self.http.post(rpc_url(&endpoint.url)).json(&body);
        if !token.is_empty() {
            request = request.header(SESSION_HEADER, token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| McpError::transport(&endpoint.name, e.to_string()))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| McpError::transport(&endpoint.name, e.to_string()))?;
        if !status.is_success() {
            return Err(McpError::transport(
                &endpoint.name,
                format!("HTTP {status}: {}", text.chars().take(300).collect::<String>()),
            ));
        }

        let value: Value = serde_json::from_str(&text)
            .map_err(|e| McpError::decode(&endpoint.name, e.to_string()))?;
        parse_rpc_response(&endpoint.name, value)
    }
}

/// Split a JSON-RPC response into its result or error.
pub fn parse_rpc_response(endpoint: &str, mut value: Value) -> Result<Value, McpError> {
    if let Some(err) = value.get("error").filter(|e| !e.is_null()) {
        return Err(McpError::Rpc {
            endpoint: endpoint.to_string(),
            code: err.get("code").and_then(Value::as_i64).unwrap_or(0),
            message: err
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        });
    }
    match value.get_mut("result") {
        Some(result) => Ok(result.take()),
        None => Err(McpError::decode(endpoint, "response has neither result nor error")),
    }
}

#[async_trait]
impl ToolClient for McpClient {
    async fn call(&self, endpoint: &str, method: &str, params: Value) -> Result<Value, McpError> {
        let ep = self
            .endpoints
            .get(endpoint)
            .ok_or_else(|| McpError::UnknownEndpoint(endpoint.to_string()))?;

        let mut attempt = 1;
        loop {
            match self.call_once(ep, method, &params).await {
                Ok(result) => return Ok(result),
                Err(e) if attempt < self.attempts => {
                    if e.is_session_error() {
                        warn!(endpoint, method, attempt, error = %e, "Session error, refreshing lease");
                        self.sessions.invalidate(endpoint).await;
                    } else {
                        warn!(endpoint, method, attempt, error = %e, "Tool call failed, retrying");
                    }
                    tokio::time::sleep(self.backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Opens sessions with `notifications/initialized`.
pub struct McpLeaseInitializer {
    http: reqwest::Client,
    endpoints: HashMap<String, EndpointConfig>,
}

impl McpLeaseInitializer {
    pub fn new(config: &BuildConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(INIT_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            endpoints: config
                .endpoints
                .iter()
                .map(|e| (e.name.clone(), e.clone()))
                .collect(),
        })
    }
}

#[async_trait]
impl LeaseInitializer for McpLeaseInitializer {
    async fn initialize(&self, endpoint: &str) -> anyhow::Result<SessionLease> {
        let ep = self
            .endpoints
            .get(endpoint)
            .with_context(|| format!("Unknown endpoint '{endpoint}'"))?;

        let response = self
            .http
            .post(rpc_url(&ep.url))
            .json(&json!({
                "jsonrpc": "2.0",
                "method": "notifications/initialized",
                "params": {},
            }))
            .send()
            .await
            .with_context(|| format!("Session init request to {endpoint} failed"))?;

        if !response.status().is_success() {
            anyhow::bail!("Session init for {endpoint} returned HTTP {}", response.status());
        }

        let body: Value = response
            .json()
            .await
            .with_context(|| format!("Session init response from {endpoint} is not JSON"))?;
        let token = body
            .pointer("/result/sessionId")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if token.is_empty() {
            debug!(endpoint, "Endpoint issued no session id; calls go without a token");
        }

        Ok(SessionLease::new(token, ep.session_ttl()))
    }
}

/// Health probe over HTTP and raw TCP.
pub struct McpProbe {
    http: reqwest::Client,
}

impl McpProbe {
    pub fn new() -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { http })
    }
}

#[async_trait]
impl EndpointProbe for McpProbe {
    async fn check(&self, target: &ProbeTarget, method: ProbeMethod) -> anyhow::Result<ProbeSignal> {
        match method {
            ProbeMethod::Liveness => {
                let url = format!("{}/health", target.address.trim_end_matches('/'));
                let response = self.http.get(&url).send().await?;
                if response.status().is_success() {
                    Ok(ProbeSignal::Ok)
                } else {
                    Ok(ProbeSignal::Impaired(format!("HTTP {}", response.status())))
                }
            }
            ProbeMethod::Capability => {
                let response = self
                    .http
                    .post(rpc_url(&target.address))
                    .json(&json!({"jsonrpc": "2.0", "id": 0, "method": "tools/list", "params": {}}))
                    .send()
                    .await?;
                if !response.status().is_success() {
                    return Ok(ProbeSignal::Impaired(format!("HTTP {}", response.status())));
                }
                let body: Value = response.json().await?;
                match parse_rpc_response(&target.name, body) {
                    Ok(_) => Ok(ProbeSignal::Ok),
                    Err(e) => Ok(ProbeSignal::Impaired(e.to_string())),
                }
            }
            ProbeMethod::Reachability => {
                let addr = socket_address(&target.address)
                    .with_context(|| format!("No host in address '{}'", target.address))?;
                tokio::net::TcpStream::connect(&addr)
                    .await
                    .with_context(|| format!("TCP connect to {addr} failed"))?;
                Ok(ProbeSignal::Ok)
            }
        }
    }
}
