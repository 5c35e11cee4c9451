//! Status updates to the ticketing endpoint.
//!
//! Each build owns one session-of-record ticket, found by the session id in its
//! title or created on first use. Updates are write-only and best-effort: the
//! orchestrator logs failures and carries on.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::mcp_client::ToolClient;

/// One status line for the session-of-record ticket.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub session_id: Uuid,
    pub iteration: u32,
    pub status: String,
    pub message: String,
}

impl StatusUpdate {
    pub fn new(
        session_id: Uuid,
        iteration: u32,
        status: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            session_id,
            iteration,
            status: status.into(),
            message: message.into(),
        }
    }

    pub fn render(&self) -> String {
        format!(
            "[{}] iteration {}: {}",
            self.status, self.iteration, self.message
        )
    }
}

#[async_trait]
pub trait StatusTracker: Send + Sync {
    /// Ticket id of the session-of-record, creating it if needed.
    async fn active_ticket(&self, session_id: Uuid) -> Result<String>;

    async fn update(&self, update: &StatusUpdate) -> Result<()>;
}

/// Tracker that only logs.
pub struct NoopTracker;

#[async_trait]
impl StatusTracker for NoopTracker {
    async fn active_ticket(&self, session_id: Uuid) -> Result<String> {
        Ok(session_id.to_string())
    }

    async fn update(&self, update: &StatusUpdate) -> Result<()> {
        debug!(session = %update.session_id, "{}", update.render());
        Ok(())
    }
}

fn ticket_title(session_id: Uuid) -> String {
    format!("Strategy build {session_id}")
}

/// Tracker backed by the ticketing tool endpoint.
pub struct McpTracker {
    tools: Arc<dyn ToolClient>,
    endpoint: String,
    ticket: Mutex<Option<String>>,
}

impl McpTracker {
    pub fn new(tools: Arc<dyn ToolClient>, endpoint: impl Into<String>) -> Self {
        Self {
            tools,
            endpoint: endpoint.into(),
            ticket: Mutex::new(None),
        }
    }

    async fn tool(&self, name: &str, arguments: Value) -> Result<Value> {
        self.tools
            .call(
                &self.endpoint,
                "tools/call",
                json!({"name": name, "arguments": arguments}),
            )
            .await
            .with_context(|| format!("{name} on {} failed", self.endpoint))
    }
}

/// Ticket id from a tool result, plain or wrapped in MCP content blocks.
fn issue_id(result: &Value) -> Option<String> {
    let from_obj = |v: &Value| {
        v.get("id")
            .or_else(|| v.get("identifier"))
            .and_then(Value::as_str)
            .map(str::to_string)
    };
    if let Some(id) = from_obj(result) {
        return Some(id);
    }
    if let Some(first) = result
        .get("issues")
        .and_then(Value::as_array)
        .and_then(|a| a.first())
    {
        return from_obj(first);
    }
    let text = result
        .get("content")?
        .as_array()?
        .iter()
        .find_map(|b| b.get("text").and_then(Value::as_str))?;
    let parsed: Value = serde_json::from_str(text).ok()?;
    issue_id(&parsed)
}

#[async_trait]
impl StatusTracker for McpTracker {
    async fn active_ticket(&self, session_id: Uuid) -> Result<String> {
        let mut ticket = self.ticket.lock().await;
        if let Some(id) = ticket.as_ref() {
            return Ok(id.clone());
        }

        let title = ticket_title(session_id);
        let found = self
            .tool("search_issues", json!({"query": title, "limit": 1}))
            .await?;
        let id = match issue_id(&found) {
            Some(id) => id,
            None => {
                let created = self
                    .tool(
                        "create_issue",
                        json!({
                            "title": title,
                            "description": format!("Autonomous build session {session_id}"),
                        }),
                    )
                    .await?;
                let id = issue_id(&created).context("create_issue returned no issue id")?;
                info!(ticket = %id, session = %session_id, "Created session-of-record ticket");
                id
            }
        };
        *ticket = Some(id.clone());
        Ok(id)
    }

    async fn update(&self, update: &StatusUpdate) -> Result<()> {
        let ticket = self.active_ticket(update.session_id).await?;
        self.tool(
            "add_comment",
            json!({"issue_id": ticket, "body": update.render()}),
        )
        .await?;
        Ok(())
    }
}
