//! Artifact validation through the backtest endpoint.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::artifact::Artifact;
use crate::errors::OrchestrationError;
use crate::mcp_client::ToolClient;

/// Tool invoked on the backtest endpoint.
pub const BACKTEST_TOOL: &str = "run_backtest";

/// Result keys tried in order when looking for the fitness score.
const SCORE_KEYS: &[&str] = &["sharpe_ratio", "sharpe", "score", "fitness"];

/// Scores a candidate artifact.
#[async_trait]
pub trait Validator: Send + Sync {
    async fn validate(&self, artifact: &Artifact) -> Result<f64, OrchestrationError>;
}

pub struct BacktestValidator {
    tools: Arc<dyn ToolClient>,
    endpoint: String,
    entry_file: String,
}

impl BacktestValidator {
    pub fn new(
        tools: Arc<dyn ToolClient>,
        endpoint: impl Into<String>,
        entry_file: impl Into<String>,
    ) -> Self {
        Self {
            tools,
            endpoint: endpoint.into(),
            entry_file: entry_file.into(),
        }
    }
}

#[async_trait]
impl Validator for BacktestValidator {
    async fn validate(&self, artifact: &Artifact) -> Result<f64, OrchestrationError> {
        if artifact.get(&self.entry_file).is_none() {
            return Err(OrchestrationError::Validation(format!(
                "entry file '{}' is missing from the artifact",
                self.entry_file
            )));
        }
        let params = json!({
            "name": BACKTEST_TOOL,
            "arguments": {
                "entry_file": self.entry_file,
                "files": artifact.files,
            },
        });
        let result = self.tools.call(&self.endpoint, "tools/call", params).await?;
        let score = extract_score(&result)?;
        info!(endpoint = %self.endpoint, score, "Backtest scored artifact");
        Ok(score)
    }
}

/// Unwrap MCP `content` text blocks into a JSON payload when present.
fn payload(result: &Value) -> Result<Value, OrchestrationError> {
    let text = result
        .get("content")
        .and_then(Value::as_array)
        .map(|blocks| {
            blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n")
        });

    if result.get("isError").and_then(Value::as_bool).unwrap_or(false) {
        return Err(OrchestrationError::Validation(
            text.unwrap_or_else(|| result.to_string()),
        ));
    }

    match text {
        Some(text) => Ok(serde_json::from_str(&text).unwrap_or(Value::String(text))),
        None => Ok(result.clone()),
    }
}

fn find_score(value: &Value) -> Option<f64> {
    let obj = value.as_object()?;
    for key in SCORE_KEYS {
        if let Some(score) = obj.get(*key).and_then(Value::as_f64) {
            return Some(score);
        }
    }
    obj.get("statistics")
        .or_else(|| obj.get("results"))
        .and_then(find_score)
}

/// Pull a finite fitness score out of a backtest result.
pub fn extract_score(result: &Value) -> Result<f64, OrchestrationError> {
    let payload = payload(result)?;
    if let Some(err) = payload.get("error").and_then(Value::as_str) {
        return Err(OrchestrationError::Validation(err.to_string()));
    }
    if let Value::String(text) = &payload {
        return Err(OrchestrationError::Validation(text.clone()));
    }
    match find_score(&payload) {
        Some(score) if score.is_finite() => Ok(score),
        Some(score) => Err(OrchestrationError::Validation(format!(
            "backtest returned a non-finite score ({score})"
        ))),
        None => {
            debug!(%payload, "Backtest result without a score");
            Err(OrchestrationError::Validation(
                "backtest returned no score".to_string(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::McpError;
    use std::sync::Mutex;

    #[test]
    fn score_from_plain_result() {
        assert_eq!(extract_score(&json!({"sharpe_ratio": 1.25})).unwrap(), 1.25);
        assert_eq!(
            extract_score(&json!({"statistics": {"sharpe": 0.8}})).unwrap(),
            0.8
        );
    }

    #[test]
    fn score_from_content_blocks() {
        let result = json!({
            "content": [{"type": "text", "text": "{\"sharpe_ratio\": 1.4, \"trades\": 120}"}],
            "isError": false,
        });
        assert_eq!(extract_score(&result).unwrap(), 1.4);
    }

    #[test]
    fn tool_error_is_validation_failure() {
        let result = json!({
            "content": [{"type": "text", "text": "NameError: name 'qb' is not defined"}],
            "isError": true,
        });
        let err = extract_score(&result).unwrap_err();
        assert!(matches!(err, OrchestrationError::Validation(ref m) if m.contains("NameError")));
    }

    #[test]
    fn error_field_and_missing_score() {
        let err = extract_score(&json!({"error": "no trades were placed"})).unwrap_err();
        assert_eq!(err.failure_text(), "no trades were placed");

        let err = extract_score(&json!({"trades": 3})).unwrap_err();
        assert_eq!(err.failure_text(), "backtest returned no score");
    }

    struct RecordingTools {
        calls: Mutex<Vec<(String, String, Value)>>,
        reply: Value,
    }

    #[async_trait]
    impl ToolClient for RecordingTools {
        async fn call(&self, endpoint: &str, method: &str, params: Value) -> Result<Value, McpError> {
            self.calls
                .lock()
                .unwrap()
                .push((endpoint.into(), method.into(), params));
            Ok(self.reply.clone())
        }
    }

    #[tokio::test]
    async fn validator_sends_files_to_backtest() {
        let tools = Arc::new(RecordingTools {
            calls: Mutex::new(Vec::new()),
            reply: json!({"sharpe_ratio": 0.9}),
        });
        let validator = BacktestValidator::new(tools.clone(), "quantconnect", "main.py");
        let score = validator
            .validate(&Artifact::single("main.py", "class A: pass"))
            .await
            .unwrap();
        assert_eq!(score, 0.9);

        let calls = tools.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        let (endpoint, method, params) = &calls[0];
        assert_eq!(endpoint, "quantconnect");
        assert_eq!(method, "tools/call");
        assert_eq!(params["name"], BACKTEST_TOOL);
        assert_eq!(params["arguments"]["files"]["main.py"], "class A: pass");
    }

    #[tokio::test]
    async fn missing_entry_file_skips_backtest() {
        let tools = Arc::new(RecordingTools {
            calls: Mutex::new(Vec::new()),
            reply: json!({}),
        });
        let validator = BacktestValidator::new(tools.clone(), "quantconnect", "main.py");
        let err = validator
            .validate(&Artifact::single("other.py", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::Validation(_)));
        assert!(tools.calls.lock().unwrap().is_empty());
    }
}
