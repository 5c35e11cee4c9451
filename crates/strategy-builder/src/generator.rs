//! Generation backends.
//!
//! [`CommandGenerator`] drives a command-line coding agent (aider by default)
//! inside the working copy. The prompt goes through a file; the agent's
//! `Cost: $X message` line, when present, is the actual cost of the call.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::Context;
use async_trait::async_trait;
use coordination::BackendDescriptor;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::artifact::Artifact;
use crate::errors::OrchestrationError;

static COST_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Cost:\s*\$([0-9]+(?:\.[0-9]+)?)\s+message").expect("valid regex")
});

/// Substrings in agent output that mean retrying cannot help.
const FATAL_MARKERS: &[&str] = &[
    "invalid api key",
    "authentication failed",
    "model not found",
    "permission denied",
];

/// What the agent is asked to do in one iteration.
#[derive(Debug, Clone, Default)]
pub struct GenerationRequest {
    pub spec: String,
    pub iteration: u32,
    /// Best fitness so far
    pub best_score: Option<f64>,
    /// Regression directive injected after a rollback
    pub directive: Option<String>,
    /// Failure text from the previous iteration
    pub last_error: Option<String>,
}

impl GenerationRequest {
    /// Prompt text handed to the agent.
    pub fn prompt(&self) -> String {
        let mut prompt = self.spec.trim_end().to_string();
        if let Some(score) = self.best_score {
            prompt.push_str(&format!("\n\nBest score so far: {score:.4}."));
        }
        if let Some(directive) = &self.directive {
            prompt.push_str("\n\n");
            prompt.push_str(directive);
        }
        if let Some(err) = &self.last_error {
            prompt.push_str("\n\nThe previous attempt failed with:\n");
            prompt.push_str(err);
        }
        prompt.push('\n');
        prompt
    }
}

#[derive(Debug, Clone)]
pub struct GenerationOutput {
    pub artifact: Artifact,
    /// Actual USD spent, when the agent reports it
    pub cost: Option<f64>,
}

/// A code-generation agent.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    async fn generate(
        &self,
        request: &GenerationRequest,
        backend: &BackendDescriptor,
    ) -> Result<GenerationOutput, OrchestrationError>;
}

/// Sum every `Cost: $X message` line in agent output.
pub fn parse_reported_cost(output: &str) -> Option<f64> {
    let costs: Vec<f64> = COST_LINE
        .captures_iter(output)
        .filter_map(|c| c[1].parse::<f64>().ok())
        .collect();
    if costs.is_empty() {
        None
    } else {
        Some(costs.iter().sum())
    }
}

/// Runs the configured agent command in the working copy.
pub struct CommandGenerator {
    command: String,
    workdir: PathBuf,
    prompt_dir: PathBuf,
}

impl CommandGenerator {
    pub fn new(
        command: impl Into<String>,
        workdir: impl Into<PathBuf>,
        prompt_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            command: command.into(),
            workdir: workdir.into(),
            prompt_dir: prompt_dir.into(),
        }
    }

    /// Split the command template and substitute placeholders per argument.
    pub fn render_args(&self, model: &str, prompt_file: &Path) -> anyhow::Result<Vec<String>> {
        let parts = shlex::split(&self.command)
            .with_context(|| format!("Unbalanced quoting in generator command: {}", self.command))?;
        if parts.is_empty() {
            anyhow::bail!("Generator command is empty");
        }
        let prompt_file = prompt_file.to_string_lossy();
        Ok(parts
            .into_iter()
            .map(|p| p.replace("{model}", model).replace("{prompt_file}", &prompt_file))
            .collect())
    }

    fn write_prompt(&self, request: &GenerationRequest) -> anyhow::Result<PathBuf> {
        std::fs::create_dir_all(&self.prompt_dir)
            .with_context(|| format!("Failed to create {}", self.prompt_dir.display()))?;
        let path = self
            .prompt_dir
            .join(format!("prompt-{:04}.md", request.iteration));
        std::fs::write(&path, request.prompt())
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path)
    }
}

#[async_trait]
impl GenerationBackend for CommandGenerator {
    async fn generate(
        &self,
        request: &GenerationRequest,
        backend: &BackendDescriptor,
    ) -> Result<GenerationOutput, OrchestrationError> {
        let prompt_file = self.write_prompt(request)?;
        let args = self.render_args(&backend.model, &prompt_file)?;
        info!(
            iteration = request.iteration,
            backend = %backend.name,
            model = %backend.model,
            "Invoking generation agent"
        );

        let output = tokio::process::Command::new(&args[0])
            .args(&args[1..])
            .current_dir(&self.workdir)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                OrchestrationError::Unrecoverable(format!("failed to start `{}`: {e}", args[0]))
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let cost = parse_reported_cost(&stdout).or_else(|| parse_reported_cost(&stderr));
        debug!(iteration = request.iteration, ?cost, "Agent finished");

        if !output.status.success() {
            let tail: String = stderr
                .lines()
                .rev()
                .take(20)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect::<Vec<_>>()
                .join("\n");
            let lowered = tail.to_lowercase();
            if FATAL_MARKERS.iter().any(|m| lowered.contains(m)) {
                return Err(OrchestrationError::Unrecoverable(tail));
            }
            warn!(
                iteration = request.iteration,
                status = %output.status,
                "Generation agent exited with failure"
            );
            return Err(OrchestrationError::generation(
                format!("agent exited with {}: {tail}", output.status),
                cost,
            ));
        }

        let artifact = Artifact::capture(&self.workdir)?;
        if artifact.is_empty() {
            return Err(OrchestrationError::generation(
                "agent produced no files in the working copy",
                cost,
            ));
        }
        Ok(GenerationOutput { artifact, cost })
    }
}
