//! Version-control bridge: branch, commit, push and pull request.
//!
//! Shells out to `git` and `gh` in the working copy. Used once, at the end of
//! a successful or partial build.

use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tracing::{debug, info, warn};

/// Backoff delays for transient git failures (milliseconds).
const RETRY_DELAYS_MS: &[u64] = &[100, 500, 2000];

/// Publication surface used by the orchestrator.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Commit the working copy to `branch`, push it and open a pull request.
    /// Returns the pull request URL.
    async fn publish(&self, branch: &str, title: &str, body: &str) -> Result<String>;
}

pub struct GitPublisher {
    workdir: PathBuf,
    base_branch: String,
    /// Paths inside the working copy that are never staged
    excluded: Vec<PathBuf>,
}

impl GitPublisher {
    pub fn new(workdir: impl Into<PathBuf>, base_branch: impl Into<String>) -> Self {
        Self {
            workdir: workdir.into(),
            base_branch: base_branch.into(),
            excluded: Vec::new(),
        }
    }

    /// Keep `path` out of every commit when it lies inside the working copy.
    pub fn exclude(mut self, path: &Path) -> Self {
        match relative_to(&self.workdir, path) {
            Some(rel) => self.excluded.push(rel),
            None => debug!(path = %path.display(), "Not inside the working copy, nothing to exclude"),
        }
        self
    }

    fn add_args(&self) -> Vec<String> {
        let mut args = vec!["add".to_string(), "-A".into(), "--".into(), ".".into()];
        args.extend(
            self.excluded
                .iter()
                .map(|p| format!(":(exclude){}", p.to_string_lossy().replace('\\', "/"))),
        );
        args
    }

    async fn run(&self, program: &str, args: &[&str]) -> Result<Output> {
        tokio::process::Command::new(program)
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .await
            .with_context(|| format!("Failed to execute `{program} {}`", args.join(" ")))
    }

    /// Run git, retrying lock contention.
    async fn git(&self, args: &[&str]) -> Result<Output> {
        let mut attempt = 0;
        loop {
            let output = self.run("git", args).await?;
            if output.status.success() {
                return Ok(output);
            }
            let stderr = String::from_utf8_lossy(&output.stderr);
            let transient = stderr.contains("index.lock") || stderr.contains("Unable to create");
            match RETRY_DELAYS_MS.get(attempt) {
                Some(&delay) if transient => {
                    warn!(
                        attempt = attempt + 1,
                        delay_ms = delay,
                        "Transient git failure, retrying: {}",
                        stderr.trim()
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
                _ => return Ok(output),
            }
        }
    }

    async fn git_ok(&self, args: &[&str]) -> Result<String> {
        let output = self.git(args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("git {} failed: {}", args.join(" "), stderr.trim());
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Check out `branch`, creating it from the base branch when missing.
    pub async fn checkout_branch(&self, branch: &str) -> Result<()> {
        let exists = self
            .git(&["rev-parse", "--verify", "--quiet", &format!("refs/heads/{branch}")])
            .await?
            .status
            .success();
        if exists {
            self.git_ok(&["checkout", branch]).await?;
        } else {
            self.git_ok(&["checkout", "-b", branch, &self.base_branch])
                .await?;
        }
        Ok(())
    }

    /// Stage and commit everything. Returns `false` when there was nothing to commit.
    pub async fn commit_all(&self, message: &str) -> Result<bool> {
        let args = self.add_args();
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.git_ok(&args).await?;
        let staged = self.git(&["diff", "--cached", "--quiet"]).await?;
        if staged.status.success() {
            return Ok(false);
        }
        self.git_ok(&["commit", "-m", message]).await?;
        Ok(true)
    }

    pub async fn push(&self, branch: &str) -> Result<()> {
        self.git_ok(&["push", "--set-upstream", "origin", branch])
            .await?;
        Ok(())
    }

    pub async fn open_pull_request(&self, branch: &str, title: &str, body: &str) -> Result<String> {
        let output = self
            .run(
                "gh",
                &[
                    "pr",
                    "create",
                    "--base",
                    &self.base_branch,
                    "--head",
                    branch,
                    "--title",
                    title,
                    "--body",
                    body,
                ],
            )
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("gh pr create failed: {}", stderr.trim());
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout
            .lines()
            .rev()
            .find(|l| l.starts_with("http"))
            .map(|l| l.trim().to_string())
            .context("gh pr create printed no URL")
    }
}

/// `path` relative to `root`, both resolved on disk; `None` when outside or equal.
fn relative_to(root: &Path, path: &Path) -> Option<PathBuf> {
    let root = std::fs::canonicalize(root).ok()?;
    let path = std::fs::canonicalize(path).ok()?;
    let rel = path.strip_prefix(&root).ok()?;
    (!rel.as_os_str().is_empty()).then(|| rel.to_path_buf())
}

#[async_trait]
impl Publisher for GitPublisher {
    async fn publish(&self, branch: &str, title: &str, body: &str) -> Result<String> {
        self.checkout_branch(branch).await?;
        if !self.commit_all(title).await? {
            info!(branch, "Working copy clean, publishing existing commits");
        }
        self.push(branch).await?;
        let url = self.open_pull_request(branch, title, body).await?;
        info!(branch, %url, "Opened pull request");
        Ok(url)
    }
}
