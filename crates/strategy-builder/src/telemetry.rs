//! Build history for the dashboard.
//!
//! `build-history.jsonl` in the state directory gets one JSON object per
//! finished build. The file is append-only.

use std::io::{BufRead, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use coordination::BuildStatus;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildHistoryEntry {
    pub session_id: Uuid,
    pub branch: String,
    pub status: BuildStatus,
    pub iterations: u32,
    pub cost: f64,
    pub best_score: Option<f64>,
    pub final_tier: usize,
    pub duration_secs: f64,
    pub finished_at: DateTime<Utc>,
}

/// Append one entry. Failures are logged, never returned.
pub fn append_history(entry: &BuildHistoryEntry, path: &Path) {
    let json = match serde_json::to_string(entry) {
        Ok(json) => json,
        Err(e) => {
            warn!("Failed to serialize build history entry: {e}");
            return;
        }
    };
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            warn!("Failed to create {}: {e}", parent.display());
            return;
        }
    }
    match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
    {
        Ok(mut file) => {
            if let Err(e) = writeln!(file, "{json}") {
                warn!("Failed to append build history: {e}");
            } else {
                info!(path = %path.display(), session = %entry.session_id, "Appended build history");
            }
        }
        Err(e) => warn!("Failed to open build history: {e}"),
    }
}

/// Read all entries, skipping malformed lines.
pub fn read_history(path: &Path) -> std::io::Result<Vec<BuildHistoryEntry>> {
    let file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut entries = Vec::new();
    for (n, line) in std::io::BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(entry) => entries.push(entry),
            Err(e) => warn!(line = n + 1, "Skipping malformed build history line: {e}"),
        }
    }
    Ok(entries)
}
