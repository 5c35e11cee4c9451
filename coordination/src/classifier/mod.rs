//! Failure classification for generation and validation errors
//!
//! Turns raw failure text from the generation agent or the backtest service
//! into an [`ErrorKind`] so the escalation engine can reason about repetition.
//!
//! Rules are evaluated in a fixed priority order
//! (syntax > api > logic > timeout > resource); the first kind with a matching
//! pattern wins. When no rule matches, the message is compared against the
//! most recent record of a known kind and inherits that kind if the two are
//! similar enough.

pub mod similarity;

use crate::error::{CoordinationError, CoordinationResult};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// Compiled regex patterns for error classification
static SYNTAX_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(syntaxerror|indentationerror|taberror|invalid syntax|unexpected (eof|indent|token)|unterminated string|parse error|failed to parse)",
    )
    .unwrap()
});

static API_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(api.*key.*invalid|invalid api key|insufficient.*credits|rate limit exceeded|too many requests|quota exceeded|unauthorized|api.*timeout|api error|\b(401|403|429)\b)",
    )
    .unwrap()
});

static LOGIC_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(nameerror|typeerror|attributeerror|importerror|modulenotfounderror|keyerror|indexerror|valueerror|zerodivisionerror|assertionerror|runtime error|no trades (were )?(placed|executed))",
    )
    .unwrap()
});

static TIMEOUT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(timed? ?out|deadline exceeded|took too long)").unwrap()
});

static RESOURCE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(not enough memory|out of memory|memoryerror|disk space|no space left|connection refused|connection reset|network.*error|too many open files)",
    )
    .unwrap()
});

/// Failure classes used for escalation decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Generated source does not parse
    Syntax,
    /// Credential, quota or provider-side API failure
    Api,
    /// Source runs but misbehaves (runtime exceptions, empty backtests)
    Logic,
    /// A call or backtest exceeded its time limit
    Timeout,
    /// Memory, disk or network exhaustion
    Resource,
    /// Nothing matched
    Unknown,
}

impl ErrorKind {
    /// Kinds with rules, in priority order
    pub const RULE_ORDER: [ErrorKind; 5] = [
        ErrorKind::Syntax,
        ErrorKind::Api,
        ErrorKind::Logic,
        ErrorKind::Timeout,
        ErrorKind::Resource,
    ];

    /// Whether the kind came from a rule or inheritance (anything but `Unknown`)
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }

    fn pattern(&self) -> Option<&'static Regex> {
        match self {
            Self::Syntax => Some(&SYNTAX_PATTERN),
            Self::Api => Some(&API_PATTERN),
            Self::Logic => Some(&LOGIC_PATTERN),
            Self::Timeout => Some(&TIMEOUT_PATTERN),
            Self::Resource => Some(&RESOURCE_PATTERN),
            Self::Unknown => None,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Syntax => write!(f, "syntax"),
            Self::Api => write!(f, "api"),
            Self::Logic => write!(f, "logic"),
            Self::Timeout => write!(f, "timeout"),
            Self::Resource => write!(f, "resource"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// One classified failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Raw failure text
    pub message: String,
    /// Classified kind
    pub kind: ErrorKind,
    /// Iteration that produced the failure
    pub iteration: u32,
    /// When the failure was recorded
    pub timestamp: DateTime<Utc>,
}

impl ErrorRecord {
    pub fn new(message: impl Into<String>, kind: ErrorKind, iteration: u32) -> Self {
        Self {
            message: message.into(),
            kind,
            iteration,
            timestamp: Utc::now(),
        }
    }
}

/// Append-only error log for one build session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorLog {
    records: Vec<ErrorRecord>,
}

impl ErrorLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a log from persisted records (checkpoint resume)
    pub fn from_records(records: Vec<ErrorRecord>) -> CoordinationResult<Self> {
        let mut log = Self::new();
        for record in records {
            log.append(record)?;
        }
        Ok(log)
    }

    /// Append a record; iterations must be non-decreasing
    pub fn append(&mut self, record: ErrorRecord) -> CoordinationResult<()> {
        if let Some(last) = self.records.last() {
            if record.iteration < last.iteration {
                return Err(CoordinationError::OutOfOrder {
                    log: "error",
                    iteration: record.iteration,
                    last: last.iteration,
                });
            }
        }
        self.records.push(record);
        Ok(())
    }

    pub fn records(&self) -> &[ErrorRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Last `n` records, oldest first
    pub fn tail(&self, n: usize) -> &[ErrorRecord] {
        let start = self.records.len().saturating_sub(n);
        &self.records[start..]
    }

    /// Most recent record whose kind is known
    pub fn last_known(&self) -> Option<&ErrorRecord> {
        self.records.iter().rev().find(|r| r.kind.is_known())
    }
}

/// Rule-based classifier with similarity fallback
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    similarity_threshold: f64,
}

impl ErrorClassifier {
    /// Create a classifier with the default 0.8 similarity threshold
    pub fn new() -> Self {
        Self::with_threshold(0.8)
    }

    pub fn with_threshold(similarity_threshold: f64) -> Self {
        Self {
            similarity_threshold: similarity_threshold.clamp(0.0, 1.0),
        }
    }

    pub fn similarity_threshold(&self) -> f64 {
        self.similarity_threshold
    }

    /// Rule pass only: the first kind (in priority order) whose pattern matches
    pub fn match_rules(raw: &str) -> Option<ErrorKind> {
        ErrorKind::RULE_ORDER
            .into_iter()
            .find(|kind| kind.pattern().is_some_and(|p| p.is_match(raw)))
    }

    /// Classify a raw failure message against the session's error log
    pub fn classify(&self, raw: &str, log: &ErrorLog) -> ErrorKind {
        if let Some(kind) = Self::match_rules(raw) {
            return kind;
        }

        match log.last_known() {
            Some(known)
                if similarity::similarity(raw, &known.message) >= self.similarity_threshold =>
            {
                tracing::debug!(
                    inherited = %known.kind,
                    from_iteration = known.iteration,
                    "classified by similarity"
                );
                known.kind
            }
            _ => ErrorKind::Unknown,
        }
    }
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new()
    }
}
