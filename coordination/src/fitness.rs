//! Fitness tracking and regression detection
//!
//! Scores are appended in iteration order. A regression is three strictly
//! decreasing scores in a row; the orchestrator answers it by restoring the
//! best artifact seen so far.

use crate::build_session::ArtifactRef;
use crate::error::{CoordinationError, CoordinationResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Number of trailing scores inspected for a regression
pub const ROLLBACK_WINDOW: usize = 3;

/// One scored artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitnessRecord {
    pub iteration: u32,
    pub score: f64,
    pub artifact: ArtifactRef,
    pub timestamp: DateTime<Utc>,
}

/// Append-only fitness history for one session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FitnessTracker {
    records: Vec<FitnessRecord>,
}

impl FitnessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted records
    pub fn from_records(records: Vec<FitnessRecord>) -> CoordinationResult<Self> {
        let mut tracker = Self::new();
        for r in records {
            tracker.push(r)?;
        }
        Ok(tracker)
    }

    /// Record a score for an iteration
    pub fn record(
        &mut self,
        iteration: u32,
        score: f64,
        artifact: ArtifactRef,
    ) -> CoordinationResult<&FitnessRecord> {
        self.push(FitnessRecord {
            iteration,
            score,
            artifact,
            timestamp: Utc::now(),
        })?;
        Ok(&self.records[self.records.len() - 1])
    }

    fn push(&mut self, record: FitnessRecord) -> CoordinationResult<()> {
        if !record.score.is_finite() {
            return Err(CoordinationError::InvalidScore {
                score: record.score,
                iteration: record.iteration,
            });
        }
        if let Some(last) = self.records.last() {
            if record.iteration < last.iteration {
                return Err(CoordinationError::OutOfOrder {
                    log: "fitness",
                    iteration: record.iteration,
                    last: last.iteration,
                });
            }
        }
        self.records.push(record);
        Ok(())
    }

    /// True iff the last three scores are strictly decreasing
    pub fn should_rollback(&self) -> bool {
        if self.records.len() < ROLLBACK_WINDOW {
            return false;
        }
        let tail = &self.records[self.records.len() - ROLLBACK_WINDOW..];
        tail.windows(2).all(|w| w[1].score < w[0].score)
    }

    /// Highest-scoring record; the earliest one wins ties
    pub fn best(&self) -> Option<&FitnessRecord> {
        self.records.iter().fold(None, |best, r| match best {
            Some(b) if b.score >= r.score => Some(b),
            _ => Some(r),
        })
    }

    pub fn latest(&self) -> Option<&FitnessRecord> {
        self.records.last()
    }

    pub fn records(&self) -> &[FitnessRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
