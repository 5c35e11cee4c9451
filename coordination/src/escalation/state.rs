//! Escalation State: Tracks the backend ladder position, cost and failure window

use crate::build_session::BuildStatus;
use crate::classifier::{ErrorKind, ErrorRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// One rung of the generation-backend ladder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendDescriptor {
    /// Human-readable backend name (used in logs and reports)
    pub name: String,
    /// Model identifier handed to the generation agent
    pub model: String,
    /// Estimated cost in USD of one generation call
    pub cost_per_call: f64,
}

impl BackendDescriptor {
    pub fn new(name: impl Into<String>, model: impl Into<String>, cost_per_call: f64) -> Self {
        Self {
            name: name.into(),
            model: model.into(),
            cost_per_call,
        }
    }
}

/// Why the ladder stopped
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum TerminalReason {
    /// Reserving or settling a call reached the cost ceiling
    CostCeiling { total_cost: f64, ceiling: f64 },
    /// The iteration budget ran out
    IterationLimit { max_iterations: u32 },
    /// The wall-clock budget ran out
    WallClock { limit_secs: u64 },
    /// The top tier kept failing with the same kind
    TopTierExhausted { kind: ErrorKind, rounds: u32 },
    /// A collaborator reported a failure that retrying cannot fix
    Unrecoverable { message: String },
}

impl std::fmt::Display for TerminalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CostCeiling { total_cost, ceiling } => {
                write!(f, "cost ${:.2} reached ceiling ${:.2}", total_cost, ceiling)
            }
            Self::IterationLimit { max_iterations } => {
                write!(f, "iteration limit {} reached", max_iterations)
            }
            Self::WallClock { limit_secs } => write!(f, "wall-clock limit {}s reached", limit_secs),
            Self::TopTierExhausted { kind, rounds } => {
                write!(f, "top tier failed {} times with {} errors", rounds, kind)
            }
            Self::Unrecoverable { message } => write!(f, "unrecoverable: {}", message),
        }
    }
}

/// Ladder status. Everything except `Active` is terminal.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum LadderStatus {
    #[default]
    Active,
    Succeeded,
    Aborted(TerminalReason),
    Failed(TerminalReason),
}

impl LadderStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active)
    }

    /// Session status this ladder status maps to
    pub fn as_build_status(&self) -> BuildStatus {
        match self {
            Self::Active => BuildStatus::Running,
            Self::Succeeded => BuildStatus::Succeeded,
            Self::Failed(_) => BuildStatus::Failed,
            Self::Aborted(TerminalReason::IterationLimit { .. }) => {
                BuildStatus::AbortedIterationLimit
            }
            Self::Aborted(TerminalReason::WallClock { .. }) => BuildStatus::AbortedTimeout,
            Self::Aborted(_) => BuildStatus::AbortedCostLimit,
        }
    }
}

/// Reasons for escalation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationReason {
    /// The rolling window filled with similar failures of one kind
    RepeatedErrorKind { kind: ErrorKind, count: u32 },
}

impl std::fmt::Display for EscalationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RepeatedErrorKind { kind, count } => {
                write!(f, "{} error repeated {}x", kind, count)
            }
        }
    }
}

/// Record of an escalation event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationRecord {
    pub from_tier: usize,
    pub to_tier: usize,
    pub reason: EscalationReason,
    pub timestamp: DateTime<Utc>,
    /// Iteration of the failure that triggered the promotion
    pub at_iteration: u32,
}

/// Full escalation state for one build session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationState {
    /// Index into the backend ladder; never decreases
    pub tier: usize,
    /// Number of rungs on the ladder
    pub tier_count: usize,
    /// Consecutive failures sharing `last_kind` (unknown failures break the run)
    pub consecutive_same_kind: u32,
    pub last_kind: Option<ErrorKind>,
    /// Accumulated cost in USD, including any outstanding reservation
    pub total_cost: f64,
    pub cost_ceiling: f64,
    /// Most recent failures since the last promotion, oldest first
    pub window: VecDeque<ErrorRecord>,
    /// Backend calls reserved so far
    pub calls: u32,
    pub status: LadderStatus,
    pub escalation_history: Vec<EscalationRecord>,
    pub last_activity: DateTime<Utc>,
}

impl EscalationState {
    /// Fresh state at tier 0
    pub fn new(tier_count: usize, cost_ceiling: f64) -> Self {
        Self {
            tier: 0,
            tier_count,
            consecutive_same_kind: 0,
            last_kind: None,
            total_cost: 0.0,
            cost_ceiling,
            window: VecDeque::new(),
            calls: 0,
            status: LadderStatus::Active,
            escalation_history: Vec::new(),
            last_activity: Utc::now(),
        }
    }

    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    pub fn at_top_tier(&self) -> bool {
        self.tier + 1 >= self.tier_count
    }

    /// Remaining budget before the ceiling
    pub fn remaining_budget(&self) -> f64 {
        (self.cost_ceiling - self.total_cost).max(0.0)
    }

    /// Consecutive count after a failure of `kind`
    pub(crate) fn next_consecutive(&self, kind: ErrorKind) -> u32 {
        if !kind.is_known() {
            0
        } else if self.last_kind == Some(kind) {
            self.consecutive_same_kind + 1
        } else {
            1
        }
    }

    /// Push a failure into the bounded window and the consecutive counters
    pub(crate) fn record_failure(&mut self, record: ErrorRecord, window_size: usize) {
        self.consecutive_same_kind = self.next_consecutive(record.kind);
        self.last_kind = record.kind.is_known().then_some(record.kind);
        self.window.push_back(record);
        while self.window.len() > window_size {
            self.window.pop_front();
        }
        self.last_activity = Utc::now();
    }

    /// Move one rung up and start a fresh window
    pub(crate) fn record_escalation(&mut self, to_tier: usize, reason: EscalationReason, at_iteration: u32) {
        self.escalation_history.push(EscalationRecord {
            from_tier: self.tier,
            to_tier,
            reason,
            timestamp: Utc::now(),
            at_iteration,
        });
        self.tier = to_tier.max(self.tier);
        self.window.clear();
        self.consecutive_same_kind = 0;
        self.last_kind = None;
        self.last_activity = Utc::now();
    }

    pub(crate) fn terminate(&mut self, status: LadderStatus) {
        if self.is_active() {
            self.status = status;
            self.last_activity = Utc::now();
        }
    }

    /// Get a summary for logging
    pub fn summary(&self) -> String {
        format!(
            "tier={}/{} cost={:.2}/{:.2} calls={} streak={} status={:?}",
            self.tier,
            self.tier_count,
            self.total_cost,
            self.cost_ceiling,
            self.calls,
            self.consecutive_same_kind,
            self.status,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(kind: ErrorKind, iteration: u32) -> ErrorRecord {
        ErrorRecord::new(format!("{kind} failure"), kind, iteration)
    }

    #[test]
    fn test_escalation_state_new() {
        let state = EscalationState::new(3, 5.0);
        assert_eq!(state.tier, 0);
        assert!(state.is_active());
        assert!(!state.at_top_tier());
        assert_eq!(state.remaining_budget(), 5.0);
    }

    #[test]
    fn test_window_is_bounded() {
        let mut state = EscalationState::new(3, 5.0);
        for i in 1..=5 {
            state.record_failure(failure(ErrorKind::Api, i), 3);
        }
        assert_eq!(state.window.len(), 3);
        assert_eq!(state.window[0].iteration, 3);
        assert_eq!(state.consecutive_same_kind, 5);
    }

    #[test]
    fn test_unknown_breaks_streak() {
        let mut state = EscalationState::new(3, 5.0);
        state.record_failure(failure(ErrorKind::Logic, 1), 3);
        state.record_failure(failure(ErrorKind::Logic, 2), 3);
        state.record_failure(failure(ErrorKind::Unknown, 3), 3);
        assert_eq!(state.consecutive_same_kind, 0);
        assert_eq!(state.last_kind, None);
        state.record_failure(failure(ErrorKind::Logic, 4), 3);
        assert_eq!(state.consecutive_same_kind, 1);
    }

    #[test]
    fn test_escalation_record_resets_window() {
        let mut state = EscalationState::new(3, 5.0);
        state.record_failure(failure(ErrorKind::Api, 1), 3);
        state.record_escalation(
            1,
            EscalationReason::RepeatedErrorKind {
                kind: ErrorKind::Api,
                count: 3,
            },
            1,
        );
        assert_eq!(state.tier, 1);
        assert!(state.window.is_empty());
        assert_eq!(state.consecutive_same_kind, 0);
        assert_eq!(state.escalation_history.len(), 1);
    }

    #[test]
    fn test_terminal_status_is_sticky() {
        let mut state = EscalationState::new(2, 5.0);
        state.terminate(LadderStatus::Aborted(TerminalReason::IterationLimit {
            max_iterations: 10,
        }));
        state.terminate(LadderStatus::Succeeded);
        assert_eq!(state.status.as_build_status(), BuildStatus::AbortedIterationLimit);
    }

    #[test]
    fn test_status_mapping() {
        let cost = LadderStatus::Aborted(TerminalReason::CostCeiling {
            total_cost: 5.1,
            ceiling: 5.0,
        });
        assert_eq!(cost.as_build_status(), BuildStatus::AbortedCostLimit);
        let clock = LadderStatus::Aborted(TerminalReason::WallClock { limit_secs: 60 });
        assert_eq!(clock.as_build_status(), BuildStatus::AbortedTimeout);
        let failed = LadderStatus::Failed(TerminalReason::Unrecoverable {
            message: "bad credentials".into(),
        });
        assert_eq!(failed.as_build_status(), BuildStatus::Failed);
        assert_eq!(LadderStatus::Active.as_build_status(), BuildStatus::Running);
    }
}
