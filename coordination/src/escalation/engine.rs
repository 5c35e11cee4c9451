//! Escalation Engine: Deterministic decision-making for backend promotion
//!
//! Consumes classified [`ErrorRecord`]s and the [`EscalationState`] to produce
//! [`Transition`]s. [`EscalationEngine::evaluate`] is pure; the `record_*`
//! methods apply its result. Cost accounting is a reserve/settle pair around
//! every backend call.

use crate::classifier::similarity::pairwise_similar;
use crate::classifier::{ErrorKind, ErrorRecord};
use crate::error::{CoordinationError, CoordinationResult};
use crate::escalation::state::{
    BackendDescriptor, EscalationReason, EscalationState, LadderStatus, TerminalReason,
};
use serde::{Deserialize, Serialize};

/// Outcome of evaluating one failure against the ladder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    /// Keep the current tier
    Stay,
    /// Move one rung up
    Promote {
        from: usize,
        to: usize,
        kind: ErrorKind,
    },
    /// Top tier exhausted; the session fails
    Fail(TerminalReason),
}

/// Result of reserving the cost of one backend call
#[derive(Debug, Clone, PartialEq)]
pub enum Reservation {
    /// The call may proceed; `estimate` is already in `total_cost`
    Granted {
        tier: usize,
        backend: BackendDescriptor,
        estimate: f64,
    },
    /// The ceiling would be reached; the ladder is now aborted
    Denied(TerminalReason),
}

/// Configuration for the Escalation Engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationConfig {
    /// Size of the rolling failure window
    pub window_size: usize,
    /// Pairwise similarity every window message must reach to promote
    pub similarity_threshold: f64,
    /// Consecutive same-kind failures at the top tier before failing
    pub top_tier_rounds: u32,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            window_size: 3,
            similarity_threshold: 0.8,
            top_tier_rounds: 3,
        }
    }
}

/// The Escalation Engine: deterministic state machine over a fixed ladder
#[derive(Debug, Clone)]
pub struct EscalationEngine {
    config: EscalationConfig,
    backends: Vec<BackendDescriptor>,
}

impl EscalationEngine {
    /// Create an engine over `backends` (cheapest first)
    pub fn new(backends: Vec<BackendDescriptor>) -> CoordinationResult<Self> {
        Self::with_config(backends, EscalationConfig::default())
    }

    /// Create with custom config
    pub fn with_config(
        backends: Vec<BackendDescriptor>,
        config: EscalationConfig,
    ) -> CoordinationResult<Self> {
        if backends.is_empty() {
            return Err(CoordinationError::config("backend ladder must not be empty"));
        }
        if let Some(b) = backends
            .iter()
            .find(|b| !b.cost_per_call.is_finite() || b.cost_per_call < 0.0)
        {
            return Err(CoordinationError::config(format!(
                "backend '{}' has invalid cost_per_call {}",
                b.name, b.cost_per_call
            )));
        }
        if config.window_size == 0 {
            return Err(CoordinationError::config("window_size must be >= 1"));
        }
        if config.top_tier_rounds == 0 {
            return Err(CoordinationError::config("top_tier_rounds must be >= 1"));
        }
        Ok(Self { config, backends })
    }

    pub fn config(&self) -> &EscalationConfig {
        &self.config
    }

    pub fn backends(&self) -> &[BackendDescriptor] {
        &self.backends
    }

    /// Fresh state for a new session
    pub fn initial_state(&self, cost_ceiling: f64) -> EscalationState {
        EscalationState::new(self.backends.len(), cost_ceiling)
    }

    /// Backend for the state's current tier
    pub fn current_backend(&self, state: &EscalationState) -> &BackendDescriptor {
        let idx = state.tier.min(self.backends.len() - 1);
        &self.backends[idx]
    }

    /// Reserve the current backend's estimate before calling it.
    ///
    /// Denied when the reservation would bring `total_cost` to or past the
    /// ceiling; nothing is added and the ladder aborts.
    pub fn reserve(&self, state: &mut EscalationState) -> Reservation {
        if let LadderStatus::Aborted(reason) | LadderStatus::Failed(reason) = &state.status {
            return Reservation::Denied(reason.clone());
        }

        let backend = self.current_backend(state).clone();
        let estimate = backend.cost_per_call;
        let projected = state.total_cost + estimate;
        if projected >= state.cost_ceiling {
            let reason = TerminalReason::CostCeiling {
                total_cost: projected,
                ceiling: state.cost_ceiling,
            };
            tracing::warn!(
                backend = %backend.name,
                total_cost = state.total_cost,
                estimate,
                ceiling = state.cost_ceiling,
                "Cost reservation denied"
            );
            state.terminate(LadderStatus::Aborted(reason.clone()));
            return Reservation::Denied(reason);
        }

        state.total_cost = projected;
        state.calls += 1;
        Reservation::Granted {
            tier: state.tier,
            backend,
            estimate,
        }
    }

    /// Replace a reservation with the call's actual cost and re-check the ceiling.
    ///
    /// Returns the terminal reason if settlement crossed the ceiling.
    pub fn settle(
        &self,
        state: &mut EscalationState,
        estimate: f64,
        actual: Option<f64>,
    ) -> Option<TerminalReason> {
        let actual = actual.filter(|c| c.is_finite() && *c >= 0.0).unwrap_or(estimate);
        state.total_cost = (state.total_cost - estimate + actual).max(0.0);

        if state.total_cost >= state.cost_ceiling && state.is_active() {
            let reason = TerminalReason::CostCeiling {
                total_cost: state.total_cost,
                ceiling: state.cost_ceiling,
            };
            tracing::warn!(
                total_cost = state.total_cost,
                ceiling = state.cost_ceiling,
                "Cost ceiling reached on settlement"
            );
            state.terminate(LadderStatus::Aborted(reason.clone()));
            return Some(reason);
        }
        None
    }

    /// Pure transition: what would recording `record` do to `state`
    pub fn evaluate(&self, state: &EscalationState, record: &ErrorRecord) -> Transition {
        if !state.is_active() || !record.kind.is_known() {
            return Transition::Stay;
        }

        if state.at_top_tier() {
            let rounds = state.next_consecutive(record.kind);
            if rounds >= self.config.top_tier_rounds {
                return Transition::Fail(TerminalReason::TopTierExhausted {
                    kind: record.kind,
                    rounds,
                });
            }
            return Transition::Stay;
        }

        let window_size = self.config.window_size;
        let keep = window_size - 1;
        let skip = state.window.len().saturating_sub(keep);
        let window: Vec<&ErrorRecord> = state
            .window
            .iter()
            .skip(skip)
            .chain(std::iter::once(record))
            .collect();

        if window.len() < window_size || window.iter().any(|r| r.kind != record.kind) {
            return Transition::Stay;
        }

        let messages: Vec<&str> = window.iter().map(|r| r.message.as_str()).collect();
        if !pairwise_similar(&messages, self.config.similarity_threshold) {
            return Transition::Stay;
        }

        Transition::Promote {
            from: state.tier,
            to: state.tier + 1,
            kind: record.kind,
        }
    }

    /// Record a classified failure and apply the resulting transition
    pub fn record_failure(&self, state: &mut EscalationState, record: &ErrorRecord) -> Transition {
        let transition = self.evaluate(state, record);
        if !state.is_active() {
            return transition;
        }

        match &transition {
            Transition::Stay => {
                state.record_failure(record.clone(), self.config.window_size);
            }
            Transition::Promote { from, to, kind } => {
                tracing::info!(
                    from_tier = from,
                    to_tier = to,
                    backend = %self.backends[*to].name,
                    kind = %kind,
                    iteration = record.iteration,
                    "Escalating backend"
                );
                state.record_escalation(
                    *to,
                    EscalationReason::RepeatedErrorKind {
                        kind: *kind,
                        count: self.config.window_size as u32,
                    },
                    record.iteration,
                );
            }
            Transition::Fail(reason) => {
                state.record_failure(record.clone(), self.config.window_size);
                tracing::warn!(tier = state.tier, reason = %reason, "Top tier exhausted");
                state.terminate(LadderStatus::Failed(reason.clone()));
            }
        }
        transition
    }

    /// A collaborator reported a failure that cannot be retried
    pub fn mark_unrecoverable(&self, state: &mut EscalationState, message: impl Into<String>) {
        state.terminate(LadderStatus::Failed(TerminalReason::Unrecoverable {
            message: message.into(),
        }));
    }

    pub fn mark_succeeded(&self, state: &mut EscalationState) {
        state.terminate(LadderStatus::Succeeded);
    }

    pub fn abort_iteration_limit(&self, state: &mut EscalationState, max_iterations: u32) {
        state.terminate(LadderStatus::Aborted(TerminalReason::IterationLimit {
            max_iterations,
        }));
    }

    pub fn abort_wall_clock(&self, state: &mut EscalationState, limit_secs: u64) {
        state.terminate(LadderStatus::Aborted(TerminalReason::WallClock { limit_secs }));
    }
}
