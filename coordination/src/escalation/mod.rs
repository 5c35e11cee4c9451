//! Escalation Engine: Deterministic State Machine for Backend Promotion
//!
//! Routes generation work up an ordered ladder of backends (cheapest first)
//! based on repeated failures, and enforces the session cost ceiling. This is
//! a pure state machine with no network calls.
//!
//! # Escalation Ladder
//!
//! ```text
//! Tier 0 (cheapest backend)
//!     │
//!     ├─ failures of mixed kinds / dissimilar text → stay
//!     ├─ last 3 failures share a kind and are ≥ 0.8 similar → promote
//!     │
//!     ▼
//! Tier 1 .. N-2 (window restarts empty after every promotion)
//!     │
//!     ▼
//! Tier N-1 (most capable backend)
//!     │
//!     ├─ 3 more consecutive same-kind failures → failed
//!     │
//!     ▼
//! Terminal: succeeded | aborted (cost / iterations / wall clock) | failed
//! ```
//!
//! Every backend call is bracketed by [`EscalationEngine::reserve`] and
//! [`EscalationEngine::settle`]; the tier index never decreases.

pub mod engine;
pub mod state;

pub use engine::{EscalationConfig, EscalationEngine, Reservation, Transition};
pub use state::{
    BackendDescriptor, EscalationReason, EscalationRecord, EscalationState, LadderStatus,
    TerminalReason,
};
