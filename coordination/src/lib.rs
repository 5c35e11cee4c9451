//! Strategy Build Coordination Library
//!
//! Deterministic and concurrency building blocks for the autonomous
//! strategy build loop. Nothing in this crate talks to the network; transports
//! plug in through the [`session::LeaseInitializer`] and
//! [`health::EndpointProbe`] traits.
//!
//! # Components
//!
//! - [`classifier`]: failure text → [`ErrorKind`], with similarity fallback
//! - [`escalation`]: backend ladder, cost reservation and terminal states
//! - [`fitness`]: score history and regression (rollback) detection
//! - [`rate_limit`]: per-endpoint token buckets
//! - [`session`]: expiring leases with lazy init and background refresh
//! - [`health`]: liveness → capability → reachability probe chain
//! - [`checkpoint`]: full-state snapshots for resume
//! - [`build_session`]: the session record and its status lifecycle

#![allow(clippy::uninlined_format_args)]

pub mod build_session;
pub mod checkpoint;
pub mod classifier;
pub mod error;
pub mod escalation;
pub mod fitness;
pub mod health;
pub mod rate_limit;
pub mod session;

pub use build_session::{ArtifactRef, BuildSession, BuildStatus};
pub use checkpoint::{Checkpoint, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
pub use classifier::{ErrorClassifier, ErrorKind, ErrorLog, ErrorRecord};
pub use error::{CoordinationError, CoordinationResult};
pub use escalation::{
    BackendDescriptor, EscalationConfig, EscalationEngine, EscalationState, LadderStatus,
    Reservation, TerminalReason, Transition,
};
pub use fitness::{FitnessRecord, FitnessTracker};
pub use health::{
    EndpointProbe, HealthCheckConfig, HealthMonitor, HealthReport, HealthStatus, ProbeMethod,
    ProbeOutcome, ProbeSignal, ProbeTarget,
};
pub use rate_limit::{RateLimitConfig, RateLimitStats, RateLimiter};
pub use session::{LeaseInitializer, SessionConfig, SessionEvent, SessionLease, SessionManager};
