//! Autonomous strategy builder.
//!
//! Drives a command-line code-generation agent through repeated attempts at a
//! trading strategy, scores each attempt on the backtest endpoint and stops on
//! success or at the first hard limit (cost, iterations, wall clock). The
//! control-loop building blocks live in the `coordination` crate; this crate
//! adds the transports, the external bridges and the loop itself.

pub mod artifact;
pub mod config;
pub mod errors;
pub mod generator;
pub mod mcp_client;
pub mod notify;
pub mod orchestrator;
pub mod telemetry;
pub mod tracker_bridge;
pub mod validator;
pub mod vcs_bridge;

pub use config::BuildConfig;
pub use errors::{McpError, OrchestrationError};
pub use orchestrator::{BuildOrchestrator, BuildReport, Collaborators, LoopSettings};
