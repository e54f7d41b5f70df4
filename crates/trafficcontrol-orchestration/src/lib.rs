#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **trafficcontrol-orchestration** – Orchestration core for TrafficControl.
//!
//! This crate ties the runtime together:
//!
//! - **Scheduler**: priority-ordered admission of queued tasks under the
//!   capacity tracker, with per-task model fallback.
//! - **ContextBudget**: token accounting over the assembled prompt context
//!   with category-based compression when over budget.
//! - **Orchestrator**: the tick-driven main loop with database-health
//!   gating, degraded mode, pre-flight confirmation, and graceful
//!   shutdown.
//! - **StateSnapshot**: best-effort persistence of loop state across
//!   restarts.
//!
//! ## Control flow
//!
//! The orchestrator ticks on a fixed interval. Each tick refreshes the
//! queue from the task store, asks the scheduler whether anything can be
//! admitted, gates the candidate through the approval controller in a
//! detached flow, and finally asks the session manager to spawn. Agent
//! events flow back over the bus and drive task-store updates,
//! notifications, and the state snapshot.

pub mod context;
pub mod engine;
pub mod preflight;
pub mod scheduler;
pub mod snapshot;

pub use context::{CompressOutcome, ContextBudget, ContextEntry};
pub use engine::{LoopState, Orchestrator, OrchestratorDeps, OrchestratorError};
pub use preflight::{BacklogValidator, BasicBacklogValidator, ValidationReport};
pub use scheduler::{ScheduleOutcome, Scheduler, SpawnHandler};
pub use snapshot::{SnapshotAgent, StateSnapshot};
