#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **trafficcontrol-agents** – Agent runtime layer for TrafficControl.
//!
//! This crate owns everything between the scheduler's admission decision and
//! the raw agent runtime:
//!
//! - **CapacityTracker**: per-model concurrency limits and active-session
//!   sets; the only authority on admission.
//! - **AgentAdapter**: uniform interface over an in-process SDK client and a
//!   CLI subprocess, producing one normalized message stream.
//! - **SessionManager**: session lifecycle from spawn to terminal event,
//!   translating adapter messages into bus events.
//!
//! ## Architecture
//!
//! ```text
//! Scheduler → SessionManager → AgentAdapter → agent runtime
//!                  ↓                ↓
//!            CapacityTracker   normalized messages
//!                  ↓                ↓
//!               EventBus  ←  event mapping
//! ```
//!
//! Ownership is strict: only the session manager mutates session records and
//! only the capacity tracker mutates per-model active sets. The two
//! communicate through value messages (session id, model), never shared
//! mutable references.

pub mod adapter;
pub mod capacity;
pub mod manager;

pub use adapter::{
    ActiveQuery, AgentAdapter, AgentMessage, CliAdapter, ModelMemory, PermissionMode,
    QueryConfig, QueryControl, ScriptStep, ScriptedClient, SdkAdapter, SdkClient, SessionScript,
};
pub use capacity::{CapacityError, CapacityTracker};
pub use manager::{RunStats, SessionError, SessionManager};

/// Tool name an agent uses to ask the operator a question.
pub const ASK_USER_QUESTION_TOOL: &str = "AskUserQuestion";
