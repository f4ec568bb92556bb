//! Shared domain types for the Smithers orchestration engine.
//!
//! Everything an out-of-tree adapter needs lives here: the status enums
//! persisted by the engine's store, and the adapter contracts (`AgentAdapter`,
//! `VcsAdapter`, `ShellAdapter`) with their request/outcome types. The engine
//! crate depends on this one, never the other way around.

pub mod adapter;
pub mod status;

pub use adapter::{
    AdapterError, AgentAdapter, AgentOutcome, AgentProgress, AgentRequest, CommandLine,
    CommandResult, ProgressFn, ShellAdapter, ShellRequest, ToolCall, VcsAdapter, VcsChange,
};
pub use status::{
    CompletionReason, ExecutionStatus, HumanStatus, PhaseRowStatus, StepRowStatus, TaskStatus,
    TicketStatus,
};
