//! Smithers: a declarative orchestration engine for multi-agent workflows.
//!
//! An author describes a workflow as a tree of composable elements:
//! iteration loops, sequential/parallel phases and steps, conditionals,
//! agent invocations, human-approval gates, commands, and VCS snapshots.
//! The engine executes that tree with durable, resumable, reactive state in
//! an embedded SQLite database.

pub mod adapters;
pub mod config;
pub mod elements;
pub mod engine;
pub mod errors;
pub mod scope;
pub mod store;
pub mod tree;

pub use config::SmithersConfig;
pub use engine::{Engine, EngineHandle, EngineOptions, Env, ExitStatus, request_stop};
pub use errors::{EngineError, RenderError, StoreError};
pub use scope::ExecScope;
pub use store::Store;
pub use tree::{Component, Element, HostElement, RenderCtx};
