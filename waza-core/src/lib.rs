//! Core building blocks of the Waza evaluation engine: the eval spec
//! data model and loader, the agent-engine capability traits, session
//! capture, per-trial workspaces, lifecycle hooks, and the trial cache.
//! The `evaluations` crate composes these into the run orchestrator.

pub mod cache;
pub mod engine;
pub mod error;
pub mod hooks;
pub mod session;
pub mod spec;
pub mod template;
pub mod workspace;

pub use engine::{AgentEngine, AgentEvent, AgentSession, EventStream, SessionParams, ToolDefinition};
pub use error::{Error, Result};
pub use hooks::{HookPoint, HookRunner, HooksConfig};
pub use session::{
    SessionCollector, SessionDigest, SessionOutcome, SkillInvocation, ToolCall, ToolCallStatus,
    TranscriptEvent,
};
pub use spec::{DatasetConfig, EvalSpec, GraderConfig, RunConfig, TaskConfig};
pub use template::{TemplateVars, expand};
pub use workspace::{Workspace, WorkspaceManager};
