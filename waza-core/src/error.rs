use std::path::PathBuf;

/// Every fault the engine can surface, split along the three terminal
/// statuses the orchestrator reports: configuration faults surface at
/// spec load, infrastructure faults mark a trial `error` (never
/// retried), and `Grading` means a grader could not produce a verdict
/// at all (also `error`). A grader that ran and returned `passed=false`
/// is not an error and never appears here.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid eval spec: {message}")]
    Config { message: String },

    #[error("invalid config for grader '{grader}': {message}")]
    GraderConfig { grader: String, message: String },

    #[error("template expansion failed: {message}")]
    Template { message: String },

    #[error("failed to load dataset '{path}': {message}")]
    Dataset { path: PathBuf, message: String },

    #[error("workspace I/O error: {message}")]
    WorkspaceIo { message: String },

    #[error("path '{path}' escapes the trial workspace")]
    PathEscape { path: String },

    #[error("{hook} hook failed: {message}")]
    Hook { hook: String, message: String },

    #[error("agent session error: {message}")]
    AgentSession { message: String },

    #[error("agent session exceeded the {timeout_ms}ms task timeout")]
    SessionTimeout { timeout_ms: u64 },

    #[error("duplicate tool_call_id '{id}' in event stream")]
    DuplicateToolCall { id: String },

    #[error("grader '{grader}' could not grade: {message}")]
    Grading { grader: String, message: String },

    #[error("run cancelled")]
    Cancelled,
}

impl Error {
    /// True for faults that mark the owning trial `error` rather than
    /// `failed`: agent/session/workspace/hook infrastructure plus any
    /// grader that raised instead of grading.
    pub fn is_infrastructure(&self) -> bool {
        match self {
            Error::WorkspaceIo { .. }
            | Error::PathEscape { .. }
            | Error::Hook { .. }
            | Error::AgentSession { .. }
            | Error::SessionTimeout { .. }
            | Error::DuplicateToolCall { .. }
            | Error::Grading { .. } => true,
            Error::Config { .. }
            | Error::GraderConfig { .. }
            | Error::Template { .. }
            | Error::Dataset { .. }
            | Error::Cancelled => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::WorkspaceIo {
            message: e.to_string(),
        }
    }
}
