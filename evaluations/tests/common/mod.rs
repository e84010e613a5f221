#![cfg_attr(test, allow(dead_code, clippy::expect_used, clippy::unwrap_used))]
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use evaluations::{Args, OutputFormat, RunOutcome, run_evaluation};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use waza_core::engine::{AgentEngine, AgentEvent, AgentSession, EventStream, SessionParams};
use waza_core::error::Error;
use waza_core::spec::EvalSpec;

pub type BehaviorFn = dyn Fn(&SessionParams, &str) -> Vec<AgentEvent> + Send + Sync;

/// Scripted agent engine: every session answers with whatever the
/// behavior closure produces for (session params, prompt). Tracks how
/// many sessions were opened and which workspaces they saw.
pub struct MockEngine {
    behavior: Arc<BehaviorFn>,
    pub sessions_opened: AtomicUsize,
    pub workspaces_seen: Mutex<Vec<PathBuf>>,
}

impl std::fmt::Debug for MockEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockEngine").finish_non_exhaustive()
    }
}

impl MockEngine {
    pub fn new(
        behavior: impl Fn(&SessionParams, &str) -> Vec<AgentEvent> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            behavior: Arc::new(behavior),
            sessions_opened: AtomicUsize::new(0),
            workspaces_seen: Mutex::new(Vec::new()),
        })
    }

    /// Engine that answers every prompt with a fixed message.
    pub fn replying(text: &str) -> Arc<Self> {
        let text = text.to_string();
        Self::new(move |_, _| {
            vec![
                AgentEvent::AssistantMessage { text: text.clone() },
                AgentEvent::SessionEnd,
            ]
        })
    }

    pub fn session_count(&self) -> usize {
        self.sessions_opened.load(Ordering::SeqCst)
    }
}

struct MockSession {
    session_id: String,
    params: SessionParams,
    behavior: Arc<BehaviorFn>,
}

#[async_trait]
impl AgentSession for MockSession {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn send(&mut self, prompt: &str) -> Result<EventStream, Error> {
        let events = (self.behavior)(&self.params, prompt);
        Ok(Box::pin(futures::stream::iter(events)))
    }

    async fn close(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

#[async_trait]
impl AgentEngine for MockEngine {
    async fn create_session(&self, params: SessionParams) -> Result<Box<dyn AgentSession>, Error> {
        self.sessions_opened.fetch_add(1, Ordering::SeqCst);
        if let Some(dir) = &params.workspace_dir {
            self.workspaces_seen.lock().unwrap().push(dir.clone());
        }
        Ok(Box::new(MockSession {
            session_id: format!("mock-{}", Uuid::now_v7()),
            params,
            behavior: self.behavior.clone(),
        }))
    }

    async fn resume_session(
        &self,
        session_id: &str,
        params: SessionParams,
    ) -> Result<Box<dyn AgentSession>, Error> {
        self.sessions_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockSession {
            session_id: session_id.to_string(),
            params,
            behavior: self.behavior.clone(),
        }))
    }
}

pub fn tool_call_pair(id: &str, name: &str) -> Vec<AgentEvent> {
    vec![
        AgentEvent::ToolCallStart {
            id: id.to_string(),
            name: name.to_string(),
            arguments: serde_json::json!({}),
        },
        AgentEvent::ToolCallComplete {
            id: id.to_string(),
            result: serde_json::json!("ok"),
        },
    ]
}

/// Writes a spec file into `dir` and loads it.
pub fn load_spec(dir: &Path, contents: &str) -> Arc<EvalSpec> {
    let path = dir.join("waza.toml");
    std::fs::write(&path, contents).unwrap();
    Arc::new(EvalSpec::load_from_path(&path).unwrap())
}

pub fn default_args() -> Args {
    Args {
        spec: PathBuf::from("unused"),
        models: None,
        baseline: false,
        max_attempts: None,
        parallel: None,
        no_cache: false,
        format: OutputFormat::Jsonl,
        output: None,
        ci_report: None,
    }
}

/// Runs a full evaluation against the given engine, discarding the
/// streamed update text.
pub async fn run(
    spec: Arc<EvalSpec>,
    engine: Arc<dyn AgentEngine>,
    args: Args,
) -> anyhow::Result<RunOutcome> {
    let mut sink = Vec::new();
    run_evaluation(
        &args,
        spec,
        engine,
        Uuid::now_v7(),
        CancellationToken::new(),
        &mut sink,
    )
    .await
}
