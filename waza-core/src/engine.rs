//! Capability traits for the external agent runtime.
//!
//! The engine core never talks to a model provider directly: it drives an
//! [`AgentEngine`] supplied by the embedding application (CLI, dashboard,
//! tests). The engine owns tool execution and skill-directory handling;
//! the core only declares tools and observes the resulting event stream.

use std::collections::HashMap;
use std::path::PathBuf;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

/// One record from an agent session's ordered event stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    AssistantMessage {
        text: String,
    },
    ToolCallStart {
        id: String,
        name: String,
        arguments: Value,
    },
    ToolCallComplete {
        id: String,
        result: Value,
    },
    ToolCallError {
        id: String,
        error: String,
    },
    Usage {
        input_tokens: u64,
        output_tokens: u64,
        #[serde(default)]
        cached_tokens: u64,
    },
    /// Engine-decorated marker that a prior tool call was a skill
    /// invocation. The engine is the sole authority on what counts as
    /// a skill; the core never infers this from tool names.
    SkillInvoked {
        tool_call_id: String,
        skill: String,
    },
    SessionEnd,
}

pub type EventStream = Pin<Box<dyn Stream<Item = AgentEvent> + Send>>;

/// A tool declared to the agent (or to a judge session). The engine is
/// responsible for surfacing calls to it back through the event stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Parameters for opening a session. Baseline runs pass an empty
/// `skill_dirs` so that a paired run differs only in skill presentation.
#[derive(Debug, Clone, Default)]
pub struct SessionParams {
    pub model: String,
    pub tools: Vec<ToolDefinition>,
    pub workspace_dir: Option<PathBuf>,
    pub skill_dirs: HashMap<String, PathBuf>,
}

#[async_trait]
pub trait AgentSession: Send {
    fn session_id(&self) -> &str;

    /// Pushes a prompt and returns the ordered event stream for the
    /// resulting agent turn. Single-consumer: the caller drains the
    /// stream to completion (or drops it on cancellation).
    async fn send(&mut self, prompt: &str) -> Result<EventStream, Error>;

    async fn close(&mut self) -> Result<(), Error>;
}

#[async_trait]
pub trait AgentEngine: Send + Sync + std::fmt::Debug {
    async fn create_session(&self, params: SessionParams) -> Result<Box<dyn AgentSession>, Error>;

    /// Reopens an existing session (used by judge graders configured
    /// with `continue_session`).
    async fn resume_session(
        &self,
        session_id: &str,
        params: SessionParams,
    ) -> Result<Box<dyn AgentSession>, Error>;
}

/// Trivial engine that answers every prompt with the prompt itself.
/// Useful for smoke-testing specs and wiring without a real agent
/// runtime; real deployments embed the engine of their choice.
#[derive(Debug, Default)]
pub struct EchoEngine;

pub struct EchoSession {
    session_id: String,
}

#[async_trait]
impl AgentSession for EchoSession {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn send(&mut self, prompt: &str) -> Result<EventStream, Error> {
        let events = vec![
            AgentEvent::AssistantMessage {
                text: prompt.to_string(),
            },
            AgentEvent::Usage {
                input_tokens: prompt.len() as u64,
                output_tokens: prompt.len() as u64,
                cached_tokens: 0,
            },
            AgentEvent::SessionEnd,
        ];
        Ok(Box::pin(futures::stream::iter(events)))
    }

    async fn close(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

#[async_trait]
impl AgentEngine for EchoEngine {
    async fn create_session(&self, _params: SessionParams) -> Result<Box<dyn AgentSession>, Error> {
        Ok(Box::new(EchoSession {
            session_id: format!("echo-{}", uuid::Uuid::now_v7()),
        }))
    }

    async fn resume_session(
        &self,
        session_id: &str,
        _params: SessionParams,
    ) -> Result<Box<dyn AgentSession>, Error> {
        Ok(Box::new(EchoSession {
            session_id: session_id.to_string(),
        }))
    }
}
