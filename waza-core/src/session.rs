//! Session capture: normalizes the agent event stream into an ordered
//! transcript, correlates tool-call start/complete pairs by id, and
//! derives the one-shot [`SessionDigest`] that trajectory graders
//! consume.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::AgentEvent;
use crate::error::Error;

/// One normalized unit of the agent's stream, ordered by arrival.
/// `Anomaly` records malformed input (e.g. a completion for an unknown
/// tool call) without failing the trial.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TranscriptEvent {
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
        cached_tokens: u64,
    },
    SkillInvoked {
        tool_call_id: String,
        skill: String,
    },
    SessionEnd,
    Anomaly {
        message: String,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Ok,
    Error,
}

/// A correlated start/complete pair. A start without a matching
/// completion by session end is reported as `status = Error` with
/// `completed_at = None`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool_call_id: String,
    pub tool_name: String,
    pub arguments: Value,
    pub result_content: Option<Value>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: ToolCallStatus,
}

/// An engine-reported skill invocation, decorated onto a tool call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SkillInvocation {
    pub tool_call_id: String,
    pub skill: String,
    pub tool_name: String,
}

/// Derived-once summary of a session. `tools_used` preserves invocation
/// order with duplicates; sequence graders depend on that.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct SessionDigest {
    pub total_turns: usize,
    pub tool_call_count: usize,
    pub tools_used: Vec<String>,
    pub tokens_total: u64,
    pub duration_ms: u64,
}

/// Everything the collector hands back when the session terminates.
#[derive(Debug)]
pub struct SessionOutcome {
    pub transcript: Vec<TranscriptEvent>,
    pub tool_calls: Vec<ToolCall>,
    pub skill_invocations: Vec<SkillInvocation>,
    pub digest: SessionDigest,
    pub output_text: String,
}

enum IngestOutcome {
    Recorded,
    Anomaly(String),
}

/// Per-tool-call state machine keyed by `tool_call_id`:
/// `NONE → STARTED` on start, `STARTED → COMPLETED/ERRORED` on the
/// matching completion, `STARTED → ERRORED` at session end. A second
/// start for a known id is a collector error; any other
/// out-of-order event is recorded as an anomaly.
pub struct SessionCollector {
    started: Instant,
    events: Vec<TranscriptEvent>,
    calls: Vec<ToolCall>,
    open: HashMap<String, usize>,
    closed: HashSet<String>,
    skills: Vec<SkillInvocation>,
    assistant_parts: Vec<String>,
    tokens_total: u64,
    turns: usize,
}

impl Default for SessionCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionCollector {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            events: Vec::new(),
            calls: Vec::new(),
            open: HashMap::new(),
            closed: HashSet::new(),
            skills: Vec::new(),
            assistant_parts: Vec::new(),
            tokens_total: 0,
            turns: 0,
        }
    }

    /// Consumes one event. The only hard failure is a duplicate
    /// `tool_call_id`; malformed sequencing is demoted to a transcript
    /// anomaly so the trial still reaches grading.
    pub fn ingest(&mut self, event: AgentEvent) -> Result<(), Error> {
        let outcome = self.apply(&event)?;
        self.events.push(normalize(event));
        if let IngestOutcome::Anomaly(message) = outcome {
            tracing::warn!(anomaly = %message, "Malformed event in agent stream");
            self.events.push(TranscriptEvent::Anomaly { message });
        }
        Ok(())
    }

    fn apply(&mut self, event: &AgentEvent) -> Result<IngestOutcome, Error> {
        match event {
            AgentEvent::AssistantMessage { text } => {
                self.turns += 1;
                self.assistant_parts.push(text.clone());
                Ok(IngestOutcome::Recorded)
            }
            AgentEvent::ToolCallStart {
                id,
                name,
                arguments,
            } => {
                if self.open.contains_key(id) || self.closed.contains(id) {
                    return Err(Error::DuplicateToolCall { id: id.clone() });
                }
                self.open.insert(id.clone(), self.calls.len());
                self.calls.push(ToolCall {
                    tool_call_id: id.clone(),
                    tool_name: name.clone(),
                    arguments: arguments.clone(),
                    result_content: None,
                    started_at: Utc::now(),
                    completed_at: None,
                    status: ToolCallStatus::Error,
                });
                Ok(IngestOutcome::Recorded)
            }
            AgentEvent::ToolCallComplete { id, result } => {
                match self.open.remove(id) {
                    Some(index) => {
                        let call = &mut self.calls[index];
                        call.result_content = Some(result.clone());
                        call.completed_at = Some(Utc::now());
                        call.status = ToolCallStatus::Ok;
                        self.closed.insert(id.clone());
                        Ok(IngestOutcome::Recorded)
                    }
                    None => Ok(IngestOutcome::Anomaly(format!(
                        "tool_call_complete for unknown tool_call_id '{id}'"
                    ))),
                }
            }
            AgentEvent::ToolCallError { id, error } => match self.open.remove(id) {
                Some(index) => {
                    let call = &mut self.calls[index];
                    call.result_content = Some(Value::String(error.clone()));
                    call.completed_at = Some(Utc::now());
                    call.status = ToolCallStatus::Error;
                    self.closed.insert(id.clone());
                    Ok(IngestOutcome::Recorded)
                }
                None => Ok(IngestOutcome::Anomaly(format!(
                    "tool_call_error for unknown tool_call_id '{id}'"
                ))),
            },
            AgentEvent::Usage {
                input_tokens,
                output_tokens,
                cached_tokens,
            } => {
                self.tokens_total += input_tokens + output_tokens + cached_tokens;
                Ok(IngestOutcome::Recorded)
            }
            AgentEvent::SkillInvoked {
                tool_call_id,
                skill,
            } => {
                let tool_name = self
                    .calls
                    .iter()
                    .find(|call| &call.tool_call_id == tool_call_id)
                    .map(|call| call.tool_name.clone());
                match tool_name {
                    Some(tool_name) => {
                        self.skills.push(SkillInvocation {
                            tool_call_id: tool_call_id.clone(),
                            skill: skill.clone(),
                            tool_name,
                        });
                        Ok(IngestOutcome::Recorded)
                    }
                    None => Ok(IngestOutcome::Anomaly(format!(
                        "skill_invoked for unknown tool_call_id '{tool_call_id}'"
                    ))),
                }
            }
            AgentEvent::SessionEnd => Ok(IngestOutcome::Recorded),
        }
    }

    /// Finalizes the session: still-open tool calls become errored with
    /// no completion timestamp, and the digest is derived in one O(n)
    /// pass. A session with no assistant content yields `output_text = ""`.
    pub fn finish(mut self) -> SessionOutcome {
        for index in self.open.values() {
            let call = &mut self.calls[*index];
            call.status = ToolCallStatus::Error;
            call.completed_at = None;
        }
        let digest = SessionDigest {
            total_turns: self.turns,
            tool_call_count: self.calls.len(),
            tools_used: self
                .calls
                .iter()
                .map(|call| call.tool_name.clone())
                .collect(),
            tokens_total: self.tokens_total,
            duration_ms: self.started.elapsed().as_millis() as u64,
        };
        SessionOutcome {
            transcript: self.events,
            tool_calls: self.calls,
            skill_invocations: self.skills,
            digest,
            output_text: self.assistant_parts.join("\n"),
        }
    }
}

fn normalize(event: AgentEvent) -> TranscriptEvent {
    match event {
        AgentEvent::AssistantMessage { text } => TranscriptEvent::AssistantMessage { text },
        AgentEvent::ToolCallStart {
            id,
            name,
            arguments,
        } => TranscriptEvent::ToolCallStart {
            id,
            name,
            arguments,
        },
        AgentEvent::ToolCallComplete { id, result } => {
            TranscriptEvent::ToolCallComplete { id, result }
        }
        AgentEvent::ToolCallError { id, error } => TranscriptEvent::ToolCallError { id, error },
        AgentEvent::Usage {
            input_tokens,
            output_tokens,
            cached_tokens,
        } => TranscriptEvent::Usage {
            input_tokens,
            output_tokens,
            cached_tokens,
        },
        AgentEvent::SkillInvoked {
            tool_call_id,
            skill,
        } => TranscriptEvent::SkillInvoked {
            tool_call_id,
            skill,
        },
        AgentEvent::SessionEnd => TranscriptEvent::SessionEnd,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn start(id: &str, name: &str) -> AgentEvent {
        AgentEvent::ToolCallStart {
            id: id.to_string(),
            name: name.to_string(),
            arguments: json!({}),
        }
    }

    fn complete(id: &str) -> AgentEvent {
        AgentEvent::ToolCallComplete {
            id: id.to_string(),
            result: json!("ok"),
        }
    }

    #[test]
    fn test_correlates_start_complete_pairs() {
        let mut collector = SessionCollector::new();
        collector.ingest(start("a", "read")).unwrap();
        collector.ingest(start("b", "write")).unwrap();
        collector.ingest(complete("b")).unwrap();
        collector.ingest(complete("a")).unwrap();
        collector.ingest(AgentEvent::SessionEnd).unwrap();

        let outcome = collector.finish();
        assert_eq!(outcome.tool_calls.len(), 2);
        assert!(
            outcome
                .tool_calls
                .iter()
                .all(|call| call.status == ToolCallStatus::Ok && call.completed_at.is_some())
        );
        // Invocation order, not completion order.
        assert_eq!(outcome.digest.tools_used, vec!["read", "write"]);
    }

    #[test]
    fn test_unterminated_call_reports_error_without_completion() {
        let mut collector = SessionCollector::new();
        collector.ingest(start("a", "bash")).unwrap();
        collector.ingest(AgentEvent::SessionEnd).unwrap();

        let outcome = collector.finish();
        assert_eq!(outcome.tool_calls[0].status, ToolCallStatus::Error);
        assert_eq!(outcome.tool_calls[0].completed_at, None);
    }

    #[test]
    fn test_duplicate_tool_call_id_is_error() {
        let mut collector = SessionCollector::new();
        collector.ingest(start("a", "bash")).unwrap();
        let err = collector.ingest(start("a", "bash")).unwrap_err();
        assert!(matches!(err, Error::DuplicateToolCall { id } if id == "a"));

        // A reused id after completion is equally rejected.
        let mut collector = SessionCollector::new();
        collector.ingest(start("a", "bash")).unwrap();
        collector.ingest(complete("a")).unwrap();
        assert!(collector.ingest(start("a", "bash")).is_err());
    }

    #[test]
    fn test_orphan_completion_is_anomaly_not_failure() {
        let mut collector = SessionCollector::new();
        collector.ingest(complete("ghost")).unwrap();
        let outcome = collector.finish();
        assert!(
            outcome
                .transcript
                .iter()
                .any(|event| matches!(event, TranscriptEvent::Anomaly { message } if message.contains("ghost")))
        );
        assert!(outcome.tool_calls.is_empty());
    }

    #[test]
    fn test_digest_counts_tokens_turns_and_duplicate_tools() {
        let mut collector = SessionCollector::new();
        collector
            .ingest(AgentEvent::AssistantMessage {
                text: "working".to_string(),
            })
            .unwrap();
        for id in ["1", "2", "3"] {
            collector.ingest(start(id, "bash")).unwrap();
            collector.ingest(complete(id)).unwrap();
        }
        collector
            .ingest(AgentEvent::Usage {
                input_tokens: 100,
                output_tokens: 20,
                cached_tokens: 5,
            })
            .unwrap();
        collector
            .ingest(AgentEvent::AssistantMessage {
                text: "done".to_string(),
            })
            .unwrap();

        let outcome = collector.finish();
        assert_eq!(outcome.digest.total_turns, 2);
        assert_eq!(outcome.digest.tool_call_count, 3);
        assert_eq!(outcome.digest.tools_used, vec!["bash", "bash", "bash"]);
        assert_eq!(outcome.digest.tokens_total, 125);
        assert_eq!(outcome.output_text, "working\ndone");
    }

    #[test]
    fn test_empty_session_has_empty_output() {
        let outcome = SessionCollector::new().finish();
        assert_eq!(outcome.output_text, "");
        assert_eq!(outcome.digest.total_turns, 0);
        assert_eq!(outcome.digest.tool_call_count, 0);
        assert!(outcome.digest.tools_used.is_empty());
        assert_eq!(outcome.digest.tokens_total, 0);
    }

    #[test]
    fn test_skill_invocation_is_decorated_onto_tool_call() {
        let mut collector = SessionCollector::new();
        collector.ingest(start("a", "skill_runner")).unwrap();
        collector.ingest(complete("a")).unwrap();
        collector
            .ingest(AgentEvent::SkillInvoked {
                tool_call_id: "a".to_string(),
                skill: "summarize".to_string(),
            })
            .unwrap();
        let outcome = collector.finish();
        assert_eq!(
            outcome.skill_invocations,
            vec![SkillInvocation {
                tool_call_id: "a".to_string(),
                skill: "summarize".to_string(),
                tool_name: "skill_runner".to_string(),
            }]
        );
    }
}
