//! Public API types for the Waza evaluations crate: the grading context
//! handed to graders, per-trial and streaming result types, and the
//! arguments accepted by the core orchestration entry points.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;
use waza_core::error::Error;
use waza_core::session::{SessionDigest, SkillInvocation, ToolCall, TranscriptEvent};
use waza_core::spec::EvalSpec;
use waza_core::workspace;
use waza_core::AgentEngine;

use crate::graders::GraderKind;

/// Read-only input to a single grader invocation. Weights never appear
/// here; the orchestrator stamps them after grading.
#[derive(Debug, Clone)]
pub struct GradingContext {
    pub output_text: String,
    /// The agent's structured outcome: the output parsed as a JSON
    /// object when it is one, empty otherwise.
    pub outcome_map: serde_json::Map<String, Value>,
    pub transcript: Arc<Vec<TranscriptEvent>>,
    pub tool_calls: Arc<Vec<ToolCall>>,
    /// Absent when the session terminated before capture finished.
    pub session_digest: Option<SessionDigest>,
    pub skill_invocations: Arc<Vec<SkillInvocation>>,
    pub workspace_dir: PathBuf,
    pub duration_ms: u64,
    pub session_id: String,
    pub model: String,
    /// Output of the paired baseline pass; only pairwise judges read it.
    pub baseline_output: Option<String>,
    pub task_vars: HashMap<String, String>,
    /// Directory snapshots and other spec-relative files resolve against.
    pub context_dir: PathBuf,
}

impl GradingContext {
    /// Containment-checked resolution of a workspace-relative path.
    pub fn resolve_workspace_path(&self, rel_path: &str) -> Result<PathBuf, Error> {
        workspace::resolve_under(&self.workspace_dir, rel_path)
    }

    pub fn outcome_map_from_output(output_text: &str) -> serde_json::Map<String, Value> {
        match serde_json::from_str::<Value>(output_text) {
            Ok(Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        }
    }
}

/// One grader's verdict for one trial.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraderResult {
    pub name: String,
    pub kind: GraderKind,
    pub score: f64,
    pub passed: bool,
    pub feedback: String,
    #[serde(default)]
    pub details: serde_json::Map<String, Value>,
    pub duration_ms: u64,
    /// Stamped by the orchestrator after grading; graders never see it.
    pub weight: f64,
}

impl GraderResult {
    pub fn new(name: &str, kind: GraderKind, score: f64, passed: bool, feedback: String) -> Self {
        Self {
            name: name.to_string(),
            kind,
            score,
            passed,
            feedback,
            details: serde_json::Map::new(),
            duration_ms: 0,
            weight: 1.0,
        }
    }

    pub fn with_details(mut self, details: serde_json::Map<String, Value>) -> Self {
        self.details = details;
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TrialStatus {
    Passed,
    Failed,
    Error,
    Cancelled,
}

/// One execution of one task under one model (after retries).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrialResult {
    pub task_id: String,
    pub task_name: String,
    pub model: String,
    pub trial_index: usize,
    pub attempts_used: u32,
    pub status: TrialStatus,
    pub grader_results: Vec<GraderResult>,
    pub session_digest: Option<SessionDigest>,
    pub transcript: Vec<TranscriptEvent>,
    pub skill_invocations: Vec<SkillInvocation>,
    pub duration_ms: u64,
    pub session_id: Option<String>,
    pub workspace_mutations: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Present on the skill-side trial in baseline mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline_result: Option<Box<TrialResult>>,
}

impl TrialResult {
    /// Weighted score over grader results: Σ(score·weight) / Σ(weight).
    pub fn weighted_score(&self) -> f64 {
        let total_weight: f64 = self.grader_results.iter().map(|r| r.weight).sum();
        if total_weight == 0.0 {
            return 0.0;
        }
        let weighted: f64 = self
            .grader_results
            .iter()
            .map(|r| r.score * r.weight)
            .sum();
        weighted / total_weight
    }

    pub fn unweighted_score(&self) -> f64 {
        if self.grader_results.is_empty() {
            return 0.0;
        }
        self.grader_results.iter().map(|r| r.score).sum::<f64>()
            / self.grader_results.len() as f64
    }

    pub fn passed(&self) -> bool {
        self.status == TrialStatus::Passed
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunInfo {
    pub job_id: Uuid,
    pub spec_name: String,
    pub spec_hash: String,
    pub num_work_units: usize,
}

/// Messages streamed over the update channel as the run progresses.
/// `RunInfo` is always first; trial completions and unit-level errors
/// follow in completion order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TrialUpdate {
    RunInfo(RunInfo),
    Trial(Box<TrialResult>),
    UnitError {
        task_id: String,
        model: String,
        trial_index: usize,
        message: String,
    },
}

/// Arguments for `run_evaluation_core_streaming`.
pub struct EvaluationCoreArgs {
    pub engine: Arc<dyn AgentEngine>,
    pub spec: Arc<EvalSpec>,
    pub job_id: Uuid,
    /// CLI override of the spec's model list.
    pub models: Option<Vec<String>>,
    pub baseline: bool,
    pub max_attempts: Option<u32>,
    pub parallel: Option<usize>,
    pub no_cache: bool,
}

/// Handle returned by the streaming entry point: the consumer drains
/// `receiver` until the channel closes, then reads the final outcome
/// from the join handle.
pub struct EvaluationStreamResult {
    pub receiver: mpsc::Receiver<TrialUpdate>,
    pub run_info: RunInfo,
}
