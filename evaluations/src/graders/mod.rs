//! The grader registry: a closed set of grader kinds sharing one
//! contract. Constructors validate configuration eagerly at spec load;
//! `grade` runs concurrently across a trial's graders and must never
//! hold state between invocations.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use waza_core::error::Error;
use waza_core::spec::{EvalSpec, GraderConfig};
use waza_core::AgentEngine;

use crate::types::{GraderResult, GradingContext};

mod action_sequence;
mod behavior;
mod code;
mod diff;
mod file;
mod json_schema;
mod judge;
mod keyword;
mod program;
mod regex;
mod skill_invocation;
mod tool_constraint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GraderKind {
    Keyword,
    Regex,
    File,
    Diff,
    JsonSchema,
    Code,
    Program,
    Prompt,
    Behavior,
    ActionSequence,
    SkillInvocation,
    ToolConstraint,
}

impl GraderKind {
    /// Parses a spec kind string. `inline_script` is an accepted alias
    /// for `code`.
    pub fn parse(kind: &str) -> Option<GraderKind> {
        match kind {
            "keyword" => Some(GraderKind::Keyword),
            "regex" => Some(GraderKind::Regex),
            "file" => Some(GraderKind::File),
            "diff" => Some(GraderKind::Diff),
            "json_schema" => Some(GraderKind::JsonSchema),
            "code" | "inline_script" => Some(GraderKind::Code),
            "program" => Some(GraderKind::Program),
            "prompt" => Some(GraderKind::Prompt),
            "behavior" => Some(GraderKind::Behavior),
            "action_sequence" => Some(GraderKind::ActionSequence),
            "skill_invocation" => Some(GraderKind::SkillInvocation),
            "tool_constraint" => Some(GraderKind::ToolConstraint),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            GraderKind::Keyword => "keyword",
            GraderKind::Regex => "regex",
            GraderKind::File => "file",
            GraderKind::Diff => "diff",
            GraderKind::JsonSchema => "json_schema",
            GraderKind::Code => "code",
            GraderKind::Program => "program",
            GraderKind::Prompt => "prompt",
            GraderKind::Behavior => "behavior",
            GraderKind::ActionSequence => "action_sequence",
            GraderKind::SkillInvocation => "skill_invocation",
            GraderKind::ToolConstraint => "tool_constraint",
        }
    }
}

impl std::fmt::Display for GraderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The grading contract. `Ok` means "I graded and here is the verdict";
/// `Err` means "I could not grade" and marks the owning trial `error`.
#[async_trait]
pub trait Grader: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;
    fn kind(&self) -> GraderKind;

    /// True for graders that can only judge a skill run against a
    /// paired baseline output; the orchestrator skips them on the
    /// baseline pass itself.
    fn requires_baseline(&self) -> bool {
        false
    }

    async fn grade(
        &self,
        context: &GradingContext,
        cancel: &CancellationToken,
    ) -> Result<GraderResult, Error>;
}

/// Shared dependencies handed to constructors. Only the `prompt` grader
/// uses the engine; `context_dir` lets constructors validate
/// spec-relative file references (snapshots, schema files) at load.
pub struct GraderDeps {
    pub engine: Arc<dyn AgentEngine>,
    pub context_dir: PathBuf,
    pub strict: bool,
}

/// Builds one grader from its spec entry, dispatching on kind. Unknown
/// kinds and invalid configs fail here, before any agent run.
pub fn create(config: &GraderConfig, deps: &GraderDeps) -> Result<Arc<dyn Grader>, Error> {
    let kind = GraderKind::parse(&config.kind).ok_or_else(|| Error::GraderConfig {
        grader: config.name.clone(),
        message: format!("unknown grader kind '{}'", config.kind),
    })?;
    let grader: Arc<dyn Grader> = match kind {
        GraderKind::Keyword => Arc::new(keyword::KeywordGrader::new(config, deps)?),
        GraderKind::Regex => Arc::new(regex::RegexGrader::new(config, deps)?),
        GraderKind::File => Arc::new(file::FileGrader::new(config, deps)?),
        GraderKind::Diff => Arc::new(diff::DiffGrader::new(config, deps)?),
        GraderKind::JsonSchema => Arc::new(json_schema::JsonSchemaGrader::new(config, deps)?),
        GraderKind::Code => Arc::new(code::CodeGrader::new(config, deps)?),
        GraderKind::Program => Arc::new(program::ProgramGrader::new(config, deps)?),
        GraderKind::Prompt => Arc::new(judge::PromptGrader::new(config, deps)?),
        GraderKind::Behavior => Arc::new(behavior::BehaviorGrader::new(config, deps)?),
        GraderKind::ActionSequence => {
            Arc::new(action_sequence::ActionSequenceGrader::new(config, deps)?)
        }
        GraderKind::SkillInvocation => {
            Arc::new(skill_invocation::SkillInvocationGrader::new(config, deps)?)
        }
        GraderKind::ToolConstraint => {
            Arc::new(tool_constraint::ToolConstraintGrader::new(config, deps)?)
        }
    };
    Ok(grader)
}

/// Instantiates every grader in the spec, in spec order.
pub fn build_graders(spec: &EvalSpec, deps: &GraderDeps) -> Result<Vec<Arc<dyn Grader>>, Error> {
    spec.graders
        .iter()
        .map(|config| create(config, deps))
        .collect()
}

/// Runs every grader concurrently against one trial's context. Results
/// come back in spec order; per-grader wall time is stamped here. A
/// single grading error aborts the set (the trial becomes `error`).
pub async fn grade_all(
    graders: &[Arc<dyn Grader>],
    context: &GradingContext,
    cancel: &CancellationToken,
) -> Result<Vec<GraderResult>, Error> {
    let mut futures = FuturesUnordered::new();
    for (index, grader) in graders.iter().enumerate() {
        let grader = grader.clone();
        futures.push(async move {
            let started = Instant::now();
            let result = grader.grade(context, cancel).await;
            (index, started.elapsed().as_millis() as u64, result)
        });
    }
    let mut results: Vec<Option<GraderResult>> = (0..graders.len()).map(|_| None).collect();
    while let Some((index, duration_ms, result)) = futures.next().await {
        let mut graded = result?;
        graded.duration_ms = duration_ms;
        results[index] = Some(graded);
    }
    Ok(results.into_iter().flatten().collect())
}

/// Decodes a grader config map into its typed struct. Strict mode
/// rejects fields outside the kind's recognized list, naming the
/// grader and the offending field.
pub(crate) fn decode_config<T: DeserializeOwned>(
    grader_name: &str,
    fields: &[&str],
    config: &serde_json::Map<String, Value>,
    strict: bool,
) -> Result<T, Error> {
    if strict {
        for key in config.keys() {
            if !fields.contains(&key.as_str()) {
                return Err(Error::GraderConfig {
                    grader: grader_name.to_string(),
                    message: format!("unknown field '{key}'"),
                });
            }
        }
    }
    serde_json::from_value(Value::Object(config.clone())).map_err(|e| Error::GraderConfig {
        grader: grader_name.to_string(),
        message: e.to_string(),
    })
}

/// passed_checks / total_checks, defined as 1.0 on an empty check set.
pub(crate) fn score_from_checks(passed: usize, total: usize) -> f64 {
    if total == 0 {
        1.0
    } else {
        passed as f64 / total as f64
    }
}
