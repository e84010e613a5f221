//! LLM-as-judge grading over the external agent engine. The judge
//! session gets dedicated verdict tools; the score is derived from the
//! calls it makes, never from parsing its prose.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use waza_core::engine::{AgentEngine, AgentEvent, SessionParams, ToolDefinition};
use waza_core::error::Error;
use waza_core::spec::GraderConfig;

use super::{Grader, GraderDeps, GraderKind, decode_config};
use crate::types::{GraderResult, GradingContext};

const FIELDS: &[&str] = &["prompt", "model", "continue_session", "mode"];

const PASS_TOOL: &str = "set_waza_grade_pass";
const FAIL_TOOL: &str = "set_waza_grade_fail";
const PAIRWISE_TOOL: &str = "set_pairwise_winner";

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
enum JudgeMode {
    #[default]
    Independent,
    Pairwise,
}

#[derive(Debug, Deserialize)]
struct PromptConfig {
    prompt: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    continue_session: bool,
    #[serde(default)]
    mode: JudgeMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PairwiseWinner {
    Skill,
    Baseline,
    Tie,
}

impl PairwiseWinner {
    fn as_str(self) -> &'static str {
        match self {
            PairwiseWinner::Skill => "skill",
            PairwiseWinner::Baseline => "baseline",
            PairwiseWinner::Tie => "tie",
        }
    }
}

fn verdict_parameters() -> Value {
    json!({
        "type": "object",
        "properties": {
            "description": {"type": "string"},
            "reason": {"type": "string"}
        },
        "required": ["description", "reason"]
    })
}

fn grade_tools() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: PASS_TOOL.to_string(),
            description: "Record that the output satisfies the rubric.".to_string(),
            parameters: verdict_parameters(),
        },
        ToolDefinition {
            name: FAIL_TOOL.to_string(),
            description: "Record that the output violates the rubric.".to_string(),
            parameters: verdict_parameters(),
        },
    ]
}

fn pairwise_tools() -> Vec<ToolDefinition> {
    vec![ToolDefinition {
        name: PAIRWISE_TOOL.to_string(),
        description: "Pick the output that better satisfies the rubric.".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "winner": {"type": "string", "enum": ["A", "B"]},
                "reason": {"type": "string"}
            },
            "required": ["winner"]
        }),
    }]
}

enum JudgeTurn {
    /// Tool calls made by the judge, in order: (tool name, arguments).
    Calls(Vec<(String, Value)>),
    Cancelled,
}

/// LLM-as-judge grader with independent and pairwise modes.
#[derive(Debug)]
pub struct PromptGrader {
    name: String,
    config: PromptConfig,
    engine: Arc<dyn AgentEngine>,
}

impl PromptGrader {
    pub fn new(config: &GraderConfig, deps: &GraderDeps) -> Result<Self, Error> {
        let decoded: PromptConfig =
            decode_config(&config.name, FIELDS, &config.config, deps.strict)?;
        if decoded.prompt.is_empty() {
            return Err(Error::GraderConfig {
                grader: config.name.clone(),
                message: "'prompt' (the rubric) must not be empty".to_string(),
            });
        }
        Ok(Self {
            name: config.name.clone(),
            config: decoded,
            engine: deps.engine.clone(),
        })
    }

    fn grading_error(&self, message: String) -> Error {
        Error::Grading {
            grader: self.name.clone(),
            message,
        }
    }

    async fn run_judge_turn(
        &self,
        context: &GradingContext,
        tools: Vec<ToolDefinition>,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<JudgeTurn, Error> {
        let params = SessionParams {
            model: self
                .config
                .model
                .clone()
                .unwrap_or_else(|| context.model.clone()),
            tools,
            workspace_dir: Some(context.workspace_dir.clone()),
            skill_dirs: Default::default(),
        };
        let mut session = if self.config.continue_session {
            self.engine
                .resume_session(&context.session_id, params)
                .await
        } else {
            self.engine.create_session(params).await
        }
        .map_err(|e| self.grading_error(format!("failed to open judge session: {e}")))?;

        let mut stream = session
            .send(prompt)
            .await
            .map_err(|e| self.grading_error(format!("judge turn failed: {e}")))?;

        let mut calls = Vec::new();
        loop {
            let event = tokio::select! {
                event = stream.next() => event,
                () = cancel.cancelled() => {
                    drop(stream);
                    let _ = session.close().await;
                    return Ok(JudgeTurn::Cancelled);
                }
            };
            match event {
                Some(AgentEvent::ToolCallStart { name, arguments, .. }) => {
                    calls.push((name, arguments));
                }
                Some(AgentEvent::SessionEnd) | None => break,
                Some(_) => {}
            }
        }
        drop(stream);
        session
            .close()
            .await
            .map_err(|e| self.grading_error(format!("failed to close judge session: {e}")))?;
        Ok(JudgeTurn::Calls(calls))
    }

    async fn grade_independent(
        &self,
        context: &GradingContext,
        cancel: &CancellationToken,
    ) -> Result<GraderResult, Error> {
        let prompt = format!(
            "{rubric}\n\n# Output under evaluation\n\n{output}\n\nRecord your verdict by calling \
             `{PASS_TOOL}` or `{FAIL_TOOL}`.",
            rubric = self.config.prompt,
            output = context.output_text,
        );
        let calls = match self
            .run_judge_turn(context, grade_tools(), &prompt, cancel)
            .await?
        {
            JudgeTurn::Calls(calls) => calls,
            JudgeTurn::Cancelled => {
                return Ok(GraderResult::new(
                    &self.name,
                    GraderKind::Prompt,
                    0.0,
                    false,
                    "cancelled".to_string(),
                ));
            }
        };

        let passes = calls.iter().filter(|(name, _)| name == PASS_TOOL).count();
        let fails = calls.iter().filter(|(name, _)| name == FAIL_TOOL).count();
        debug!(passes, fails, "Judge verdict counts");

        let (score, passed, feedback) = if passes + fails == 0 {
            (0.0, false, "judge recorded no verdict".to_string())
        } else {
            let first_reason = calls
                .iter()
                .find_map(|(_, args)| args.get("reason").and_then(Value::as_str))
                .unwrap_or("");
            (
                passes as f64 / (passes + fails) as f64,
                fails == 0 && passes > 0,
                format!("{passes} pass / {fails} fail: {first_reason}"),
            )
        };
        let mut details = serde_json::Map::new();
        details.insert("passes".to_string(), passes.into());
        details.insert("fails".to_string(), fails.into());
        Ok(
            GraderResult::new(&self.name, GraderKind::Prompt, score, passed, feedback)
                .with_details(details),
        )
    }

    async fn run_pairwise_pass(
        &self,
        context: &GradingContext,
        output_a: &str,
        output_b: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<Option<char>>, Error> {
        let prompt = format!(
            "{rubric}\n\n# Output A\n\n{output_a}\n\n# Output B\n\n{output_b}\n\nCompare the two \
             outputs against the rubric and call `{PAIRWISE_TOOL}` with the better one.",
            rubric = self.config.prompt,
        );
        let calls = match self
            .run_judge_turn(context, pairwise_tools(), &prompt, cancel)
            .await?
        {
            JudgeTurn::Calls(calls) => calls,
            JudgeTurn::Cancelled => return Ok(None),
        };
        let label = calls
            .iter()
            .rev()
            .find(|(name, _)| name == PAIRWISE_TOOL)
            .and_then(|(_, args)| args.get("winner").and_then(Value::as_str))
            .and_then(|winner| winner.trim().to_ascii_uppercase().chars().next())
            .filter(|label| *label == 'A' || *label == 'B');
        Ok(Some(label))
    }

    async fn grade_pairwise(
        &self,
        context: &GradingContext,
        cancel: &CancellationToken,
    ) -> Result<GraderResult, Error> {
        let baseline_output = context.baseline_output.as_deref().ok_or_else(|| {
            self.grading_error(
                "pairwise mode requires a baseline output (run with --baseline)".to_string(),
            )
        })?;
        let skill_output = context.output_text.as_str();

        // The comparison runs twice with positions swapped so position
        // bias shows up as a semantic disagreement.
        let first = self
            .run_pairwise_pass(context, skill_output, baseline_output, cancel)
            .await?;
        let Some(first) = first else {
            return Ok(GraderResult::new(
                &self.name,
                GraderKind::Prompt,
                0.0,
                false,
                "cancelled".to_string(),
            ));
        };
        let second = self
            .run_pairwise_pass(context, baseline_output, skill_output, cancel)
            .await?;
        let Some(second) = second else {
            return Ok(GraderResult::new(
                &self.name,
                GraderKind::Prompt,
                0.0,
                false,
                "cancelled".to_string(),
            ));
        };

        let (Some(first), Some(second)) = (first, second) else {
            return Err(self.grading_error("judge did not pick a pairwise winner".to_string()));
        };

        let semantic_first = if first == 'A' {
            PairwiseWinner::Skill
        } else {
            PairwiseWinner::Baseline
        };
        let semantic_second = if second == 'A' {
            PairwiseWinner::Baseline
        } else {
            PairwiseWinner::Skill
        };
        let position_consistent = semantic_first == semantic_second;
        let winner = if position_consistent {
            semantic_first
        } else {
            PairwiseWinner::Tie
        };

        let score = match winner {
            PairwiseWinner::Skill => 1.0,
            PairwiseWinner::Tie => 0.5,
            PairwiseWinner::Baseline => 0.0,
        };
        let passed = winner != PairwiseWinner::Baseline;
        let mut details = serde_json::Map::new();
        details.insert("winner".to_string(), winner.as_str().into());
        details.insert("position_consistent".to_string(), position_consistent.into());
        Ok(GraderResult::new(
            &self.name,
            GraderKind::Prompt,
            score,
            passed,
            format!("pairwise winner: {}", winner.as_str()),
        )
        .with_details(details))
    }
}

#[async_trait]
impl Grader for PromptGrader {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> GraderKind {
        GraderKind::Prompt
    }

    fn requires_baseline(&self) -> bool {
        self.config.mode == JudgeMode::Pairwise
    }

    async fn grade(
        &self,
        context: &GradingContext,
        cancel: &CancellationToken,
    ) -> Result<GraderResult, Error> {
        match self.config.mode {
            JudgeMode::Independent => self.grade_independent(context, cancel).await,
            JudgeMode::Pairwise => self.grade_pairwise(context, cancel).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graders::test_support::context_with_output;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use waza_core::engine::{AgentSession, EventStream};

    /// Engine whose sessions replay scripted event lists, one per
    /// `send` in order across all sessions.
    #[derive(Debug)]
    struct ScriptedEngine {
        scripts: Mutex<VecDeque<Vec<AgentEvent>>>,
    }

    impl ScriptedEngine {
        fn new(scripts: Vec<Vec<AgentEvent>>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into_iter().collect()),
            })
        }
    }

    struct ScriptedSession {
        events: Option<Vec<AgentEvent>>,
    }

    #[async_trait]
    impl AgentSession for ScriptedSession {
        fn session_id(&self) -> &str {
            "scripted"
        }

        async fn send(&mut self, _prompt: &str) -> Result<EventStream, Error> {
            let events = self.events.take().unwrap_or_default();
            Ok(Box::pin(futures::stream::iter(events)))
        }

        async fn close(&mut self) -> Result<(), Error> {
            Ok(())
        }
    }

    #[async_trait]
    impl AgentEngine for ScriptedEngine {
        async fn create_session(
            &self,
            _params: SessionParams,
        ) -> Result<Box<dyn AgentSession>, Error> {
            let events = self.scripts.lock().unwrap().pop_front();
            Ok(Box::new(ScriptedSession { events }))
        }

        async fn resume_session(
            &self,
            _session_id: &str,
            params: SessionParams,
        ) -> Result<Box<dyn AgentSession>, Error> {
            self.create_session(params).await
        }
    }

    fn tool_call(name: &str, arguments: Value) -> AgentEvent {
        AgentEvent::ToolCallStart {
            id: uuid::Uuid::now_v7().to_string(),
            name: name.to_string(),
            arguments,
        }
    }

    fn grader_with_engine(
        config: serde_json::Value,
        engine: Arc<dyn AgentEngine>,
    ) -> PromptGrader {
        PromptGrader::new(
            &GraderConfig {
                name: "judge".to_string(),
                kind: "prompt".to_string(),
                config: config.as_object().unwrap().clone(),
                weight: None,
            },
            &GraderDeps {
                engine,
                context_dir: std::env::temp_dir(),
                strict: false,
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_independent_counts_pass_fail_votes() {
        let engine = ScriptedEngine::new(vec![vec![
            tool_call(PASS_TOOL, json!({"description": "d", "reason": "clear answer"})),
            tool_call(PASS_TOOL, json!({"description": "d", "reason": "complete"})),
            tool_call(FAIL_TOOL, json!({"description": "d", "reason": "typo"})),
            AgentEvent::SessionEnd,
        ]]);
        let grader = grader_with_engine(json!({"prompt": "Is it good?"}), engine);
        let result = grader
            .grade(&context_with_output("out"), &CancellationToken::new())
            .await
            .unwrap();
        assert!(!result.passed);
        assert!((result.score - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(result.details.get("passes"), Some(&json!(2)));
        assert_eq!(result.details.get("fails"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn test_independent_all_pass() {
        let engine = ScriptedEngine::new(vec![vec![
            tool_call(PASS_TOOL, json!({"description": "d", "reason": "good"})),
            AgentEvent::SessionEnd,
        ]]);
        let grader = grader_with_engine(json!({"prompt": "Is it good?"}), engine);
        let result = grader
            .grade(&context_with_output("out"), &CancellationToken::new())
            .await
            .unwrap();
        assert!(result.passed);
        assert_eq!(result.score, 1.0);
    }

    #[tokio::test]
    async fn test_independent_no_verdict_fails() {
        let engine = ScriptedEngine::new(vec![vec![
            AgentEvent::AssistantMessage {
                text: "thinking...".to_string(),
            },
            AgentEvent::SessionEnd,
        ]]);
        let grader = grader_with_engine(json!({"prompt": "Is it good?"}), engine);
        let result = grader
            .grade(&context_with_output("out"), &CancellationToken::new())
            .await
            .unwrap();
        assert!(!result.passed);
        assert_eq!(result.score, 0.0);
        assert!(result.feedback.contains("no verdict"));
    }

    #[tokio::test]
    async fn test_pairwise_consistent_winner() {
        // Pass 1: picks A (= skill). Pass 2 (swapped): picks B (= skill).
        let engine = ScriptedEngine::new(vec![
            vec![tool_call(PAIRWISE_TOOL, json!({"winner": "A"})), AgentEvent::SessionEnd],
            vec![tool_call(PAIRWISE_TOOL, json!({"winner": "B"})), AgentEvent::SessionEnd],
        ]);
        let grader = grader_with_engine(json!({"prompt": "rubric", "mode": "pairwise"}), engine);
        let mut context = context_with_output("skill output");
        context.baseline_output = Some("baseline output".to_string());
        let result = grader.grade(&context, &CancellationToken::new()).await.unwrap();
        assert!(result.passed);
        assert_eq!(result.score, 1.0);
        assert_eq!(result.details.get("winner"), Some(&json!("skill")));
        assert_eq!(result.details.get("position_consistent"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn test_pairwise_position_bias_collapses_to_tie() {
        // Both passes pick the label "A", which is semantically
        // opposite across the swap: position-inconsistent.
        let engine = ScriptedEngine::new(vec![
            vec![tool_call(PAIRWISE_TOOL, json!({"winner": "A"})), AgentEvent::SessionEnd],
            vec![tool_call(PAIRWISE_TOOL, json!({"winner": "A"})), AgentEvent::SessionEnd],
        ]);
        let grader = grader_with_engine(json!({"prompt": "rubric", "mode": "pairwise"}), engine);
        let mut context = context_with_output("skill output");
        context.baseline_output = Some("baseline output".to_string());
        let result = grader.grade(&context, &CancellationToken::new()).await.unwrap();
        assert!(result.passed);
        assert_eq!(result.score, 0.5);
        assert_eq!(result.details.get("winner"), Some(&json!("tie")));
        assert_eq!(
            result.details.get("position_consistent"),
            Some(&json!(false))
        );
    }

    #[tokio::test]
    async fn test_pairwise_without_baseline_is_grading_error() {
        let engine = ScriptedEngine::new(vec![]);
        let grader = grader_with_engine(json!({"prompt": "rubric", "mode": "pairwise"}), engine);
        let err = grader
            .grade(&context_with_output("out"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Grading { .. }));
    }

    #[tokio::test]
    async fn test_pairwise_no_winner_is_grading_error() {
        let engine = ScriptedEngine::new(vec![
            vec![AgentEvent::SessionEnd],
            vec![AgentEvent::SessionEnd],
        ]);
        let grader = grader_with_engine(json!({"prompt": "rubric", "mode": "pairwise"}), engine);
        let mut context = context_with_output("skill output");
        context.baseline_output = Some("baseline".to_string());
        let err = grader.grade(&context, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::Grading { .. }));
    }
}
