use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use waza_core::error::Error;
use waza_core::spec::GraderConfig;

use super::{Grader, GraderDeps, GraderKind, decode_config, score_from_checks};
use crate::types::{GraderResult, GradingContext};

const FIELDS: &[&str] = &[
    "max_tool_calls",
    "max_tokens",
    "required_tools",
    "forbidden_tools",
    "max_duration_ms",
];

#[derive(Debug, Deserialize, Default)]
struct BehaviorConfig {
    #[serde(default)]
    max_tool_calls: Option<usize>,
    #[serde(default)]
    max_tokens: Option<u64>,
    #[serde(default)]
    required_tools: Vec<String>,
    #[serde(default)]
    forbidden_tools: Vec<String>,
    #[serde(default)]
    max_duration_ms: Option<u64>,
}

impl BehaviorConfig {
    fn rule_count(&self) -> usize {
        usize::from(self.max_tool_calls.is_some())
            + usize::from(self.max_tokens.is_some())
            + usize::from(self.max_duration_ms.is_some())
            + self.required_tools.len()
            + self.forbidden_tools.len()
    }
}

/// Execution-constraint checks over the session digest.
#[derive(Debug)]
pub struct BehaviorGrader {
    name: String,
    config: BehaviorConfig,
}

impl BehaviorGrader {
    pub fn new(config: &GraderConfig, deps: &GraderDeps) -> Result<Self, Error> {
        let decoded: BehaviorConfig =
            decode_config(&config.name, FIELDS, &config.config, deps.strict)?;
        if decoded.rule_count() == 0 {
            return Err(Error::GraderConfig {
                grader: config.name.clone(),
                message: "at least one behavior rule is required".to_string(),
            });
        }
        Ok(Self {
            name: config.name.clone(),
            config: decoded,
        })
    }
}

#[async_trait]
impl Grader for BehaviorGrader {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> GraderKind {
        GraderKind::Behavior
    }

    async fn grade(
        &self,
        context: &GradingContext,
        _cancel: &CancellationToken,
    ) -> Result<GraderResult, Error> {
        let Some(digest) = &context.session_digest else {
            return Ok(GraderResult::new(
                &self.name,
                GraderKind::Behavior,
                0.0,
                false,
                "no session digest available".to_string(),
            ));
        };

        let total = self.config.rule_count();
        let mut failures = Vec::new();

        if let Some(limit) = self.config.max_tool_calls
            && digest.tool_call_count > limit
        {
            failures.push(format!(
                "made {} tool calls, allowed {limit}",
                digest.tool_call_count
            ));
        }
        if let Some(limit) = self.config.max_tokens
            && digest.tokens_total > limit
        {
            failures.push(format!("used {} tokens, allowed {limit}", digest.tokens_total));
        }
        if let Some(limit) = self.config.max_duration_ms
            && digest.duration_ms > limit
        {
            failures.push(format!("took {}ms, allowed {limit}ms", digest.duration_ms));
        }
        for tool in &self.config.required_tools {
            if !digest.tools_used.iter().any(|used| used == tool) {
                failures.push(format!("required tool '{tool}' was never invoked"));
            }
        }
        for tool in &self.config.forbidden_tools {
            if digest.tools_used.iter().any(|used| used == tool) {
                failures.push(format!("forbidden tool '{tool}' was invoked"));
            }
        }

        let passed = failures.is_empty();
        let feedback = if passed {
            format!("all {total} behavior rules satisfied")
        } else {
            failures.join("; ")
        };
        Ok(GraderResult::new(
            &self.name,
            GraderKind::Behavior,
            score_from_checks(total - failures.len(), total),
            passed,
            feedback,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graders::test_support::{context_with_output, deps};
    use serde_json::json;
    use waza_core::session::SessionDigest;

    fn grader(value: serde_json::Value) -> Result<BehaviorGrader, Error> {
        BehaviorGrader::new(
            &GraderConfig {
                name: "budget".to_string(),
                kind: "behavior".to_string(),
                config: value.as_object().unwrap().clone(),
                weight: None,
            },
            &deps(),
        )
    }

    fn context_with_digest(digest: SessionDigest) -> crate::types::GradingContext {
        let mut context = context_with_output("");
        context.session_digest = Some(digest);
        context
    }

    #[test]
    fn test_empty_rule_set_rejected() {
        assert!(grader(json!({})).is_err());
    }

    #[tokio::test]
    async fn test_tool_budget_enforced() {
        let grader = grader(json!({"max_tool_calls": 5})).unwrap();
        let context = context_with_digest(SessionDigest {
            tool_call_count: 7,
            tools_used: vec!["bash".to_string(); 7],
            ..Default::default()
        });
        let result = grader.grade(&context, &CancellationToken::new()).await.unwrap();
        assert!(!result.passed);
        assert_eq!(result.score, 0.0);
        assert!(result.feedback.contains('7'));
        assert!(result.feedback.contains('5'));
    }

    #[tokio::test]
    async fn test_required_and_forbidden_tools_count_per_tool() {
        let grader = grader(json!({
            "required_tools": ["read", "write"],
            "forbidden_tools": ["rm"],
        }))
        .unwrap();
        let context = context_with_digest(SessionDigest {
            tool_call_count: 2,
            tools_used: vec!["read".to_string(), "rm".to_string()],
            ..Default::default()
        });
        let result = grader.grade(&context, &CancellationToken::new()).await.unwrap();
        // read ok; write missing; rm invoked: 1 of 3 rules pass.
        assert!(!result.passed);
        assert!((result.score - 1.0 / 3.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_missing_digest_is_single_failure() {
        let grader = grader(json!({"max_tool_calls": 5, "max_tokens": 100})).unwrap();
        let mut context = context_with_output("");
        context.session_digest = None;
        let result = grader.grade(&context, &CancellationToken::new()).await.unwrap();
        assert!(!result.passed);
        assert_eq!(result.score, 0.0);
        assert!(result.feedback.contains("digest"));
    }

    #[tokio::test]
    async fn test_all_rules_satisfied() {
        let grader = grader(json!({"max_tokens": 1000, "required_tools": ["bash"]})).unwrap();
        let context = context_with_digest(SessionDigest {
            tool_call_count: 1,
            tools_used: vec!["bash".to_string()],
            tokens_total: 500,
            ..Default::default()
        });
        let result = grader.grade(&context, &CancellationToken::new()).await.unwrap();
        assert!(result.passed);
        assert_eq!(result.score, 1.0);
    }
}
