use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use waza_core::error::Error;
use waza_core::spec::GraderConfig;

use super::{Grader, GraderDeps, GraderKind, decode_config, score_from_checks};
use crate::types::{GraderResult, GradingContext};

const FIELDS: &[&str] = &["expect_tools", "reject_tools", "max_turns", "max_tokens"];

#[derive(Debug, Deserialize, Default)]
struct ToolConstraintConfig {
    #[serde(default)]
    expect_tools: Vec<String>,
    #[serde(default)]
    reject_tools: Vec<String>,
    #[serde(default)]
    max_turns: Option<usize>,
    #[serde(default)]
    max_tokens: Option<u64>,
}

impl ToolConstraintConfig {
    fn check_count(&self) -> usize {
        self.expect_tools.len()
            + self.reject_tools.len()
            + usize::from(self.max_turns.is_some())
            + usize::from(self.max_tokens.is_some())
    }
}

/// Skill-validator-style constraints: expected/rejected tools plus turn
/// and token ceilings, each listed tool counting as one check.
#[derive(Debug)]
pub struct ToolConstraintGrader {
    name: String,
    config: ToolConstraintConfig,
}

impl ToolConstraintGrader {
    pub fn new(config: &GraderConfig, deps: &GraderDeps) -> Result<Self, Error> {
        let decoded: ToolConstraintConfig =
            decode_config(&config.name, FIELDS, &config.config, deps.strict)?;
        if decoded.check_count() == 0 {
            return Err(Error::GraderConfig {
                grader: config.name.clone(),
                message: "at least one constraint is required".to_string(),
            });
        }
        Ok(Self {
            name: config.name.clone(),
            config: decoded,
        })
    }
}

#[async_trait]
impl Grader for ToolConstraintGrader {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> GraderKind {
        GraderKind::ToolConstraint
    }

    async fn grade(
        &self,
        context: &GradingContext,
        _cancel: &CancellationToken,
    ) -> Result<GraderResult, Error> {
        let Some(digest) = &context.session_digest else {
            return Ok(GraderResult::new(
                &self.name,
                GraderKind::ToolConstraint,
                0.0,
                false,
                "no session digest available".to_string(),
            ));
        };

        let total = self.config.check_count();
        let mut failures = Vec::new();

        for tool in &self.config.expect_tools {
            if !digest.tools_used.iter().any(|used| used == tool) {
                failures.push(format!("expected tool '{tool}' was never used"));
            }
        }
        for tool in &self.config.reject_tools {
            if digest.tools_used.iter().any(|used| used == tool) {
                failures.push(format!("rejected tool '{tool}' was used"));
            }
        }
        if let Some(limit) = self.config.max_turns
            && digest.total_turns > limit
        {
            failures.push(format!("took {} turns, allowed {limit}", digest.total_turns));
        }
        if let Some(limit) = self.config.max_tokens
            && digest.tokens_total > limit
        {
            failures.push(format!("used {} tokens, allowed {limit}", digest.tokens_total));
        }

        let passed = failures.is_empty();
        let feedback = if passed {
            format!("all {total} tool constraints satisfied")
        } else {
            failures.join("; ")
        };
        Ok(GraderResult::new(
            &self.name,
            GraderKind::ToolConstraint,
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

    fn grader(value: serde_json::Value) -> Result<ToolConstraintGrader, Error> {
        ToolConstraintGrader::new(
            &GraderConfig {
                name: "constraints".to_string(),
                kind: "tool_constraint".to_string(),
                config: value.as_object().unwrap().clone(),
                weight: None,
            },
            &deps(),
        )
    }

    #[test]
    fn test_empty_constraint_set_rejected() {
        assert!(grader(json!({})).is_err());
    }

    #[tokio::test]
    async fn test_constraint_checks() {
        let grader = grader(json!({
            "expect_tools": ["read"],
            "reject_tools": ["rm"],
            "max_turns": 3,
            "max_tokens": 1000,
        }))
        .unwrap();
        let mut context = context_with_output("");
        context.session_digest = Some(SessionDigest {
            total_turns: 5,
            tool_call_count: 1,
            tools_used: vec!["read".to_string()],
            tokens_total: 200,
            duration_ms: 0,
        });
        let result = grader.grade(&context, &CancellationToken::new()).await.unwrap();
        // expect read ok, reject rm ok, tokens ok; turns exceeded: 3/4.
        assert!(!result.passed);
        assert_eq!(result.score, 0.75);
        assert!(result.feedback.contains("turns"));
    }

    #[tokio::test]
    async fn test_missing_digest_single_failure() {
        let grader = grader(json!({"max_turns": 2})).unwrap();
        let mut context = context_with_output("");
        context.session_digest = None;
        let result = grader.grade(&context, &CancellationToken::new()).await.unwrap();
        assert!(!result.passed);
        assert_eq!(result.score, 0.0);
    }
}
