use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use waza_core::error::Error;
use waza_core::spec::GraderConfig;

use super::{Grader, GraderDeps, GraderKind, decode_config, score_from_checks};
use crate::types::{GraderResult, GradingContext};

const FIELDS: &[&str] = &["must_match", "must_not_match"];

#[derive(Debug, Deserialize, Default)]
struct RegexConfig {
    #[serde(default)]
    must_match: Vec<String>,
    #[serde(default)]
    must_not_match: Vec<String>,
}

/// Regex checks over the agent output. Patterns compile once at
/// construction; an invalid pattern is a configuration error, never a
/// runtime failure.
#[derive(Debug)]
pub struct RegexGrader {
    name: String,
    must_match: Vec<Regex>,
    must_not_match: Vec<Regex>,
}

pub(crate) fn compile_all(grader_name: &str, patterns: &[String]) -> Result<Vec<Regex>, Error> {
    patterns
        .iter()
        .map(|pattern| {
            Regex::new(pattern).map_err(|e| Error::GraderConfig {
                grader: grader_name.to_string(),
                message: format!("invalid regex pattern '{pattern}': {e}"),
            })
        })
        .collect()
}

impl RegexGrader {
    pub fn new(config: &GraderConfig, deps: &GraderDeps) -> Result<Self, Error> {
        let decoded: RegexConfig =
            decode_config(&config.name, FIELDS, &config.config, deps.strict)?;
        Ok(Self {
            name: config.name.clone(),
            must_match: compile_all(&config.name, &decoded.must_match)?,
            must_not_match: compile_all(&config.name, &decoded.must_not_match)?,
        })
    }
}

#[async_trait]
impl Grader for RegexGrader {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> GraderKind {
        GraderKind::Regex
    }

    async fn grade(
        &self,
        context: &GradingContext,
        _cancel: &CancellationToken,
    ) -> Result<GraderResult, Error> {
        let total = self.must_match.len() + self.must_not_match.len();
        let mut failures = Vec::new();

        for pattern in &self.must_match {
            if !pattern.is_match(&context.output_text) {
                failures.push(format!("pattern '{pattern}' did not match"));
            }
        }
        for pattern in &self.must_not_match {
            if pattern.is_match(&context.output_text) {
                failures.push(format!("forbidden pattern '{pattern}' matched"));
            }
        }

        let passed = failures.is_empty();
        let feedback = if passed {
            format!("all {total} pattern checks passed")
        } else {
            failures.join("; ")
        };
        Ok(GraderResult::new(
            &self.name,
            GraderKind::Regex,
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

    fn config(value: serde_json::Value) -> GraderConfig {
        GraderConfig {
            name: "re".to_string(),
            kind: "regex".to_string(),
            config: value.as_object().unwrap().clone(),
            weight: None,
        }
    }

    #[tokio::test]
    async fn test_match_and_forbid() {
        let grader = RegexGrader::new(
            &config(json!({
                "must_match": [r"\d+"],
                "must_not_match": ["ERROR"],
            })),
            &deps(),
        )
        .unwrap();
        let result = grader
            .grade(&context_with_output("answer: 42"), &CancellationToken::new())
            .await
            .unwrap();
        assert!(result.passed);
        assert_eq!(result.score, 1.0);

        let result = grader
            .grade(
                &context_with_output("ERROR: no digits"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(!result.passed);
        assert_eq!(result.score, 0.0);
    }

    #[test]
    fn test_invalid_pattern_is_config_error() {
        let err = RegexGrader::new(&config(json!({"must_match": ["[unclosed"]})), &deps())
            .unwrap_err();
        assert!(matches!(err, Error::GraderConfig { .. }));
        assert!(err.to_string().contains("invalid regex pattern"));
    }
}
