use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use waza_core::error::Error;
use waza_core::spec::GraderConfig;

use super::{Grader, GraderDeps, GraderKind, decode_config, score_from_checks};
use crate::types::{GraderResult, GradingContext};

const FIELDS: &[&str] = &["must_contain", "must_not_contain"];

#[derive(Debug, Deserialize, Default)]
struct KeywordConfig {
    #[serde(default)]
    must_contain: Vec<String>,
    #[serde(default)]
    must_not_contain: Vec<String>,
}

/// Case-insensitive substring checks over the agent output.
#[derive(Debug)]
pub struct KeywordGrader {
    name: String,
    config: KeywordConfig,
}

impl KeywordGrader {
    pub fn new(config: &GraderConfig, deps: &GraderDeps) -> Result<Self, Error> {
        let decoded: KeywordConfig =
            decode_config(&config.name, FIELDS, &config.config, deps.strict)?;
        Ok(Self {
            name: config.name.clone(),
            config: decoded,
        })
    }
}

#[async_trait]
impl Grader for KeywordGrader {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> GraderKind {
        GraderKind::Keyword
    }

    async fn grade(
        &self,
        context: &GradingContext,
        _cancel: &CancellationToken,
    ) -> Result<GraderResult, Error> {
        let haystack = context.output_text.to_lowercase();
        let total = self.config.must_contain.len() + self.config.must_not_contain.len();
        let mut failures = Vec::new();

        for keyword in &self.config.must_contain {
            if !haystack.contains(&keyword.to_lowercase()) {
                failures.push(format!("missing required keyword '{keyword}'"));
            }
        }
        for keyword in &self.config.must_not_contain {
            if haystack.contains(&keyword.to_lowercase()) {
                failures.push(format!("found forbidden keyword '{keyword}'"));
            }
        }

        let passed = failures.is_empty();
        let feedback = if passed {
            format!("all {total} keyword checks passed")
        } else {
            failures.join("; ")
        };
        Ok(GraderResult::new(
            &self.name,
            GraderKind::Keyword,
            score_from_checks(total - failures.len(), total),
            passed,
            feedback,
        ))
    }
}
