use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use waza_core::error::Error;
use waza_core::spec::GraderConfig;

use super::action_sequence::{MatchingMode, sequence_f1};
use super::{Grader, GraderDeps, GraderKind, decode_config};
use crate::types::{GraderResult, GradingContext};

const FIELDS: &[&str] = &["required_skills", "mode", "allow_extra"];

fn default_mode() -> MatchingMode {
    MatchingMode::AnyOrderMatch
}

fn default_allow_extra() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct SkillInvocationConfig {
    required_skills: Vec<String>,
    #[serde(default = "default_mode")]
    mode: MatchingMode,
    #[serde(default = "default_allow_extra")]
    allow_extra: bool,
}

/// Matches engine-reported skill invocations against the required set.
/// With `allow_extra = false`, surplus invocations shrink the score
/// multiplicatively, approaching a 60% reduction as extras dominate.
#[derive(Debug)]
pub struct SkillInvocationGrader {
    name: String,
    config: SkillInvocationConfig,
}

impl SkillInvocationGrader {
    pub fn new(config: &GraderConfig, deps: &GraderDeps) -> Result<Self, Error> {
        let decoded: SkillInvocationConfig =
            decode_config(&config.name, FIELDS, &config.config, deps.strict)?;
        if decoded.required_skills.is_empty() {
            return Err(Error::GraderConfig {
                grader: config.name.clone(),
                message: "'required_skills' must not be empty".to_string(),
            });
        }
        Ok(Self {
            name: config.name.clone(),
            config: decoded,
        })
    }
}

#[async_trait]
impl Grader for SkillInvocationGrader {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> GraderKind {
        GraderKind::SkillInvocation
    }

    async fn grade(
        &self,
        context: &GradingContext,
        _cancel: &CancellationToken,
    ) -> Result<GraderResult, Error> {
        let actual: Vec<String> = context
            .skill_invocations
            .iter()
            .map(|invocation| invocation.skill.clone())
            .collect();
        let expected = &self.config.required_skills;

        let passed = self.config.mode.matches(expected, &actual);
        let (precision, recall, f1) = sequence_f1(expected, &actual);
        let mut score = f1;

        let overlap: f64 = recall * expected.len() as f64;
        let extras = (actual.len() as f64 - overlap).max(0.0);
        if !self.config.allow_extra && extras > 0.0 {
            // Penalty approaches 0.6 as extras dominate the trajectory.
            let penalty = 0.6 * (extras / actual.len() as f64);
            score *= 1.0 - penalty;
        }

        let feedback = if passed {
            format!(
                "skills satisfied {} (score {score:.2})",
                self.config.mode.as_str()
            )
        } else {
            format!(
                "skills violated {}: required {expected:?}, invoked {actual:?}",
                self.config.mode.as_str()
            )
        };
        let mut details = serde_json::Map::new();
        details.insert("precision".to_string(), json!(precision));
        details.insert("recall".to_string(), json!(recall));
        details.insert("f1".to_string(), json!(f1));
        details.insert("extra_invocations".to_string(), json!(extras as u64));
        Ok(GraderResult::new(
            &self.name,
            GraderKind::SkillInvocation,
            score,
            passed,
            feedback,
        )
        .with_details(details))
    }
}
