use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use waza_core::error::Error;
use waza_core::spec::GraderConfig;

use super::{Grader, GraderDeps, GraderKind, decode_config};
use crate::types::{GraderResult, GradingContext};

const FIELDS: &[&str] = &["matching_mode", "expected_actions"];

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub(crate) enum MatchingMode {
    ExactMatch,
    InOrderMatch,
    AnyOrderMatch,
}

impl MatchingMode {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            MatchingMode::ExactMatch => "exact_match",
            MatchingMode::InOrderMatch => "in_order_match",
            MatchingMode::AnyOrderMatch => "any_order_match",
        }
    }

    /// The mode's boolean verdict over expected vs. actual sequences.
    pub(crate) fn matches(self, expected: &[String], actual: &[String]) -> bool {
        match self {
            MatchingMode::ExactMatch => expected == actual,
            MatchingMode::InOrderMatch => is_subsequence(expected, actual),
            MatchingMode::AnyOrderMatch => {
                let actual_counts = multiset(actual);
                multiset(expected)
                    .iter()
                    .all(|(name, count)| actual_counts.get(name).unwrap_or(&0) >= count)
            }
        }
    }
}

fn is_subsequence(expected: &[String], actual: &[String]) -> bool {
    let mut remaining = expected.iter();
    let mut next = remaining.next();
    for action in actual {
        if let Some(expected_action) = next
            && expected_action == action
        {
            next = remaining.next();
        }
    }
    next.is_none()
}

fn multiset(actions: &[String]) -> HashMap<&str, usize> {
    let mut counts = HashMap::new();
    for action in actions {
        *counts.entry(action.as_str()).or_insert(0) += 1;
    }
    counts
}

/// Multiset precision/recall/F1 between expected and actual sequences.
/// Both empty is a perfect match.
pub(crate) fn sequence_f1(expected: &[String], actual: &[String]) -> (f64, f64, f64) {
    if expected.is_empty() && actual.is_empty() {
        return (1.0, 1.0, 1.0);
    }
    let expected_counts = multiset(expected);
    let actual_counts = multiset(actual);
    let overlap: usize = expected_counts
        .iter()
        .map(|(name, count)| (*count).min(*actual_counts.get(name).unwrap_or(&0)))
        .sum();
    let precision = if actual.is_empty() {
        0.0
    } else {
        overlap as f64 / actual.len() as f64
    };
    let recall = if expected.is_empty() {
        0.0
    } else {
        overlap as f64 / expected.len() as f64
    };
    let f1 = if precision + recall == 0.0 {
        0.0
    } else {
        2.0 * precision * recall / (precision + recall)
    };
    (precision, recall, f1)
}

#[derive(Debug, Deserialize)]
struct ActionSequenceConfig {
    matching_mode: MatchingMode,
    expected_actions: Vec<String>,
}

/// Tool-name sequence matching. The score is always the multiset F1;
/// `passed` follows the mode's boolean check, so an out-of-order
/// trajectory can score 1.0 and still fail `exact_match`.
#[derive(Debug)]
pub struct ActionSequenceGrader {
    name: String,
    config: ActionSequenceConfig,
}

impl ActionSequenceGrader {
    pub fn new(config: &GraderConfig, deps: &GraderDeps) -> Result<Self, Error> {
        let decoded: ActionSequenceConfig =
            decode_config(&config.name, FIELDS, &config.config, deps.strict)?;
        Ok(Self {
            name: config.name.clone(),
            config: decoded,
        })
    }
}

#[async_trait]
impl Grader for ActionSequenceGrader {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> GraderKind {
        GraderKind::ActionSequence
    }

    async fn grade(
        &self,
        context: &GradingContext,
        _cancel: &CancellationToken,
    ) -> Result<GraderResult, Error> {
        let actual: Vec<String> = context
            .session_digest
            .as_ref()
            .map(|digest| digest.tools_used.clone())
            .unwrap_or_default();
        let expected = &self.config.expected_actions;

        let passed = self.config.matching_mode.matches(expected, &actual);
        let (precision, recall, f1) = sequence_f1(expected, &actual);

        let feedback = if passed {
            format!(
                "actions satisfied {} (f1 {f1:.2})",
                self.config.matching_mode.as_str()
            )
        } else {
            format!(
                "actions violated {}: expected {expected:?}, got {actual:?}",
                self.config.matching_mode.as_str()
            )
        };
        let mut details = serde_json::Map::new();
        details.insert("precision".to_string(), json!(precision));
        details.insert("recall".to_string(), json!(recall));
        details.insert("f1".to_string(), json!(f1));
        details.insert(
            "matching_mode".to_string(),
            json!(self.config.matching_mode.as_str()),
        );
        Ok(
            GraderResult::new(&self.name, GraderKind::ActionSequence, f1, passed, feedback)
                .with_details(details),
        )
    }
}
