use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use waza_core::error::Error;
use waza_core::spec::GraderConfig;
use waza_core::workspace::is_contained_rel;

use super::{Grader, GraderDeps, GraderKind, decode_config, score_from_checks};
use crate::types::{GraderResult, GradingContext};

const FIELDS: &[&str] = &["must_exist", "must_not_exist", "content_patterns"];

#[derive(Debug, Deserialize, Default)]
struct FileConfig {
    #[serde(default)]
    must_exist: Vec<String>,
    #[serde(default)]
    must_not_exist: Vec<String>,
    #[serde(default)]
    content_patterns: Vec<ContentPatternConfig>,
}

#[derive(Debug, Deserialize)]
struct ContentPatternConfig {
    path: String,
    #[serde(default)]
    must_match: Vec<String>,
    #[serde(default)]
    must_not_match: Vec<String>,
}

#[derive(Debug)]
struct ContentPattern {
    path: String,
    must_match: Vec<Regex>,
    must_not_match: Vec<Regex>,
}

impl ContentPattern {
    fn check_count(&self) -> usize {
        self.must_match.len() + self.must_not_match.len()
    }
}

/// Workspace existence and content-pattern checks. All configured paths
/// are containment-validated at construction; workspace resolution
/// re-checks at grade time.
#[derive(Debug)]
pub struct FileGrader {
    name: String,
    must_exist: Vec<String>,
    must_not_exist: Vec<String>,
    content_patterns: Vec<ContentPattern>,
}

fn validate_rel_path(grader_name: &str, path: &str) -> Result<(), Error> {
    if is_contained_rel(path) {
        Ok(())
    } else {
        Err(Error::GraderConfig {
            grader: grader_name.to_string(),
            message: format!("path '{path}' is not a contained workspace-relative path"),
        })
    }
}

impl FileGrader {
    pub fn new(config: &GraderConfig, deps: &GraderDeps) -> Result<Self, Error> {
        let decoded: FileConfig =
            decode_config(&config.name, FIELDS, &config.config, deps.strict)?;
        for path in decoded.must_exist.iter().chain(&decoded.must_not_exist) {
            validate_rel_path(&config.name, path)?;
        }
        let mut content_patterns = Vec::with_capacity(decoded.content_patterns.len());
        for entry in decoded.content_patterns {
            validate_rel_path(&config.name, &entry.path)?;
            content_patterns.push(ContentPattern {
                path: entry.path,
                must_match: super::regex::compile_all(&config.name, &entry.must_match)?,
                must_not_match: super::regex::compile_all(&config.name, &entry.must_not_match)?,
            });
        }
        Ok(Self {
            name: config.name.clone(),
            must_exist: decoded.must_exist,
            must_not_exist: decoded.must_not_exist,
            content_patterns,
        })
    }
}

#[async_trait]
impl Grader for FileGrader {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> GraderKind {
        GraderKind::File
    }

    async fn grade(
        &self,
        context: &GradingContext,
        _cancel: &CancellationToken,
    ) -> Result<GraderResult, Error> {
        let total = self.must_exist.len()
            + self.must_not_exist.len()
            + self
                .content_patterns
                .iter()
                .map(ContentPattern::check_count)
                .sum::<usize>();
        let mut failures = Vec::new();

        for path in &self.must_exist {
            if !context.resolve_workspace_path(path)?.exists() {
                failures.push(format!("expected file '{path}' does not exist"));
            }
        }
        for path in &self.must_not_exist {
            if context.resolve_workspace_path(path)?.exists() {
                failures.push(format!("forbidden file '{path}' exists"));
            }
        }
        for pattern in &self.content_patterns {
            let resolved = context.resolve_workspace_path(&pattern.path)?;
            match std::fs::read_to_string(&resolved) {
                Ok(contents) => {
                    for regex in &pattern.must_match {
                        if !regex.is_match(&contents) {
                            failures.push(format!(
                                "'{}': pattern '{regex}' did not match",
                                pattern.path
                            ));
                        }
                    }
                    for regex in &pattern.must_not_match {
                        if regex.is_match(&contents) {
                            failures.push(format!(
                                "'{}': forbidden pattern '{regex}' matched",
                                pattern.path
                            ));
                        }
                    }
                }
                // A missing file fails every sub-check so the total
                // check count stays stable across runs.
                Err(_) => {
                    for _ in 0..pattern.check_count() {
                        failures.push(format!("'{}': file not readable", pattern.path));
                    }
                }
            }
        }

        let passed = failures.is_empty();
        let feedback = if passed {
            format!("all {total} file checks passed")
        } else {
            failures.join("; ")
        };
        Ok(GraderResult::new(
            &self.name,
            GraderKind::File,
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
    use tempfile::TempDir;

    fn grader(value: serde_json::Value) -> Result<FileGrader, Error> {
        FileGrader::new(
            &GraderConfig {
                name: "fs".to_string(),
                kind: "file".to_string(),
                config: value.as_object().unwrap().clone(),
                weight: None,
            },
            &deps(),
        )
    }

    #[tokio::test]
    async fn test_existence_checks() {
        let workspace = TempDir::new().unwrap();
        std::fs::write(workspace.path().join("present.txt"), "x").unwrap();
        let mut context = context_with_output("");
        context.workspace_dir = workspace.path().to_path_buf();

        let grader = grader(json!({
            "must_exist": ["present.txt"],
            "must_not_exist": ["absent.txt"],
        }))
        .unwrap();
        let result = grader.grade(&context, &CancellationToken::new()).await.unwrap();
        assert!(result.passed);
        assert_eq!(result.score, 1.0);
    }

    #[tokio::test]
    async fn test_content_patterns() {
        let workspace = TempDir::new().unwrap();
        std::fs::write(workspace.path().join("log.txt"), "build ok\nwarnings: 0").unwrap();
        let mut context = context_with_output("");
        context.workspace_dir = workspace.path().to_path_buf();

        let grader = grader(json!({
            "content_patterns": [{
                "path": "log.txt",
                "must_match": ["build ok"],
                "must_not_match": ["FAILED"],
            }],
        }))
        .unwrap();
        let result = grader.grade(&context, &CancellationToken::new()).await.unwrap();
        assert!(result.passed);
        assert_eq!(result.score, 1.0);
    }

    #[tokio::test]
    async fn test_missing_content_file_fails_every_subcheck() {
        let workspace = TempDir::new().unwrap();
        let mut context = context_with_output("");
        context.workspace_dir = workspace.path().to_path_buf();

        let grader = grader(json!({
            "must_exist": ["gone.txt"],
            "content_patterns": [{
                "path": "gone.txt",
                "must_match": ["a", "b"],
                "must_not_match": ["c"],
            }],
        }))
        .unwrap();
        let result = grader.grade(&context, &CancellationToken::new()).await.unwrap();
        // 4 checks total (1 existence + 3 sub-checks), all failing.
        assert!(!result.passed);
        assert_eq!(result.score, 0.0);
    }

    #[test]
    fn test_escaping_path_is_config_error() {
        let err = grader(json!({"must_exist": ["../outside.txt"]})).unwrap_err();
        assert!(matches!(err, Error::GraderConfig { .. }));
    }
}
