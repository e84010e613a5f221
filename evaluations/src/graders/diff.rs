use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use waza_core::error::Error;
use waza_core::spec::GraderConfig;
use waza_core::workspace::is_contained_rel;

use super::{Grader, GraderDeps, GraderKind, decode_config, score_from_checks};
use crate::types::{GraderResult, GradingContext};

const FIELDS: &[&str] = &["expected_files"];

#[derive(Debug, Deserialize, Default)]
struct DiffConfig {
    #[serde(default)]
    expected_files: Vec<ExpectedFileConfig>,
}

#[derive(Debug, Deserialize)]
struct ExpectedFileConfig {
    path: String,
    #[serde(default)]
    snapshot: Option<String>,
    #[serde(default)]
    contains: Vec<String>,
}

#[derive(Debug)]
enum Fragment {
    /// `+fragment` (and bare fragments) must appear in the file.
    Present(String),
    /// `-fragment` must not appear.
    Absent(String),
}

#[derive(Debug)]
struct ExpectedFile {
    path: String,
    /// Resolved at construction; comparison is exact-bytes.
    snapshot: Option<PathBuf>,
    fragments: Vec<Fragment>,
}

impl ExpectedFile {
    /// One existence check per entry, plus one per snapshot and one per
    /// fragment.
    fn check_count(&self) -> usize {
        1 + usize::from(self.snapshot.is_some()) + self.fragments.len()
    }
}

/// Compares workspace files against expected snapshots and fragments
/// after the agent has run.
#[derive(Debug)]
pub struct DiffGrader {
    name: String,
    expected_files: Vec<ExpectedFile>,
}

impl DiffGrader {
    pub fn new(config: &GraderConfig, deps: &GraderDeps) -> Result<Self, Error> {
        let decoded: DiffConfig =
            decode_config(&config.name, FIELDS, &config.config, deps.strict)?;
        let mut expected_files = Vec::with_capacity(decoded.expected_files.len());
        for entry in decoded.expected_files {
            if !is_contained_rel(&entry.path) {
                return Err(Error::GraderConfig {
                    grader: config.name.clone(),
                    message: format!(
                        "path '{}' is not a contained workspace-relative path",
                        entry.path
                    ),
                });
            }
            if entry.snapshot.is_none() && entry.contains.is_empty() {
                return Err(Error::GraderConfig {
                    grader: config.name.clone(),
                    message: format!(
                        "entry '{}' needs at least one of 'snapshot' or 'contains'",
                        entry.path
                    ),
                });
            }
            let snapshot = match entry.snapshot {
                Some(rel) => {
                    let resolved = deps.context_dir.join(&rel);
                    if !resolved.is_file() {
                        return Err(Error::GraderConfig {
                            grader: config.name.clone(),
                            message: format!("snapshot file '{rel}' does not exist"),
                        });
                    }
                    Some(resolved)
                }
                None => None,
            };
            let fragments = entry
                .contains
                .into_iter()
                .map(|fragment| match fragment.strip_prefix('-') {
                    Some(rest) => Fragment::Absent(rest.to_string()),
                    None => Fragment::Present(
                        fragment
                            .strip_prefix('+')
                            .unwrap_or(&fragment)
                            .to_string(),
                    ),
                })
                .collect();
            expected_files.push(ExpectedFile {
                path: entry.path,
                snapshot,
                fragments,
            });
        }
        Ok(Self {
            name: config.name.clone(),
            expected_files,
        })
    }
}

#[async_trait]
impl Grader for DiffGrader {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> GraderKind {
        GraderKind::Diff
    }

    async fn grade(
        &self,
        context: &GradingContext,
        _cancel: &CancellationToken,
    ) -> Result<GraderResult, Error> {
        let total: usize = self.expected_files.iter().map(ExpectedFile::check_count).sum();
        let mut failures = Vec::new();

        for expected in &self.expected_files {
            let resolved = context.resolve_workspace_path(&expected.path)?;
            let actual = match std::fs::read(&resolved) {
                Ok(bytes) => bytes,
                Err(_) => {
                    for _ in 0..expected.check_count() {
                        failures.push(format!("'{}' does not exist", expected.path));
                    }
                    continue;
                }
            };

            if let Some(snapshot_path) = &expected.snapshot {
                let snapshot = std::fs::read(snapshot_path).map_err(|e| Error::Grading {
                    grader: self.name.clone(),
                    message: format!(
                        "failed to read snapshot '{}': {e}",
                        snapshot_path.display()
                    ),
                })?;
                if actual != snapshot {
                    failures.push(format!("'{}' differs from its snapshot", expected.path));
                }
            }

            let text = String::from_utf8_lossy(&actual);
            for fragment in &expected.fragments {
                match fragment {
                    Fragment::Present(needle) => {
                        if !text.contains(needle.as_str()) {
                            failures.push(format!(
                                "'{}' is missing expected fragment '{needle}'",
                                expected.path
                            ));
                        }
                    }
                    Fragment::Absent(needle) => {
                        if text.contains(needle.as_str()) {
                            failures.push(format!(
                                "'{}' contains forbidden fragment '{needle}'",
                                expected.path
                            ));
                        }
                    }
                }
            }
        }

        let passed = failures.is_empty();
        let feedback = if passed {
            format!("all {total} diff checks passed")
        } else {
            failures.join("; ")
        };
        Ok(GraderResult::new(
            &self.name,
            GraderKind::Diff,
            score_from_checks(total - failures.len(), total),
            passed,
            feedback,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graders::test_support::context_with_output;
    use crate::graders::test_support::deps as engine_deps;
    use serde_json::json;
    use tempfile::TempDir;

    fn grader_with_context_dir(
        value: serde_json::Value,
        context_dir: PathBuf,
    ) -> Result<DiffGrader, Error> {
        let mut deps = engine_deps();
        deps.context_dir = context_dir;
        DiffGrader::new(
            &GraderConfig {
                name: "diff".to_string(),
                kind: "diff".to_string(),
                config: value.as_object().unwrap().clone(),
                weight: None,
            },
            &deps,
        )
    }

    #[tokio::test]
    async fn test_fragment_rules() {
        let workspace = TempDir::new().unwrap();
        std::fs::write(workspace.path().join("input.txt"), "ab").unwrap();
        let mut context = context_with_output("");
        context.workspace_dir = workspace.path().to_path_buf();

        let grader = grader_with_context_dir(
            json!({"expected_files": [{"path": "input.txt", "contains": ["+b", "-z", "a"]}]}),
            std::env::temp_dir(),
        )
        .unwrap();
        let result = grader.grade(&context, &CancellationToken::new()).await.unwrap();
        assert!(result.passed);
        assert_eq!(result.score, 1.0);

        // Unchanged file missing the added fragment fails.
        std::fs::write(workspace.path().join("input.txt"), "a").unwrap();
        let result = grader.grade(&context, &CancellationToken::new()).await.unwrap();
        assert!(!result.passed);
        // existence + "-z" + "a" pass; "+b" fails: 3 of 4.
        assert_eq!(result.score, 0.75);
    }

    #[tokio::test]
    async fn test_snapshot_exact_bytes() {
        let context_dir = TempDir::new().unwrap();
        std::fs::write(context_dir.path().join("expected.txt"), "golden\n").unwrap();
        let workspace = TempDir::new().unwrap();
        std::fs::write(workspace.path().join("out.txt"), "golden\n").unwrap();
        let mut context = context_with_output("");
        context.workspace_dir = workspace.path().to_path_buf();

        let grader = grader_with_context_dir(
            json!({"expected_files": [{"path": "out.txt", "snapshot": "expected.txt"}]}),
            context_dir.path().to_path_buf(),
        )
        .unwrap();
        let result = grader.grade(&context, &CancellationToken::new()).await.unwrap();
        assert!(result.passed);

        // A single trailing byte difference fails the snapshot check.
        std::fs::write(workspace.path().join("out.txt"), "golden").unwrap();
        let result = grader.grade(&context, &CancellationToken::new()).await.unwrap();
        assert!(!result.passed);
        assert_eq!(result.score, 0.5);
    }

    #[tokio::test]
    async fn test_missing_file_fails_all_entry_checks() {
        let workspace = TempDir::new().unwrap();
        let mut context = context_with_output("");
        context.workspace_dir = workspace.path().to_path_buf();

        let grader = grader_with_context_dir(
            json!({"expected_files": [{"path": "never.txt", "contains": ["+x", "+y"]}]}),
            std::env::temp_dir(),
        )
        .unwrap();
        let result = grader.grade(&context, &CancellationToken::new()).await.unwrap();
        assert!(!result.passed);
        assert_eq!(result.score, 0.0);
    }

    #[test]
    fn test_entry_without_snapshot_or_contains_rejected() {
        let err = grader_with_context_dir(
            json!({"expected_files": [{"path": "a.txt"}]}),
            std::env::temp_dir(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::GraderConfig { .. }));
    }

    #[test]
    fn test_missing_snapshot_file_rejected_at_construction() {
        let err = grader_with_context_dir(
            json!({"expected_files": [{"path": "a.txt", "snapshot": "no-such-snapshot.txt"}]}),
            TempDir::new().unwrap().path().to_path_buf(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::GraderConfig { .. }));
    }
}
