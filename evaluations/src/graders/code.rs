use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use waza_core::error::Error;
use waza_core::session::TranscriptEvent;
use waza_core::spec::GraderConfig;

use super::{Grader, GraderDeps, GraderKind, decode_config, score_from_checks};
use crate::types::{GraderResult, GradingContext};

const FIELDS: &[&str] = &["language", "assertions"];
const INTERPRETER_TIMEOUT: Duration = Duration::from_secs(30);

/// Fixed wrapper programs: both read a JSON payload on stdin, evaluate
/// each assertion expression against it, and print
/// `{"results": [...]}` where `""` means pass and any other string is
/// the failure message. The boundary is data, not a language ABI.
const PYTHON_WRAPPER: &str = r#"
import json, sys
payload = json.load(sys.stdin)
scope = {key: payload[key] for key in ("output", "outcome", "transcript", "tool_calls", "duration_ms", "errors")}
results = []
for expr in payload["assertions"]:
    try:
        results.append("" if eval(expr, {"__builtins__": __builtins__}, dict(scope)) else "assertion failed: " + expr)
    except Exception as exc:
        results.append(type(exc).__name__ + ": " + str(exc))
print(json.dumps({"results": results}))
"#;

const JAVASCRIPT_WRAPPER: &str = r#"
let raw = "";
process.stdin.on("data", (chunk) => { raw += chunk; });
process.stdin.on("end", () => {
  const payload = JSON.parse(raw);
  const results = payload.assertions.map((expr) => {
    try {
      const fn = new Function(
        "output", "outcome", "transcript", "tool_calls", "duration_ms", "errors",
        `return (${expr});`
      );
      const ok = fn(payload.output, payload.outcome, payload.transcript,
                    payload.tool_calls, payload.duration_ms, payload.errors);
      return ok ? "" : `assertion failed: ${expr}`;
    } catch (err) {
      return String(err);
    }
  });
  process.stdout.write(JSON.stringify({ results }));
});
"#;

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
enum Language {
    Python,
    Javascript,
}

impl Language {
    fn command(self) -> Command {
        match self {
            Language::Python => {
                let mut command = Command::new("python3");
                command.arg("-c").arg(PYTHON_WRAPPER);
                command
            }
            Language::Javascript => {
                let mut command = Command::new("node");
                command.arg("-e").arg(JAVASCRIPT_WRAPPER);
                command
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct CodeConfig {
    language: Language,
    assertions: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct WrapperOutput {
    results: Vec<String>,
}

/// Boolean assertion expressions evaluated by an external interpreter
/// against a JSON payload of the trial. Interpreter faults (missing
/// binary, non-zero exit, unparseable output) are grading errors, not
/// trial failures.
#[derive(Debug)]
pub struct CodeGrader {
    name: String,
    config: CodeConfig,
}

impl CodeGrader {
    pub fn new(config: &GraderConfig, deps: &GraderDeps) -> Result<Self, Error> {
        let decoded: CodeConfig =
            decode_config(&config.name, FIELDS, &config.config, deps.strict)?;
        if decoded.assertions.is_empty() {
            return Err(Error::GraderConfig {
                grader: config.name.clone(),
                message: "at least one assertion is required".to_string(),
            });
        }
        Ok(Self {
            name: config.name.clone(),
            config: decoded,
        })
    }

    fn grading_error(&self, message: String) -> Error {
        Error::Grading {
            grader: self.name.clone(),
            message,
        }
    }
}

#[async_trait]
impl Grader for CodeGrader {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> GraderKind {
        GraderKind::Code
    }

    async fn grade(
        &self,
        context: &GradingContext,
        cancel: &CancellationToken,
    ) -> Result<GraderResult, Error> {
        let errors: Vec<String> = context
            .transcript
            .iter()
            .filter_map(|event| match event {
                TranscriptEvent::ToolCallError { error, .. } => Some(error.clone()),
                TranscriptEvent::Anomaly { message } => Some(message.clone()),
                _ => None,
            })
            .collect();
        let payload = json!({
            "output": context.output_text,
            "outcome": context.outcome_map,
            "transcript": &*context.transcript,
            "tool_calls": &*context.tool_calls,
            "duration_ms": context.duration_ms,
            "errors": errors,
            "assertions": self.config.assertions,
        });
        let payload_bytes =
            serde_json::to_vec(&payload).map_err(|e| self.grading_error(e.to_string()))?;

        let mut child = self
            .config
            .language
            .command()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.grading_error(format!("failed to spawn interpreter: {e}")))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| self.grading_error("interpreter stdin unavailable".to_string()))?;
        stdin
            .write_all(&payload_bytes)
            .await
            .map_err(|e| self.grading_error(format!("failed to write payload: {e}")))?;
        drop(stdin);

        let output = tokio::select! {
            output = tokio::time::timeout(INTERPRETER_TIMEOUT, child.wait_with_output()) => {
                match output {
                    Ok(Ok(output)) => output,
                    Ok(Err(e)) => return Err(self.grading_error(format!("interpreter failed: {e}"))),
                    Err(_) => {
                        return Err(self.grading_error(format!(
                            "interpreter timed out after {}s",
                            INTERPRETER_TIMEOUT.as_secs()
                        )));
                    }
                }
            }
            () = cancel.cancelled() => {
                return Ok(GraderResult::new(
                    &self.name,
                    GraderKind::Code,
                    0.0,
                    false,
                    "cancelled".to_string(),
                ));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(self.grading_error(format!(
                "interpreter exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        let parsed: WrapperOutput = serde_json::from_slice(&output.stdout)
            .map_err(|e| self.grading_error(format!("unparseable interpreter output: {e}")))?;
        if parsed.results.len() != self.config.assertions.len() {
            return Err(self.grading_error(format!(
                "interpreter returned {} results for {} assertions",
                parsed.results.len(),
                self.config.assertions.len()
            )));
        }

        let total = self.config.assertions.len();
        let failures: Vec<&String> = parsed.results.iter().filter(|r| !r.is_empty()).collect();
        let passed = failures.is_empty();
        let feedback = if passed {
            format!("all {total} assertions passed")
        } else {
            failures
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join("; ")
        };
        Ok(GraderResult::new(
            &self.name,
            GraderKind::Code,
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

    fn grader(value: serde_json::Value) -> Result<CodeGrader, Error> {
        CodeGrader::new(
            &GraderConfig {
                name: "assertions".to_string(),
                kind: "code".to_string(),
                config: value.as_object().unwrap().clone(),
                weight: None,
            },
            &deps(),
        )
    }

    #[test]
    fn test_empty_assertions_rejected() {
        let err = grader(json!({"language": "python", "assertions": []})).unwrap_err();
        assert!(matches!(err, Error::GraderConfig { .. }));
    }

    #[test]
    fn test_unknown_language_rejected() {
        let err = grader(json!({"language": "cobol", "assertions": ["1"]})).unwrap_err();
        assert!(matches!(err, Error::GraderConfig { .. }));
    }

    // Exercises the real python3 interpreter; the environments this
    // suite runs in carry one.
    #[tokio::test]
    async fn test_python_assertions_pass_and_fail() {
        let grader = grader(json!({
            "language": "python",
            "assertions": ["'hello' in output", "duration_ms >= 0", "'nope' in output"],
        }))
        .unwrap();
        let result = grader
            .grade(&context_with_output("hello there"), &CancellationToken::new())
            .await
            .unwrap();
        assert!(!result.passed);
        assert!((result.score - 2.0 / 3.0).abs() < 1e-12);
        assert!(result.feedback.contains("nope"));
    }

    #[tokio::test]
    async fn test_javascript_assertions() {
        let grader = grader(json!({
            "language": "javascript",
            "assertions": ["typeof output === 'string'", "output.includes('hi')"],
        }))
        .unwrap();
        let result = grader
            .grade(&context_with_output("hi there"), &CancellationToken::new())
            .await;
        match result {
            Ok(result) => {
                assert!(result.passed);
                assert_eq!(result.score, 1.0);
            }
            // Hosts without node report a grading error, never a
            // failed verdict.
            Err(err) => assert!(matches!(err, Error::Grading { .. })),
        }
    }
}
