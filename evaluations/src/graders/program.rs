use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use waza_core::error::Error;
use waza_core::spec::GraderConfig;

use super::{Grader, GraderDeps, GraderKind, decode_config};
use crate::types::{GraderResult, GradingContext};

const FIELDS: &[&str] = &["command", "args", "timeout", "protocol"];

fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize)]
struct ProgramConfig {
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    timeout: u64,
    /// Reserved protocol selector; recorded but not interpreted yet.
    #[serde(default)]
    protocol: Option<String>,
}

/// Arbitrary external grader: the child receives the agent output on
/// stdin and `WORKSPACE_DIR` in its environment, and votes with its
/// exit code. The last line of stdout becomes the feedback. Binary by
/// construction: score is 0 or 1.
#[derive(Debug)]
pub struct ProgramGrader {
    name: String,
    config: ProgramConfig,
}

impl ProgramGrader {
    pub fn new(config: &GraderConfig, deps: &GraderDeps) -> Result<Self, Error> {
        let decoded: ProgramConfig =
            decode_config(&config.name, FIELDS, &config.config, deps.strict)?;
        if decoded.command.is_empty() {
            return Err(Error::GraderConfig {
                grader: config.name.clone(),
                message: "'command' must not be empty".to_string(),
            });
        }
        Ok(Self {
            name: config.name.clone(),
            config: decoded,
        })
    }
}

#[async_trait]
impl Grader for ProgramGrader {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> GraderKind {
        GraderKind::Program
    }

    async fn grade(
        &self,
        context: &GradingContext,
        cancel: &CancellationToken,
    ) -> Result<GraderResult, Error> {
        let mut child = Command::new(&self.config.command)
            .args(&self.config.args)
            .current_dir(&context.workspace_dir)
            .env("WORKSPACE_DIR", &context.workspace_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Grading {
                grader: self.name.clone(),
                message: format!("failed to spawn '{}': {e}", self.config.command),
            })?;

        let mut stdin = child.stdin.take().ok_or_else(|| Error::Grading {
            grader: self.name.clone(),
            message: "grader stdin unavailable".to_string(),
        })?;
        stdin
            .write_all(context.output_text.as_bytes())
            .await
            .map_err(|e| Error::Grading {
                grader: self.name.clone(),
                message: format!("failed to write agent output: {e}"),
            })?;
        drop(stdin);

        let timeout = Duration::from_secs(self.config.timeout);
        let output = tokio::select! {
            output = tokio::time::timeout(timeout, child.wait_with_output()) => {
                match output {
                    Ok(Ok(output)) => output,
                    Ok(Err(e)) => {
                        return Err(Error::Grading {
                            grader: self.name.clone(),
                            message: format!("failed to wait for grader process: {e}"),
                        });
                    }
                    Err(_) => {
                        return Ok(GraderResult::new(
                            &self.name,
                            GraderKind::Program,
                            0.0,
                            false,
                            format!("timeout after {}s", self.config.timeout),
                        ));
                    }
                }
            }
            () = cancel.cancelled() => {
                return Ok(GraderResult::new(
                    &self.name,
                    GraderKind::Program,
                    0.0,
                    false,
                    "cancelled".to_string(),
                ));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let feedback = stdout
            .lines()
            .filter(|line| !line.trim().is_empty())
            .next_back()
            .unwrap_or("")
            .to_string();
        let passed = output.status.success();
        let mut result = GraderResult::new(
            &self.name,
            GraderKind::Program,
            if passed { 1.0 } else { 0.0 },
            passed,
            feedback,
        );
        if let Some(protocol) = &self.config.protocol {
            result
                .details
                .insert("protocol".to_string(), protocol.clone().into());
        }
        result.details.insert(
            "exit_code".to_string(),
            output.status.code().unwrap_or(-1).into(),
        );
        Ok(result)
    }
}
