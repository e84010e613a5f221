//! Lifecycle hooks: shell commands run at four points with distinct
//! failure semantics (applied by the orchestrator; this module only
//! executes and reports). Command lines are template-expanded with the
//! same vars as prompts.

use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Error;
use crate::template::{TemplateVars, expand};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookPoint {
    BeforeRun,
    BeforeTask,
    AfterTask,
    AfterRun,
}

impl HookPoint {
    pub fn as_str(self) -> &'static str {
        match self {
            HookPoint::BeforeRun => "before_run",
            HookPoint::BeforeTask => "before_task",
            HookPoint::AfterTask => "after_task",
            HookPoint::AfterRun => "after_run",
        }
    }
}

impl std::fmt::Display for HookPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HooksConfig {
    pub before_run: Option<String>,
    pub before_task: Option<String>,
    pub after_task: Option<String>,
    pub after_run: Option<String>,
}

impl HooksConfig {
    pub fn command(&self, point: HookPoint) -> Option<&str> {
        match point {
            HookPoint::BeforeRun => self.before_run.as_deref(),
            HookPoint::BeforeTask => self.before_task.as_deref(),
            HookPoint::AfterTask => self.after_task.as_deref(),
            HookPoint::AfterRun => self.after_run.as_deref(),
        }
    }
}

pub struct HookRunner {
    hooks: HooksConfig,
}

impl HookRunner {
    pub fn new(hooks: HooksConfig) -> Self {
        Self { hooks }
    }

    /// Runs the hook configured for `point`, if any. Exit code 0 (or no
    /// configured hook) is success; anything else is `Error::Hook`.
    /// Cancellation kills the child and surfaces `Error::Cancelled`.
    pub async fn run(
        &self,
        point: HookPoint,
        vars: &TemplateVars,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let Some(raw_command) = self.hooks.command(point) else {
            return Ok(());
        };
        let command_line = expand(raw_command, vars)?;
        debug!(hook = %point, command = %command_line, "Running hook");

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&command_line)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Hook {
                hook: point.to_string(),
                message: format!("failed to spawn '{command_line}': {e}"),
            })?;

        let output = tokio::select! {
            output = child.wait_with_output() => output.map_err(|e| Error::Hook {
                hook: point.to_string(),
                message: format!("failed to wait for '{command_line}': {e}"),
            })?,
            () = cancel.cancelled() => {
                warn!(hook = %point, "Hook cancelled");
                return Err(Error::Cancelled);
            }
        };

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(Error::Hook {
                hook: point.to_string(),
                message: format!(
                    "'{command_line}' exited with {}: {}",
                    output.status,
                    stderr.trim()
                ),
            })
        }
    }
}
