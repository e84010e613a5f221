//! Results emission: the canonical machine-readable run document, the
//! CI manifest with its exit-code contract, and the human summary.

use std::io::Write;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::stats::RunOutcome;
use crate::types::TrialStatus;

/// Exit codes for the CI contract: 0 all trials passed, 1 any trial
/// failed or errored, 2 reserved for run-level errors (spec load,
/// `before_run` hook, cancellation) which abort before an outcome
/// exists.
pub const EXIT_OK: i32 = 0;
pub const EXIT_TRIAL_FAILURES: i32 = 1;
pub const EXIT_RUN_ERROR: i32 = 2;

/// Serializes the run document. Canonical: emitting, parsing, and
/// emitting again is byte-identical (struct field order is fixed and
/// parsed maps preserve insertion order).
pub fn render_results_document(outcome: &RunOutcome) -> Result<String> {
    let mut rendered = serde_json::to_string_pretty(outcome)?;
    rendered.push('\n');
    Ok(rendered)
}

pub fn write_results_document(outcome: &RunOutcome, mut writer: impl Write) -> Result<()> {
    writer.write_all(render_results_document(outcome)?.as_bytes())?;
    Ok(())
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CiFailure {
    pub task_id: String,
    pub model: String,
    pub trial_index: usize,
    pub status: TrialStatus,
    /// Name and feedback of the first failing grader, when one exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_failing_grader: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CiReport {
    pub spec_name: String,
    pub pass_rate: f64,
    pub total_trials: usize,
    pub passed_trials: usize,
    pub failed_trials: usize,
    pub error_trials: usize,
    pub exit_code: i32,
    pub failures: Vec<CiFailure>,
}

pub fn build_ci_report(outcome: &RunOutcome) -> CiReport {
    let trials: Vec<_> = outcome
        .tasks
        .iter()
        .flat_map(|task| &task.trials)
        .collect();
    let passed_trials = trials.iter().filter(|t| t.passed()).count();
    let error_trials = trials
        .iter()
        .filter(|t| t.status == TrialStatus::Error)
        .count();
    let failures = trials
        .iter()
        .filter(|trial| !trial.passed())
        .map(|trial| {
            let first_failing = trial.grader_results.iter().find(|result| !result.passed);
            CiFailure {
                task_id: trial.task_id.clone(),
                model: trial.model.clone(),
                trial_index: trial.trial_index,
                status: trial.status,
                first_failing_grader: first_failing.map(|result| result.name.clone()),
                feedback: first_failing
                    .map(|result| result.feedback.clone())
                    .or_else(|| trial.error.clone()),
            }
        })
        .collect();
    CiReport {
        spec_name: outcome.spec_name.clone(),
        pass_rate: outcome.overall.pass_rate,
        total_trials: trials.len(),
        passed_trials,
        failed_trials: trials.len() - passed_trials - error_trials,
        error_trials,
        exit_code: exit_code(outcome),
        failures,
    }
}

pub fn exit_code(outcome: &RunOutcome) -> i32 {
    if outcome.all_passed() {
        EXIT_OK
    } else {
        EXIT_TRIAL_FAILURES
    }
}

/// Developer-facing summary: aggregate pass rate, baseline movement,
/// and the first failing grader per failing task.
pub fn write_text_summary(outcome: &RunOutcome, mut writer: impl Write) -> Result<()> {
    writeln!(
        writer,
        "{}: {}/{} trials passed (pass rate {:.1}%, 95% CI [{:.2}, {:.2}])",
        outcome.spec_name,
        outcome
            .tasks
            .iter()
            .flat_map(|task| &task.trials)
            .filter(|trial| trial.passed())
            .count(),
        outcome.overall.total_trials,
        outcome.overall.pass_rate * 100.0,
        outcome.overall.pass_rate_ci.lower,
        outcome.overall.pass_rate_ci.upper,
    )?;
    writeln!(
        writer,
        "weighted score {:.3}",
        outcome.overall.avg_weighted_score
    )?;

    if let Some(delta) = &outcome.baseline_delta {
        writeln!(
            writer,
            "baseline: {:.1}% -> {:.1}% (delta {:+.1}%, normalized gain {:.2}){}",
            delta.pass_rate_without * 100.0,
            delta.pass_rate_with * 100.0,
            delta.delta * 100.0,
            delta.normalized_gain,
            if delta.significant {
                ", significant"
            } else {
                ""
            },
        )?;
    }

    for task in &outcome.tasks {
        let Some(failing) = task.trials.iter().find(|trial| !trial.passed()) else {
            continue;
        };
        match failing.grader_results.iter().find(|result| !result.passed) {
            Some(grader) => writeln!(
                writer,
                "FAIL {}: {} - {}",
                task.task_id, grader.name, grader.feedback
            )?,
            None => writeln!(
                writer,
                "FAIL {}: {}",
                task.task_id,
                failing.error.as_deref().unwrap_or("infrastructure error")
            )?,
        }
    }
    Ok(())
}
