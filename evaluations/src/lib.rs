//! The Waza run orchestrator: enumerates task × model × trial work
//! units, drives the agent through each one in an isolated workspace,
//! runs the configured graders, and streams trial results to the
//! consumer while folding them into the final run outcome.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context as AnyhowContext, anyhow};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use waza_core::cache::{CacheKeyParts, TrialCache, compute_cache_key};
use waza_core::engine::{AgentEngine, AgentEvent, SessionParams};
use waza_core::error::Error;
use waza_core::hooks::{HookPoint, HookRunner};
use waza_core::session::SessionCollector;
use waza_core::spec::{EvalSpec, TaskConfig};
use waza_core::template::TemplateVars;
use waza_core::workspace::{self, WorkspaceManager};

pub mod cli;
pub mod graders;
pub mod helpers;
pub mod report;
pub mod stats;
pub mod types;

pub use cli::{Args, OutputFormat};
pub use graders::{Grader, GraderDeps, GraderKind};
pub use stats::{AggregateParams, RunOutcome, aggregate};
pub use types::{
    EvaluationCoreArgs, EvaluationStreamResult, GraderResult, GradingContext, RunInfo,
    TrialResult, TrialStatus, TrialUpdate,
};

/// Buffer size for the update channel; provides backpressure when the
/// consumer falls behind the workers.
const UPDATE_CHANNEL_BUFFER_SIZE: usize = 128;

/// High-level entry point used by the CLI: loads nothing itself (the
/// spec is already loaded), runs the run-level hooks with their failure
/// semantics, drains the update stream into `writer`, and aggregates
/// the final outcome. `after_run` fires on every exit path, including
/// a failed `before_run` and cancellation.
#[instrument(skip_all, fields(job_id = %job_id, spec = %spec.name))]
pub async fn run_evaluation(
    args: &Args,
    spec: Arc<EvalSpec>,
    engine: Arc<dyn AgentEngine>,
    job_id: Uuid,
    cancel: CancellationToken,
    mut writer: impl Write,
) -> anyhow::Result<RunOutcome> {
    let hook_runner = HookRunner::new(spec.hooks.clone());
    let run_vars = TemplateVars {
        job_id: job_id.to_string(),
        ..Default::default()
    }
    .with_vars(spec.vars.clone());

    let result = match hook_runner
        .run(HookPoint::BeforeRun, &run_vars, &cancel)
        .await
    {
        Err(e) => Err(anyhow!(e).context("before_run hook failed; aborting run")),
        Ok(()) => {
            run_evaluation_streaming_to_writer(args, spec.clone(), engine, job_id, &cancel, &mut writer)
                .await
        }
    };

    // `after_run` always fires, even on abort; failures are warnings.
    if let Err(e) = hook_runner
        .run(HookPoint::AfterRun, &run_vars, &CancellationToken::new())
        .await
    {
        warn!(error = %e, "after_run hook failed");
    }

    result
}

async fn run_evaluation_streaming_to_writer(
    args: &Args,
    spec: Arc<EvalSpec>,
    engine: Arc<dyn AgentEngine>,
    job_id: Uuid,
    cancel: &CancellationToken,
    writer: &mut impl Write,
) -> anyhow::Result<RunOutcome> {
    let started_at = chrono::Utc::now();
    let core_args = EvaluationCoreArgs {
        engine,
        spec: spec.clone(),
        job_id,
        models: args.models.clone(),
        baseline: args.baseline,
        max_attempts: args.max_attempts,
        parallel: args.parallel,
        no_cache: args.no_cache,
    };
    let models = core_args.resolved_models();
    let stream_result = run_evaluation_core_streaming(core_args, cancel.clone()).await?;
    let EvaluationStreamResult {
        mut receiver,
        run_info,
    } = stream_result;

    let progress_bar = match args.format {
        OutputFormat::Pretty => {
            let bar = indicatif::ProgressBar::new(run_info.num_work_units as u64);
            Some(bar)
        }
        OutputFormat::Jsonl => None,
    };
    if args.format == OutputFormat::Jsonl {
        writeln!(
            writer,
            "{}",
            serde_json::to_string(&TrialUpdate::RunInfo(run_info.clone()))?
        )?;
    }

    let mut trials = Vec::new();
    while let Some(update) = receiver.recv().await {
        match &update {
            TrialUpdate::RunInfo(_) => continue,
            TrialUpdate::Trial(trial) => {
                trials.push((**trial).clone());
                if let Some(bar) = &progress_bar {
                    bar.inc(1);
                }
            }
            TrialUpdate::UnitError { task_id, message, .. } => {
                warn!(task_id = %task_id, error = %message, "Work unit failed");
                if let Some(bar) = &progress_bar {
                    bar.inc(1);
                }
            }
        }
        if args.format == OutputFormat::Jsonl {
            writeln!(writer, "{}", serde_json::to_string(&update)?)?;
        }
    }
    if let Some(bar) = progress_bar {
        bar.finish_with_message("Done");
    }

    let outcome = aggregate(
        &AggregateParams {
            spec: &spec,
            job_id,
            models,
            baseline: args.baseline,
            started_at,
            finished_at: chrono::Utc::now(),
        },
        trials,
    );

    if args.format == OutputFormat::Pretty {
        report::write_text_summary(&outcome, &mut *writer)?;
    }
    if let Some(path) = &args.output {
        let document = report::render_results_document(&outcome)?;
        std::fs::write(path, document)
            .with_context(|| format!("failed to write results to '{}'", path.display()))?;
        info!(path = %path.display(), "Results document written");
    }
    if let Some(path) = &args.ci_report {
        let ci = report::build_ci_report(&outcome);
        std::fs::write(path, serde_json::to_string_pretty(&ci)?)
            .with_context(|| format!("failed to write CI report to '{}'", path.display()))?;
    }

    if cancel.is_cancelled() {
        return Err(anyhow!(Error::Cancelled));
    }
    Ok(outcome)
}

impl EvaluationCoreArgs {
    pub fn resolved_models(&self) -> Vec<String> {
        self.models
            .clone()
            .filter(|models| !models.is_empty())
            .unwrap_or_else(|| self.spec.config.models())
    }

    fn resolved_max_attempts(&self) -> u32 {
        self.max_attempts.unwrap_or(self.spec.config.max_attempts).max(1)
    }

    fn resolved_parallelism(&self, num_models: usize) -> usize {
        let default = self.spec.config.trials_per_task * num_models;
        let configured = self.parallel.unwrap_or(self.spec.config.parallel);
        let cap = if configured > 0 { configured } else { default };
        cap.max(1)
    }
}

/// Shared state cloned into every work unit.
struct UnitContext {
    engine: Arc<dyn AgentEngine>,
    spec: Arc<EvalSpec>,
    graders: Arc<Vec<Arc<dyn Grader>>>,
    hook_runner: Arc<HookRunner>,
    cache: Arc<TrialCache<TrialResult>>,
    job_id: Uuid,
    baseline: bool,
    no_cache: bool,
    max_attempts: u32,
    cancel: CancellationToken,
}

/// Core streaming orchestration: spawns one bounded-concurrency task
/// per (task, model, trial) work unit and streams `TrialUpdate`s as
/// units complete. The first message is always `RunInfo`.
#[instrument(skip_all, fields(job_id = %args.job_id, spec = %args.spec.name, baseline = args.baseline))]
pub async fn run_evaluation_core_streaming(
    args: EvaluationCoreArgs,
    cancel: CancellationToken,
) -> Result<EvaluationStreamResult, Error> {
    // Grader construction is part of spec validation: unknown kinds and
    // bad configs surface here, before any agent runs.
    let deps = GraderDeps {
        engine: args.engine.clone(),
        context_dir: args.spec.base_dir.clone(),
        strict: args.spec.config.strict,
    };
    let graders = Arc::new(graders::build_graders(&args.spec, &deps)?);

    let models = args.resolved_models();
    let tasks: Vec<Arc<TaskConfig>> = args
        .spec
        .tasks
        .iter()
        .filter(|task| task.enabled)
        .cloned()
        .map(Arc::new)
        .collect();
    let num_work_units = tasks.len() * models.len() * args.spec.config.trials_per_task;

    let run_info = RunInfo {
        job_id: args.job_id,
        spec_name: args.spec.name.clone(),
        spec_hash: args.spec.spec_hash.clone(),
        num_work_units,
    };
    info!(
        tasks = tasks.len(),
        models = models.len(),
        trials_per_task = args.spec.config.trials_per_task,
        num_work_units,
        "Work units enumerated"
    );

    let (sender, receiver) = mpsc::channel(UPDATE_CHANNEL_BUFFER_SIZE);
    if sender
        .send(TrialUpdate::RunInfo(run_info.clone()))
        .await
        .is_err()
    {
        warn!("Update receiver dropped before the run started");
    }

    let semaphore = Arc::new(tokio::sync::Semaphore::new(
        args.resolved_parallelism(models.len()),
    ));
    let context = Arc::new(UnitContext {
        engine: args.engine.clone(),
        spec: args.spec.clone(),
        graders,
        hook_runner: Arc::new(HookRunner::new(args.spec.hooks.clone())),
        cache: Arc::new(TrialCache::new()),
        job_id: args.job_id,
        baseline: args.baseline,
        no_cache: args.no_cache,
        max_attempts: args.resolved_max_attempts(),
        cancel: cancel.clone(),
    });

    let mut join_set = JoinSet::new();
    let mut unit_id_map: HashMap<tokio::task::Id, (String, String, usize)> = HashMap::new();
    for task in &tasks {
        for model in &models {
            for trial_index in 0..args.spec.config.trials_per_task {
                let context = context.clone();
                let semaphore = semaphore.clone();
                let task = task.clone();
                let model = model.clone();
                let task_id_for_map = task.id.clone();
                let model_for_map = model.clone();
                let handle = join_set.spawn(async move {
                    let _permit = semaphore
                        .acquire()
                        .await
                        .map_err(|_| Error::Cancelled)?;
                    Ok::<TrialResult, Error>(
                        execute_work_unit(&context, &task, &model, trial_index).await,
                    )
                });
                unit_id_map.insert(handle.id(), (task_id_for_map, model_for_map, trial_index));
            }
        }
    }

    tokio::spawn(async move {
        while let Some(result) = join_set.join_next_with_id().await {
            let update = match result {
                Ok((_, Ok(trial))) => TrialUpdate::Trial(Box::new(trial)),
                Ok((id, Err(e))) => {
                    let (task_id, model, trial_index) =
                        unit_id_map.get(&id).cloned().unwrap_or_default();
                    TrialUpdate::UnitError {
                        task_id,
                        model,
                        trial_index,
                        message: e.to_string(),
                    }
                }
                Err(join_error) => {
                    let (task_id, model, trial_index) = unit_id_map
                        .get(&join_error.id())
                        .cloned()
                        .unwrap_or_default();
                    TrialUpdate::UnitError {
                        task_id,
                        model,
                        trial_index,
                        message: join_error.to_string(),
                    }
                }
            };
            if sender.send(update).await.is_err() {
                break;
            }
        }
    });

    Ok(EvaluationStreamResult { receiver, run_info })
}

/// One work unit: cache consult, then the retry loop around
/// `execute_once`. Never returns `Err` for per-trial faults; they are
/// folded into the `TrialResult` status so the stream always carries
/// one result per unit.
async fn execute_work_unit(
    context: &UnitContext,
    task: &Arc<TaskConfig>,
    model: &str,
    trial_index: usize,
) -> TrialResult {
    let vars = TemplateVars {
        job_id: context.job_id.to_string(),
        task_name: task.display_name().to_string(),
        trial_index,
        ..Default::default()
    }
    .with_vars(context.spec.vars.clone())
    .with_vars(task.vars.clone());

    let prompt = match waza_core::template::expand(&task.prompt, &vars) {
        Ok(prompt) => prompt,
        Err(e) => return error_trial(task, model, trial_index, 0, &e),
    };

    if context.no_cache {
        return run_with_retries(context, task, model, trial_index, &prompt, &vars).await;
    }

    let graders_signature = match context.spec.graders_signature() {
        Ok(signature) => signature,
        Err(e) => return error_trial(task, model, trial_index, 0, &e),
    };
    let mut skill_signature = context.spec.skill_signature();
    if context.baseline {
        skill_signature.push_str(";baseline-paired");
    }
    let key = match compute_cache_key(&CacheKeyParts {
        task_id: &task.id,
        model,
        prompt: &prompt,
        fixture_sources: &task.fixtures,
        grader_configs: &graders_signature,
        skill_signature: &skill_signature,
    }) {
        Ok(key) => key,
        Err(e) => return error_trial(task, model, trial_index, 0, &e),
    };

    let cached = context
        .cache
        .get_or_execute(key, async {
            Ok(Arc::new(
                run_with_retries(context, task, model, trial_index, &prompt, &vars).await,
            ))
        })
        .await;
    match cached {
        Ok(result) => {
            let mut trial = (*result).clone();
            // A deduplicated execution serves several trial indices.
            trial.trial_index = trial_index;
            trial
        }
        Err(e) => error_trial(task, model, trial_index, 0, &e),
    }
}

/// The inner retry loop. Workspace and session are created inside
/// `execute_once` so a retry starts from a clean slate; only plain
/// grader failures consume additional attempts.
async fn run_with_retries(
    context: &UnitContext,
    task: &Arc<TaskConfig>,
    model: &str,
    trial_index: usize,
    prompt: &str,
    vars: &TemplateVars,
) -> TrialResult {
    let mut attempts_used = 0;
    let mut last = loop {
        // A retried attempt restarts the whole per-attempt sequence,
        // before_task included. A failing hook on any attempt marks
        // the trial failed (not error) with no grader results and no
        // further attempts.
        if let Err(e) = context
            .hook_runner
            .run(HookPoint::BeforeTask, vars, &context.cancel)
            .await
        {
            if context.cancel.is_cancelled() {
                return cancelled_trial(task, model, trial_index, attempts_used);
            }
            warn!(task_id = %task.id, error = %e, "before_task hook failed; skipping task");
            let mut trial = error_trial(task, model, trial_index, attempts_used, &e);
            trial.status = TrialStatus::Failed;
            return trial;
        }

        attempts_used += 1;
        let result =
            execute_once(context, task, model, trial_index, attempts_used, prompt).await;
        match result.status {
            TrialStatus::Failed if attempts_used < context.max_attempts => {
                debug!(
                    task_id = %task.id,
                    attempt = attempts_used,
                    max_attempts = context.max_attempts,
                    "Attempt failed; retrying"
                );
            }
            _ => break result,
        }
    };
    last.attempts_used = attempts_used;

    // Observational only: an after_task failure never changes the trial.
    if let Err(e) = context
        .hook_runner
        .run(HookPoint::AfterTask, vars, &context.cancel)
        .await
    {
        warn!(task_id = %task.id, error = %e, "after_task hook failed");
    }
    last
}

/// One pure execution of the task: fresh workspace(s), one agent pass
/// (two in baseline mode), grading, weight stamping. Holds no state
/// across invocations.
async fn execute_once(
    context: &UnitContext,
    task: &Arc<TaskConfig>,
    model: &str,
    trial_index: usize,
    attempt: u32,
    prompt: &str,
) -> TrialResult {
    let baseline_result = if context.baseline {
        // The baseline pass shares prompt, fixtures, and model but
        // sees no skill directories and no baseline output of its own.
        let pass = run_single_pass(context, task, model, trial_index, prompt, false, None).await;
        if pass.status != TrialStatus::Passed && pass.status != TrialStatus::Failed {
            // Infrastructure trouble on the baseline side poisons the
            // pair; surface it as the unit's result.
            return pass;
        }
        Some(pass)
    } else {
        None
    };

    let baseline_output = baseline_result
        .as_ref()
        .map(|result| result.output_text_for_pairwise());
    let mut result = run_single_pass(
        context,
        task,
        model,
        trial_index,
        prompt,
        true,
        baseline_output,
    )
    .await;
    result.attempts_used = attempt;
    result.baseline_result = baseline_result.map(Box::new);
    result
}

impl TrialResult {
    /// The assistant output of this trial, reconstructed for pairwise
    /// judges on the paired skill run.
    fn output_text_for_pairwise(&self) -> String {
        self.transcript
            .iter()
            .filter_map(|event| match event {
                waza_core::session::TranscriptEvent::AssistantMessage { text } => {
                    Some(text.as_str())
                }
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn error_trial(
    task: &TaskConfig,
    model: &str,
    trial_index: usize,
    attempts_used: u32,
    error: &Error,
) -> TrialResult {
    TrialResult {
        task_id: task.id.clone(),
        task_name: task.display_name().to_string(),
        model: model.to_string(),
        trial_index,
        attempts_used,
        status: if error.is_cancelled() {
            TrialStatus::Cancelled
        } else {
            TrialStatus::Error
        },
        grader_results: Vec::new(),
        session_digest: None,
        transcript: Vec::new(),
        skill_invocations: Vec::new(),
        duration_ms: 0,
        session_id: None,
        workspace_mutations: Vec::new(),
        error: Some(error.to_string()),
        baseline_result: None,
    }
}

fn cancelled_trial(
    task: &TaskConfig,
    model: &str,
    trial_index: usize,
    attempts_used: u32,
) -> TrialResult {
    let mut trial = error_trial(task, model, trial_index, attempts_used, &Error::Cancelled);
    trial.status = TrialStatus::Cancelled;
    trial
}

/// Drives one agent session over one fresh workspace and grades the
/// result. `with_skills = false` is the baseline pass.
async fn run_single_pass(
    context: &UnitContext,
    task: &Arc<TaskConfig>,
    model: &str,
    trial_index: usize,
    prompt: &str,
    with_skills: bool,
    baseline_output: Option<String>,
) -> TrialResult {
    let started = Instant::now();
    let workspace = match WorkspaceManager::acquire(&task.fixtures) {
        Ok(workspace) => workspace,
        Err(e) => return error_trial(task, model, trial_index, 0, &e),
    };
    let snapshot_before = match workspace::snapshot(workspace.path()) {
        Ok(snapshot) => snapshot,
        Err(e) => return error_trial(task, model, trial_index, 0, &e),
    };

    let timeout_secs = task.timeout_secs.unwrap_or(context.spec.config.timeout_secs);
    let params = SessionParams {
        model: model.to_string(),
        tools: Vec::new(),
        workspace_dir: Some(workspace.path().to_path_buf()),
        skill_dirs: if with_skills {
            context.spec.skills.clone()
        } else {
            HashMap::new()
        },
    };

    let session_outcome = drive_agent(context, params, prompt, timeout_secs).await;
    let (session_id, outcome) = match session_outcome {
        Ok(pair) => pair,
        Err(e) => {
            let mut trial = error_trial(task, model, trial_index, 0, &e);
            trial.duration_ms = started.elapsed().as_millis() as u64;
            return trial;
        }
    };

    let snapshot_after = match workspace::snapshot(workspace.path()) {
        Ok(snapshot) => snapshot,
        Err(e) => return error_trial(task, model, trial_index, 0, &e),
    };
    let workspace_mutations = workspace::diff_snapshots(&snapshot_before, &snapshot_after);

    let mut task_vars = context.spec.vars.clone();
    task_vars.extend(task.vars.clone());
    if let Some(expected) = &task.expected_output {
        task_vars.insert("expected_output".to_string(), expected.clone());
    }
    let outcome_map = GradingContext::outcome_map_from_output(&outcome.output_text);
    let grading_context = GradingContext {
        output_text: outcome.output_text.clone(),
        outcome_map,
        transcript: Arc::new(outcome.transcript.clone()),
        tool_calls: Arc::new(outcome.tool_calls),
        session_digest: Some(outcome.digest.clone()),
        skill_invocations: Arc::new(outcome.skill_invocations.clone()),
        workspace_dir: workspace.path().to_path_buf(),
        duration_ms: outcome.digest.duration_ms,
        session_id: session_id.clone(),
        model: model.to_string(),
        baseline_output,
        task_vars,
        context_dir: context.spec.base_dir.clone(),
    };

    // The baseline pass cannot feed a pairwise judge (there is no
    // paired output yet), so baseline-dependent graders sit it out.
    let active_graders: Vec<Arc<dyn Grader>> = if with_skills {
        context.graders.to_vec()
    } else {
        context
            .graders
            .iter()
            .filter(|grader| !grader.requires_baseline())
            .cloned()
            .collect()
    };
    let graded = graders::grade_all(&active_graders, &grading_context, &context.cancel).await;
    let mut grader_results = match graded {
        Ok(results) => results,
        Err(e) => {
            if context.cancel.is_cancelled() {
                return cancelled_trial(task, model, trial_index, 0);
            }
            let mut trial = error_trial(task, model, trial_index, 0, &e);
            trial.session_digest = Some(outcome.digest);
            trial.transcript = outcome.transcript;
            trial.duration_ms = started.elapsed().as_millis() as u64;
            return trial;
        }
    };
    stamp_weights(&context.spec, &mut grader_results);

    let status = if context.cancel.is_cancelled() {
        TrialStatus::Cancelled
    } else if grader_results.iter().all(|result| result.passed) {
        TrialStatus::Passed
    } else {
        TrialStatus::Failed
    };

    TrialResult {
        task_id: task.id.clone(),
        task_name: task.display_name().to_string(),
        model: model.to_string(),
        trial_index,
        attempts_used: 0,
        status,
        grader_results,
        session_digest: Some(outcome.digest),
        transcript: outcome.transcript,
        skill_invocations: outcome.skill_invocations,
        duration_ms: started.elapsed().as_millis() as u64,
        session_id: Some(session_id),
        workspace_mutations,
        error: None,
        baseline_result: None,
    }
    // The workspace is destroyed here on every path: RAII drop.
}

struct PassOutcome {
    output_text: String,
    transcript: Vec<waza_core::session::TranscriptEvent>,
    tool_calls: Vec<waza_core::session::ToolCall>,
    skill_invocations: Vec<waza_core::session::SkillInvocation>,
    digest: waza_core::session::SessionDigest,
}

/// Opens a session, pushes the prompt, and feeds the event stream into
/// the collector until the session terminates, the per-task timeout
/// expires (trial `error`, no grading, no retry), or cancellation.
async fn drive_agent(
    context: &UnitContext,
    params: SessionParams,
    prompt: &str,
    timeout_secs: u64,
) -> Result<(String, PassOutcome), Error> {
    let mut session = context.engine.create_session(params).await?;
    let session_id = session.session_id().to_string();

    let drained = tokio::time::timeout(Duration::from_secs(timeout_secs), async {
        let mut stream = session.send(prompt).await?;
        let mut collector = SessionCollector::new();
        loop {
            let event = tokio::select! {
                event = stream.next() => event,
                () = context.cancel.cancelled() => return Err(Error::Cancelled),
            };
            match event {
                Some(AgentEvent::SessionEnd) => {
                    collector.ingest(AgentEvent::SessionEnd)?;
                    break;
                }
                Some(event) => collector.ingest(event)?,
                None => break,
            }
        }
        Ok(collector.finish())
    })
    .await;

    let close_result = session.close().await;
    let outcome = match drained {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => return Err(e),
        Err(_) => {
            return Err(Error::SessionTimeout {
                timeout_ms: timeout_secs * 1000,
            });
        }
    };
    close_result?;

    Ok((
        session_id,
        PassOutcome {
            output_text: outcome.output_text,
            transcript: outcome.transcript,
            tool_calls: outcome.tool_calls,
            skill_invocations: outcome.skill_invocations,
            digest: outcome.digest,
        },
    ))
}

/// Graders never see weights; they are stamped onto the
/// results here, after grading completes.
fn stamp_weights(spec: &EvalSpec, results: &mut [GraderResult]) {
    let weights: HashMap<&str, f64> = spec
        .graders
        .iter()
        .map(|grader| (grader.name.as_str(), grader.effective_weight()))
        .collect();
    for result in results {
        if let Some(weight) = weights.get(result.name.as_str()) {
            result.weight = *weight;
        }
    }
}
