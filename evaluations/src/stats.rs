//! Statistics and aggregation: per-task and per-run scores, pass rates,
//! bootstrap confidence intervals, baseline deltas, and group-by
//! slices. Aggregation is deterministic (the bootstrap uses a fixed
//! seed), so identical trial vectors always produce identical outcomes.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use waza_core::spec::EvalSpec;

use crate::types::{TrialResult, TrialStatus};

pub const BOOTSTRAP_RESAMPLES: usize = 10_000;
const BOOTSTRAP_SEED: u64 = 0x57A7;
const GAIN_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ConfidenceInterval {
    pub lower: f64,
    pub upper: f64,
}

impl ConfidenceInterval {
    pub fn disjoint_from(&self, other: &ConfidenceInterval) -> bool {
        self.upper < other.lower || other.upper < self.lower
    }
}

/// 95% percentile-bootstrap CI over the mean of `values`.
pub fn bootstrap_ci(values: &[f64], resamples: usize) -> ConfidenceInterval {
    if values.is_empty() {
        return ConfidenceInterval {
            lower: 0.0,
            upper: 0.0,
        };
    }
    let mut rng = StdRng::seed_from_u64(BOOTSTRAP_SEED);
    let mut means = Vec::with_capacity(resamples);
    for _ in 0..resamples {
        let mut sum = 0.0;
        for _ in 0..values.len() {
            sum += values[rng.random_range(0..values.len())];
        }
        means.push(sum / values.len() as f64);
    }
    means.sort_by(|a, b| a.total_cmp(b));
    let index = |quantile: f64| {
        let position = quantile * (means.len() - 1) as f64;
        means[position.round() as usize]
    };
    ConfidenceInterval {
        lower: index(0.025),
        upper: index(0.975),
    }
}

/// `(p_with − p_without) / max(1 − p_without, ε)`.
pub fn normalized_gain(p_with: f64, p_without: f64) -> f64 {
    (p_with - p_without) / (1.0 - p_without).max(GAIN_EPSILON)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStats {
    pub trials: usize,
    pub pass_rate: f64,
    pub avg_unweighted_score: f64,
    pub avg_weighted_score: f64,
    pub pass_rate_ci: ConfidenceInterval,
    /// attempts_used -> number of trials.
    pub attempts_histogram: BTreeMap<u32, usize>,
    pub per_grader_pass_rate: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: String,
    pub task_name: String,
    pub stats: TaskStats,
    pub trials: Vec<TrialResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupSlice {
    /// `dimension=value`, e.g. `model=sonnet` or `scenario=happy-path`.
    pub key: String,
    pub trials: usize,
    pub pass_rate: f64,
    pub avg_weighted_score: f64,
    pub pass_rate_ci: ConfidenceInterval,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaselineDelta {
    pub pass_rate_with: f64,
    pub pass_rate_without: f64,
    pub delta: f64,
    pub normalized_gain: f64,
    pub ci_with: ConfidenceInterval,
    pub ci_without: ConfidenceInterval,
    /// True when the two 95% CIs are disjoint.
    pub significant: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStats {
    pub total_trials: usize,
    pub pass_rate: f64,
    pub pass_rate_ci: ConfidenceInterval,
    pub avg_unweighted_score: f64,
    pub avg_weighted_score: f64,
}

/// The top-level run artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    pub spec_name: String,
    pub spec_hash: String,
    pub job_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub models: Vec<String>,
    pub baseline: bool,
    pub tasks: Vec<TaskOutcome>,
    pub group_slices: Vec<GroupSlice>,
    pub overall: RunStats,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline_delta: Option<BaselineDelta>,
}

impl RunOutcome {
    pub fn all_passed(&self) -> bool {
        self.overall.total_trials > 0
            && self
                .tasks
                .iter()
                .flat_map(|task| &task.trials)
                .all(TrialResult::passed)
    }

    pub fn any_error(&self) -> bool {
        self.tasks
            .iter()
            .flat_map(|task| &task.trials)
            .any(|trial| trial.status == TrialStatus::Error)
    }
}

pub struct AggregateParams<'a> {
    pub spec: &'a EvalSpec,
    pub job_id: Uuid,
    pub models: Vec<String>,
    pub baseline: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

fn pass_vector(trials: &[&TrialResult]) -> Vec<f64> {
    trials
        .iter()
        .map(|trial| if trial.passed() { 1.0 } else { 0.0 })
        .collect()
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn slice_for(key: String, trials: &[&TrialResult]) -> GroupSlice {
    let passes = pass_vector(trials);
    GroupSlice {
        key,
        trials: trials.len(),
        pass_rate: mean(&passes),
        avg_weighted_score: mean(
            &trials
                .iter()
                .map(|trial| trial.weighted_score())
                .collect::<Vec<_>>(),
        ),
        pass_rate_ci: bootstrap_ci(&passes, BOOTSTRAP_RESAMPLES),
    }
}

/// Folds finalized trials into the run outcome. Tasks and trials are
/// ordered by spec order (then model, then trial index) regardless of
/// completion order.
pub fn aggregate(params: &AggregateParams<'_>, mut trials: Vec<TrialResult>) -> RunOutcome {
    let task_order: BTreeMap<&str, usize> = params
        .spec
        .tasks
        .iter()
        .enumerate()
        .map(|(index, task)| (task.id.as_str(), index))
        .collect();
    let model_order: BTreeMap<&str, usize> = params
        .models
        .iter()
        .enumerate()
        .map(|(index, model)| (model.as_str(), index))
        .collect();
    trials.sort_by_key(|trial| {
        (
            task_order.get(trial.task_id.as_str()).copied().unwrap_or(usize::MAX),
            model_order.get(trial.model.as_str()).copied().unwrap_or(usize::MAX),
            trial.trial_index,
        )
    });

    let mut tasks = Vec::new();
    for task in &params.spec.tasks {
        let task_trials: Vec<TrialResult> = trials
            .iter()
            .filter(|trial| trial.task_id == task.id)
            .cloned()
            .collect();
        if task_trials.is_empty() {
            continue;
        }
        let refs: Vec<&TrialResult> = task_trials.iter().collect();
        let passes = pass_vector(&refs);
        let mut attempts_histogram = BTreeMap::new();
        for trial in &task_trials {
            *attempts_histogram.entry(trial.attempts_used).or_insert(0) += 1;
        }
        let mut per_grader: BTreeMap<String, (usize, usize)> = BTreeMap::new();
        for trial in &task_trials {
            for result in &trial.grader_results {
                let entry = per_grader.entry(result.name.clone()).or_insert((0, 0));
                entry.1 += 1;
                if result.passed {
                    entry.0 += 1;
                }
            }
        }
        let stats = TaskStats {
            trials: task_trials.len(),
            pass_rate: mean(&passes),
            avg_unweighted_score: mean(
                &task_trials
                    .iter()
                    .map(TrialResult::unweighted_score)
                    .collect::<Vec<_>>(),
            ),
            avg_weighted_score: mean(
                &task_trials
                    .iter()
                    .map(TrialResult::weighted_score)
                    .collect::<Vec<_>>(),
            ),
            pass_rate_ci: bootstrap_ci(&passes, BOOTSTRAP_RESAMPLES),
            attempts_histogram,
            per_grader_pass_rate: per_grader
                .into_iter()
                .map(|(name, (passed, total))| (name, passed as f64 / total as f64))
                .collect(),
        };
        tasks.push(TaskOutcome {
            task_id: task.id.clone(),
            task_name: task.display_name().to_string(),
            stats,
            trials: task_trials,
        });
    }

    let all_refs: Vec<&TrialResult> = trials.iter().collect();
    let passes = pass_vector(&all_refs);
    let overall = RunStats {
        total_trials: trials.len(),
        pass_rate: mean(&passes),
        pass_rate_ci: bootstrap_ci(&passes, BOOTSTRAP_RESAMPLES),
        avg_unweighted_score: mean(
            &trials
                .iter()
                .map(TrialResult::unweighted_score)
                .collect::<Vec<_>>(),
        ),
        avg_weighted_score: mean(
            &trials
                .iter()
                .map(TrialResult::weighted_score)
                .collect::<Vec<_>>(),
        ),
    };

    let mut group_slices = Vec::new();
    for model in &params.models {
        let group: Vec<&TrialResult> = trials
            .iter()
            .filter(|trial| &trial.model == model)
            .collect();
        if !group.is_empty() {
            group_slices.push(slice_for(format!("model={model}"), &group));
        }
    }
    for dimension in &params.spec.config.group_by {
        let mut by_value: BTreeMap<String, Vec<&TrialResult>> = BTreeMap::new();
        for trial in &trials {
            let value = params
                .spec
                .tasks
                .iter()
                .find(|task| task.id == trial.task_id)
                .and_then(|task| task.vars.get(dimension));
            if let Some(value) = value {
                by_value.entry(value.clone()).or_default().push(trial);
            }
        }
        for (value, group) in by_value {
            group_slices.push(slice_for(format!("{dimension}={value}"), &group));
        }
    }

    let baseline_delta = if params.baseline {
        let with_passes: Vec<f64> = pass_vector(&all_refs);
        let without: Vec<&TrialResult> = trials
            .iter()
            .filter_map(|trial| trial.baseline_result.as_deref())
            .collect();
        if without.is_empty() {
            None
        } else {
            let without_passes = pass_vector(&without);
            let p_with = mean(&with_passes);
            let p_without = mean(&without_passes);
            let ci_with = bootstrap_ci(&with_passes, BOOTSTRAP_RESAMPLES);
            let ci_without = bootstrap_ci(&without_passes, BOOTSTRAP_RESAMPLES);
            let significant = ci_with.disjoint_from(&ci_without);
            Some(BaselineDelta {
                pass_rate_with: p_with,
                pass_rate_without: p_without,
                delta: p_with - p_without,
                normalized_gain: normalized_gain(p_with, p_without),
                ci_with,
                ci_without,
                significant,
            })
        }
    } else {
        None
    };

    RunOutcome {
        spec_name: params.spec.name.clone(),
        spec_hash: params.spec.spec_hash.clone(),
        job_id: params.job_id,
        started_at: params.started_at,
        finished_at: params.finished_at,
        models: params.models.clone(),
        baseline: params.baseline,
        tasks,
        group_slices,
        overall,
        baseline_delta,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GraderResult, TrialStatus};
    use crate::graders::GraderKind;

    fn trial(task_id: &str, model: &str, index: usize, passed: bool) -> TrialResult {
        TrialResult {
            task_id: task_id.to_string(),
            task_name: task_id.to_string(),
            model: model.to_string(),
            trial_index: index,
            attempts_used: 1,
            status: if passed {
                TrialStatus::Passed
            } else {
                TrialStatus::Failed
            },
            grader_results: vec![GraderResult {
                name: "g".to_string(),
                kind: GraderKind::Keyword,
                score: if passed { 1.0 } else { 0.0 },
                passed,
                feedback: String::new(),
                details: serde_json::Map::new(),
                duration_ms: 0,
                weight: 1.0,
            }],
            session_digest: None,
            transcript: Vec::new(),
            skill_invocations: Vec::new(),
            duration_ms: 0,
            session_id: None,
            workspace_mutations: Vec::new(),
            error: None,
            baseline_result: None,
        }
    }

    fn spec_with_tasks(ids: &[&str]) -> EvalSpec {
        use waza_core::spec::TaskConfig;
        EvalSpec {
            name: "stats-test".to_string(),
            description: None,
            config: Default::default(),
            hooks: Default::default(),
            vars: Default::default(),
            skills: Default::default(),
            tasks: ids
                .iter()
                .map(|id| TaskConfig {
                    id: id.to_string(),
                    name: None,
                    prompt: "x".to_string(),
                    expected_output: None,
                    fixtures: Vec::new(),
                    timeout_secs: None,
                    enabled: true,
                    vars: Default::default(),
                })
                .collect(),
            dataset: None,
            graders: Vec::new(),
            base_dir: std::path::PathBuf::from("."),
            spec_hash: String::new(),
        }
    }

    fn params<'a>(spec: &'a EvalSpec, models: &[&str], baseline: bool) -> AggregateParams<'a> {
        AggregateParams {
            spec,
            job_id: Uuid::nil(),
            models: models.iter().map(|m| m.to_string()).collect(),
            baseline,
            started_at: DateTime::<Utc>::MIN_UTC,
            finished_at: DateTime::<Utc>::MIN_UTC,
        }
    }

    #[test]
    fn test_bootstrap_ci_degenerate_vectors() {
        let all_pass = vec![1.0; 8];
        let ci = bootstrap_ci(&all_pass, BOOTSTRAP_RESAMPLES);
        assert_eq!(ci, ConfidenceInterval { lower: 1.0, upper: 1.0 });

        let all_fail = vec![0.0; 8];
        let ci = bootstrap_ci(&all_fail, BOOTSTRAP_RESAMPLES);
        assert_eq!(ci, ConfidenceInterval { lower: 0.0, upper: 0.0 });
    }

    #[test]
    fn test_bootstrap_ci_brackets_the_mean() {
        let values = vec![1.0, 1.0, 1.0, 0.0, 0.0, 1.0, 1.0, 0.0, 1.0, 1.0];
        let ci = bootstrap_ci(&values, BOOTSTRAP_RESAMPLES);
        assert!(ci.lower <= 0.7 && 0.7 <= ci.upper);
        assert!(ci.lower < ci.upper);
        // Deterministic across calls.
        assert_eq!(ci, bootstrap_ci(&values, BOOTSTRAP_RESAMPLES));
    }

    #[test]
    fn test_normalized_gain() {
        assert!((normalized_gain(0.8, 0.5) - 0.6).abs() < 1e-12);
        assert_eq!(normalized_gain(0.5, 0.5), 0.0);
        // Saturated baseline: epsilon guards the division.
        assert!(normalized_gain(1.0, 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_aggregate_orders_by_spec_and_computes_rates() {
        let spec = spec_with_tasks(&["alpha", "beta"]);
        // Completion order deliberately scrambled.
        let trials = vec![
            trial("beta", "m", 1, false),
            trial("alpha", "m", 0, true),
            trial("beta", "m", 0, true),
            trial("alpha", "m", 1, true),
        ];
        let outcome = aggregate(&params(&spec, &["m"], false), trials);
        assert_eq!(outcome.tasks.len(), 2);
        assert_eq!(outcome.tasks[0].task_id, "alpha");
        assert_eq!(outcome.tasks[0].stats.pass_rate, 1.0);
        assert_eq!(outcome.tasks[1].stats.pass_rate, 0.5);
        assert_eq!(outcome.overall.pass_rate, 0.75);
        assert_eq!(outcome.tasks[1].trials[0].trial_index, 0);
        assert_eq!(
            outcome.tasks[0].stats.per_grader_pass_rate.get("g"),
            Some(&1.0)
        );
    }

    #[test]
    fn test_aggregate_group_slices_per_model() {
        let spec = spec_with_tasks(&["alpha"]);
        let trials = vec![
            trial("alpha", "m1", 0, true),
            trial("alpha", "m2", 0, false),
        ];
        let outcome = aggregate(&params(&spec, &["m1", "m2"], false), trials);
        let keys: Vec<&str> = outcome
            .group_slices
            .iter()
            .map(|slice| slice.key.as_str())
            .collect();
        assert_eq!(keys, vec!["model=m1", "model=m2"]);
        assert_eq!(outcome.group_slices[0].pass_rate, 1.0);
        assert_eq!(outcome.group_slices[1].pass_rate, 0.0);
    }

    #[test]
    fn test_baseline_delta_and_gain() {
        let spec = spec_with_tasks(&["alpha", "beta"]);
        let mut with_skill_a = trial("alpha", "m", 0, true);
        with_skill_a.baseline_result = Some(Box::new(trial("alpha", "m", 0, false)));
        let mut with_skill_b = trial("beta", "m", 0, true);
        with_skill_b.baseline_result = Some(Box::new(trial("beta", "m", 0, false)));

        let outcome = aggregate(&params(&spec, &["m"], true), vec![with_skill_a, with_skill_b]);
        let delta = outcome.baseline_delta.unwrap();
        assert_eq!(delta.pass_rate_with, 1.0);
        assert_eq!(delta.pass_rate_without, 0.0);
        assert_eq!(delta.delta, 1.0);
        assert!((delta.normalized_gain - 1.0).abs() < 1e-9);
        // Degenerate all-pass vs. all-fail CIs are disjoint.
        assert!(delta.significant);
    }

    #[test]
    fn test_weighted_run_score_matches_formula() {
        let spec = spec_with_tasks(&["alpha"]);
        let mut uneven = trial("alpha", "m", 0, false);
        uneven.grader_results = vec![
            GraderResult {
                name: "heavy".to_string(),
                kind: GraderKind::Keyword,
                score: 1.0,
                passed: true,
                feedback: String::new(),
                details: serde_json::Map::new(),
                duration_ms: 0,
                weight: 3.0,
            },
            GraderResult {
                name: "light".to_string(),
                kind: GraderKind::Keyword,
                score: 0.0,
                passed: false,
                feedback: String::new(),
                details: serde_json::Map::new(),
                duration_ms: 0,
                weight: 1.0,
            },
        ];
        let outcome = aggregate(&params(&spec, &["m"], false), vec![uneven]);
        assert_eq!(outcome.overall.avg_weighted_score, 0.75);
        assert_eq!(outcome.overall.avg_unweighted_score, 0.5);
    }
}
