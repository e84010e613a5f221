//! The loaded benchmark definition: tasks, graders, run-level config,
//! hooks, and optional dataset-driven task expansion. Specs are decoded
//! from TOML, validated eagerly, and immutable after load.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use minijinja::{Environment, UndefinedBehavior};
use serde::Deserialize;
use serde_json::Value;

use crate::error::Error;
use crate::hooks::HooksConfig;

fn default_trials() -> usize {
    1
}

fn default_max_attempts() -> u32 {
    1
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_enabled() -> bool {
    true
}

/// Run-level knobs. `parallel = 0` means "derive from trials × models".
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    #[serde(default = "default_trials")]
    pub trials_per_task: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub parallel: usize,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub executor: Option<String>,
    /// Strict mode rejects unknown fields in grader config maps.
    #[serde(default)]
    pub strict: bool,
    /// Extra group-by dimensions (task var names) for result slicing.
    #[serde(default)]
    pub group_by: Vec<String>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            trials_per_task: default_trials(),
            max_attempts: default_max_attempts(),
            timeout_secs: default_timeout_secs(),
            parallel: 0,
            models: Vec::new(),
            executor: None,
            strict: false,
            group_by: Vec::new(),
        }
    }
}

impl RunConfig {
    /// The model list, defaulting to a single engine-defined model.
    pub fn models(&self) -> Vec<String> {
        if self.models.is_empty() {
            vec!["default".to_string()]
        } else {
            self.models.clone()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskConfig {
    pub id: String,
    /// Display name; falls back to the id.
    #[serde(default)]
    pub name: Option<String>,
    pub prompt: String,
    #[serde(default)]
    pub expected_output: Option<String>,
    /// Files and directories copied into the trial workspace.
    #[serde(default, alias = "context_files")]
    pub fixtures: Vec<PathBuf>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub vars: HashMap<String, String>,
}

impl TaskConfig {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GraderConfig {
    pub name: String,
    pub kind: String,
    #[serde(default)]
    pub config: serde_json::Map<String, Value>,
    #[serde(default)]
    pub weight: Option<f64>,
}

impl GraderConfig {
    /// Zero, negative, and absent weights all normalize to 1.0.
    pub fn effective_weight(&self) -> f64 {
        match self.weight {
            Some(weight) if weight > 0.0 => weight,
            _ => 1.0,
        }
    }
}

/// Dataset-driven tasks: one task per CSV row, columns exposed as
/// template vars to the shared prompt template.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatasetConfig {
    pub path: PathBuf,
    pub prompt: String,
    /// Column used for task ids; rows are numbered when absent.
    #[serde(default)]
    pub id_column: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EvalSpec {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub config: RunConfig,
    #[serde(default)]
    pub hooks: HooksConfig,
    #[serde(default)]
    pub vars: HashMap<String, String>,
    /// Labeled skill directories; omitted from baseline passes.
    #[serde(default)]
    pub skills: HashMap<String, PathBuf>,
    #[serde(default)]
    pub tasks: Vec<TaskConfig>,
    #[serde(default)]
    pub dataset: Option<DatasetConfig>,
    #[serde(default)]
    pub graders: Vec<GraderConfig>,
    /// Directory the spec file was loaded from; fixture, skill, and
    /// snapshot paths resolve against it.
    #[serde(skip)]
    pub base_dir: PathBuf,
    /// Hash of the raw spec text, stamped into the results document.
    #[serde(skip)]
    pub spec_hash: String,
}

impl EvalSpec {
    pub fn load_from_path(path: &Path) -> Result<EvalSpec, Error> {
        let raw = std::fs::read_to_string(path).map_err(|e| Error::Config {
            message: format!("failed to read spec '{}': {e}", path.display()),
        })?;
        let mut spec: EvalSpec = toml::from_str(&raw).map_err(|e| Error::Config {
            message: format!("failed to parse spec '{}':\n{e}", path.display()),
        })?;
        spec.base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        spec.spec_hash = blake3::hash(raw.as_bytes()).to_hex().to_string();
        spec.resolve_paths();
        spec.expand_dataset()?;
        spec.validate()?;
        Ok(spec)
    }

    fn resolve_paths(&mut self) {
        let base = self.base_dir.clone();
        let rebase = |path: &mut PathBuf| {
            if path.is_relative() {
                let resolved = base.join(path.as_path());
                *path = resolved;
            }
        };
        for task in &mut self.tasks {
            for fixture in &mut task.fixtures {
                rebase(fixture);
            }
        }
        for dir in self.skills.values_mut() {
            rebase(dir);
        }
        if let Some(dataset) = &mut self.dataset {
            rebase(&mut dataset.path);
        }
    }

    fn expand_dataset(&mut self) -> Result<(), Error> {
        let Some(dataset) = self.dataset.take() else {
            return Ok(());
        };
        let mut reader = csv::Reader::from_path(&dataset.path).map_err(|e| Error::Dataset {
            path: dataset.path.clone(),
            message: e.to_string(),
        })?;
        let headers: Vec<String> = reader
            .headers()
            .map_err(|e| Error::Dataset {
                path: dataset.path.clone(),
                message: e.to_string(),
            })?
            .iter()
            .map(str::to_string)
            .collect();
        for (row_index, record) in reader.records().enumerate() {
            let record = record.map_err(|e| Error::Dataset {
                path: dataset.path.clone(),
                message: format!("row {row_index}: {e}"),
            })?;
            let vars: HashMap<String, String> = headers
                .iter()
                .cloned()
                .zip(record.iter().map(str::to_string))
                .collect();
            let id = match &dataset.id_column {
                Some(column) => vars.get(column).cloned().ok_or_else(|| Error::Dataset {
                    path: dataset.path.clone(),
                    message: format!("row {row_index}: missing id column '{column}'"),
                })?,
                None => format!("dataset-{row_index}"),
            };
            self.tasks.push(TaskConfig {
                id,
                name: None,
                prompt: dataset.prompt.clone(),
                expected_output: None,
                fixtures: Vec::new(),
                timeout_secs: None,
                enabled: true,
                vars,
            });
        }
        Ok(())
    }

    /// Eager validation: everything that can fail here must never fail
    /// at trial time.
    pub fn validate(&self) -> Result<(), Error> {
        if self.name.is_empty() {
            return Err(Error::Config {
                message: "spec name must not be empty".to_string(),
            });
        }
        if self.tasks.is_empty() {
            return Err(Error::Config {
                message: "spec defines no tasks".to_string(),
            });
        }

        let mut task_ids = HashSet::new();
        for task in &self.tasks {
            if !task_ids.insert(task.id.as_str()) {
                return Err(Error::Config {
                    message: format!("duplicate task id '{}'", task.id),
                });
            }
            check_template_syntax(&task.prompt, &format!("task '{}' prompt", task.id))?;
            for fixture in &task.fixtures {
                if !fixture.exists() {
                    return Err(Error::Config {
                        message: format!(
                            "task '{}': fixture '{}' does not exist",
                            task.id,
                            fixture.display()
                        ),
                    });
                }
            }
        }

        let mut grader_names = HashSet::new();
        for grader in &self.graders {
            if !grader_names.insert(grader.name.as_str()) {
                return Err(Error::Config {
                    message: format!("duplicate grader name '{}'", grader.name),
                });
            }
        }

        for (label, dir) in &self.skills {
            if !dir.is_dir() {
                return Err(Error::Config {
                    message: format!(
                        "skill directory '{label}' -> '{}' does not exist",
                        dir.display()
                    ),
                });
            }
        }

        for point in [
            &self.hooks.before_run,
            &self.hooks.before_task,
            &self.hooks.after_task,
            &self.hooks.after_run,
        ]
        .into_iter()
        .flatten()
        {
            check_template_syntax(point, "hook command")?;
        }

        Ok(())
    }

    /// Serialization of the grader configuration list used in cache
    /// keys (a changed grader config invalidates cached trials).
    pub fn graders_signature(&self) -> Result<String, Error> {
        let entries: Vec<Value> = self
            .graders
            .iter()
            .map(|grader| {
                serde_json::json!({
                    "name": grader.name,
                    "kind": grader.kind,
                    "config": grader.config,
                    "weight": grader.effective_weight(),
                })
            })
            .collect();
        serde_json::to_string(&entries).map_err(|e| Error::Config {
            message: format!("failed to serialize grader configs: {e}"),
        })
    }

    /// Labels and paths of skill directories, used for cache keys.
    pub fn skill_signature(&self) -> String {
        let mut labels: Vec<String> = self
            .skills
            .iter()
            .map(|(label, dir)| format!("{label}={}", dir.display()))
            .collect();
        labels.sort();
        labels.join(";")
    }
}

fn check_template_syntax(template: &str, what: &str) -> Result<(), Error> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.template_from_str(template)
        .map(|_| ())
        .map_err(|e| Error::Config {
            message: format!("{what}: invalid template: {e}"),
        })
}
