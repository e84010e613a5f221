use std::collections::HashMap;

use minijinja::{Environment, UndefinedBehavior};
use serde::Serialize;

use crate::error::Error;

/// Variables available to prompt and hook templates. System-provided
/// fields are always present; `vars` carries the user-supplied map from
/// the spec (and dataset columns for dataset-expanded tasks).
#[derive(Debug, Clone, Serialize, Default)]
pub struct TemplateVars {
    pub job_id: String,
    pub task_name: String,
    pub trial_index: usize,
    #[serde(flatten)]
    pub vars: HashMap<String, String>,
}

impl TemplateVars {
    pub fn with_vars(mut self, vars: HashMap<String, String>) -> Self {
        self.vars.extend(vars);
        self
    }
}

/// Expands `{{ var }}` placeholders in a one-off template string.
///
/// Undefined variables are a hard error so that a typo'd `{{ taskname }}`
/// surfaces at the template's first use instead of silently rendering
/// empty.
pub fn expand(template: &str, vars: &TemplateVars) -> Result<String, Error> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.render_str(template, vars).map_err(|err| {
        let mut message = err.to_string();
        let mut source = &err as &dyn std::error::Error;
        while let Some(next) = source.source() {
            message.push_str("\nCaused by: ");
            message.push_str(&next.to_string());
            source = next;
        }
        Error::Template { message }
    })
}
