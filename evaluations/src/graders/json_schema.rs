use async_trait::async_trait;
use jsonschema::Validator;
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use waza_core::error::Error;
use waza_core::spec::GraderConfig;

use super::{Grader, GraderDeps, GraderKind, decode_config};
use crate::types::{GraderResult, GradingContext};

const FIELDS: &[&str] = &["schema", "schema_file"];

#[derive(Debug, Deserialize, Default)]
struct JsonSchemaConfig {
    #[serde(default)]
    schema: Option<Value>,
    #[serde(default)]
    schema_file: Option<String>,
}

/// Validates the agent output as JSON against a schema. Binary by
/// construction: score is 0 or 1, and the parse or validation error is
/// surfaced in feedback.
#[derive(Debug)]
pub struct JsonSchemaGrader {
    name: String,
    validator: Validator,
}

impl JsonSchemaGrader {
    pub fn new(config: &GraderConfig, deps: &GraderDeps) -> Result<Self, Error> {
        let decoded: JsonSchemaConfig =
            decode_config(&config.name, FIELDS, &config.config, deps.strict)?;
        let schema = match (decoded.schema, decoded.schema_file) {
            (Some(schema), None) => schema,
            (None, Some(rel)) => {
                let path = deps.context_dir.join(&rel);
                let raw = std::fs::read_to_string(&path).map_err(|e| Error::GraderConfig {
                    grader: config.name.clone(),
                    message: format!("failed to read schema_file '{rel}': {e}"),
                })?;
                serde_json::from_str(&raw).map_err(|e| Error::GraderConfig {
                    grader: config.name.clone(),
                    message: format!("schema_file '{rel}' is not valid JSON: {e}"),
                })?
            }
            (Some(_), Some(_)) | (None, None) => {
                return Err(Error::GraderConfig {
                    grader: config.name.clone(),
                    message: "exactly one of 'schema' and 'schema_file' is required".to_string(),
                });
            }
        };
        let validator = jsonschema::validator_for(&schema).map_err(|e| Error::GraderConfig {
            grader: config.name.clone(),
            message: format!("invalid JSON schema: {e}"),
        })?;
        Ok(Self {
            name: config.name.clone(),
            validator,
        })
    }
}

#[async_trait]
impl Grader for JsonSchemaGrader {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> GraderKind {
        GraderKind::JsonSchema
    }

    async fn grade(
        &self,
        context: &GradingContext,
        _cancel: &CancellationToken,
    ) -> Result<GraderResult, Error> {
        let instance: Value = match serde_json::from_str(&context.output_text) {
            Ok(value) => value,
            Err(e) => {
                return Ok(GraderResult::new(
                    &self.name,
                    GraderKind::JsonSchema,
                    0.0,
                    false,
                    format!("output is not valid JSON: {e}"),
                ));
            }
        };
        let errors: Vec<String> = self
            .validator
            .iter_errors(&instance)
            .map(|error| error.to_string())
            .collect();
        if errors.is_empty() {
            Ok(GraderResult::new(
                &self.name,
                GraderKind::JsonSchema,
                1.0,
                true,
                "output conforms to schema".to_string(),
            ))
        } else {
            Ok(GraderResult::new(
                &self.name,
                GraderKind::JsonSchema,
                0.0,
                false,
                errors.join("; "),
            ))
        }
    }
}
