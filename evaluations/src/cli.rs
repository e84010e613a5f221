//! CLI argument definitions for the Waza evaluations binary.
//!
//! This file should remain minimal, containing only CLI argument
//! struct definitions.

use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

#[derive(clap::ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[clap(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    #[default]
    Pretty,
    Jsonl,
}

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Path to the eval spec file.
    #[arg(long, default_value = "./waza.toml")]
    pub spec: PathBuf,

    /// Models to run (comma-separated). Overrides the spec's model list.
    #[arg(long = "model", value_delimiter = ',')]
    pub models: Option<Vec<String>>,

    /// Run each task twice, without and with skill directories, and
    /// report the skill impact.
    #[arg(long)]
    pub baseline: bool,

    /// Maximum grading attempts per trial. Overrides the spec.
    #[arg(long)]
    pub max_attempts: Option<u32>,

    /// Worker cap for concurrent work units. Overrides the spec.
    #[arg(long)]
    pub parallel: Option<usize>,

    /// Disable reuse of identical task executions.
    #[arg(long)]
    pub no_cache: bool,

    #[arg(short, long, default_value = "pretty")]
    pub format: OutputFormat,

    /// Write the machine-readable results document here.
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Write the CI manifest here.
    #[arg(long)]
    pub ci_report: Option<PathBuf>,
}
