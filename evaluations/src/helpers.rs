use anyhow::{Result, anyhow};
use tracing_subscriber::EnvFilter;

use crate::OutputFormat;

/// Logs go to stderr so stdout stays reserved for result output. The
/// jsonl output format switches the log events to JSON as well, so the
/// two streams stay machine readable together.
pub fn setup_logging(format: OutputFormat) -> Result<()> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr);
    match format {
        OutputFormat::Jsonl => builder.json().try_init(),
        OutputFormat::Pretty => builder.try_init(),
    }
    .map_err(|e| anyhow!("failed to initialize tracing: {e}"))
}
