//! Per-run trial cache. Keys hash everything that affects a work unit's
//! outcome; lookups go through `moka`'s keyed coalescing so two
//! concurrent units with the same key deduplicate to one execution.
//! The cache is in-memory only; run history is not persisted.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use walkdir::WalkDir;

use crate::error::Error;

/// Inputs to the cache key: a trial re-executes iff any of these change.
#[derive(Debug)]
pub struct CacheKeyParts<'a> {
    pub task_id: &'a str,
    pub model: &'a str,
    /// Prompt after template expansion (so `{{ trial_index }}` prompts
    /// naturally get distinct keys per trial).
    pub prompt: &'a str,
    pub fixture_sources: &'a [PathBuf],
    pub grader_configs: &'a str,
    /// Labels + paths of the skill directories presented to the agent;
    /// empty for baseline passes.
    pub skill_signature: &'a str,
}

pub fn compute_cache_key(parts: &CacheKeyParts<'_>) -> Result<String, Error> {
    let mut hasher = blake3::Hasher::new();
    for field in [
        parts.task_id,
        parts.model,
        parts.prompt,
        parts.grader_configs,
        parts.skill_signature,
    ] {
        hasher.update(&(field.len() as u64).to_le_bytes());
        hasher.update(field.as_bytes());
    }
    for source in parts.fixture_sources {
        hash_fixture(&mut hasher, source)?;
    }
    Ok(hasher.finalize().to_hex().to_string())
}

fn hash_fixture(hasher: &mut blake3::Hasher, source: &PathBuf) -> Result<(), Error> {
    let mut files: Vec<PathBuf> = Vec::new();
    if source.is_file() {
        files.push(source.clone());
    } else {
        for entry in WalkDir::new(source).sort_by_file_name() {
            let entry = entry.map_err(|e| Error::WorkspaceIo {
                message: format!("failed to walk fixture '{}': {e}", source.display()),
            })?;
            if entry.file_type().is_file() {
                files.push(entry.path().to_path_buf());
            }
        }
    }
    for file in files {
        let rel = file.strip_prefix(source).unwrap_or(&file);
        let name = rel.to_string_lossy();
        hasher.update(&(name.len() as u64).to_le_bytes());
        hasher.update(name.as_bytes());
        let contents = std::fs::read(&file).map_err(|e| Error::WorkspaceIo {
            message: format!("failed to read fixture '{}': {e}", file.display()),
        })?;
        hasher.update(&(contents.len() as u64).to_le_bytes());
        hasher.update(&contents);
    }
    Ok(())
}

/// Keyed, coalescing cache of finalized trial results.
pub struct TrialCache<T> {
    inner: moka::future::Cache<String, Arc<T>>,
}

impl<T: Send + Sync + 'static> Default for TrialCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + Sync + 'static> TrialCache<T> {
    pub fn new() -> Self {
        Self {
            inner: moka::future::Cache::builder().build(),
        }
    }

    /// Returns the cached value for `key`, or runs `init` to produce it.
    /// Concurrent callers with the same key share a single `init`
    /// execution; an `init` error is returned to all of them and
    /// nothing is cached.
    pub async fn get_or_execute<F>(&self, key: String, init: F) -> Result<Arc<T>, Arc<Error>>
    where
        F: Future<Output = Result<Arc<T>, Error>>,
    {
        self.inner.try_get_with(key, init).await
    }
}
