//! Per-trial workspace lifecycle: a fresh owner-only temp directory,
//! recursively populated from fixture sources, destroyed on every exit
//! path via RAII. All grader-supplied paths are containment-checked
//! path. Grader-supplied paths are containment-checked before any I/O
//! (advisory, catches accidental escapes).

use std::path::{Component, Path, PathBuf};

use tempfile::TempDir;
use tracing::debug;
use walkdir::WalkDir;

use crate::error::Error;

/// An exclusively-owned trial workspace. Dropping the value removes the
/// directory tree; the orchestrator relies on this for cleanup on all
/// exit paths, including cancellation.
#[derive(Debug)]
pub struct Workspace {
    dir: TempDir,
}

impl Workspace {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Resolves a grader-supplied relative path against the workspace
    /// root. Absolute inputs and any path whose normalized form leaves
    /// the workspace are rejected.
    pub fn resolve(&self, rel_path: &str) -> Result<PathBuf, Error> {
        resolve_under(self.dir.path(), rel_path)
    }
}

/// Lexical containment check usable before a workspace exists (grader
/// constructors validate configured paths with a placeholder root).
pub fn is_contained_rel(rel_path: &str) -> bool {
    resolve_under(Path::new("/waza-containment-probe"), rel_path).is_ok()
}

/// Resolves `rel_path` under `root`, rejecting absolute inputs and any
/// normalized form that leaves `root`.
pub fn resolve_under(root: &Path, rel_path: &str) -> Result<PathBuf, Error> {
    let candidate = Path::new(rel_path);
    if candidate.is_absolute() {
        return Err(Error::PathEscape {
            path: rel_path.to_string(),
        });
    }
    let mut resolved = root.to_path_buf();
    let mut depth = 0usize;
    for component in candidate.components() {
        match component {
            Component::Normal(part) => {
                resolved.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    return Err(Error::PathEscape {
                        path: rel_path.to_string(),
                    });
                }
                resolved.pop();
                depth -= 1;
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(Error::PathEscape {
                    path: rel_path.to_string(),
                });
            }
        }
    }
    if depth == 0 {
        // Resolving to the workspace root itself is not a file reference.
        return Err(Error::PathEscape {
            path: rel_path.to_string(),
        });
    }
    Ok(resolved)
}

/// Content snapshot of a directory tree: relative path -> blake3 hex.
/// The orchestrator diffs a post-run snapshot against the post-fixture
/// one to summarize workspace mutations.
pub fn snapshot(root: &Path) -> Result<std::collections::BTreeMap<String, String>, Error> {
    let mut entries = std::collections::BTreeMap::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|e| Error::WorkspaceIo {
            message: format!("failed to walk '{}': {e}", root.display()),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| Error::WorkspaceIo {
                message: format!("path outside snapshot root: {e}"),
            })?
            .to_string_lossy()
            .to_string();
        let contents = std::fs::read(entry.path())?;
        entries.insert(rel, blake3::hash(&contents).to_hex().to_string());
    }
    Ok(entries)
}

/// Human-oriented mutation summary between two snapshots.
pub fn diff_snapshots(
    before: &std::collections::BTreeMap<String, String>,
    after: &std::collections::BTreeMap<String, String>,
) -> Vec<String> {
    let mut changes = Vec::new();
    for (path, hash) in after {
        match before.get(path) {
            None => changes.push(format!("added {path}")),
            Some(previous) if previous != hash => changes.push(format!("modified {path}")),
            Some(_) => {}
        }
    }
    for path in before.keys() {
        if !after.contains_key(path) {
            changes.push(format!("removed {path}"));
        }
    }
    changes
}

/// Creates and populates trial workspaces.
#[derive(Debug, Default)]
pub struct WorkspaceManager;

impl WorkspaceManager {
    /// Creates a fresh directory and recursively copies every fixture
    /// source into it. Directory sources contribute their contents;
    /// file sources are copied under their file name.
    pub fn acquire(fixture_sources: &[PathBuf]) -> Result<Workspace, Error> {
        let dir = TempDir::with_prefix("waza-trial-").map_err(|e| Error::WorkspaceIo {
            message: format!("failed to create workspace: {e}"),
        })?;
        for source in fixture_sources {
            copy_fixture(source, dir.path())?;
        }
        debug!(workspace = %dir.path().display(), "Workspace acquired");
        Ok(Workspace { dir })
    }
}

fn copy_fixture(source: &Path, dest_root: &Path) -> Result<(), Error> {
    if source.is_file() {
        let file_name = source.file_name().ok_or_else(|| Error::WorkspaceIo {
            message: format!("fixture '{}' has no file name", source.display()),
        })?;
        std::fs::copy(source, dest_root.join(file_name)).map_err(|e| Error::WorkspaceIo {
            message: format!("failed to copy fixture '{}': {e}", source.display()),
        })?;
        return Ok(());
    }
    if !source.is_dir() {
        return Err(Error::WorkspaceIo {
            message: format!("fixture source '{}' does not exist", source.display()),
        });
    }
    for entry in WalkDir::new(source) {
        let entry = entry.map_err(|e| Error::WorkspaceIo {
            message: format!("failed to walk fixture '{}': {e}", source.display()),
        })?;
        let rel = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| Error::WorkspaceIo {
                message: format!("fixture path outside source root: {e}"),
            })?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let dest = dest_root.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&dest)?;
        } else {
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &dest).map_err(|e| Error::WorkspaceIo {
                message: format!("failed to copy '{}': {e}", entry.path().display()),
            })?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_copies_fixture_tree() {
        let fixtures = TempDir::new().unwrap();
        std::fs::create_dir_all(fixtures.path().join("nested")).unwrap();
        std::fs::write(fixtures.path().join("input.txt"), "a").unwrap();
        std::fs::write(fixtures.path().join("nested/deep.txt"), "b").unwrap();

        let workspace = WorkspaceManager::acquire(&[fixtures.path().to_path_buf()]).unwrap();
        assert_eq!(
            std::fs::read_to_string(workspace.path().join("input.txt")).unwrap(),
            "a"
        );
        assert_eq!(
            std::fs::read_to_string(workspace.path().join("nested/deep.txt")).unwrap(),
            "b"
        );
    }

    #[test]
    fn test_acquire_copies_single_file_fixture() {
        let fixtures = TempDir::new().unwrap();
        let file = fixtures.path().join("seed.json");
        std::fs::write(&file, "{}").unwrap();

        let workspace = WorkspaceManager::acquire(&[file]).unwrap();
        assert!(workspace.path().join("seed.json").is_file());
    }

    #[test]
    fn test_workspace_removed_on_drop() {
        let workspace = WorkspaceManager::acquire(&[]).unwrap();
        let path = workspace.path().to_path_buf();
        assert!(path.is_dir());
        drop(workspace);
        assert!(!path.exists());
    }

    #[test]
    fn test_resolve_accepts_contained_paths() {
        let workspace = WorkspaceManager::acquire(&[]).unwrap();
        let resolved = workspace.resolve("src/main.rs").unwrap();
        assert!(resolved.starts_with(workspace.path()));
        assert!(workspace.resolve("a/./b").is_ok());
        assert!(workspace.resolve("a/../b").is_ok());
    }

    #[test]
    fn test_snapshot_diff_reports_mutations() {
        let workspace = WorkspaceManager::acquire(&[]).unwrap();
        std::fs::write(workspace.path().join("keep.txt"), "same").unwrap();
        std::fs::write(workspace.path().join("change.txt"), "v1").unwrap();
        std::fs::write(workspace.path().join("drop.txt"), "bye").unwrap();
        let before = snapshot(workspace.path()).unwrap();

        std::fs::write(workspace.path().join("change.txt"), "v2").unwrap();
        std::fs::write(workspace.path().join("new.txt"), "hi").unwrap();
        std::fs::remove_file(workspace.path().join("drop.txt")).unwrap();
        let after = snapshot(workspace.path()).unwrap();

        let mut changes = diff_snapshots(&before, &after);
        changes.sort();
        assert_eq!(
            changes,
            vec![
                "added new.txt".to_string(),
                "modified change.txt".to_string(),
                "removed drop.txt".to_string(),
            ]
        );
    }

    #[test]
    fn test_resolve_rejects_escapes() {
        let workspace = WorkspaceManager::acquire(&[]).unwrap();
        assert!(matches!(
            workspace.resolve("/etc/passwd"),
            Err(Error::PathEscape { .. })
        ));
        assert!(matches!(
            workspace.resolve("../outside"),
            Err(Error::PathEscape { .. })
        ));
        assert!(matches!(
            workspace.resolve("a/../../outside"),
            Err(Error::PathEscape { .. })
        ));
        assert!(matches!(workspace.resolve("."), Err(Error::PathEscape { .. })));
    }
}
