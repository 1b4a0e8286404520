//! Discovery of the source files a run will process.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

use crate::io::config::SandboxConfig;

const IGNORED_DIRS: &[&str] = &["__pycache__"];

/// Collect in-scope files under `root`, canonicalized and sorted.
///
/// Skips the backup directory, `__pycache__`, temp files left by interrupted
/// writes and hidden directories below the root.
pub fn discover_files(root: &Path, cfg: &SandboxConfig) -> Result<Vec<PathBuf>> {
    let root = root
        .canonicalize()
        .with_context(|| format!("resolve target directory {}", root.display()))?;
    let backup_dir = root.join(&cfg.backup_dir);

    let mut files = Vec::new();
    for entry in WalkDir::new(&root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_ignored_dir(e, &backup_dir))
    {
        let entry = match entry {
            Ok(e) => e,
            Err(err) => {
                warn!(err = %err, "skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() || !has_allowed_extension(entry.path(), cfg) {
            continue;
        }
        if entry.file_name().to_string_lossy().starts_with(".tmp_") {
            continue;
        }
        let path = entry
            .path()
            .canonicalize()
            .with_context(|| format!("resolve {}", entry.path().display()))?;
        files.push(path);
    }

    files.sort();
    files.dedup();
    debug!(count = files.len(), root = %root.display(), "discovered files");
    Ok(files)
}

fn is_ignored_dir(entry: &DirEntry, backup_dir: &Path) -> bool {
    if !entry.file_type().is_dir() {
        return false;
    }
    let name = entry.file_name().to_string_lossy();
    entry.path() == backup_dir || name.starts_with('.') || IGNORED_DIRS.contains(&name.as_ref())
}

fn has_allowed_extension(path: &Path, cfg: &SandboxConfig) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy())
        .is_some_and(|ext| {
            cfg.allowed_extensions
                .iter()
                .any(|allowed| allowed.as_str() == ext.as_ref())
        })
}
