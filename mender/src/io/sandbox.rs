//! Mutation sandbox: every file read, write and delete the workflow performs.
//!
//! All entry points resolve their path through [`validate_path`] first. Writes
//! take a timestamped backup of the previous content, then replace the file via
//! a sibling temp file and an atomic rename.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Local;
use regex::Regex;
use tracing::{debug, info, instrument, warn};

use crate::core::error::MenderError;
use crate::io::config::SandboxConfig;

const TEMP_PREFIX: &str = ".tmp_";
const BACKUP_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Resolve `path` and ensure it lies under `root`.
///
/// Relative paths are taken relative to `root`. Symlinks are resolved for the
/// longest existing prefix; the remainder is normalized lexically so paths of
/// files that do not exist yet can still be checked.
pub fn validate_path(path: &Path, root: &Path) -> Result<PathBuf, MenderError> {
    let root_resolved = resolve(root);
    let candidate = if path.is_absolute() {
        path.to_path_buf()
    } else {
        root_resolved.join(path)
    };
    let resolved = resolve(&candidate);
    if resolved.starts_with(&root_resolved) {
        Ok(resolved)
    } else {
        Err(MenderError::ContainmentViolation {
            path: path.to_path_buf(),
            root: root.to_path_buf(),
        })
    }
}

fn resolve(path: &Path) -> PathBuf {
    for ancestor in path.ancestors() {
        if let Ok(canonical) = ancestor.canonicalize() {
            let rest = path.strip_prefix(ancestor).unwrap_or(Path::new(""));
            return push_normalized(canonical, rest);
        }
    }
    push_normalized(PathBuf::new(), path)
}

fn push_normalized(mut base: PathBuf, rest: &Path) -> PathBuf {
    for component in rest.components() {
        match component {
            Component::ParentDir => {
                base.pop();
            }
            Component::CurDir => {}
            other => base.push(other.as_os_str()),
        }
    }
    base
}

/// Result of a sandbox write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    pub path: PathBuf,
    /// Backup of the previous content, if the file existed.
    pub backup: Option<PathBuf>,
    /// Nothing was written because the sandbox runs in dry-run mode.
    pub skipped: bool,
}

#[derive(Debug, Clone)]
pub struct Sandbox {
    root: PathBuf,
    backup_dir: PathBuf,
    max_file_size_bytes: u64,
    max_backups_per_file: Option<usize>,
    dry_run: bool,
}

impl Sandbox {
    pub fn new(root: &Path, cfg: &SandboxConfig, dry_run: bool) -> Result<Self> {
        let root = root
            .canonicalize()
            .with_context(|| format!("resolve sandbox root {}", root.display()))?;
        let backup_dir = root.join(&cfg.backup_dir);
        Ok(Self {
            root,
            backup_dir,
            max_file_size_bytes: cfg.max_file_size_bytes,
            max_backups_per_file: cfg.max_backups_per_file,
            dry_run,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn validate_path(&self, path: &Path) -> Result<PathBuf, MenderError> {
        validate_path(path, &self.root)
    }

    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn read(&self, path: &Path) -> Result<String> {
        let path = self.validate_path(path)?;
        let meta = match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => return Err(MenderError::NotFound(path).into()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(MenderError::NotFound(path).into());
            }
            Err(e) => return Err(e).with_context(|| format!("stat {}", path.display())),
        };
        if meta.len() > self.max_file_size_bytes {
            return Err(MenderError::FileTooLarge {
                path,
                size: meta.len(),
                limit: self.max_file_size_bytes,
            }
            .into());
        }
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))
    }

    #[instrument(skip_all, fields(path = %path.display(), bytes = content.len()))]
    pub fn write(&self, path: &Path, content: &str) -> Result<WriteOutcome> {
        self.write_with(path, |file| file.write_all(content.as_bytes()))
    }

    /// Remove `path` if present. Returns whether a file was removed.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn delete(&self, path: &Path) -> Result<bool> {
        let path = self.validate_path(path)?;
        if !path.is_file() {
            return Ok(false);
        }
        if self.dry_run {
            info!(path = %path.display(), "dry run: skipping delete");
            return Ok(false);
        }
        fs::remove_file(&path).with_context(|| format!("delete {}", path.display()))?;
        Ok(true)
    }

    fn write_with<F>(&self, path: &Path, fill: F) -> Result<WriteOutcome>
    where
        F: FnOnce(&mut File) -> io::Result<()>,
    {
        let path = self.validate_path(path)?;
        if self.dry_run {
            info!(path = %path.display(), "dry run: skipping write");
            return Ok(WriteOutcome {
                path,
                backup: None,
                skipped: true,
            });
        }

        let backup = if path.is_file() {
            Some(self.backup(&path)?)
        } else {
            None
        };

        let parent = path
            .parent()
            .with_context(|| format!("path missing parent {}", path.display()))?;
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
        let file_name = path
            .file_name()
            .with_context(|| format!("path missing file name {}", path.display()))?;
        let tmp_path = parent.join(format!("{TEMP_PREFIX}{}", file_name.to_string_lossy()));

        let written = File::create(&tmp_path)
            .and_then(|mut file| {
                fill(&mut file)?;
                file.sync_all()
            })
            .and_then(|()| fs::rename(&tmp_path, &path));
        if let Err(e) = written {
            if let Err(cleanup) = fs::remove_file(&tmp_path)
                && cleanup.kind() != io::ErrorKind::NotFound
            {
                warn!(err = %cleanup, tmp = %tmp_path.display(), "failed to remove temp file");
            }
            return Err(e).with_context(|| format!("atomic write {}", path.display()));
        }

        debug!(backup = ?backup, "file replaced");
        Ok(WriteOutcome {
            path,
            backup,
            skipped: false,
        })
    }

    /// Copy `path` into the backup directory, mirroring its location under the root.
    fn backup(&self, path: &Path) -> Result<PathBuf> {
        let (dir, stem, ext) = self.backup_location(path)?;
        fs::create_dir_all(&dir).with_context(|| format!("create directory {}", dir.display()))?;

        let stamp = Local::now().format(BACKUP_TIMESTAMP_FORMAT).to_string();
        let mut target = dir.join(format!("{stem}_{stamp}{ext}"));
        let mut n = 1;
        while target.exists() {
            target = dir.join(format!("{stem}_{stamp}_{n}{ext}"));
            n += 1;
        }
        fs::copy(path, &target)
            .with_context(|| format!("backup {} to {}", path.display(), target.display()))?;

        if let Some(keep) = self.max_backups_per_file
            && let Err(err) = self.prune_backups(path, keep)
        {
            warn!(err = %format!("{err:#}"), path = %path.display(), "backup pruning failed");
        }
        Ok(target)
    }

    /// Backups of `path`, oldest first.
    pub fn backups_of(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let path = self.validate_path(path)?;
        let (dir, stem, ext) = self.backup_location(&path)?;
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let pattern = Regex::new(&format!(
            r"^{}_(\d{{8}}_\d{{6}})(?:_(\d+))?{}$",
            regex::escape(&stem),
            regex::escape(&ext)
        ))
        .context("build backup name pattern")?;

        let mut found = Vec::new();
        for entry in fs::read_dir(&dir).with_context(|| format!("list {}", dir.display()))? {
            let entry = entry.with_context(|| format!("list {}", dir.display()))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(caps) = pattern.captures(&name) {
                let stamp = caps[1].to_string();
                let n: u32 = caps.get(2).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
                found.push(((stamp, n), entry.path()));
            }
        }
        found.sort();
        Ok(found.into_iter().map(|(_, path)| path).collect())
    }

    fn prune_backups(&self, path: &Path, keep: usize) -> Result<()> {
        let backups = self.backups_of(path)?;
        let excess = backups.len().saturating_sub(keep);
        for old in backups.iter().take(excess) {
            fs::remove_file(old).with_context(|| format!("prune backup {}", old.display()))?;
            debug!(backup = %old.display(), "pruned backup");
        }
        Ok(())
    }

    fn backup_location(&self, path: &Path) -> Result<(PathBuf, String, String)> {
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        let dir = match relative.parent() {
            Some(parent) => self.backup_dir.join(parent),
            None => self.backup_dir.clone(),
        };
        let stem = path
            .file_stem()
            .with_context(|| format!("path missing file name {}", path.display()))?
            .to_string_lossy()
            .into_owned();
        let ext = path
            .extension()
            .map(|ext| format!(".{}", ext.to_string_lossy()))
            .unwrap_or_default();
        Ok((dir, stem, ext))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sandbox(root: &Path) -> Sandbox {
        Sandbox::new(root, &SandboxConfig::default(), false).expect("sandbox")
    }

    fn visible_entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .expect("read_dir")
            .map(|e| e.expect("entry").file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn rejects_paths_outside_root() {
        let err = validate_path(Path::new("/etc/passwd"), Path::new("/sandbox"))
            .expect_err("must escape");
        assert!(matches!(err, MenderError::ContainmentViolation { .. }));

        let ok = validate_path(Path::new("/sandbox/a/b.py"), Path::new("/sandbox")).expect("inside");
        assert_eq!(ok, PathBuf::from("/sandbox/a/b.py"));
    }

    #[test]
    fn dot_dot_cannot_escape() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = validate_path(Path::new("../outside.py"), temp.path()).expect_err("escape");
        assert!(matches!(err, MenderError::ContainmentViolation { .. }));

        let ok = validate_path(Path::new("pkg/../a.py"), temp.path()).expect("inside");
        assert_eq!(ok, temp.path().canonicalize().expect("canon").join("a.py"));
    }

    #[cfg(unix)]
    #[test]
    fn symlink_out_of_root_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let outside = tempfile::tempdir().expect("outside");
        std::os::unix::fs::symlink(outside.path(), temp.path().join("link")).expect("symlink");
        let err = validate_path(&temp.path().join("link/x.py"), temp.path()).expect_err("escape");
        assert!(matches!(err, MenderError::ContainmentViolation { .. }));
    }

    #[test]
    fn read_missing_is_not_found() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = sandbox(temp.path())
            .read(&temp.path().join("nope.py"))
            .expect_err("missing");
        assert!(matches!(MenderError::find(&err), Some(MenderError::NotFound(_))));
    }

    #[test]
    fn read_rejects_oversized_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = SandboxConfig {
            max_file_size_bytes: 4,
            ..SandboxConfig::default()
        };
        let sb = Sandbox::new(temp.path(), &cfg, false).expect("sandbox");
        fs::write(temp.path().join("big.py"), "x = 12345").expect("write");
        let err = sb.read(&temp.path().join("big.py")).expect_err("too large");
        assert!(matches!(
            MenderError::find(&err),
            Some(MenderError::FileTooLarge { size: 9, limit: 4, .. })
        ));
    }

    #[test]
    fn write_replaces_and_backs_up() {
        let temp = tempfile::tempdir().expect("tempdir");
        let sb = sandbox(temp.path());
        let target = temp.path().join("a.py");
        fs::write(&target, "old = 1\n").expect("seed");

        let outcome = sb.write(&target, "new = 2\n").expect("write");
        assert_eq!(fs::read_to_string(&target).expect("read"), "new = 2\n");
        let backup = outcome.backup.expect("backup taken");
        assert!(backup.starts_with(sb.backup_dir()));
        assert_eq!(fs::read_to_string(&backup).expect("backup"), "old = 1\n");
        assert_eq!(visible_entries(temp.path()), vec![".backups", "a.py"]);
    }

    #[test]
    fn new_file_has_no_backup() {
        let temp = tempfile::tempdir().expect("tempdir");
        let outcome = sandbox(temp.path())
            .write(&temp.path().join("pkg/new.py"), "x = 1\n")
            .expect("write");
        assert!(outcome.backup.is_none());
        assert!(temp.path().join("pkg/new.py").is_file());
    }

    #[test]
    fn failed_write_leaves_original_untouched() {
        let temp = tempfile::tempdir().expect("tempdir");
        let sb = sandbox(temp.path());
        let target = temp.path().join("a.py");
        fs::write(&target, "original = True\n").expect("seed");

        let err = sb
            .write_with(&target, |file| {
                file.write_all(b"half writ")?;
                Err(io::Error::other("simulated crash"))
            })
            .expect_err("crash");
        assert!(format!("{err:#}").contains("simulated crash"));
        assert_eq!(
            fs::read_to_string(&target).expect("read"),
            "original = True\n"
        );
        assert!(
            visible_entries(temp.path())
                .iter()
                .all(|name| !name.starts_with(TEMP_PREFIX))
        );
    }

    #[test]
    fn write_outside_root_is_refused() {
        let temp = tempfile::tempdir().expect("tempdir");
        let outside = tempfile::tempdir().expect("outside");
        let target = outside.path().join("evil.py");
        let err = sandbox(temp.path()).write(&target, "x").expect_err("escape");
        assert!(MenderError::aborts_run(&err));
        assert!(!target.exists());
    }

    #[test]
    fn dry_run_never_touches_disk() {
        let temp = tempfile::tempdir().expect("tempdir");
        let sb = Sandbox::new(temp.path(), &SandboxConfig::default(), true).expect("sandbox");
        let target = temp.path().join("a.py");
        fs::write(&target, "keep = 1\n").expect("seed");

        let outcome = sb.write(&target, "changed\n").expect("write");
        assert!(outcome.skipped);
        assert!(!sb.delete(&target).expect("delete"));
        assert_eq!(fs::read_to_string(&target).expect("read"), "keep = 1\n");
        assert!(!sb.backup_dir().exists());
    }

    #[test]
    fn delete_is_noop_when_absent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let sb = sandbox(temp.path());
        assert!(!sb.delete(&temp.path().join("ghost.py")).expect("delete"));
        fs::write(temp.path().join("real.py"), "").expect("seed");
        assert!(sb.delete(&temp.path().join("real.py")).expect("delete"));
        assert!(!temp.path().join("real.py").exists());
    }

    #[test]
    fn backups_are_pruned_to_cap() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = SandboxConfig {
            max_backups_per_file: Some(2),
            ..SandboxConfig::default()
        };
        let sb = Sandbox::new(temp.path(), &cfg, false).expect("sandbox");
        let target = temp.path().join("a.py");
        fs::write(&target, "v0").expect("seed");
        for version in 1..=4 {
            sb.write(&target, &format!("v{version}")).expect("write");
        }

        let backups = sb.backups_of(&target).expect("backups");
        assert_eq!(backups.len(), 2);
        let contents: Vec<String> = backups
            .iter()
            .map(|b| fs::read_to_string(b).expect("read"))
            .collect();
        assert_eq!(contents, vec!["v2", "v3"]);
    }

    #[test]
    fn failed_pruning_does_not_fail_the_write() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = SandboxConfig {
            max_backups_per_file: Some(1),
            ..SandboxConfig::default()
        };
        let sb = Sandbox::new(temp.path(), &cfg, false).expect("sandbox");
        let target = temp.path().join("a.py");
        fs::write(&target, "v0").expect("seed");
        // Oldest entry by name, and a directory, so removing it fails.
        let stuck = sb.backup_dir().join("a_20000101_000000.py");
        fs::create_dir_all(&stuck).expect("stuck backup");

        let outcome = sb.write(&target, "v1").expect("write despite pruning error");

        assert_eq!(fs::read_to_string(&target).expect("read"), "v1");
        let backup = outcome.backup.expect("backup taken");
        assert_eq!(fs::read_to_string(backup).expect("backup"), "v0");
        assert!(stuck.is_dir());
    }

    #[test]
    fn backups_are_kept_without_cap() {
        let temp = tempfile::tempdir().expect("tempdir");
        let sb = sandbox(temp.path());
        let target = temp.path().join("a.py");
        fs::write(&target, "v0").expect("seed");
        for version in 1..=3 {
            sb.write(&target, &format!("v{version}")).expect("write");
        }
        assert_eq!(sb.backups_of(&target).expect("backups").len(), 3);
    }
}
