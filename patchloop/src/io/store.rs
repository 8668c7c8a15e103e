//! Committed/snapshot/staging file store for one project.
//!
//! Committed files live directly under the project root. Everything patchloop
//! owns sits under the reserved `.patchloop/` subtree, which is never
//! interpreted as project source:
//!
//! - `.patchloop/snapshot/` — last known-good copy, used only for rollback
//! - `.patchloop/staging/` — the single in-flight, untested change set
//! - `.patchloop/attempts/` — append-only attempt history
//!
//! Commit and rollback write each file to a temp sibling and rename it into
//! place, so a concurrent reader never observes a half-written file.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};

use crate::core::types::NoSnapshotError;

/// Name of the reserved subtree under a project root.
pub const RESERVED_DIR: &str = ".patchloop";

/// Canonical paths within a project directory.
#[derive(Debug, Clone)]
pub struct ProjectPaths {
    pub root: PathBuf,
    pub reserved_dir: PathBuf,
    pub snapshot_dir: PathBuf,
    pub staging_dir: PathBuf,
    pub attempts_dir: PathBuf,
}

impl ProjectPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let reserved_dir = root.join(RESERVED_DIR);
        Self {
            snapshot_dir: reserved_dir.join("snapshot"),
            staging_dir: reserved_dir.join("staging"),
            attempts_dir: reserved_dir.join("attempts"),
            reserved_dir,
            root,
        }
    }

    /// Project name derived from the root directory.
    pub fn name(&self) -> String {
        self.root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "project".to_string())
    }
}

/// True for files that count as project source (tracked by snapshot/staging).
pub fn is_project_file(name: &str) -> bool {
    name.ends_with(".py") || name == "requirements.txt"
}

/// Store operations over one project's committed, snapshot, and staging sets.
pub struct ProjectStore {
    paths: ProjectPaths,
}

impl ProjectStore {
    pub fn new(paths: ProjectPaths) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &ProjectPaths {
        &self.paths
    }

    /// Ensure the project root and reserved subtree exist.
    pub fn init(&self) -> Result<()> {
        for dir in [&self.paths.root, &self.paths.reserved_dir, &self.paths.attempts_dir] {
            fs::create_dir_all(dir)
                .with_context(|| format!("create directory {}", dir.display()))?;
        }
        Ok(())
    }

    /// Read the committed file set, reserved subtree excluded.
    pub fn committed_files(&self) -> Result<BTreeMap<String, String>> {
        read_tracked_files(&self.paths.root)
    }

    /// Read the staging area's file set.
    pub fn staged_files(&self) -> Result<BTreeMap<String, String>> {
        if !self.paths.staging_dir.exists() {
            return Err(anyhow!("no staging area for {}", self.paths.name()));
        }
        read_tracked_files(&self.paths.staging_dir)
    }

    pub fn has_snapshot(&self) -> bool {
        self.paths.snapshot_dir.is_dir()
            && fs::read_dir(&self.paths.snapshot_dir)
                .map(|mut entries| entries.next().is_some())
                .unwrap_or(false)
    }

    pub fn has_staging(&self) -> bool {
        self.paths.staging_dir.is_dir()
    }

    /// Copy committed files into the snapshot slot, replacing any prior one.
    #[instrument(skip_all, fields(project = %self.paths.name()))]
    pub fn snapshot(&self) -> Result<usize> {
        let files = self.committed_files()?;
        replace_dir_with(&self.paths.snapshot_dir, &files)?;
        debug!(files = files.len(), "snapshot saved");
        Ok(files.len())
    }

    /// Start a fresh staging area seeded from committed files.
    ///
    /// Any prior uncommitted staging contents are discarded, never merged.
    #[instrument(skip_all, fields(project = %self.paths.name()))]
    pub fn begin_staging(&self) -> Result<()> {
        let files = self.committed_files()?;
        replace_dir_with(&self.paths.staging_dir, &files)?;
        debug!(files = files.len(), "staging prepared");
        Ok(())
    }

    /// Write decoded bundle files into the staging area, creating
    /// subdirectories as needed.
    ///
    /// Every name must be a plain relative path. Absolute names or names with
    /// `..` components are rejected before anything is written, so a hostile
    /// bundle can never escape the staging area.
    pub fn write_staged(&self, files: &BTreeMap<String, String>) -> Result<()> {
        for name in files.keys() {
            ensure_safe_relative(name)?;
        }
        fs::create_dir_all(&self.paths.staging_dir)
            .with_context(|| format!("create {}", self.paths.staging_dir.display()))?;
        for (name, content) in files {
            let dest = self.paths.staging_dir.join(name);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create directory {}", parent.display()))?;
            }
            fs::write(&dest, content).with_context(|| format!("write {}", dest.display()))?;
        }
        Ok(())
    }

    /// Promote the staging area over the committed files and clear it.
    ///
    /// Callers must have run both validators first; the store itself does not
    /// re-check.
    #[instrument(skip_all, fields(project = %self.paths.name()))]
    pub fn commit(&self) -> Result<Vec<String>> {
        let staged = self.staged_files()?;
        let names = self.overlay_onto_root(&staged)?;
        fs::remove_dir_all(&self.paths.staging_dir)
            .with_context(|| format!("clear staging {}", self.paths.staging_dir.display()))?;
        debug!(files = names.len(), "committed staged changes");
        Ok(names)
    }

    /// Restore the committed set from the snapshot.
    #[instrument(skip_all, fields(project = %self.paths.name()))]
    pub fn rollback(&self) -> Result<Vec<String>> {
        if !self.has_snapshot() {
            return Err(anyhow::Error::new(NoSnapshotError {
                project: self.paths.name(),
            }));
        }
        let files = read_tracked_files(&self.paths.snapshot_dir)?;
        let names = self.overlay_onto_root(&files)?;
        debug!(files = names.len(), "rolled back to snapshot");
        Ok(names)
    }

    /// Drop the staging area, if any.
    pub fn discard_staging(&self) -> Result<()> {
        if self.paths.staging_dir.exists() {
            fs::remove_dir_all(&self.paths.staging_dir)
                .with_context(|| format!("discard staging {}", self.paths.staging_dir.display()))?;
        }
        Ok(())
    }

    fn overlay_onto_root(&self, files: &BTreeMap<String, String>) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for (name, content) in files {
            let dest = self.paths.root.join(name);
            write_atomic(&dest, content)?;
            names.push(name.clone());
        }
        Ok(names)
    }
}

/// Reject names that could resolve outside the directory they are joined to.
fn ensure_safe_relative(name: &str) -> Result<()> {
    use std::path::Component;

    let path = Path::new(name);
    let safe = !name.is_empty()
        && !path.is_absolute()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if safe {
        Ok(())
    } else {
        Err(anyhow!("unsafe file name in bundle: {name:?}"))
    }
}

/// Replace `dir` with a fresh copy of `files`.
fn replace_dir_with(dir: &Path, files: &BTreeMap<String, String>) -> Result<()> {
    if dir.exists() {
        fs::remove_dir_all(dir).with_context(|| format!("remove {}", dir.display()))?;
    }
    fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    for (name, content) in files {
        let dest = dir.join(name);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        fs::write(&dest, content).with_context(|| format!("write {}", dest.display()))?;
    }
    Ok(())
}

/// Recursively read tracked project files under `base` as relative paths.
fn read_tracked_files(base: &Path) -> Result<BTreeMap<String, String>> {
    let mut files = BTreeMap::new();
    collect_files(base, Path::new(""), &mut files)?;
    Ok(files)
}

fn collect_files(dir: &Path, rel: &Path, files: &mut BTreeMap<String, String>) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    let entries = fs::read_dir(dir).with_context(|| format!("read directory {}", dir.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let path = entry.path();
        let child_rel = rel.join(&name);
        if path.is_dir() {
            // Reserved state, resolved dependencies, bytecode caches, and
            // hidden directories are not project source.
            if name.starts_with('.') || name == "deps" || name == "__pycache__" {
                continue;
            }
            collect_files(&path, &child_rel, files)?;
        } else if is_project_file(&name) {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("read {}", path.display()))?;
            files.insert(child_rel.to_string_lossy().into_owned(), content);
        }
    }
    Ok(())
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let file_name = path
        .file_name()
        .with_context(|| format!("path missing file name {}", path.display()))?
        .to_string_lossy()
        .into_owned();
    let tmp_path = path.with_file_name(format!("{file_name}.tmp"));
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_files(files: &[(&str, &str)]) -> (tempfile::TempDir, ProjectStore) {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = ProjectStore::new(ProjectPaths::new(temp.path().join("demo")));
        store.init().expect("init");
        for (name, content) in files {
            let dest = store.paths().root.join(name);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).expect("mkdir");
            }
            fs::write(dest, content).expect("write");
        }
        (temp, store)
    }

    #[test]
    fn committed_files_exclude_reserved_subtree() {
        let (_temp, store) = store_with_files(&[("main.py", "x = 1")]);
        fs::create_dir_all(store.paths().snapshot_dir.clone()).expect("mkdir");
        fs::write(store.paths().snapshot_dir.join("main.py"), "old").expect("write");

        let files = store.committed_files().expect("committed");
        assert_eq!(files.len(), 1);
        assert_eq!(files["main.py"], "x = 1");
    }

    #[test]
    fn commit_promotes_staging_and_clears_it() {
        let (_temp, store) = store_with_files(&[("main.py", "x = 1")]);
        store.begin_staging().expect("staging");
        store
            .write_staged(&BTreeMap::from([
                ("main.py".to_string(), "x = 2".to_string()),
                ("lib/util.py".to_string(), "pass".to_string()),
            ]))
            .expect("write staged");

        let names = store.commit().expect("commit");
        assert_eq!(names, vec!["lib/util.py".to_string(), "main.py".to_string()]);
        assert!(!store.has_staging());
        let committed = store.committed_files().expect("committed");
        assert_eq!(committed["main.py"], "x = 2");
        assert_eq!(committed["lib/util.py"], "pass");
    }

    #[test]
    fn begin_staging_discards_prior_staging() {
        let (_temp, store) = store_with_files(&[("main.py", "x = 1")]);
        store.begin_staging().expect("staging 1");
        store
            .write_staged(&BTreeMap::from([(
                "orphan.py".to_string(),
                "gone".to_string(),
            )]))
            .expect("write staged");

        store.begin_staging().expect("staging 2");
        let staged = store.staged_files().expect("staged");
        assert!(!staged.contains_key("orphan.py"));
        assert_eq!(staged["main.py"], "x = 1");
    }

    #[test]
    fn traversal_names_are_rejected_before_any_write() {
        let (_temp, store) = store_with_files(&[("main.py", "safe")]);
        store.begin_staging().expect("staging");

        for name in ["../../main.py", "/etc/main.py", "a/../../b.py", ""] {
            let err = store
                .write_staged(&BTreeMap::from([(name.to_string(), "evil".to_string())]))
                .expect_err("unsafe name");
            assert!(err.to_string().contains("unsafe file name"), "{name:?}");
        }
        // Nothing leaked outside staging and nothing was partially written.
        assert_eq!(store.committed_files().expect("committed")["main.py"], "safe");
        assert_eq!(store.staged_files().expect("staged")["main.py"], "safe");
    }

    #[test]
    fn rollback_restores_the_snapshot() {
        let (_temp, store) = store_with_files(&[("main.py", "original")]);
        store.snapshot().expect("snapshot");

        fs::write(store.paths().root.join("main.py"), "broken").expect("overwrite");
        store.rollback().expect("rollback");

        let committed = store.committed_files().expect("committed");
        assert_eq!(committed["main.py"], "original");
    }

    #[test]
    fn rollback_without_snapshot_fails_with_typed_error() {
        let (_temp, store) = store_with_files(&[("main.py", "x = 1")]);
        let err = store.rollback().expect_err("no snapshot");
        assert!(err.downcast_ref::<NoSnapshotError>().is_some());
    }

    #[test]
    fn latest_snapshot_overwrites_the_prior_one() {
        let (_temp, store) = store_with_files(&[("main.py", "v1")]);
        store.snapshot().expect("snapshot v1");
        fs::write(store.paths().root.join("main.py"), "v2").expect("write");
        store.snapshot().expect("snapshot v2");

        fs::write(store.paths().root.join("main.py"), "v3").expect("write");
        store.rollback().expect("rollback");
        assert_eq!(store.committed_files().expect("committed")["main.py"], "v2");
    }

    #[test]
    fn discard_staging_leaves_committed_untouched() {
        let (_temp, store) = store_with_files(&[("main.py", "keep")]);
        store.begin_staging().expect("staging");
        store
            .write_staged(&BTreeMap::from([(
                "main.py".to_string(),
                "reject me".to_string(),
            )]))
            .expect("write staged");

        store.discard_staging().expect("discard");
        assert!(!store.has_staging());
        assert_eq!(store.committed_files().expect("committed")["main.py"], "keep");
    }
}
