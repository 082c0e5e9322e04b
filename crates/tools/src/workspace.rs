//! Per-request workspaces with output-file detection.
//!
//! Every engine request owns a private directory for code execution.
//! Before each execute/shell tool runs, the workspace is snapshotted;
//! afterwards the diff yields the files the tool created, filtered by
//! ignore rules so source and cache files never count as output.
//! Workspaces are reaped on startup.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use base64::Engine as _;
use serde::{Deserialize, Serialize};

use sk_domain::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Ignore rules
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Extensions that are never output files (source, config, compiled).
const IGNORED_EXTENSIONS: &[&str] = &[
    "pyc", "pyo", "pyd", "toml", "cfg", "ini", "env", "lock", "o", "so", "dll", "exe", "class",
    "wasm", "dylib", "a", "lib", "cache", "tmp", "bak", "swp", "swo",
];

const IGNORED_FILENAMES: &[&str] = &[
    "_script.py",
    "requirements.txt",
    "package.json",
    "package-lock.json",
    "SKILL.md",
    "CLAUDE.md",
    "Makefile",
    "Dockerfile",
    "Pipfile",
    "Pipfile.lock",
    "setup.py",
    "setup.cfg",
    "pyproject.toml",
];

const IGNORED_PREFIXES: &[&str] = &["_script_", ".", "__"];

const IGNORED_DIRS: &[&str] = &["__pycache__", ".git", "node_modules", ".ipynb_checkpoints"];

fn should_ignore(path: &Path) -> bool {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    if IGNORED_FILENAMES.contains(&name.as_str()) {
        return true;
    }
    if IGNORED_PREFIXES.iter().any(|p| name.starts_with(p)) {
        return true;
    }
    if let Some(ext) = path.extension().map(|e| e.to_string_lossy().to_lowercase()) {
        if IGNORED_EXTENSIONS.contains(&ext.as_str()) {
            return true;
        }
    }
    path.components().any(|c| {
        let part = c.as_os_str().to_string_lossy();
        IGNORED_DIRS.contains(&part.as_ref())
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Output file info
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A detected output file, as reported in tool results and events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputFileInfo {
    pub filename: String,
    pub size: u64,
    pub content_type: String,
    pub download_url: String,
}

fn encode_path(path: &str) -> String {
    base64::engine::general_purpose::URL_SAFE.encode(path.as_bytes())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// RequestWorkspace
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A private filesystem area owned by one engine request.
pub struct RequestWorkspace {
    pub id: String,
    dir: PathBuf,
}

impl RequestWorkspace {
    /// Create a fresh workspace directory under `base_dir`.
    pub fn create(base_dir: &Path, workspace_id: Option<String>) -> Result<Self> {
        let id = workspace_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let dir = base_dir.join(&id);
        std::fs::create_dir_all(&dir).map_err(Error::Io)?;
        tracing::debug!(workspace_id = %id, path = %dir.display(), "workspace created");
        Ok(Self { id, dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Snapshot files under the workspace: path -> mtime.
    pub fn snapshot(&self) -> HashMap<PathBuf, SystemTime> {
        let mut result = HashMap::new();
        snapshot_into(&self.dir, &mut result);
        result
    }

    /// Files that are new or modified relative to `before`, with ignore
    /// rules applied. Sorted for deterministic reporting.
    pub fn diff_new_files(&self, before: &HashMap<PathBuf, SystemTime>) -> Vec<PathBuf> {
        let after = self.snapshot();
        let mut new_files: Vec<PathBuf> = after
            .into_iter()
            .filter(|(path, mtime)| match before.get(path) {
                None => true,
                Some(old) => mtime > old,
            })
            .map(|(path, _)| path)
            .filter(|p| {
                let rel = p.strip_prefix(&self.dir).unwrap_or(p);
                !should_ignore(rel)
            })
            .collect();
        new_files.sort();
        new_files
    }

    /// Build [`OutputFileInfo`] records for detected files. Empty files
    /// and files that vanished since the diff are skipped.
    pub fn build_output_file_infos(&self, new_paths: &[PathBuf]) -> Vec<OutputFileInfo> {
        let mut results = Vec::new();
        for path in new_paths {
            let Ok(meta) = std::fs::metadata(path) else {
                continue;
            };
            if !meta.is_file() || meta.len() == 0 {
                continue;
            }
            let filename = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let content_type = mime_guess::from_path(path)
                .first_or_octet_stream()
                .to_string();
            let encoded = encode_path(&path.to_string_lossy());
            results.push(OutputFileInfo {
                filename,
                size: meta.len(),
                content_type,
                download_url: format!("/api/v1/files/output/download?path={encoded}"),
            });
        }
        results
    }

    /// Delete the workspace directory.
    pub fn cleanup(&self) {
        if let Err(e) = std::fs::remove_dir_all(&self.dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(
                    workspace_id = %self.id,
                    error = %e,
                    "failed to clean up workspace"
                );
            }
        }
    }
}

fn snapshot_into(dir: &Path, result: &mut HashMap<PathBuf, SystemTime>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            snapshot_into(&path, result);
        } else if let Ok(meta) = entry.metadata() {
            let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            result.insert(path, mtime);
        }
    }
}

/// Remove every leftover workspace directory under `base_dir`. Called at
/// startup; live workspaces belong to requests that no longer exist.
pub fn reap_stale_workspaces(base_dir: &Path) -> usize {
    let Ok(entries) = std::fs::read_dir(base_dir) else {
        return 0;
    };
    let mut reaped = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() && std::fs::remove_dir_all(&path).is_ok() {
            reaped += 1;
        }
    }
    if reaped > 0 {
        tracing::info!(count = reaped, "reaped stale workspaces");
    }
    reaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_detects_only_new_visible_files() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = RequestWorkspace::create(tmp.path(), None).unwrap();

        std::fs::write(ws.dir().join("before.txt"), "old").unwrap();
        let before = ws.snapshot();

        std::fs::write(ws.dir().join("result.csv"), "a,b\n1,2\n").unwrap();
        std::fs::write(ws.dir().join("_script.py"), "print('x')").unwrap();
        std::fs::write(ws.dir().join(".hidden"), "secret").unwrap();
        std::fs::write(ws.dir().join("Pipfile"), "[packages]").unwrap();
        std::fs::write(ws.dir().join("Pipfile.lock"), "{}").unwrap();
        std::fs::write(ws.dir().join("CLAUDE.md"), "notes").unwrap();

        let new_files = ws.diff_new_files(&before);
        let names: Vec<_> = new_files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["result.csv"]);
    }

    #[test]
    fn ignored_dirs_are_excluded() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = RequestWorkspace::create(tmp.path(), None).unwrap();
        let before = ws.snapshot();

        let cache = ws.dir().join("__pycache__");
        std::fs::create_dir_all(&cache).unwrap();
        std::fs::write(cache.join("mod.cpython-311.pyc"), "bin").unwrap();
        std::fs::create_dir_all(ws.dir().join("out")).unwrap();
        std::fs::write(ws.dir().join("out/chart.png"), "png-bytes").unwrap();

        let names: Vec<_> = ws
            .diff_new_files(&before)
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["chart.png"]);
    }

    #[test]
    fn output_info_skips_empty_files() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = RequestWorkspace::create(tmp.path(), None).unwrap();

        let full = ws.dir().join("data.json");
        let empty = ws.dir().join("empty.json");
        std::fs::write(&full, "{}").unwrap();
        std::fs::write(&empty, "").unwrap();

        let infos = ws.build_output_file_infos(&[full, empty]);
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].filename, "data.json");
        assert_eq!(infos[0].content_type, "application/json");
        assert!(infos[0].download_url.contains("path="));
    }

    #[test]
    fn reap_removes_leftover_workspaces() {
        let tmp = tempfile::tempdir().unwrap();
        RequestWorkspace::create(tmp.path(), Some("w1".into())).unwrap();
        RequestWorkspace::create(tmp.path(), Some("w2".into())).unwrap();
        assert_eq!(reap_stale_workspaces(tmp.path()), 2);
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[test]
    fn cleanup_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = RequestWorkspace::create(tmp.path(), None).unwrap();
        ws.cleanup();
        ws.cleanup(); // second call must not warn or panic
        assert!(!ws.dir().exists());
    }
}
