//! File operation tools — glob, grep, read, write, edit — constrained
//! to a set of allowed roots.
//!
//! Relative paths resolve against the first root (the request
//! workspace). Absolute paths are accepted only when they stay inside
//! one of the allowed roots (workspace or the skills directory), so the
//! model can read skill source code but nothing else on the host.
//!
//! All functions return `Result<Value, String>`; error strings are
//! serialized into tool_result payloads by the caller, never raised.

use std::path::{Component, Path, PathBuf};

use regex::Regex;
use serde_json::Value;

/// Cap on glob/grep result counts to keep tool output bounded.
const MAX_MATCHES: usize = 200;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Path validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Validate a requested path against the allowed roots.
///
/// 1. Rejects `..` components outright.
/// 2. Relative paths join onto the first root.
/// 3. The resolved path must stay inside one of the roots.
pub fn validate_path(roots: &[PathBuf], requested: &str) -> Result<PathBuf, String> {
    if roots.is_empty() {
        return Err("no allowed roots configured".into());
    }

    let requested_path = Path::new(requested);
    for component in requested_path.components() {
        if matches!(component, Component::ParentDir) {
            return Err("path must not contain '..' components".to_owned());
        }
    }

    let candidate = if requested_path.is_absolute() {
        requested_path.to_path_buf()
    } else {
        roots[0].join(requested_path)
    };

    let resolved = resolve_existing_prefix(&candidate)?;

    for root in roots {
        if let Ok(canonical_root) = root.canonicalize() {
            if resolved.starts_with(&canonical_root) {
                return Ok(resolved);
            }
        }
    }

    Err(format!(
        "path '{requested}' resolves outside the allowed directories"
    ))
}

/// Canonicalize the longest existing prefix of `candidate` and re-append
/// the missing tail, so not-yet-created files still validate.
fn resolve_existing_prefix(candidate: &Path) -> Result<PathBuf, String> {
    if candidate.exists() {
        return candidate
            .canonicalize()
            .map_err(|e| format!("cannot resolve path '{}': {e}", candidate.display()));
    }

    let mut existing = candidate;
    let mut tail: Vec<&std::ffi::OsStr> = Vec::new();
    loop {
        if existing.exists() {
            break;
        }
        match existing.parent() {
            Some(parent) => {
                if let Some(name) = existing.file_name() {
                    tail.push(name);
                }
                existing = parent;
            }
            None => break,
        }
    }
    let mut resolved = existing
        .canonicalize()
        .map_err(|e| format!("cannot resolve ancestor of '{}': {e}", candidate.display()))?;
    for part in tail.into_iter().rev() {
        resolved.push(part);
    }
    Ok(resolved)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// read / write / edit
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Read a file with 1-based line numbers, honoring offset/limit.
pub fn read_file(
    roots: &[PathBuf],
    file_path: &str,
    offset: Option<usize>,
    limit: Option<usize>,
) -> Result<Value, String> {
    let path = validate_path(roots, file_path)?;
    let content = std::fs::read_to_string(&path)
        .map_err(|e| format!("failed to read '{}': {e}", path.display()))?;

    let lines: Vec<&str> = content.lines().collect();
    let total_lines = lines.len();
    let offset = offset.unwrap_or(0);
    let limit = limit.unwrap_or(total_lines.saturating_sub(offset));

    let numbered: Vec<String> = lines
        .iter()
        .enumerate()
        .skip(offset)
        .take(limit)
        .map(|(i, l)| format!("{:>5}\t{}", i + 1, l))
        .collect();

    Ok(serde_json::json!({
        "file_path": file_path,
        "content": numbered.join("\n"),
        "total_lines": total_lines,
        "lines_returned": numbered.len(),
    }))
}

/// Write/create a file, creating parent directories as needed.
pub fn write_file(roots: &[PathBuf], file_path: &str, content: &str) -> Result<Value, String> {
    let path = validate_path(roots, file_path)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("failed to create parent directory: {e}"))?;
    }
    std::fs::write(&path, content)
        .map_err(|e| format!("failed to write '{}': {e}", path.display()))?;

    Ok(serde_json::json!({
        "file_path": file_path,
        "bytes_written": content.len(),
        "success": true,
    }))
}

/// Replace `old_string` with `new_string` in a file.
///
/// Without `replace_all`, the old string must occur exactly once — an
/// ambiguous match is an error so the model adds more context.
pub fn edit_file(
    roots: &[PathBuf],
    file_path: &str,
    old_string: &str,
    new_string: &str,
    replace_all: bool,
) -> Result<Value, String> {
    let path = validate_path(roots, file_path)?;
    let content = std::fs::read_to_string(&path)
        .map_err(|e| format!("failed to read '{}': {e}", path.display()))?;

    let occurrences = content.matches(old_string).count();
    if occurrences == 0 {
        return Err(format!("old_string not found in '{file_path}'"));
    }
    if occurrences > 1 && !replace_all {
        return Err(format!(
            "old_string occurs {occurrences} times in '{file_path}'; provide more context or set replace_all"
        ));
    }

    let new_content = if replace_all {
        content.replace(old_string, new_string)
    } else {
        content.replacen(old_string, new_string, 1)
    };
    std::fs::write(&path, &new_content)
        .map_err(|e| format!("failed to write '{}': {e}", path.display()))?;

    Ok(serde_json::json!({
        "file_path": file_path,
        "replacements": if replace_all { occurrences } else { 1 },
        "success": true,
    }))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// glob / grep
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Find files matching a glob pattern under `path` (defaults to the
/// first root).
pub fn glob_files(
    roots: &[PathBuf],
    pattern: &str,
    path: Option<&str>,
) -> Result<Value, String> {
    let base = match path {
        Some(p) => validate_path(roots, p)?,
        None => roots[0].clone(),
    };
    let full_pattern = base.join(pattern);
    let pattern_str = full_pattern.to_string_lossy();

    let mut matches: Vec<String> = Vec::new();
    let paths = glob::glob(&pattern_str).map_err(|e| format!("invalid glob pattern: {e}"))?;
    for entry in paths {
        match entry {
            Ok(p) if p.is_file() => {
                matches.push(p.to_string_lossy().to_string());
                if matches.len() >= MAX_MATCHES {
                    break;
                }
            }
            _ => {}
        }
    }
    matches.sort();

    Ok(serde_json::json!({
        "pattern": pattern,
        "matches": matches,
        "count": matches.len(),
    }))
}

/// Search file contents by regex under `path` (defaults to the first
/// root), optionally filtered by a filename glob in `include`.
pub fn grep_search(
    roots: &[PathBuf],
    pattern: &str,
    path: Option<&str>,
    include: Option<&str>,
) -> Result<Value, String> {
    let base = match path {
        Some(p) => validate_path(roots, p)?,
        None => roots[0].clone(),
    };
    let re = Regex::new(pattern).map_err(|e| format!("invalid regex: {e}"))?;
    let include_matcher = match include {
        Some(g) => {
            Some(glob::Pattern::new(g).map_err(|e| format!("invalid include pattern: {e}"))?)
        }
        None => None,
    };

    let mut matches: Vec<Value> = Vec::new();
    grep_dir(&base, &re, include_matcher.as_ref(), &mut matches);

    Ok(serde_json::json!({
        "pattern": pattern,
        "matches": matches,
        "count": matches.len(),
    }))
}

fn grep_dir(dir: &Path, re: &Regex, include: Option<&glob::Pattern>, out: &mut Vec<Value>) {
    if out.len() >= MAX_MATCHES {
        return;
    }
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        if out.len() >= MAX_MATCHES {
            return;
        }
        let path = entry.path();
        if path.is_dir() {
            grep_dir(&path, re, include, out);
            continue;
        }
        if let Some(matcher) = include {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            if !matcher.matches(&name) {
                continue;
            }
        }
        let Ok(content) = std::fs::read_to_string(&path) else {
            continue; // binary or unreadable
        };
        for (line_no, line) in content.lines().enumerate() {
            if re.is_match(line) {
                out.push(serde_json::json!({
                    "file": path.to_string_lossy(),
                    "line": line_no + 1,
                    "text": line.trim_end(),
                }));
                if out.len() >= MAX_MATCHES {
                    return;
                }
            }
        }
    }
}
