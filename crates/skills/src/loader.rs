use std::path::Path;

use sk_domain::error::Result;

use crate::types::{parse_frontmatter, SkillEntry};

/// Load one skill entry from a directory containing a SKILL.md.
///
/// The skill name comes from the frontmatter when present, otherwise
/// from the directory name; the description defaults to the first
/// non-heading body line.
pub fn load_skill_entry(skill_dir: &Path) -> Result<Option<SkillEntry>> {
    let md_path = skill_dir.join("SKILL.md");
    if !md_path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(&md_path)?;
    let (fm, body) = parse_frontmatter(&content);

    let dir_name = skill_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let (name, description) = match fm {
        Some(fm) => (
            fm.name.unwrap_or(dir_name),
            fm.description.unwrap_or_else(|| first_body_line(body)),
        ),
        None => (dir_name, first_body_line(body)),
    };

    Ok(Some(SkillEntry {
        name,
        description,
        location: skill_dir.display().to_string(),
    }))
}

fn first_body_line(body: &str) -> String {
    body.lines()
        .map(str::trim)
        .find(|l| !l.is_empty() && !l.starts_with('#'))
        .unwrap_or("")
        .to_string()
}

/// Load the on-demand SKILL.md documentation for a skill.
pub fn load_skill_doc(skills_root: &Path, skill_name: &str) -> Result<Option<String>> {
    let doc_path = skills_root.join(skill_name).join("SKILL.md");
    if !doc_path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(&doc_path)?;
    Ok(Some(content))
}

/// Scan the skills root directory and load all skill entries.
pub fn scan_skills(skills_root: &Path) -> Result<Vec<SkillEntry>> {
    let mut entries = Vec::new();
    if !skills_root.exists() {
        return Ok(entries);
    }
    for entry in std::fs::read_dir(skills_root)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        match load_skill_entry(&path) {
            Ok(Some(skill)) => entries.push(skill),
            Ok(None) => {} // not a skill directory
            Err(e) => {
                tracing::warn!(
                    skill_dir = %path.display(),
                    error = %e,
                    "skipping unreadable skill directory"
                );
            }
        }
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}
