use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use sk_domain::error::{Error, Result};

use crate::loader;
use crate::types::SkillEntry;

/// In-memory skills registry.
///
/// The engine only reads: list entries, fetch a document by name. An
/// optional allow-list restricts what a request can see.
pub struct SkillsRegistry {
    entries: RwLock<Vec<SkillEntry>>,
    skills_root: PathBuf,
}

impl SkillsRegistry {
    pub fn load(skills_root: &Path) -> Result<Self> {
        let entries = loader::scan_skills(skills_root)?;
        tracing::info!(
            skills_count = entries.len(),
            path = %skills_root.display(),
            "skills registry loaded"
        );
        Ok(Self {
            entries: RwLock::new(entries),
            skills_root: skills_root.to_path_buf(),
        })
    }

    pub fn empty() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            skills_root: PathBuf::new(),
        }
    }

    /// List skills, optionally restricted to an allow-list of names.
    pub fn list(&self, allowed: Option<&[String]>) -> Vec<SkillEntry> {
        let entries = self.entries.read();
        match allowed {
            None => entries.clone(),
            Some(names) => entries
                .iter()
                .filter(|e| names.iter().any(|n| n == &e.name))
                .cloned()
                .collect(),
        }
    }

    /// Fetch a skill's full SKILL.md content by name.
    pub fn fetch_content(&self, skill_name: &str) -> Result<String> {
        let exists = self.entries.read().iter().any(|e| e.name == skill_name);
        if !exists {
            return Err(Error::SkillNotFound(skill_name.to_string()));
        }
        match loader::load_skill_doc(&self.skills_root, skill_name)? {
            Some(doc) => Ok(doc),
            None => Err(Error::SkillNotFound(skill_name.to_string())),
        }
    }

    /// Render the one-line-per-skill index used in the system prompt.
    pub fn render_index(&self, allowed: Option<&[String]>) -> String {
        self.list(allowed)
            .iter()
            .map(|e| e.render_index_line())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn skills_root(&self) -> &Path {
        &self.skills_root
    }
}
