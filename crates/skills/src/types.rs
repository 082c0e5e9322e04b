use serde::{Deserialize, Serialize};

/// A skill known to the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillEntry {
    pub name: String,
    pub description: String,
    /// Directory the skill was loaded from.
    pub location: String,
}

impl SkillEntry {
    pub fn render_index_line(&self) -> String {
        format!("- {}: {}", self.name, self.description)
    }
}

/// YAML frontmatter at the top of a SKILL.md document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SkillFrontmatter {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Split a SKILL.md document into parsed frontmatter and body.
///
/// Frontmatter is delimited by `---` lines at the very top. A document
/// without frontmatter yields `(None, whole document)`.
pub fn parse_frontmatter(content: &str) -> (Option<SkillFrontmatter>, &str) {
    let rest = match content.strip_prefix("---") {
        Some(rest) => rest,
        None => return (None, content),
    };
    let Some(end) = rest.find("\n---") else {
        return (None, content);
    };
    let yaml = &rest[..end];
    let body = rest[end + 4..].trim_start_matches(['\r', '\n']);
    match serde_yaml::from_str::<SkillFrontmatter>(yaml) {
        Ok(fm) => (Some(fm), body),
        Err(e) => {
            tracing::warn!(error = %e, "malformed SKILL.md frontmatter");
            (None, content)
        }
    }
}
