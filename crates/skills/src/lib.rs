//! Read-only skill registry.
//!
//! A skill is a named documentation artifact the agent fetches and
//! follows. Skills live in a directory tree of `<name>/SKILL.md`
//! documents with YAML frontmatter. The engine consumes the registry
//! through two queries only: list skills, fetch skill content by name.

pub mod loader;
pub mod registry;
pub mod types;

pub use registry::SkillsRegistry;
pub use types::SkillEntry;
