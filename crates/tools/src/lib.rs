//! Tool implementations: per-request workspaces with output-file
//! detection, shell/code execution, workspace-rooted file operations,
//! and web fetch. The engine's tool set wires these behind the tool
//! catalog exposed to the LLM.

pub mod exec;
pub mod file_ops;
pub mod web;
pub mod workspace;

pub use workspace::{OutputFileInfo, RequestWorkspace};
