//! The per-request tool set: catalog, validation, and dispatch.
//!
//! Base tools are assembled per request and filtered by an optional
//! allow-list; tools contributed by equipped MCP servers are always
//! included. Invocation never fails — unknown tools, missing required
//! parameters, and handler errors all come back as serialized error
//! payloads for the model to read. Blocking file work runs on the
//! blocking pool so the turn loop's task is never stalled.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;

use sk_domain::config::ToolExecConfig;
use sk_domain::message::ToolDefinition;
use sk_mcp_client::McpManager;
use sk_skills::SkillsRegistry;
use sk_tools::workspace::RequestWorkspace;
use sk_tools::{exec, file_ops, web};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Base tool catalog
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The built-in tools every request starts from.
pub fn base_tool_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: "list_skills".into(),
            description: "List all available skills. Use this first to see what skills are available before reading one.".into(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {},
                "required": [],
            }),
        },
        ToolDefinition {
            name: "get_skill".into(),
            description: "Get the full documentation of a specific skill. Use this to learn how to use a library or perform a task before writing code.".into(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "skill_name": {
                        "type": "string",
                        "description": "Name of the skill to read (e.g., 'data-analyzer', 'pdf-converter')",
                    },
                },
                "required": ["skill_name"],
            }),
        },
        ToolDefinition {
            name: "execute_code".into(),
            description: "Execute Python code. Code runs in an isolated workspace directory, NOT the project root. Save output files with relative paths so they are auto-detected as downloadable results.".into(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "code": { "type": "string", "description": "Python code to execute" },
                },
                "required": ["code"],
            }),
        },
        ToolDefinition {
            name: "bash".into(),
            description: "Execute a shell command. Use for git, pip, and other CLI tools. Commands run in an isolated workspace directory, NOT the project root. Supports an optional timeout parameter (seconds).".into(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "command": { "type": "string", "description": "Shell command to execute" },
                    "timeout": { "type": "integer", "description": "Timeout in seconds (default 120)" },
                },
                "required": ["command"],
            }),
        },
        ToolDefinition {
            name: "glob_files".into(),
            description: "Search for files by glob pattern (e.g. '**/*.py'). Defaults to the skills directory when no path is given.".into(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "pattern": { "type": "string", "description": "Glob pattern to match" },
                    "path": { "type": "string", "description": "Directory to search in" },
                },
                "required": ["pattern"],
            }),
        },
        ToolDefinition {
            name: "grep_search".into(),
            description: "Search file contents with a regex. Defaults to the skills directory when no path is given.".into(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "pattern": { "type": "string", "description": "Regex to search for" },
                    "path": { "type": "string", "description": "Directory to search in" },
                    "include": { "type": "string", "description": "Filename filter (e.g. '*.py')" },
                },
                "required": ["pattern"],
            }),
        },
        ToolDefinition {
            name: "read_file".into(),
            description: "Read file contents with line numbers. Supports optional offset/limit for large files.".into(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "file_path": { "type": "string", "description": "Path to the file" },
                    "offset": { "type": "integer", "description": "Line to start from (0-based)" },
                    "limit": { "type": "integer", "description": "Maximum lines to return" },
                },
                "required": ["file_path"],
            }),
        },
        ToolDefinition {
            name: "write_file".into(),
            description: "Write content to a file, creating parent directories as needed.".into(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "file_path": { "type": "string", "description": "Path to write" },
                    "content": { "type": "string", "description": "Content to write" },
                },
                "required": ["file_path", "content"],
            }),
        },
        ToolDefinition {
            name: "edit_file".into(),
            description: "Replace an exact string in a file. The old string must occur exactly once unless replace_all is set.".into(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "file_path": { "type": "string", "description": "Path to edit" },
                    "old_string": { "type": "string", "description": "Exact text to replace" },
                    "new_string": { "type": "string", "description": "Replacement text" },
                    "replace_all": { "type": "boolean", "description": "Replace every occurrence" },
                },
                "required": ["file_path", "old_string", "new_string"],
            }),
        },
        ToolDefinition {
            name: "web_fetch".into(),
            description: "Fetch content from a URL and return readable text. HTML is stripped; content is capped at 50KB.".into(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "url": { "type": "string", "description": "The URL to fetch content from" },
                    "prompt": { "type": "string", "description": "What information to extract from the page" },
                },
                "required": ["url", "prompt"],
            }),
        },
        ToolDefinition {
            name: "web_search".into(),
            description: "Search the web. Returns result titles, URLs, and snippets.".into(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "The search query" },
                },
                "required": ["query"],
            }),
        },
    ]
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ToolSet
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-request tool selection knobs.
#[derive(Default)]
pub struct ToolSetParams {
    /// Restrict built-in tools to these names. MCP tools pass through
    /// regardless.
    pub tools_allowlist: Option<Vec<String>>,
    /// Restrict which skills `list_skills`/`get_skill` can see.
    pub skills_allowlist: Option<Vec<String>>,
    /// Equipped MCP servers, by name.
    pub mcp_servers: Vec<String>,
    /// Remote code-execution target; local when unset.
    pub executor_name: Option<String>,
}

pub struct ToolSet {
    defs: Vec<ToolDefinition>,
    mcp_tool_names: HashSet<String>,
    skills: Arc<SkillsRegistry>,
    skills_allowlist: Option<Vec<String>>,
    mcp: Arc<McpManager>,
    mcp_servers: Vec<String>,
    workspace: RequestWorkspace,
    /// Roots file tools may touch: workspace first, then skills.
    roots: Vec<PathBuf>,
    exec_cfg: ToolExecConfig,
    executor_name: Option<String>,
}

impl ToolSet {
    /// Assemble the tool set for one request.
    pub fn build(
        skills: Arc<SkillsRegistry>,
        mcp: Arc<McpManager>,
        workspace: RequestWorkspace,
        exec_cfg: ToolExecConfig,
        params: ToolSetParams,
    ) -> Self {
        let mut defs = base_tool_definitions();
        if let Some(allowed) = &params.tools_allowlist {
            defs.retain(|d| allowed.iter().any(|a| a == &d.name));
        }

        // MCP tools from equipped servers are always included, even
        // when an allow-list restricts the built-ins.
        let mut mcp_tool_names = HashSet::new();
        for (server, tool) in mcp.tools_for(&params.mcp_servers) {
            if defs.iter().any(|d| d.name == tool.name) {
                tracing::warn!(
                    tool = %tool.name,
                    server = %server,
                    "MCP tool shadows an existing definition, skipping"
                );
                continue;
            }
            mcp_tool_names.insert(tool.name.clone());
            defs.push(ToolDefinition {
                name: tool.name,
                description: tool.description,
                input_schema: tool.input_schema,
            });
        }

        let mut roots = vec![workspace.dir().to_path_buf()];
        let skills_root = skills.skills_root().to_path_buf();
        if skills_root.as_os_str().is_empty() {
            tracing::debug!("no skills root configured; file tools are workspace-only");
        } else {
            roots.push(skills_root);
        }

        Self {
            defs,
            mcp_tool_names,
            skills,
            skills_allowlist: params.skills_allowlist,
            mcp,
            mcp_servers: params.mcp_servers,
            workspace,
            roots,
            exec_cfg,
            executor_name: params.executor_name,
        }
    }

    /// Definitions to advertise to the LLM.
    pub fn definitions(&self) -> &[ToolDefinition] {
        &self.defs
    }

    /// `(name, first description line)` for MCP-contributed tools, for
    /// the system prompt.
    pub fn mcp_tool_lines(&self) -> Vec<(String, String)> {
        self.defs
            .iter()
            .filter(|d| self.mcp_tool_names.contains(&d.name))
            .map(|d| {
                let first_line = d.description.lines().next().unwrap_or("").trim().to_string();
                (d.name.clone(), first_line)
            })
            .collect()
    }

    pub fn workspace_dir(&self) -> &std::path::Path {
        self.workspace.dir()
    }

    pub fn skills_root(&self) -> &std::path::Path {
        self.skills.skills_root()
    }

    pub fn executor_name(&self) -> Option<&str> {
        self.executor_name.as_deref()
    }

    /// Delete the request workspace. Called once the run completes.
    pub fn cleanup(&self) {
        self.workspace.cleanup();
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Dispatch
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Invoke a tool by name. Never fails: every outcome is a string
    /// payload for the tool_result block.
    pub async fn invoke(&self, name: &str, input: &Value) -> String {
        let Some(def) = self.defs.iter().find(|d| d.name == name) else {
            return error_payload(&format!(
                "Unknown tool: '{name}'. Check the available tools and try again."
            ));
        };

        if let Some(missing) = missing_required(&def.input_schema, input) {
            return error_payload(&format!(
                "missing required parameter(s): {}",
                missing.join(", ")
            ));
        }

        if self.mcp_tool_names.contains(name) {
            return match self.mcp.call_tool(&self.mcp_servers, name, input).await {
                Ok(text) => text,
                Err(e) => error_payload(&format!("MCP tool '{name}' failed: {e}")),
            };
        }

        match name {
            "list_skills" => self.list_skills(),
            "get_skill" => self.get_skill(input),
            "execute_code" => self.execute_code(input).await,
            "bash" => self.bash(input).await,
            "glob_files" => self.file_op(input, FileOp::Glob).await,
            "grep_search" => self.file_op(input, FileOp::Grep).await,
            "read_file" => self.file_op(input, FileOp::Read).await,
            "write_file" => self.write_file(input).await,
            "edit_file" => self.file_op(input, FileOp::Edit).await,
            "web_fetch" => self.web_fetch(input).await,
            "web_search" => error_payload(
                "Web search is not configured on this deployment. Use web_fetch with a known URL instead.",
            ),
            other => error_payload(&format!("tool '{other}' has no handler")),
        }
    }

    // ── Skill tools ────────────────────────────────────────────────

    fn list_skills(&self) -> String {
        let entries = self.skills.list(self.skills_allowlist.as_deref());
        let skills: Vec<Value> = entries
            .iter()
            .map(|e| serde_json::json!({"name": e.name, "description": e.description}))
            .collect();
        serde_json::json!({"skills": skills, "count": skills.len()}).to_string()
    }

    fn get_skill(&self, input: &Value) -> String {
        let name = input
            .get("skill_name")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        if let Some(allowed) = &self.skills_allowlist {
            if !allowed.iter().any(|a| a == name) {
                return error_payload(&format!(
                    "skill '{name}' is not equipped for this agent"
                ));
            }
        }
        match self.skills.fetch_content(name) {
            Ok(doc) => doc,
            Err(e) => error_payload(&e.to_string()),
        }
    }

    // ── Execution tools ────────────────────────────────────────────

    async fn execute_code(&self, input: &Value) -> String {
        let code = input.get("code").and_then(|v| v.as_str()).unwrap_or("");
        if let Some(executor) = &self.executor_name {
            tracing::debug!(executor = %executor, "dispatching execute_code to remote executor");
        }
        let before = self.workspace.snapshot();
        let outcome = exec::run_python(
            code,
            self.workspace.dir(),
            self.exec_cfg.timeout_sec,
            self.exec_cfg.max_output_chars,
        )
        .await;
        self.exec_result(outcome, &before)
    }

    async fn bash(&self, input: &Value) -> String {
        let command = input.get("command").and_then(|v| v.as_str()).unwrap_or("");
        let timeout = input
            .get("timeout")
            .and_then(|v| v.as_u64())
            .unwrap_or(self.exec_cfg.timeout_sec);
        let before = self.workspace.snapshot();
        let outcome = exec::run_command(
            command,
            self.workspace.dir(),
            timeout,
            self.exec_cfg.max_output_chars,
        )
        .await;
        self.exec_result(outcome, &before)
    }

    fn exec_result(
        &self,
        outcome: exec::ExecOutcome,
        before: &std::collections::HashMap<PathBuf, std::time::SystemTime>,
    ) -> String {
        let new_paths = self.workspace.diff_new_files(before);
        let new_files = self.workspace.build_output_file_infos(&new_paths);
        serde_json::json!({
            "success": outcome.success,
            "output": outcome.output,
            "exit_code": outcome.exit_code,
            "new_files": new_files,
        })
        .to_string()
    }

    // ── File tools ─────────────────────────────────────────────────

    async fn write_file(&self, input: &Value) -> String {
        let file_path = input
            .get("file_path")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let content = input
            .get("content")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();

        let before = self.workspace.snapshot();
        let roots = self.roots.clone();
        let result = tokio::task::spawn_blocking(move || {
            file_ops::write_file(&roots, &file_path, &content)
        })
        .await;

        match result {
            Ok(Ok(mut value)) => {
                // Written files count as outputs too.
                let new_paths = self.workspace.diff_new_files(&before);
                let new_files = self.workspace.build_output_file_infos(&new_paths);
                value["new_files"] = serde_json::to_value(new_files).unwrap_or_default();
                value.to_string()
            }
            Ok(Err(msg)) => error_payload(&msg),
            Err(e) => error_payload(&format!("write task failed: {e}")),
        }
    }

    async fn file_op(&self, input: &Value, op: FileOp) -> String {
        let roots = self.roots.clone();
        let input = input.clone();
        let result = tokio::task::spawn_blocking(move || {
            let s = |key: &str| input.get(key).and_then(|v| v.as_str()).map(str::to_owned);
            match op {
                FileOp::Read => file_ops::read_file(
                    &roots,
                    &s("file_path").unwrap_or_default(),
                    input.get("offset").and_then(|v| v.as_u64()).map(|v| v as usize),
                    input.get("limit").and_then(|v| v.as_u64()).map(|v| v as usize),
                ),
                FileOp::Edit => file_ops::edit_file(
                    &roots,
                    &s("file_path").unwrap_or_default(),
                    &s("old_string").unwrap_or_default(),
                    &s("new_string").unwrap_or_default(),
                    input
                        .get("replace_all")
                        .and_then(|v| v.as_bool())
                        .unwrap_or(false),
                ),
                FileOp::Glob => file_ops::glob_files(
                    &roots,
                    &s("pattern").unwrap_or_default(),
                    s("path").as_deref(),
                ),
                FileOp::Grep => file_ops::grep_search(
                    &roots,
                    &s("pattern").unwrap_or_default(),
                    s("path").as_deref(),
                    s("include").as_deref(),
                ),
            }
        })
        .await;

        match result {
            Ok(Ok(value)) => value.to_string(),
            Ok(Err(msg)) => error_payload(&msg),
            Err(e) => error_payload(&format!("file task failed: {e}")),
        }
    }

    // ── Web tools ──────────────────────────────────────────────────

    async fn web_fetch(&self, input: &Value) -> String {
        let url = input.get("url").and_then(|v| v.as_str()).unwrap_or("");
        match web::web_fetch(url).await {
            Ok(value) => value.to_string(),
            Err(msg) => error_payload(&msg),
        }
    }
}

enum FileOp {
    Read,
    Edit,
    Glob,
    Grep,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn error_payload(message: &str) -> String {
    serde_json::json!({"error": message}).to_string()
}

/// Required fields from the schema that are absent in the input.
fn missing_required(schema: &Value, input: &Value) -> Option<Vec<String>> {
    let required = schema.get("required")?.as_array()?;
    let missing: Vec<String> = required
        .iter()
        .filter_map(|r| r.as_str())
        .filter(|key| input.get(key).map_or(true, |v| v.is_null()))
        .map(str::to_string)
        .collect();
    if missing.is_empty() {
        None
    } else {
        Some(missing)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn toolset(params: ToolSetParams) -> (tempfile::TempDir, ToolSet) {
        let tmp = tempfile::tempdir().unwrap();
        let workspace = RequestWorkspace::create(tmp.path(), None).unwrap();
        let ts = ToolSet::build(
            Arc::new(SkillsRegistry::empty()),
            Arc::new(McpManager::new()),
            workspace,
            ToolExecConfig::default(),
            params,
        );
        (tmp, ts)
    }

    fn toolset_with_skills(
        skills: &[(&str, &str)],
        params: ToolSetParams,
    ) -> (tempfile::TempDir, tempfile::TempDir, ToolSet) {
        let skills_dir = tempfile::tempdir().unwrap();
        for (name, desc) in skills {
            let dir = skills_dir.path().join(name);
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(
                dir.join("SKILL.md"),
                format!("---\nname: {name}\ndescription: {desc}\n---\ndoc body for {name}"),
            )
            .unwrap();
        }
        let registry = Arc::new(SkillsRegistry::load(skills_dir.path()).unwrap());

        let ws_dir = tempfile::tempdir().unwrap();
        let workspace = RequestWorkspace::create(ws_dir.path(), None).unwrap();
        let ts = ToolSet::build(
            registry,
            Arc::new(McpManager::new()),
            workspace,
            ToolExecConfig::default(),
            params,
        );
        (skills_dir, ws_dir, ts)
    }

    #[tokio::test]
    async fn unknown_tool_returns_error_payload() {
        let (_tmp, ts) = toolset(ToolSetParams::default());
        let result = ts.invoke("frobnicate", &serde_json::json!({})).await;
        let parsed: Value = serde_json::from_str(&result).unwrap();
        assert!(parsed["error"].as_str().unwrap().contains("Unknown tool"));
    }

    #[tokio::test]
    async fn missing_required_parameter_is_reported() {
        let (_tmp, ts) = toolset(ToolSetParams::default());
        let result = ts.invoke("get_skill", &serde_json::json!({})).await;
        let parsed: Value = serde_json::from_str(&result).unwrap();
        assert!(parsed["error"]
            .as_str()
            .unwrap()
            .contains("missing required parameter"));
        assert!(parsed["error"].as_str().unwrap().contains("skill_name"));
    }

    #[tokio::test]
    async fn allowlist_filters_builtin_tools() {
        let (_tmp, ts) = toolset(ToolSetParams {
            tools_allowlist: Some(vec!["bash".into(), "read_file".into()]),
            ..Default::default()
        });
        let names: Vec<_> = ts.definitions().iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["bash", "read_file"]);

        let result = ts.invoke("execute_code", &serde_json::json!({"code": "1"})).await;
        let parsed: Value = serde_json::from_str(&result).unwrap();
        assert!(parsed["error"].as_str().unwrap().contains("Unknown tool"));
    }

    #[tokio::test]
    async fn list_and_get_skill_respect_allowlist() {
        let (_s, _w, ts) = toolset_with_skills(
            &[("alpha", "first"), ("beta", "second")],
            ToolSetParams {
                skills_allowlist: Some(vec!["alpha".into()]),
                ..Default::default()
            },
        );

        let listed = ts.invoke("list_skills", &serde_json::json!({})).await;
        let parsed: Value = serde_json::from_str(&listed).unwrap();
        assert_eq!(parsed["count"], 1);
        assert_eq!(parsed["skills"][0]["name"], "alpha");

        let doc = ts
            .invoke("get_skill", &serde_json::json!({"skill_name": "alpha"}))
            .await;
        assert!(doc.contains("doc body for alpha"));

        let denied = ts
            .invoke("get_skill", &serde_json::json!({"skill_name": "beta"}))
            .await;
        let parsed: Value = serde_json::from_str(&denied).unwrap();
        assert!(parsed["error"].as_str().unwrap().contains("not equipped"));
    }

    #[tokio::test]
    async fn bash_reports_new_files() {
        let (_tmp, ts) = toolset(ToolSetParams::default());
        let result = ts
            .invoke("bash", &serde_json::json!({"command": "echo hi > result.txt && echo done"}))
            .await;
        let parsed: Value = serde_json::from_str(&result).unwrap();
        assert_eq!(parsed["success"], true);
        assert!(parsed["output"].as_str().unwrap().contains("done"));
        let new_files = parsed["new_files"].as_array().unwrap();
        assert_eq!(new_files.len(), 1);
        assert_eq!(new_files[0]["filename"], "result.txt");
    }

    #[tokio::test]
    async fn write_then_read_roundtrip() {
        let (_tmp, ts) = toolset(ToolSetParams::default());
        let written = ts
            .invoke(
                "write_file",
                &serde_json::json!({"file_path": "notes.md", "content": "line one\nline two"}),
            )
            .await;
        let parsed: Value = serde_json::from_str(&written).unwrap();
        assert_eq!(parsed["success"], true);
        assert_eq!(parsed["new_files"][0]["filename"], "notes.md");

        let read = ts
            .invoke("read_file", &serde_json::json!({"file_path": "notes.md"}))
            .await;
        let parsed: Value = serde_json::from_str(&read).unwrap();
        assert!(parsed["content"].as_str().unwrap().contains("line two"));
    }

    #[tokio::test]
    async fn tool_failures_are_payloads_not_errors() {
        let (_tmp, ts) = toolset(ToolSetParams::default());
        let result = ts
            .invoke("read_file", &serde_json::json!({"file_path": "missing.txt"}))
            .await;
        let parsed: Value = serde_json::from_str(&result).unwrap();
        assert!(parsed["error"].as_str().unwrap().contains("failed to read"));
    }

    #[tokio::test]
    async fn web_search_is_a_stub() {
        let (_tmp, ts) = toolset(ToolSetParams::default());
        let result = ts
            .invoke("web_search", &serde_json::json!({"query": "rust async"}))
            .await;
        let parsed: Value = serde_json::from_str(&result).unwrap();
        assert!(parsed["error"].as_str().unwrap().contains("not configured"));
    }
}
