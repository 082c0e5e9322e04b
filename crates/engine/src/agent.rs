//! The turn loop.
//!
//! [`Agent::run`] owns the message list for one request and iterates
//! `LLM call → tool dispatch → LLM call` until the model stops asking
//! for tools, the turn budget runs out, or the caller cancels. Along
//! the way it emits stream events, compresses the context under token
//! pressure, records the step and llm-call timelines, and updates the
//! pre-created trace row.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::StreamExt;
use serde_json::Value;

use sk_domain::config::{EngineConfig, LimitsConfig};
use sk_domain::error::{Error, Result};
use sk_domain::message::{ContentBlock, Message, ToolCall};
use sk_domain::stream::{LlmStreamEvent, StopReason, Usage};
use sk_mcp_client::McpManager;
use sk_providers::retry::is_retryable;
use sk_providers::{build_client, LlmClient, LlmRequest, LlmResponse};
use sk_sessions::SessionStore;
use sk_skills::SkillsRegistry;
use sk_tools::workspace::RequestWorkspace;

use crate::cancel::CancelToken;
use crate::compress::{self, ClientSummarizer};
use crate::event_stream::EventStream;
use crate::events::{EventPayload, StreamEvent};
use crate::result::{AgentResult, AgentStep, LlmCallRecord, OutputFile};
use crate::toolset::{ToolSet, ToolSetParams};
use crate::trace::TraceStore;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// System prompt
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const BASE_SYSTEM_PROMPT: &str = r#"You are a helpful assistant with access to skills and tools.
{custom_instructions}
## Current Date
Today is {current_date}. Use this date when searching for recent news or time-sensitive information.

## Equipped Skills
{equipped_skills_section}

**IMPORTANT:** When a user request matches a skill's trigger words, you MUST:
1. Call `get_skill(skill_name)` to read the full documentation
2. Follow the skill's workflow exactly as documented
3. Use the tools specified in the skill

## Available Tools

### Skill Management
- list_skills: List all available skills
- get_skill: Read skill documentation

### Code Execution
- execute_code: Execute Python code in the workspace
- bash: Execute shell commands

### Code Exploration (for reading skill source code)
- glob_files: Search for files by pattern (e.g., "**/*.py")
- grep_search: Search for content in files using regex
- read_file: Read file contents with line numbers

### File Editing
- write_file: Write a file
- edit_file: Replace an exact string in a file

### Web
- web_fetch: Fetch a URL as readable text
- web_search: Search the web

{mcp_tools_section}

## Workflow
1. First, list available skills to see what's available
2. Read relevant skill documentation to learn the API
3. If you need more details about the implementation, explore the skill source with glob_files / grep_search / read_file
4. Write and execute code based on what you learned
5. If code fails, debug and retry
6. Return the final result to the user

## Working Directory
Your workspace is `{workspace_dir}`. All tools share this directory — relative paths resolve here.
- **Saving output files:** Use relative paths directly (e.g., `open("output.png", "wb")`). They will be auto-detected as downloadable output files. **NEVER use `/tmp/` for output files**.
- **Accessing skill files:** Use absolute paths under `{skills_dir}`.

## Important Notes
- Always read skill documentation before writing code
- Use code exploration tools when skill docs are insufficient
- When the task is complete, provide a clear final answer
"#;

/// Pull quoted trigger phrases out of a skill document: `- "..."` (or
/// `- '...'`) list lines, present only when the doc mentions triggers
/// at all. Capped at five.
fn extract_trigger_lines(content: &str) -> Vec<String> {
    if !content.to_lowercase().contains("trigger") {
        return Vec::new();
    }
    let mut triggers = Vec::new();
    for line in content.lines() {
        if !(line.contains("- \"") || line.contains("- '")) {
            continue;
        }
        let trigger = line
            .trim()
            .trim_start_matches('-')
            .trim()
            .trim_matches(|c| c == '"' || c == '\'');
        if !trigger.is_empty() && trigger.len() < 50 {
            triggers.push(trigger.to_string());
        }
        if triggers.len() >= 5 {
            break;
        }
    }
    triggers
}

fn build_equipped_skills_section(
    skills: &SkillsRegistry,
    allowed: Option<&[String]>,
) -> String {
    let Some(allowed) = allowed else {
        return "No skills equipped. Use `list_skills` to see available skills.".to_string();
    };

    let mut lines = vec!["The following skills are equipped and ready to use:\n".to_string()];
    let entries = skills.list(Some(allowed));
    for name in allowed {
        match entries.iter().find(|e| &e.name == name) {
            Some(entry) => {
                lines.push(format!("### {}", entry.name));
                if !entry.description.is_empty() {
                    lines.push(format!("**Description:** {}", entry.description));
                }
                if let Ok(content) = skills.fetch_content(name) {
                    let triggers = extract_trigger_lines(&content);
                    if !triggers.is_empty() {
                        lines.push(format!("**Triggers:** {}", triggers.join(", ")));
                    }
                }
                lines.push(String::new());
            }
            None => {
                lines.push(format!("### {name}"));
                lines.push("(Skill not found)".to_string());
                lines.push(String::new());
            }
        }
    }
    lines.join("\n")
}

fn build_mcp_tools_section(toolset: &ToolSet) -> String {
    let tools = toolset.mcp_tool_lines();
    if tools.is_empty() {
        return String::new();
    }
    let mut lines = vec!["### MCP Tools (External Services)".to_string()];
    for (name, desc) in tools {
        lines.push(format!("- {name}: {desc}"));
    }
    lines.join("\n")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Dependencies and options
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Process-wide collaborators every agent shares.
#[derive(Clone)]
pub struct EngineDeps {
    pub config: EngineConfig,
    pub skills: Arc<SkillsRegistry>,
    pub mcp: Arc<McpManager>,
    pub traces: Arc<TraceStore>,
    pub sessions: Arc<SessionStore>,
    /// Base directory for per-request workspaces.
    pub workspace_root: PathBuf,
}

/// Per-request configuration.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub max_turns: u32,
    pub model_provider: String,
    pub model: Option<String>,
    pub skills_allowlist: Option<Vec<String>>,
    pub tools_allowlist: Option<Vec<String>>,
    pub mcp_servers: Vec<String>,
    pub custom_system_prompt: Option<String>,
    pub executor_name: Option<String>,
    pub session_id: Option<String>,
    pub workspace_id: Option<String>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            max_turns: 60,
            model_provider: "anthropic".into(),
            model: None,
            skills_allowlist: None,
            tools_allowlist: None,
            mcp_servers: Vec::new(),
            custom_system_prompt: None,
            executor_name: None,
            session_id: None,
            workspace_id: None,
        }
    }
}

/// Input for one invocation of [`Agent::run`].
#[derive(Default)]
pub struct RunInput {
    pub request: String,
    /// Prior working context for multi-turn conversations.
    pub conversation_history: Vec<Message>,
    /// Provider-format image source blocks attached to the request.
    pub image_contents: Vec<Value>,
    /// Presence selects streaming execution.
    pub event_stream: Option<Arc<EventStream>>,
    pub cancellation: Option<CancelToken>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Agent {
    client: Arc<dyn LlmClient>,
    toolset: ToolSet,
    system_prompt: String,
    config: EngineConfig,
    max_turns: u32,
    traces: Arc<TraceStore>,
    session_id: Option<String>,
}

impl Agent {
    /// Build an agent for one request, constructing the provider client
    /// from the options.
    pub fn build(deps: &EngineDeps, options: RunOptions) -> Result<Self> {
        let client = build_client(
            &options.model_provider,
            options.model.as_deref(),
            None,
        )?;
        Self::build_with_client(deps, options, client)
    }

    /// Build an agent with an injected LLM client (tests, custom
    /// transports).
    pub fn build_with_client(
        deps: &EngineDeps,
        options: RunOptions,
        client: Arc<dyn LlmClient>,
    ) -> Result<Self> {
        let workspace = RequestWorkspace::create(&deps.workspace_root, options.workspace_id)?;
        let toolset = ToolSet::build(
            deps.skills.clone(),
            deps.mcp.clone(),
            workspace,
            deps.config.tools.clone(),
            ToolSetParams {
                tools_allowlist: options.tools_allowlist,
                skills_allowlist: options.skills_allowlist.clone(),
                mcp_servers: options.mcp_servers,
                executor_name: options.executor_name,
            },
        );

        let custom_instructions = match &options.custom_system_prompt {
            Some(text) => format!("\n## Custom Instructions\n{text}\n"),
            None => String::new(),
        };
        let system_prompt = BASE_SYSTEM_PROMPT
            .replace("{custom_instructions}", &custom_instructions)
            .replace(
                "{current_date}",
                &chrono::Utc::now().format("%Y-%m-%d").to_string(),
            )
            .replace(
                "{equipped_skills_section}",
                &build_equipped_skills_section(&deps.skills, options.skills_allowlist.as_deref()),
            )
            .replace("{mcp_tools_section}", &build_mcp_tools_section(&toolset))
            .replace(
                "{workspace_dir}",
                &toolset.workspace_dir().display().to_string(),
            )
            .replace(
                "{skills_dir}",
                &toolset.skills_root().display().to_string(),
            );

        Ok(Self {
            client,
            toolset,
            system_prompt,
            max_turns: LimitsConfig::clamp_max_turns(options.max_turns),
            config: deps.config.clone(),
            traces: deps.traces.clone(),
            session_id: options.session_id,
        })
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn client(&self) -> &Arc<dyn LlmClient> {
        &self.client
    }

    /// Release the request workspace. Call once the result has been
    /// consumed.
    pub fn cleanup(&self) {
        self.toolset.cleanup();
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // The turn loop
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    pub async fn run(&self, input: RunInput) -> AgentResult {
        let started = std::time::Instant::now();
        let events = input.event_stream.clone();
        let cancel = input.cancellation.clone();

        // Pre-create the trace row so clients can poll immediately.
        let trace_id = self.traces.begin(
            &input.request,
            self.client.provider_id(),
            self.client.model(),
            self.toolset.executor_name(),
            self.session_id.as_deref(),
        );

        if let Some(events) = &events {
            events
                .push(StreamEvent::new(
                    0,
                    EventPayload::RunStarted {
                        trace_id: trace_id.clone(),
                        session_id: self.session_id.clone(),
                    },
                ))
                .await;
        }

        // Build the initial message list: history + the new request
        // (with image blocks when supplied).
        let mut messages = input.conversation_history.clone();
        if input.image_contents.is_empty() {
            messages.push(Message::user(input.request.clone()));
        } else {
            let mut blocks: Vec<ContentBlock> = input
                .image_contents
                .iter()
                .map(|source| ContentBlock::Image {
                    source: source.clone(),
                })
                .collect();
            blocks.push(ContentBlock::Text {
                text: input.request.clone(),
            });
            messages.push(Message::user_blocks(blocks));
        }

        let mut steps: Vec<AgentStep> = Vec::new();
        let mut llm_calls: Vec<LlmCallRecord> = Vec::new();
        let mut used_skills: BTreeSet<String> = BTreeSet::new();
        let mut output_files: Vec<OutputFile> = Vec::new();
        let mut seen_file_urls: BTreeSet<String> = BTreeSet::new();
        let mut turns: u32 = 0;
        let mut total_usage = Usage::default();
        let mut last_input_tokens: u64 = 0;

        while turns < self.max_turns {
            if is_cancelled(&cancel) {
                tracing::info!(trace_id = %trace_id, "run cancelled before turn start");
                break;
            }

            turns += 1;

            // ── Compression check ──────────────────────────────────
            if last_input_tokens > 0
                && compress::should_compress(
                    last_input_tokens,
                    self.client.context_limit(),
                    self.config.compression.threshold_ratio,
                )
            {
                tracing::info!(
                    last_input_tokens,
                    context_limit = self.client.context_limit(),
                    "input tokens over threshold, compressing"
                );
                let summarizer = ClientSummarizer::new(self.client.clone());
                let outcome = compress::compress_messages(
                    &summarizer,
                    std::mem::take(&mut messages),
                    self.client.context_limit(),
                    &self.config.compression,
                    self.config.limits.summary_max_tokens,
                )
                .await;
                messages = outcome.messages;
                total_usage.add(Usage {
                    input_tokens: outcome.summary_input_tokens,
                    output_tokens: outcome.summary_output_tokens,
                });

                // The event marks that the threshold fired, even when
                // the compressor left the list unchanged (too few
                // logical turns, or everything fit the recent budget).
                if let Some(events) = &events {
                    events
                        .push(StreamEvent::new(
                            turns,
                            EventPayload::ContextCompressed {
                                previous_tokens: last_input_tokens,
                                context_limit: self.client.context_limit(),
                            },
                        ))
                        .await;
                }
            }

            if let Some(events) = &events {
                events
                    .push(StreamEvent::new(
                        turns,
                        EventPayload::TurnStart {
                            max_turns: self.max_turns,
                        },
                    ))
                    .await;
            }

            // ── LLM call (streaming or not, with bounded retry) ────
            let response = match self
                .invoke_llm(&messages, &events, &cancel, turns)
                .await
            {
                LlmAttempt::Response(resp) => resp,
                LlmAttempt::Cancelled => break,
                LlmAttempt::Failed(err) => {
                    let error_msg = format!("LLM call failed after retries: {err}");
                    if let Some(events) = &events {
                        events
                            .push(StreamEvent::new(
                                turns,
                                EventPayload::Error {
                                    message: error_msg.clone(),
                                },
                            ))
                            .await;
                    }
                    let result = AgentResult {
                        success: false,
                        answer: error_msg.clone(),
                        steps,
                        llm_calls,
                        total_turns: turns,
                        total_input_tokens: total_usage.input_tokens,
                        total_output_tokens: total_usage.output_tokens,
                        error: Some(error_msg),
                        skills_used: used_skills.into_iter().collect(),
                        output_files,
                        final_messages: messages,
                    };
                    self.finish(&trace_id, &result, started, &events, turns).await;
                    return result;
                }
            };

            if is_cancelled(&cancel) {
                break;
            }

            // ── Record usage ───────────────────────────────────────
            total_usage.add(response.usage);
            last_input_tokens = response.usage.input_tokens;

            tracing::debug!(
                turn = turns,
                stop_reason = %response.stop_reason,
                input_tokens = response.usage.input_tokens,
                output_tokens = response.usage.output_tokens,
                "llm response"
            );

            // ── Normalize blocks, collect pending tool calls ───────
            let mut tool_calls: Vec<ToolCall> = Vec::new();
            for block in &response.content {
                match block {
                    ContentBlock::Text { text } => {
                        steps.push(AgentStep::assistant(text.clone()));
                    }
                    ContentBlock::ToolUse { id, name, input } => {
                        tool_calls.push(ToolCall {
                            id: id.clone(),
                            name: name.clone(),
                            input: input.clone(),
                        });
                        if let Some(events) = &events {
                            events
                                .push(StreamEvent::new(
                                    turns,
                                    EventPayload::ToolCall {
                                        tool_name: name.clone(),
                                        tool_input: input.clone(),
                                    },
                                ))
                                .await;
                        }
                    }
                    _ => {}
                }
            }

            messages.push(Message::assistant_blocks(response.content.clone()));

            llm_calls.push(LlmCallRecord {
                turn: turns,
                timestamp: chrono::Utc::now().to_rfc3339(),
                model: response.model.clone(),
                stop_reason: response.stop_reason.as_str().to_string(),
                input_tokens: response.usage.input_tokens,
                output_tokens: response.usage.output_tokens,
            });

            // ── Max-tokens truncation guard ────────────────────────
            // Tool inputs from a truncated response are unreliable; do
            // not execute them. Feed synthetic error results instead so
            // pairing holds and the model retries from a shorter angle.
            if response.stop_reason == StopReason::MaxTokens && !tool_calls.is_empty() {
                tracing::warn!(
                    count = tool_calls.len(),
                    "response truncated at max_tokens; discarding pending tool calls"
                );
                let truncation_msg = "Your previous response was truncated because it exceeded \
                     the maximum output length. The tool call(s) were incomplete and could not \
                     be executed. Please try again with a shorter approach — for example, break \
                     the task into smaller steps or generate less code at once.";
                let mut tool_results = Vec::new();
                for tc in &tool_calls {
                    tool_results.push(ContentBlock::ToolResult {
                        tool_use_id: tc.id.clone(),
                        content: serde_json::json!({"error": truncation_msg}).to_string(),
                        is_error: true,
                    });
                    steps.push(AgentStep::tool(
                        &tc.name,
                        tc.input.clone(),
                        &serde_json::json!({
                            "error": "Response truncated (max_tokens) — tool call incomplete"
                        })
                        .to_string(),
                    ));
                    if let Some(events) = &events {
                        events
                            .push(StreamEvent::new(
                                turns,
                                EventPayload::ToolResult {
                                    tool_name: tc.name.clone(),
                                    tool_input: tc.input.clone(),
                                    tool_result:
                                        "Error: Response truncated (max_tokens). Tool call was incomplete."
                                            .into(),
                                },
                            ))
                            .await;
                    }
                }
                messages.push(Message::tool_results(tool_results));
                continue;
            }

            // ── Termination check ──────────────────────────────────
            if response.stop_reason == StopReason::EndTurn && tool_calls.is_empty() {
                // A steering message waiting at the finish line turns
                // into a fresh user turn instead of ending the run.
                if let Some(steering) = events.as_ref().and_then(|e| e.take_injection()) {
                    messages.push(Message::user(format!(
                        "[User Steering Message]: {steering}"
                    )));
                    if let Some(events) = &events {
                        events
                            .push(StreamEvent::new(
                                turns,
                                EventPayload::SteeringReceived { message: steering },
                            ))
                            .await;
                    }
                    continue;
                }

                let result = AgentResult {
                    success: true,
                    answer: response.text_content(),
                    steps,
                    llm_calls,
                    total_turns: turns,
                    total_input_tokens: total_usage.input_tokens,
                    total_output_tokens: total_usage.output_tokens,
                    error: None,
                    skills_used: used_skills.into_iter().collect(),
                    output_files,
                    final_messages: messages,
                };
                self.finish(&trace_id, &result, started, &events, turns).await;
                return result;
            }

            // ── Execute tool calls sequentially ────────────────────
            let mut tool_results: Vec<ContentBlock> = Vec::new();
            let mut cancelled_mid_tools = false;
            for tc in &tool_calls {
                if is_cancelled(&cancel) {
                    cancelled_mid_tools = true;
                    break;
                }

                tracing::debug!(tool = %tc.name, "invoking tool");
                let result = self.toolset.invoke(&tc.name, &tc.input).await;

                if tc.name == "get_skill" {
                    if let Some(skill) = tc.input.get("skill_name").and_then(|v| v.as_str()) {
                        if !skill.is_empty() {
                            used_skills.insert(skill.to_string());
                        }
                    }
                }

                tool_results.push(ContentBlock::ToolResult {
                    tool_use_id: tc.id.clone(),
                    content: result.clone(),
                    is_error: false,
                });
                steps.push(AgentStep::tool(&tc.name, tc.input.clone(), &result));

                if let Some(events) = &events {
                    events
                        .push(StreamEvent::new(
                            turns,
                            EventPayload::ToolResult {
                                tool_name: tc.name.clone(),
                                tool_input: tc.input.clone(),
                                tool_result: preview(&result, 3000),
                            },
                        ))
                        .await;
                }

                // ── Harvest output files ────────────────────────────
                if matches!(tc.name.as_str(), "execute_code" | "bash" | "write_file") {
                    for file in harvest_new_files(&result, &mut seen_file_urls) {
                        if let Some(events) = &events {
                            events
                                .push(StreamEvent::new(
                                    turns,
                                    EventPayload::OutputFileEvent { file: file.clone() },
                                ))
                                .await;
                        }
                        output_files.push(file);
                    }
                }
            }

            if cancelled_mid_tools || is_cancelled(&cancel) {
                break;
            }

            if !tool_results.is_empty() {
                messages.push(Message::tool_results(tool_results));
            }

            // ── Steering window after tool results ─────────────────
            if let Some(steering) = events.as_ref().and_then(|e| e.take_injection()) {
                messages.push(Message::user(format!(
                    "[User Steering Message]: {steering}"
                )));
                if let Some(events) = &events {
                    events
                        .push(StreamEvent::new(
                            turns,
                            EventPayload::SteeringReceived { message: steering },
                        ))
                        .await;
                }
            }

            if let Some(events) = &events {
                events
                    .push(StreamEvent::new(
                        turns,
                        EventPayload::TurnComplete {
                            messages_snapshot: messages.clone(),
                        },
                    ))
                    .await;
            }
        }

        // ── Loop exit: cancelled or turn budget exhausted ──────────
        let was_cancelled = is_cancelled(&cancel);

        let (final_answer, error_msg) = if was_cancelled {
            ("Agent execution was cancelled.".to_string(), "cancelled".to_string())
        } else {
            // One final non-tool turn so the model can report what it
            // accomplished.
            tracing::info!(max_turns = self.max_turns, "turn budget exhausted, requesting summary");
            messages.push(Message::user(format!(
                "You have reached the maximum number of turns ({}). You cannot make any more \
                 tool calls. Please provide a final summary of what you have accomplished so \
                 far and what remains to be done.",
                self.max_turns
            )));

            let mut answer = "Max turns reached without completing the task.".to_string();
            let req = LlmRequest {
                messages: messages.clone(),
                system: Some(self.system_prompt.clone()),
                tools: Vec::new(),
                max_tokens: self.config.limits.summary_max_tokens,
            };
            match self.client.call(&req).await {
                Ok(resp) => {
                    total_usage.add(resp.usage);
                    let text = resp.text_content();
                    if !text.is_empty() {
                        answer = text.clone();
                        steps.push(AgentStep::assistant(text.clone()));
                        if let Some(events) = &events {
                            events
                                .push(StreamEvent::new(
                                    turns + 1,
                                    EventPayload::Assistant { content: text },
                                ))
                                .await;
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "final summary call failed");
                }
            }
            (answer, "max_turns_exceeded".to_string())
        };

        let result = AgentResult {
            success: false,
            answer: final_answer,
            steps,
            llm_calls,
            total_turns: turns,
            total_input_tokens: total_usage.input_tokens,
            total_output_tokens: total_usage.output_tokens,
            error: Some(error_msg),
            skills_used: used_skills.into_iter().collect(),
            output_files,
            final_messages: messages,
        };
        self.finish(&trace_id, &result, started, &events, turns).await;
        result
    }

    /// Update the trace, push `complete`, and close the stream.
    async fn finish(
        &self,
        trace_id: &str,
        result: &AgentResult,
        started: std::time::Instant,
        events: &Option<Arc<EventStream>>,
        turn: u32,
    ) {
        self.traces
            .complete(trace_id, result, started.elapsed().as_millis() as u64);

        if let Some(events) = events {
            events
                .push(StreamEvent::new(
                    turn,
                    EventPayload::Complete {
                        success: result.success,
                        answer: result.answer.clone(),
                        total_turns: result.total_turns,
                        total_input_tokens: result.total_input_tokens,
                        total_output_tokens: result.total_output_tokens,
                        skills_used: result.skills_used.clone(),
                        output_files: result.output_files.clone(),
                        final_messages: result.final_messages.clone(),
                        error: result.error.clone(),
                    },
                ))
                .await;
            events.close();
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // LLM invocation with retry
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    fn request(&self, messages: &[Message]) -> LlmRequest {
        LlmRequest {
            messages: messages.to_vec(),
            system: Some(self.system_prompt.clone()),
            tools: self.toolset.definitions().to_vec(),
            max_tokens: self.config.limits.max_output_tokens,
        }
    }

    /// One LLM interaction: streaming when an event stream is present,
    /// non-streaming otherwise. A mid-stream failure falls back to
    /// non-streaming retries; retries are bounded with exponential
    /// backoff and only attempted for retryable errors.
    async fn invoke_llm(
        &self,
        messages: &[Message],
        events: &Option<Arc<EventStream>>,
        cancel: &Option<CancelToken>,
        turn: u32,
    ) -> LlmAttempt {
        let req = self.request(messages);

        if let Some(events) = events {
            match self.stream_once(&req, events, cancel, turn).await {
                StreamOutcome::Complete(resp) => return LlmAttempt::Response(resp),
                StreamOutcome::Cancelled => return LlmAttempt::Cancelled,
                StreamOutcome::Failed(err) => {
                    tracing::warn!(error = %err, "stream failed");
                    if !is_retryable(&err) {
                        return LlmAttempt::Failed(err);
                    }
                    // Fall back to non-streaming retries.
                    let mut last_err = err;
                    for attempt in 1..=self.config.retry.max_retries {
                        if is_cancelled(cancel) {
                            return LlmAttempt::Cancelled;
                        }
                        let delay = self.config.retry.backoff_for(attempt);
                        tracing::info!(
                            attempt,
                            delay_secs = delay.as_secs(),
                            "retrying with non-streaming call"
                        );
                        tokio::time::sleep(delay).await;
                        match self.client.call(&req).await {
                            Ok(resp) => return LlmAttempt::Response(resp),
                            Err(e) => {
                                let fatal = !is_retryable(&e);
                                last_err = e;
                                if fatal {
                                    break;
                                }
                            }
                        }
                    }
                    return LlmAttempt::Failed(last_err);
                }
            }
        }

        // Non-streaming: one initial call plus bounded retries.
        let mut attempt: u32 = 0;
        loop {
            if is_cancelled(cancel) {
                return LlmAttempt::Cancelled;
            }
            match self.client.call(&req).await {
                Ok(resp) => return LlmAttempt::Response(resp),
                Err(e) => {
                    if attempt >= self.config.retry.max_retries || !is_retryable(&e) {
                        return LlmAttempt::Failed(e);
                    }
                    attempt += 1;
                    let delay = self.config.retry.backoff_for(attempt);
                    tracing::info!(
                        attempt,
                        delay_secs = delay.as_secs(),
                        error = %e,
                        "retrying LLM call"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Drive one streaming call to completion, pushing text deltas and
    /// assembling the consolidated response.
    async fn stream_once(
        &self,
        req: &LlmRequest,
        events: &Arc<EventStream>,
        cancel: &Option<CancelToken>,
        turn: u32,
    ) -> StreamOutcome {
        let mut stream = match self.client.call_stream(req).await {
            Ok(s) => s,
            Err(e) => return StreamOutcome::Failed(e),
        };

        let mut text_buf = String::new();
        // Open tool_use blocks: id -> (name, args buffer), in arrival order.
        let mut open_tools: Vec<(String, String, String)> = Vec::new();
        let mut finished_tools: Vec<ContentBlock> = Vec::new();
        let mut done: Option<(Option<Usage>, Option<StopReason>)> = None;

        while let Some(item) = stream.next().await {
            if is_cancelled(cancel) {
                return StreamOutcome::Cancelled;
            }
            match item {
                Ok(LlmStreamEvent::TextDelta { text }) => {
                    events
                        .push(StreamEvent::new(
                            turn,
                            EventPayload::TextDelta { text: text.clone() },
                        ))
                        .await;
                    text_buf.push_str(&text);
                }
                Ok(LlmStreamEvent::ToolUseStarted { id, name }) => {
                    open_tools.push((id, name, String::new()));
                }
                Ok(LlmStreamEvent::ToolUseDelta { id, partial_json }) => {
                    if let Some(entry) = open_tools.iter_mut().find(|(tid, _, _)| tid == &id) {
                        entry.2.push_str(&partial_json);
                    }
                }
                Ok(LlmStreamEvent::ToolUseFinished { id, name, input }) => {
                    open_tools.retain(|(tid, _, _)| tid != &id);
                    finished_tools.push(ContentBlock::ToolUse { id, name, input });
                }
                Ok(LlmStreamEvent::Done { usage, stop_reason }) => {
                    done = Some((usage, stop_reason));
                }
                Ok(LlmStreamEvent::Error { message }) => {
                    return StreamOutcome::Failed(Error::Provider {
                        provider: self.client.provider_id().to_string(),
                        message,
                    });
                }
                Err(e) => return StreamOutcome::Failed(e),
            }
        }

        let Some((usage, stop_reason)) = done else {
            return StreamOutcome::Failed(Error::Http(
                "stream ended without a completion frame (incomplete chunked read)".into(),
            ));
        };

        // Some providers only emit start+delta; assemble the leftovers.
        for (id, name, args) in open_tools {
            let input: Value = if args.trim().is_empty() {
                Value::Object(Default::default())
            } else {
                serde_json::from_str(&args).unwrap_or_else(|e| {
                    tracing::warn!(tool = %name, error = %e, "unparseable tool input, defaulting to {{}}");
                    Value::Object(Default::default())
                })
            };
            finished_tools.push(ContentBlock::ToolUse { id, name, input });
        }

        let mut content: Vec<ContentBlock> = Vec::new();
        if !text_buf.is_empty() {
            content.push(ContentBlock::Text { text: text_buf });
        }
        let has_tools = !finished_tools.is_empty();
        content.extend(finished_tools);

        let stop_reason = stop_reason.unwrap_or(if has_tools {
            StopReason::ToolUse
        } else {
            StopReason::EndTurn
        });

        StreamOutcome::Complete(LlmResponse {
            content,
            stop_reason,
            usage: usage.unwrap_or_default(),
            model: self.client.model().to_string(),
        })
    }
}

enum LlmAttempt {
    Response(LlmResponse),
    Cancelled,
    Failed(Error),
}

enum StreamOutcome {
    Complete(LlmResponse),
    Cancelled,
    Failed(Error),
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn is_cancelled(cancel: &Option<CancelToken>) -> bool {
    cancel.as_ref().map(CancelToken::is_cancelled).unwrap_or(false)
}

fn preview(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

/// Pull `new_files` entries out of a tool result, skipping download
/// URLs already seen this run, and mint file ids.
fn harvest_new_files(tool_result: &str, seen_urls: &mut BTreeSet<String>) -> Vec<OutputFile> {
    let Ok(parsed) = serde_json::from_str::<Value>(tool_result) else {
        return Vec::new();
    };
    let Some(new_files) = parsed.get("new_files").and_then(|v| v.as_array()) else {
        return Vec::new();
    };

    let mut out = Vec::new();
    for nf in new_files {
        let Some(url) = nf.get("download_url").and_then(|v| v.as_str()) else {
            continue;
        };
        if url.is_empty() || !seen_urls.insert(url.to_string()) {
            continue;
        }
        out.push(OutputFile {
            file_id: uuid::Uuid::new_v4().to_string(),
            filename: nf
                .get("filename")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
            size: nf.get("size").and_then(|v| v.as_u64()).unwrap_or(0),
            content_type: nf
                .get("content_type")
                .and_then(|v| v.as_str())
                .unwrap_or("application/octet-stream")
                .to_string(),
            download_url: url.to_string(),
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn harvest_dedupes_by_download_url() {
        let mut seen = BTreeSet::new();
        let result = serde_json::json!({
            "success": true,
            "new_files": [
                {"filename": "a.png", "size": 10, "content_type": "image/png", "download_url": "/d?p=1"},
                {"filename": "b.png", "size": 20, "content_type": "image/png", "download_url": "/d?p=2"},
            ],
        })
        .to_string();

        let first = harvest_new_files(&result, &mut seen);
        assert_eq!(first.len(), 2);

        // Same result again: everything already seen.
        let second = harvest_new_files(&result, &mut seen);
        assert!(second.is_empty());
    }

    #[test]
    fn harvest_ignores_non_json_results() {
        let mut seen = BTreeSet::new();
        assert!(harvest_new_files("plain text output", &mut seen).is_empty());
    }

    #[test]
    fn preview_respects_char_boundaries() {
        let s = "héllo wörld";
        let p = preview(s, 2);
        assert!(p.len() <= 2);
        assert!(s.starts_with(&p));
    }

    #[test]
    fn trigger_lines_extracted_from_skill_doc() {
        let doc = "# data-analyzer\n\n\
                   ## Triggers\n\
                   - \"analyze this csv\"\n\
                   - 'plot the data'\n\
                   - not quoted, skipped\n\
                   - \"make a chart\"\n";
        let triggers = extract_trigger_lines(doc);
        assert_eq!(
            triggers,
            vec!["analyze this csv", "plot the data", "make a chart"]
        );
    }

    #[test]
    fn trigger_extraction_requires_a_trigger_section() {
        let doc = "# skill\n- \"looks like a trigger but is not\"\n";
        assert!(extract_trigger_lines(doc).is_empty());
    }

    #[test]
    fn trigger_extraction_caps_at_five_and_drops_long_lines() {
        let long = "x".repeat(60);
        let mut doc = String::from("## Trigger words\n");
        doc.push_str(&format!("- \"{long}\"\n"));
        for i in 0..8 {
            doc.push_str(&format!("- \"trigger {i}\"\n"));
        }
        let triggers = extract_trigger_lines(&doc);
        assert_eq!(triggers.len(), 5);
        assert_eq!(triggers[0], "trigger 0");
    }

    #[test]
    fn equipped_skills_section_includes_description_and_triggers() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("pdf-converter");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("SKILL.md"),
            "---\nname: pdf-converter\ndescription: Convert PDFs to text\n---\n\
             ## Triggers\n- \"convert this pdf\"\n- \"extract pdf text\"\n",
        )
        .unwrap();
        let registry = SkillsRegistry::load(tmp.path()).unwrap();

        let allowed = vec!["pdf-converter".to_string(), "missing-skill".to_string()];
        let section = build_equipped_skills_section(&registry, Some(&allowed));

        assert!(section.contains("### pdf-converter"));
        assert!(section.contains("**Description:** Convert PDFs to text"));
        assert!(section.contains("**Triggers:** convert this pdf, extract pdf text"));
        assert!(section.contains("### missing-skill"));
        assert!(section.contains("(Skill not found)"));
    }
}
