//! Context-window compression.
//!
//! When the last LLM call's input tokens cross the threshold, old
//! logical turns are collapsed into a structured `<summary>` block and
//! the working context is rebuilt as summary + recent turns. Splits
//! always land on logical turn boundaries (or, inside one oversized
//! turn, on assistant messages that are not mid tool_use/tool_result
//! pair), so pairing is never broken.
//!
//! Compression operates only on the agent's working context; the
//! session display history is never touched.

use std::collections::BTreeSet;

use serde_json::Value;

use sk_domain::config::CompressionConfig;
use sk_domain::error::Result;
use sk_domain::message::{ContentBlock, Message, MessageContent, Role};
use sk_domain::stream::Usage;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Prompts
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const SUMMARY_SYSTEM_PROMPT: &str = r#"You have been given a partial transcript of a conversation between a user and an AI assistant. Write a summary that provides continuity so the assistant can continue making progress in a future context where the raw history is replaced by this summary.

You must wrap your summary in a <summary></summary> block with the following sections:

<summary>
## Primary Request and Intent
The user's explicit goals and overall task. Include any clarifications or constraints the user provided.

## Key Technical Concepts
Technologies, frameworks, models, APIs, and domain-specific terms discussed. Include exact model names, package versions, and configuration values.

## Files and Code Sections
Specific files read, created, or modified, with brief notes on what was done. Include exact file paths. For critical code changes, preserve the key snippets verbatim.

## Problem Solving
Completed troubleshooting efforts — what was tried, what worked, what failed and why. Include exact error messages if relevant.

## All User Messages
List every non-tool-use user statement **verbatim** (or near-verbatim for very long messages >500 chars). Number them chronologically. This is the most critical section — user intent must be preserved precisely, not paraphrased.

## Current State
What was just completed immediately before this summary. Be specific about the last action taken and its result.

## Pending Tasks
Outstanding work items and next steps, in priority order. Include any blockers.
</summary>

Be concise but thorough. Preserve exact file paths, variable names, model names, API parameters, and configuration values. Do not omit details that would be needed to continue the work.

Note: File tracking sections (<read-files> and <modified-files>) will be appended automatically — do not duplicate them in your summary.

{file_tracking_section}"#;

const SUMMARY_UPDATE_PROMPT: &str = r#"You have been given NEW conversation messages that occurred after a previous summary. Update the existing summary with the new information.

<previous-summary>
{previous_summary}
</previous-summary>

Rules:
- PRESERVE all existing information from the previous summary
- ADD new progress, decisions, user messages, and context from the new messages
- UPDATE "Current State" and "Pending Tasks" based on what was accomplished
- APPEND new user statements to "All User Messages" (preserve existing entries verbatim)
- PRESERVE exact file paths, function names, error messages, and configuration values
- If something is no longer relevant, you may remove it
- Use the same <summary> section structure as the original

Note: File tracking sections (<read-files> and <modified-files>) will be appended automatically — do not duplicate them in your summary.

{file_tracking_section}"#;

const TURN_PREFIX_SUMMARY_PROMPT: &str = r#"This is the PREFIX of a conversation turn that was too large to keep in full. The SUFFIX (recent work) is retained verbatim. Summarize the prefix to provide context for the retained suffix.

Write a brief summary with these sections:
## Original Request
What did the user ask for in this turn?

## Early Progress
Key decisions and work done in the prefix

## Context for Suffix
Information needed to understand the retained recent work"#;

/// Synthetic assistant acknowledgment inserted when the kept recent
/// messages start with a user message (keeps role alternation valid).
pub const ACK_TEXT: &str = "I understand the context. Let me continue from where we left off.";

/// Serialized-transcript cap before head/tail truncation.
const MAX_SERIALIZED_CHARS: usize = 100_000;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Summarizer seam
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The narrow LLM surface the compressor needs. Injecting this instead
/// of a full client keeps the engine's recursive self-use explicit and
/// makes the compressor testable without a provider.
#[async_trait::async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(
        &self,
        system: &str,
        user_text: &str,
        max_tokens: u32,
    ) -> Result<(String, Usage)>;
}

/// Adapter from any [`sk_providers::LlmClient`].
pub struct ClientSummarizer {
    client: std::sync::Arc<dyn sk_providers::LlmClient>,
}

impl ClientSummarizer {
    pub fn new(client: std::sync::Arc<dyn sk_providers::LlmClient>) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl Summarizer for ClientSummarizer {
    async fn summarize(
        &self,
        system: &str,
        user_text: &str,
        max_tokens: u32,
    ) -> Result<(String, Usage)> {
        let req = sk_providers::LlmRequest {
            messages: vec![Message::user(user_text)],
            system: Some(system.to_string()),
            tools: Vec::new(),
            max_tokens,
        };
        let resp = self.client.call(&req).await?;
        Ok((resp.text_content(), resp.usage))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Outcome
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct CompressionOutcome {
    pub messages: Vec<Message>,
    pub summary_input_tokens: u64,
    pub summary_output_tokens: u64,
    /// False when nothing was compressed (too few turns, or everything
    /// fits the recent-turns budget).
    pub compressed: bool,
}

impl CompressionOutcome {
    fn unchanged(messages: Vec<Message>) -> Self {
        Self {
            messages,
            summary_input_tokens: 0,
            summary_output_tokens: 0,
            compressed: false,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Threshold
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Strict threshold: compress only when tokens exceed the ratio.
pub fn should_compress(last_input_tokens: u64, context_limit: u64, threshold_ratio: f64) -> bool {
    last_input_tokens as f64 > context_limit as f64 * threshold_ratio
}

/// Estimated token count of a message list (chars-per-token rule).
pub fn estimate_tokens(messages: &[Message], chars_per_token: f64) -> u64 {
    let chars: usize = messages.iter().map(Message::content_chars).sum();
    (chars as f64 / chars_per_token) as u64
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// File-operation tracking
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Scan messages for file operations: reads (read/glob/grep tool_use)
/// and modifications (write/edit tool_use, `new_files` in tool results).
fn extract_file_operations(messages: &[Message]) -> (BTreeSet<String>, BTreeSet<String>) {
    let mut read_files = BTreeSet::new();
    let mut modified_files = BTreeSet::new();

    for msg in messages {
        let MessageContent::Blocks(blocks) = &msg.content else {
            continue;
        };
        for block in blocks {
            match block {
                ContentBlock::ToolUse { name, input, .. } => match name.as_str() {
                    "read" | "read_file" => {
                        if let Some(fp) = input.get("file_path").and_then(|v| v.as_str()) {
                            if !fp.is_empty() {
                                read_files.insert(fp.to_string());
                            }
                        }
                    }
                    "glob" | "glob_files" => {
                        let path = input.get("path").and_then(|v| v.as_str()).unwrap_or("");
                        let pattern = input.get("pattern").and_then(|v| v.as_str()).unwrap_or("");
                        if !path.is_empty() {
                            if pattern.is_empty() {
                                read_files.insert(path.to_string());
                            } else {
                                read_files.insert(format!("{path}/{pattern}"));
                            }
                        }
                    }
                    "grep" | "grep_search" => {
                        if let Some(path) = input.get("path").and_then(|v| v.as_str()) {
                            if !path.is_empty() {
                                read_files.insert(path.to_string());
                            }
                        }
                    }
                    "write" | "write_file" | "edit" | "edit_file" => {
                        if let Some(fp) = input.get("file_path").and_then(|v| v.as_str()) {
                            if !fp.is_empty() {
                                modified_files.insert(fp.to_string());
                            }
                        }
                    }
                    _ => {}
                },
                ContentBlock::ToolResult { content, .. } => {
                    if let Ok(parsed) = serde_json::from_str::<Value>(content) {
                        if let Some(new_files) = parsed.get("new_files").and_then(|v| v.as_array())
                        {
                            for nf in new_files {
                                if let Some(name) = nf.get("filename").and_then(|v| v.as_str()) {
                                    if !name.is_empty() {
                                        modified_files.insert(name.to_string());
                                    }
                                }
                            }
                        }
                    }
                }
                _ => {}
            }
        }
    }

    (read_files, modified_files)
}

fn build_file_tracking_section(
    read_files: &BTreeSet<String>,
    modified_files: &BTreeSet<String>,
) -> String {
    let mut parts = Vec::new();
    if !read_files.is_empty() {
        let list = read_files.iter().cloned().collect::<Vec<_>>().join("\n");
        parts.push(format!("<read-files>\n{list}\n</read-files>"));
    }
    if !modified_files.is_empty() {
        let list = modified_files.iter().cloned().collect::<Vec<_>>().join("\n");
        parts.push(format!("<modified-files>\n{list}\n</modified-files>"));
    }
    parts.join("\n")
}

/// Extract the file-tracking sets from a previous summary's XML blocks.
fn extract_previous_file_tracking(summary_text: &str) -> (BTreeSet<String>, BTreeSet<String>) {
    fn extract(text: &str, tag: &str) -> BTreeSet<String> {
        let re = regex::Regex::new(&format!(r"(?s)<{tag}>\s*(.*?)\s*</{tag}>")).unwrap();
        re.captures(text)
            .map(|c| {
                c[1].lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
    (
        extract(summary_text, "read-files"),
        extract(summary_text, "modified-files"),
    )
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Transcript serialization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn truncate_chars(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...(truncated)", &s[..end])
}

/// Render messages as readable text for the summarization prompt.
///
/// Tool inputs truncate at 500 chars, tool results at 1000. If the
/// whole transcript exceeds 100K chars, the middle is cut out.
fn serialize_messages_for_summary(messages: &[Message]) -> String {
    let mut parts: Vec<String> = Vec::new();

    for msg in messages {
        let role = match msg.role {
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        match &msg.content {
            MessageContent::Text(t) => parts.push(format!("[{role}]: {t}")),
            MessageContent::Blocks(blocks) => {
                for block in blocks {
                    match block {
                        ContentBlock::Text { text } => parts.push(format!("[{role}]: {text}")),
                        ContentBlock::ToolUse { name, input, .. } => {
                            let input_json = serde_json::to_string(input).unwrap_or_default();
                            parts.push(format!(
                                "[{role} -> tool_use({name})]: {}",
                                truncate_chars(&input_json, 500)
                            ));
                        }
                        ContentBlock::ToolResult { content, .. } => {
                            parts.push(format!(
                                "[tool_result]: {}",
                                truncate_chars(content, 1000)
                            ));
                        }
                        ContentBlock::Image { .. } => {}
                    }
                }
            }
        }
    }

    let text = parts.join("\n\n");
    if text.len() > MAX_SERIALIZED_CHARS {
        let half = MAX_SERIALIZED_CHARS / 2;
        let mut head_end = half;
        while !text.is_char_boundary(head_end) {
            head_end -= 1;
        }
        let mut tail_start = text.len() - half;
        while !text.is_char_boundary(tail_start) {
            tail_start += 1;
        }
        format!(
            "{}\n\n[... truncated middle section ...]\n\n{}",
            &text[..head_end],
            &text[tail_start..]
        )
    } else {
        text
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Turn boundary analysis
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Indices of messages that open a logical turn.
fn turn_boundaries(messages: &[Message]) -> Vec<usize> {
    messages
        .iter()
        .enumerate()
        .filter(|(_, m)| m.is_turn_boundary())
        .map(|(i, _)| i)
        .collect()
}

fn range_tokens(messages: &[Message], start: usize, end: usize, chars_per_token: f64) -> f64 {
    let chars: usize = messages[start..end].iter().map(Message::content_chars).sum();
    chars as f64 / chars_per_token
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Compression
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Compress old logical turns into a structured summary, keeping recent
/// turns verbatim.
///
/// Handles iterative summaries (a previous `<summary>` in the first old
/// message triggers the update prompt and merges file tracking), splits
/// one oversized terminal turn at safe cut points, and falls back to a
/// raw transcript when the summary call fails.
pub async fn compress_messages(
    summarizer: &dyn Summarizer,
    messages: Vec<Message>,
    context_limit: u64,
    cfg: &CompressionConfig,
    summary_max_tokens: u32,
) -> CompressionOutcome {
    let boundaries = turn_boundaries(&messages);

    // Need at least 2 logical turns (1 to compress + 1 to keep).
    if boundaries.len() < 2 {
        tracing::debug!("not enough logical turns to compress, skipping");
        return CompressionOutcome::unchanged(messages);
    }

    // Walk turns from the end, keeping as many as fit the budget.
    let max_recent_tokens = context_limit as f64 * cfg.recent_turns_token_budget;
    let mut accumulated = 0.0;
    let mut keep_turns = 0usize;

    for idx in (0..boundaries.len()).rev() {
        let turn_start = boundaries[idx];
        let turn_end = if idx + 1 < boundaries.len() {
            boundaries[idx + 1]
        } else {
            messages.len()
        };
        let turn_tokens = range_tokens(&messages, turn_start, turn_end, cfg.chars_per_token);
        if accumulated + turn_tokens > max_recent_tokens && keep_turns >= 1 {
            break;
        }
        accumulated += turn_tokens;
        keep_turns += 1;
        if keep_turns >= cfg.max_recent_turns {
            break;
        }
    }

    if keep_turns >= boundaries.len() {
        tracing::debug!("all turns fit in budget, skipping compression");
        return CompressionOutcome::unchanged(messages);
    }

    let split_point = boundaries[boundaries.len() - keep_turns];
    let old_messages: Vec<Message> = messages[..split_point].to_vec();
    let mut recent_messages: Vec<Message> = messages[split_point..].to_vec();

    tracing::info!(
        keep_turns,
        old = old_messages.len(),
        recent = recent_messages.len(),
        "compressing working context"
    );

    // ── Oversized terminal turn: split at safe cut points ──────────
    let mut turn_prefix_summary: Option<String> = None;
    if keep_turns == 1 {
        let turn_start = *boundaries.last().unwrap();
        let turn_tokens =
            range_tokens(&messages, turn_start, messages.len(), cfg.chars_per_token);
        if turn_tokens > max_recent_tokens * 0.5 {
            if let Some(best_cut) = find_turn_cut(&messages, turn_start, max_recent_tokens, cfg) {
                let turn_prefix: Vec<Message> = messages[turn_start..best_cut].to_vec();
                recent_messages = messages[best_cut..].to_vec();

                tracing::info!(
                    prefix = turn_prefix.len(),
                    suffix = recent_messages.len(),
                    "split oversized terminal turn"
                );

                let prefix_serialized = serialize_messages_for_summary(&turn_prefix);
                let summary = match summarizer
                    .summarize(
                        TURN_PREFIX_SUMMARY_PROMPT,
                        &format!("Summarize this turn prefix:\n\n{prefix_serialized}"),
                        2048,
                    )
                    .await
                {
                    Ok((text, _)) => text,
                    Err(e) => {
                        tracing::warn!(error = %e, "turn prefix summary failed, using raw text");
                        if prefix_serialized.len() > 5000 {
                            let head = &prefix_serialized[..floor_boundary(&prefix_serialized, 2500)];
                            let tail = &prefix_serialized
                                [ceil_boundary(&prefix_serialized, prefix_serialized.len() - 2500)..];
                            format!("{head}\n...\n{tail}")
                        } else {
                            prefix_serialized
                        }
                    }
                };
                turn_prefix_summary = Some(summary);
            }
        }
    }

    // ── Cumulative file tracking ───────────────────────────────────
    let (mut read_files, mut modified_files) = extract_file_operations(&old_messages);

    // ── Iterative compression detection ────────────────────────────
    let mut previous_summary_text: Option<String> = None;
    if let Some(first) = old_messages.first() {
        if first.role == Role::User {
            if let MessageContent::Text(text) = &first.content {
                if text.contains("<summary>") {
                    let re = regex::Regex::new(r"(?s)<summary>(.*?)</summary>").unwrap();
                    if let Some(caps) = re.captures(text) {
                        previous_summary_text = Some(caps[1].trim().to_string());
                    }
                    let (prev_read, prev_mod) = extract_previous_file_tracking(text);
                    read_files.extend(prev_read);
                    modified_files.extend(prev_mod);
                }
            }
        }
    }

    let file_tracking = build_file_tracking_section(&read_files, &modified_files);

    // ── Summarize ──────────────────────────────────────────────────
    let mut summary_input_tokens = 0u64;
    let mut summary_output_tokens = 0u64;

    let (system_prompt, user_content) = match &previous_summary_text {
        Some(prev) => {
            // Iterative: pass only the messages since the last summary,
            // skipping the synthetic acknowledgment.
            let new_messages: Vec<Message> = old_messages[1..]
                .iter()
                .filter(|m| !is_ack_message(m))
                .cloned()
                .collect();
            let serialized = if new_messages.is_empty() {
                String::new()
            } else {
                serialize_messages_for_summary(&new_messages)
            };
            let system = SUMMARY_UPDATE_PROMPT
                .replace("{previous_summary}", prev)
                .replace("{file_tracking_section}", &file_tracking);
            let user = if serialized.is_empty() {
                "No new messages to add.".to_string()
            } else {
                format!("Please update the summary with these new conversation messages:\n\n{serialized}")
            };
            tracing::debug!("using iterative summary update");
            (system, user)
        }
        None => {
            let serialized = serialize_messages_for_summary(&old_messages);
            let system = SUMMARY_SYSTEM_PROMPT.replace("{file_tracking_section}", &file_tracking);
            let user = format!("Please summarize the following conversation:\n\n{serialized}");
            (system, user)
        }
    };

    let mut summary_text = match summarizer
        .summarize(&system_prompt, &user_content, summary_max_tokens)
        .await
    {
        Ok((text, usage)) => {
            summary_input_tokens = usage.input_tokens;
            summary_output_tokens = usage.output_tokens;
            text
        }
        Err(e) => {
            // Fallback: a truncated raw transcript still carries the
            // thread; compression is never fatal.
            tracing::warn!(error = %e, "summary call failed, using raw transcript fallback");
            let mut fallback = match &previous_summary_text {
                Some(prev) => prev.clone(),
                None => serialize_messages_for_summary(&old_messages),
            };
            if fallback.len() > 10_000 {
                let head = &fallback[..floor_boundary(&fallback, 5000)];
                let tail = &fallback[ceil_boundary(&fallback, fallback.len() - 5000)..];
                fallback = format!("{head}\n\n[... truncated ...]\n\n{tail}");
            }
            fallback
        }
    };

    // ── Assemble the compression message ───────────────────────────
    if !summary_text.contains("<summary>") {
        summary_text = format!("<summary>\n{summary_text}\n</summary>");
    }

    if !file_tracking.is_empty()
        && !summary_text.contains("<read-files>")
        && !summary_text.contains("<modified-files>")
    {
        let trimmed = summary_text.trim_end();
        summary_text = if let Some(stripped) = trimmed.strip_suffix("</summary>") {
            format!("{stripped}\n\n{file_tracking}\n</summary>")
        } else {
            format!("{trimmed}\n\n{file_tracking}")
        };
    }

    if let Some(prefix) = turn_prefix_summary {
        summary_text.push_str(&format!("\n\n[Recent turn prefix context]:\n{prefix}"));
    }

    let compression_content = format!(
        "This session is being continued from a previous conversation that ran out of context. \
         The summary below covers the earlier portion of the conversation.\n\n\
         {summary_text}\n\n\
         Please continue the conversation from where we left off without asking the user any \
         further questions. Continue with the last task that you were asked to work on."
    );

    let mut compressed = vec![Message::user(compression_content)];
    if recent_messages
        .first()
        .map(|m| m.role == Role::User)
        .unwrap_or(false)
    {
        compressed.push(Message::assistant_blocks(vec![ContentBlock::Text {
            text: ACK_TEXT.to_string(),
        }]));
    }
    compressed.extend(recent_messages);

    tracing::info!(
        from = messages.len(),
        to = compressed.len(),
        "working context compressed"
    );

    CompressionOutcome {
        messages: compressed,
        summary_input_tokens,
        summary_output_tokens,
        compressed: true,
    }
}

/// The synthetic acknowledgment inserted by a previous compression.
fn is_ack_message(msg: &Message) -> bool {
    if msg.role != Role::Assistant {
        return false;
    }
    match &msg.content {
        MessageContent::Blocks(blocks) => blocks.iter().any(|b| {
            matches!(b, ContentBlock::Text { text } if text.contains("I understand the context"))
        }),
        MessageContent::Text(t) => t.contains("I understand the context"),
    }
}

/// Find the cut index for an oversized terminal turn.
///
/// Valid cuts are assistant messages not immediately followed by a
/// tool_result carrier (cutting there would orphan the pair). Walking
/// from the end and accumulating suffix tokens, the cut keeping the
/// largest suffix that still fits the budget wins; among equal-budget
/// candidates that is the latest cut still under budget. If even the
/// smallest suffix overflows, the latest cut is used so the kept
/// suffix stays minimal.
fn find_turn_cut(
    messages: &[Message],
    turn_start: usize,
    max_recent_tokens: f64,
    cfg: &CompressionConfig,
) -> Option<usize> {
    let turn_end = messages.len();
    let cut_points: Vec<usize> = (turn_start + 1..turn_end)
        .filter(|&i| {
            if messages[i].role != Role::Assistant {
                return false;
            }
            match messages.get(i + 1) {
                Some(next) => !next.has_tool_results(),
                None => true,
            }
        })
        .collect();

    if cut_points.is_empty() {
        return None;
    }

    let mut best_cut: Option<usize> = None;
    let mut acc = 0.0;
    for i in (turn_start + 1..turn_end).rev() {
        acc += messages[i].content_chars() as f64 / cfg.chars_per_token;
        if acc > max_recent_tokens {
            break;
        }
        if cut_points.contains(&i) {
            best_cut = Some(i);
        }
    }
    let best = best_cut.or_else(|| cut_points.last().copied())?;
    (best > turn_start).then_some(best)
}

fn floor_boundary(s: &str, mut idx: usize) -> usize {
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn ceil_boundary(s: &str, mut idx: usize) -> usize {
    while idx < s.len() && !s.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use sk_domain::error::Error;

    /// Scripted summarizer: returns a fixed summary, or fails.
    struct FakeSummarizer {
        text: String,
        fail: bool,
        calls: std::sync::Mutex<Vec<(String, String)>>,
    }

    impl FakeSummarizer {
        fn returning(text: &str) -> Self {
            Self {
                text: text.to_string(),
                fail: false,
                calls: std::sync::Mutex::new(Vec::new()),
            }
        }

        fn failing() -> Self {
            Self {
                text: String::new(),
                fail: true,
                calls: std::sync::Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait::async_trait]
    impl Summarizer for FakeSummarizer {
        async fn summarize(
            &self,
            system: &str,
            user_text: &str,
            _max_tokens: u32,
        ) -> Result<(String, Usage)> {
            self.calls
                .lock()
                .unwrap()
                .push((system.to_string(), user_text.to_string()));
            if self.fail {
                return Err(Error::Http("connection reset by peer".into()));
            }
            Ok((
                self.text.clone(),
                Usage {
                    input_tokens: 100,
                    output_tokens: 50,
                },
            ))
        }
    }

    fn cfg() -> CompressionConfig {
        CompressionConfig::default()
    }

    fn tool_turn(i: usize, padding: usize) -> Vec<Message> {
        let pad = "x".repeat(padding);
        vec![
            Message::user(format!("task {i}: {pad}")),
            Message::assistant_blocks(vec![ContentBlock::ToolUse {
                id: format!("tu_{i}"),
                name: "read_file".into(),
                input: serde_json::json!({"file_path": format!("/src/file{i}.rs")}),
            }]),
            Message::tool_results(vec![ContentBlock::ToolResult {
                tool_use_id: format!("tu_{i}"),
                content: format!("contents of file {i}: {pad}"),
                is_error: false,
            }]),
            Message::assistant(format!("done with task {i}")),
        ]
    }

    fn many_turns(n: usize, padding: usize) -> Vec<Message> {
        (0..n).flat_map(|i| tool_turn(i, padding)).collect()
    }

    /// Every tool_use id has exactly one matching tool_result somewhere
    /// later, and vice versa (pairing invariant).
    fn assert_pairing(messages: &[Message]) {
        let mut uses = Vec::new();
        let mut results = Vec::new();
        for msg in messages {
            if let MessageContent::Blocks(blocks) = &msg.content {
                for block in blocks {
                    match block {
                        ContentBlock::ToolUse { id, .. } => uses.push(id.clone()),
                        ContentBlock::ToolResult { tool_use_id, .. } => {
                            results.push(tool_use_id.clone())
                        }
                        _ => {}
                    }
                }
            }
        }
        uses.sort();
        results.sort();
        assert_eq!(uses, results, "tool_use/tool_result pairing broken");
    }

    #[test]
    fn threshold_is_strict() {
        assert!(!should_compress(3500, 5000, 0.70));
        assert!(should_compress(3501, 5000, 0.70));
        assert!(!should_compress(0, 5000, 0.70));
    }

    #[tokio::test]
    async fn too_few_turns_returns_unchanged() {
        let summarizer = FakeSummarizer::returning("<summary>s</summary>");
        let messages = tool_turn(0, 10);
        let outcome = compress_messages(&summarizer, messages.clone(), 5_000, &cfg(), 4096).await;
        assert!(!outcome.compressed);
        assert_eq!(outcome.messages.len(), messages.len());
        assert!(summarizer.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn compression_reduces_message_count() {
        let summarizer = FakeSummarizer::returning(
            "<summary>\n## Primary Request and Intent\nwork\n</summary>",
        );
        // 8 turns of ~2000 chars each against a 5000-token limit: the
        // 1250-token recent budget keeps only the newest turn.
        let messages = many_turns(8, 2000);
        let original_len = messages.len();
        let outcome = compress_messages(&summarizer, messages, 5_000, &cfg(), 4096).await;

        assert!(outcome.compressed);
        assert!(outcome.messages.len() < original_len);
        assert!(outcome.summary_input_tokens > 0);

        // First message is the compression message.
        let first_text = outcome.messages[0].content.extract_all_text();
        assert!(first_text.contains("<summary>"));
        assert!(first_text.contains("ran out of context"));

        assert_pairing(&outcome.messages);
    }

    #[tokio::test]
    async fn ack_inserted_when_recent_starts_with_user() {
        let summarizer = FakeSummarizer::returning("<summary>s</summary>");
        // Heavy old turns, one light terminal turn: the whole last turn
        // is kept verbatim (no split) and starts at a user boundary.
        let mut messages = many_turns(7, 2000);
        messages.extend(tool_turn(7, 10));
        let outcome = compress_messages(&summarizer, messages, 5_000, &cfg(), 4096).await;

        // Recent turns begin at a user boundary, so an acknowledgment
        // must restore user/assistant alternation.
        assert_eq!(outcome.messages[0].role, Role::User);
        assert_eq!(outcome.messages[1].role, Role::Assistant);
        assert!(is_ack_message(&outcome.messages[1]));
        assert_eq!(outcome.messages[2].role, Role::User);
    }

    #[tokio::test]
    async fn file_tracking_appended_inside_summary() {
        let summarizer = FakeSummarizer::returning("<summary>\nwork so far\n</summary>");
        let messages = many_turns(8, 2000);
        let outcome = compress_messages(&summarizer, messages, 5_000, &cfg(), 4096).await;

        let first_text = outcome.messages[0].content.extract_all_text();
        assert!(first_text.contains("<read-files>"));
        assert!(first_text.contains("/src/file0.rs"));
        // Inserted before the closing tag.
        let read_pos = first_text.find("<read-files>").unwrap();
        let close_pos = first_text.find("</summary>").unwrap();
        assert!(read_pos < close_pos);
    }

    #[tokio::test]
    async fn iterative_compression_uses_update_prompt_and_merges_files() {
        // Round 1.
        let summarizer = FakeSummarizer::returning("<summary>\nround one\n</summary>");
        let messages = many_turns(8, 2000);
        let round1 = compress_messages(&summarizer, messages, 5_000, &cfg(), 4096).await;
        assert!(round1.compressed);

        // Grow the context again with turns that write a new file.
        let mut grown = round1.messages.clone();
        for i in 100..106 {
            grown.push(Message::user(format!("next {i}: {}", "y".repeat(2000))));
            grown.push(Message::assistant_blocks(vec![ContentBlock::ToolUse {
                id: format!("tu_{i}"),
                name: "write_file".into(),
                input: serde_json::json!({"file_path": "/app/out.txt", "content": "z"}),
            }]));
            grown.push(Message::tool_results(vec![ContentBlock::ToolResult {
                tool_use_id: format!("tu_{i}"),
                content: "ok".into(),
                is_error: false,
            }]));
            grown.push(Message::assistant(format!("wrote {i}")));
        }

        let summarizer2 = FakeSummarizer::returning("<summary>\nround two\n</summary>");
        let round2 = compress_messages(&summarizer2, grown, 5_000, &cfg(), 4096).await;
        assert!(round2.compressed);

        // The update prompt embeds the previous summary verbatim.
        let calls = summarizer2.calls.lock().unwrap();
        let (system, user) = &calls[0];
        assert!(system.contains("<previous-summary>"));
        assert!(system.contains("round one"));
        assert!(user.contains("update the summary"));

        // Exactly one <summary> open tag in the new first message, and
        // file sets merged monotonically: old reads + new write.
        let first_text = round2.messages[0].content.extract_all_text();
        assert_eq!(first_text.matches("<summary>").count(), 1);
        assert!(first_text.contains("/src/file0.rs"));
        assert!(first_text.contains("/app/out.txt"));
    }

    #[tokio::test]
    async fn summary_failure_falls_back_to_transcript() {
        let summarizer = FakeSummarizer::failing();
        let messages = many_turns(8, 2000);
        let outcome = compress_messages(&summarizer, messages, 5_000, &cfg(), 4096).await;

        assert!(outcome.compressed);
        assert_eq!(outcome.summary_input_tokens, 0);
        let first_text = outcome.messages[0].content.extract_all_text();
        // Fallback transcript still gets wrapped and framed.
        assert!(first_text.contains("<summary>"));
        assert!(first_text.contains("task 0"));
        assert_pairing(&outcome.messages);
    }

    #[tokio::test]
    async fn oversized_terminal_turn_is_split_at_safe_cut() {
        let summarizer = FakeSummarizer::returning("<summary>s</summary>");

        // Two turns; the second is one giant turn with several
        // tool_use/tool_result pairs and safe cuts between them.
        let mut messages = tool_turn(0, 100);
        messages.push(Message::user(format!("big task: {}", "z".repeat(400))));
        for i in 10..20 {
            messages.push(Message::assistant_blocks(vec![ContentBlock::ToolUse {
                id: format!("tu_{i}"),
                name: "bash".into(),
                input: serde_json::json!({"command": format!("step {i}: {}", "w".repeat(1500))}),
            }]));
            messages.push(Message::tool_results(vec![ContentBlock::ToolResult {
                tool_use_id: format!("tu_{i}"),
                content: "v".repeat(1500),
                is_error: false,
            }]));
            // Safe cut: plain assistant text after the pair closes.
            messages.push(Message::assistant(format!("step {i} done: {}", "q".repeat(1500))));
        }

        let outcome = compress_messages(&summarizer, messages, 5_000, &cfg(), 4096).await;
        assert!(outcome.compressed);

        let first_text = outcome.messages[0].content.extract_all_text();
        assert!(first_text.contains("[Recent turn prefix context]"));
        assert_pairing(&outcome.messages);
    }

    #[test]
    fn find_turn_cut_never_lands_mid_pair() {
        let mut messages = vec![Message::user("t")];
        messages.push(Message::assistant_blocks(vec![ContentBlock::ToolUse {
            id: "tu_1".into(),
            name: "bash".into(),
            input: serde_json::json!({}),
        }]));
        messages.push(Message::tool_results(vec![ContentBlock::ToolResult {
            tool_use_id: "tu_1".into(),
            content: "r".into(),
            is_error: false,
        }]));
        messages.push(Message::assistant("after pair"));

        let cut = find_turn_cut(&messages, 0, 1.0, &cfg()).unwrap();
        // The only legal cut is the trailing plain assistant message,
        // index 3 — never index 1 (its tool_result follows).
        assert_eq!(cut, 3);
    }

    #[tokio::test]
    async fn serialize_truncates_tool_payloads() {
        let messages = vec![
            Message::assistant_blocks(vec![ContentBlock::ToolUse {
                id: "tu_1".into(),
                name: "bash".into(),
                input: serde_json::json!({"command": "c".repeat(2000)}),
            }]),
            Message::tool_results(vec![ContentBlock::ToolResult {
                tool_use_id: "tu_1".into(),
                content: "r".repeat(5000),
                is_error: false,
            }]),
        ];
        let text = serialize_messages_for_summary(&messages);
        assert!(text.contains("...(truncated)"));
        // 500-char cap on inputs, 1000 on results, plus labels.
        assert!(text.len() < 2_000);
    }

    #[test]
    fn estimate_tokens_uses_chars_per_token() {
        let messages = vec![Message::user("x".repeat(350))];
        let tokens = estimate_tokens(&messages, 3.5);
        // 350 chars plus JSON quotes, divided by 3.5.
        assert!((100..=101).contains(&tokens));
    }
}
