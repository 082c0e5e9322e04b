//! Shared test fixtures: a scripted LLM client and engine deps wired to
//! temp directories.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use sk_domain::error::{Error, Result};
use sk_domain::message::ContentBlock;
use sk_domain::stream::{BoxStream, LlmStreamEvent, StopReason, Usage};
use sk_engine::agent::EngineDeps;
use sk_engine::trace::TraceStore;
use sk_mcp_client::McpManager;
use sk_providers::{LlmClient, LlmRequest, LlmResponse};
use sk_sessions::SessionStore;
use sk_skills::SkillsRegistry;

/// One scripted reply: a full response or an error to surface.
#[derive(Debug)]
pub enum Scripted {
    Reply(LlmResponse),
    Fail(Error),
}

/// An LLM client that pops scripted replies in order. Both `call` and
/// `call_stream` consume from the same queue, so scripts also cover the
/// compressor's nested summary calls.
#[derive(Debug)]
pub struct MockLlm {
    script: Mutex<VecDeque<Scripted>>,
    context_limit: u64,
    pub calls: AtomicU32,
}

impl MockLlm {
    pub fn new(script: Vec<Scripted>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            context_limit: 200_000,
            calls: AtomicU32::new(0),
        })
    }

    pub fn with_context_limit(script: Vec<Scripted>, context_limit: u64) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            context_limit,
            calls: AtomicU32::new(0),
        })
    }

    fn next(&self) -> Result<LlmResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.script.lock().unwrap().pop_front() {
            Some(Scripted::Reply(resp)) => Ok(resp),
            Some(Scripted::Fail(err)) => Err(err),
            None => Err(Error::Other("mock script exhausted".into())),
        }
    }
}

#[async_trait::async_trait]
impl LlmClient for MockLlm {
    async fn call(&self, _req: &LlmRequest) -> Result<LlmResponse> {
        self.next()
    }

    async fn call_stream(
        &self,
        _req: &LlmRequest,
    ) -> Result<BoxStream<'static, Result<LlmStreamEvent>>> {
        let resp = self.next()?;
        let mut items: Vec<Result<LlmStreamEvent>> = Vec::new();
        for block in &resp.content {
            match block {
                ContentBlock::Text { text } => {
                    // Chunk text so streaming consumers see real deltas.
                    for chunk in text.as_bytes().chunks(8) {
                        items.push(Ok(LlmStreamEvent::TextDelta {
                            text: String::from_utf8_lossy(chunk).to_string(),
                        }));
                    }
                }
                ContentBlock::ToolUse { id, name, input } => {
                    items.push(Ok(LlmStreamEvent::ToolUseStarted {
                        id: id.clone(),
                        name: name.clone(),
                    }));
                    items.push(Ok(LlmStreamEvent::ToolUseFinished {
                        id: id.clone(),
                        name: name.clone(),
                        input: input.clone(),
                    }));
                }
                _ => {}
            }
        }
        items.push(Ok(LlmStreamEvent::Done {
            usage: Some(resp.usage),
            stop_reason: Some(resp.stop_reason.clone()),
        }));
        Ok(Box::pin(futures_util::stream::iter(items)))
    }

    fn context_limit(&self) -> u64 {
        self.context_limit
    }

    fn provider_id(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        "mock-model"
    }
}

// ── Response builders ──────────────────────────────────────────────

pub fn text_reply(text: &str, input_tokens: u64) -> Scripted {
    Scripted::Reply(LlmResponse {
        content: vec![ContentBlock::Text { text: text.into() }],
        stop_reason: StopReason::EndTurn,
        usage: Usage {
            input_tokens,
            output_tokens: 10,
        },
        model: "mock-model".into(),
    })
}

pub fn tool_reply(id: &str, name: &str, input: serde_json::Value, input_tokens: u64) -> Scripted {
    Scripted::Reply(LlmResponse {
        content: vec![ContentBlock::ToolUse {
            id: id.into(),
            name: name.into(),
            input,
        }],
        stop_reason: StopReason::ToolUse,
        usage: Usage {
            input_tokens,
            output_tokens: 20,
        },
        model: "mock-model".into(),
    })
}

pub fn truncated_tool_reply(id: &str, name: &str, input: serde_json::Value) -> Scripted {
    Scripted::Reply(LlmResponse {
        content: vec![ContentBlock::ToolUse {
            id: id.into(),
            name: name.into(),
            input,
        }],
        stop_reason: StopReason::MaxTokens,
        usage: Usage {
            input_tokens: 50,
            output_tokens: 999,
        },
        model: "mock-model".into(),
    })
}

// ── Engine deps ────────────────────────────────────────────────────

pub fn deps(tmp: &tempfile::TempDir) -> EngineDeps {
    EngineDeps {
        config: Default::default(),
        skills: Arc::new(SkillsRegistry::empty()),
        mcp: Arc::new(McpManager::new()),
        traces: Arc::new(TraceStore::new(&tmp.path().join("state")).unwrap()),
        sessions: Arc::new(SessionStore::new(&tmp.path().join("state")).unwrap()),
        workspace_root: tmp.path().join("workspaces"),
    }
}
