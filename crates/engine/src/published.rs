//! Published chat front — a thin adapter over the engine for published
//! agent presets.
//!
//! Resolves the preset, enforces the published transport mode, wires
//! session load/save around the run, and pre-compresses an oversized
//! working context before the first LLM call of the request.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use sk_domain::error::{Error, Result};
use sk_domain::message::Message;
use sk_providers::LlmClient;

use crate::agent::{Agent, EngineDeps, RunInput, RunOptions};
use crate::cancel::{CancelMap, CancelToken};
use crate::compress::{self, ClientSummarizer};
use crate::event_stream::EventStream;
use crate::events::StreamEvent;
use crate::result::AgentResult;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Presets
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiResponseMode {
    Streaming,
    NonStreaming,
}

/// A reusable agent configuration. Only published presets are reachable
/// through this front.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentPreset {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Skills bound to this preset; `None` means all.
    #[serde(default)]
    pub skill_names: Option<Vec<String>>,
    #[serde(default)]
    pub mcp_servers: Vec<String>,
    /// Built-in tools to enable; `None` means all.
    #[serde(default)]
    pub builtin_tools: Option<Vec<String>>,
    pub max_turns: u32,
    pub model_provider: String,
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default)]
    pub is_published: bool,
    /// Required transport mode; unset means the preset is unpublished.
    #[serde(default)]
    pub api_response_mode: Option<ApiResponseMode>,
    #[serde(default)]
    pub executor_name: Option<String>,
}

/// In-memory preset registry.
#[derive(Default)]
pub struct PresetStore {
    presets: RwLock<HashMap<String, AgentPreset>>,
}

impl PresetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, preset: AgentPreset) {
        self.presets.write().insert(preset.id.clone(), preset);
    }

    pub fn get(&self, id: &str) -> Option<AgentPreset> {
        self.presets.read().get(id).cloned()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Published chat
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct PublishedChat {
    deps: EngineDeps,
    presets: Arc<PresetStore>,
    /// Active cancel tokens by session id, for stop requests.
    cancels: Arc<CancelMap>,
    /// Injected LLM client for tests; production builds from the preset.
    client_override: Option<Arc<dyn LlmClient>>,
}

impl PublishedChat {
    pub fn new(deps: EngineDeps, presets: Arc<PresetStore>) -> Self {
        // Workspaces from runs that died with a previous process are
        // orphans; clear them before serving requests.
        sk_tools::workspace::reap_stale_workspaces(&deps.workspace_root);
        Self {
            deps,
            presets,
            cancels: Arc::new(CancelMap::new()),
            client_override: None,
        }
    }

    /// Cancel the in-flight run for a session, if any.
    pub fn stop(&self, session_id: &str) -> bool {
        self.cancels.cancel(session_id)
    }

    pub fn with_client_override(mut self, client: Arc<dyn LlmClient>) -> Self {
        self.client_override = Some(client);
        self
    }

    /// Streaming chat: returns the session id and the event receiver.
    /// The run (and its session save) continues in the background.
    pub async fn run_streaming(
        &self,
        preset_id: &str,
        request: &str,
        session_id: Option<&str>,
    ) -> Result<(String, mpsc::Receiver<StreamEvent>, CancelToken)> {
        let preset = self.resolve(preset_id, ApiResponseMode::Streaming)?;
        let (agent, history, session_id) = self.prepare(&preset, session_id).await?;

        let (events, rx) = EventStream::bounded(self.deps.config.limits.event_capacity);
        let cancel = self.cancels.register(&session_id);

        let deps = self.deps.clone();
        let cancels = self.cancels.clone();
        let request = request.to_string();
        let sid = session_id.clone();
        let input = RunInput {
            request: request.clone(),
            conversation_history: history,
            image_contents: Vec::new(),
            event_stream: Some(events),
            cancellation: Some(cancel.clone()),
        };
        tokio::spawn(async move {
            let result = agent.run(input).await;
            cancels.remove(&sid);
            save_session(&deps, &sid, &request, &result);
            agent.cleanup();
        });

        Ok((session_id, rx, cancel))
    }

    /// Non-streaming chat: runs to completion and returns the result.
    pub async fn run_blocking(
        &self,
        preset_id: &str,
        request: &str,
        session_id: Option<&str>,
    ) -> Result<(AgentResult, String)> {
        let preset = self.resolve(preset_id, ApiResponseMode::NonStreaming)?;
        let (agent, history, session_id) = self.prepare(&preset, session_id).await?;

        let input = RunInput {
            request: request.to_string(),
            conversation_history: history,
            image_contents: Vec::new(),
            event_stream: None,
            cancellation: None,
        };
        let result = agent.run(input).await;
        save_session(&self.deps, &session_id, request, &result);
        agent.cleanup();

        Ok((result, session_id))
    }

    // ── Internals ──────────────────────────────────────────────────

    /// Resolve a preset and enforce its published transport mode.
    fn resolve(&self, preset_id: &str, requested: ApiResponseMode) -> Result<AgentPreset> {
        let preset = self
            .presets
            .get(preset_id)
            .ok_or_else(|| Error::InvalidRequest(format!("unknown agent '{preset_id}'")))?;
        if !preset.is_published {
            return Err(Error::InvalidRequest(format!(
                "agent '{}' is not published",
                preset.name
            )));
        }
        let mode = preset.api_response_mode.ok_or_else(|| {
            Error::InvalidRequest(format!("agent '{}' is not published", preset.name))
        })?;
        if mode != requested {
            let expected = match mode {
                ApiResponseMode::Streaming => "streaming",
                ApiResponseMode::NonStreaming => "non-streaming",
            };
            return Err(Error::InvalidRequest(format!(
                "agent '{}' only supports {expected} requests",
                preset.name
            )));
        }
        Ok(preset)
    }

    /// Load the session, pre-compress an oversized working context, and
    /// build the agent from the preset.
    async fn prepare(
        &self,
        preset: &AgentPreset,
        session_id: Option<&str>,
    ) -> Result<(Agent, Vec<Message>, String)> {
        let (record, _is_new) = self.deps.sessions.load_or_create(&preset.id, session_id);
        let session_id = record.session_id.clone();

        let options = RunOptions {
            max_turns: preset.max_turns,
            model_provider: preset.model_provider.clone(),
            model: preset.model_name.clone(),
            skills_allowlist: preset.skill_names.clone(),
            tools_allowlist: preset.builtin_tools.clone(),
            mcp_servers: preset.mcp_servers.clone(),
            custom_system_prompt: preset.system_prompt.clone(),
            executor_name: preset.executor_name.clone(),
            session_id: Some(session_id.clone()),
            workspace_id: None,
        };
        let agent = match &self.client_override {
            Some(client) => Agent::build_with_client(&self.deps, options, client.clone())?,
            None => Agent::build(&self.deps, options)?,
        };

        let mut history = record.working_context().to_vec();

        // Pre-compress when the loaded context already predicts a
        // threshold crossing on the next call.
        let cfg = &self.deps.config.compression;
        let estimated = compress::estimate_tokens(&history, cfg.chars_per_token);
        if compress::should_compress(estimated, agent.client().context_limit(), cfg.threshold_ratio)
        {
            tracing::info!(
                session_id = %session_id,
                estimated,
                "pre-compressing session context"
            );
            let summarizer = ClientSummarizer::new(agent.client().clone());
            let outcome = compress::compress_messages(
                &summarizer,
                history,
                agent.client().context_limit(),
                cfg,
                self.deps.config.limits.summary_max_tokens,
            )
            .await;
            history = outcome.messages;
            if outcome.compressed {
                if let Err(e) = self
                    .deps
                    .sessions
                    .checkpoint_context(&session_id, history.clone())
                {
                    tracing::warn!(error = %e, "failed to persist pre-compressed context");
                }
            }
        }

        Ok((agent, history, session_id))
    }
}

/// Session save order after a run: checkpoint the working context, then
/// append the display exchange. Failures are logged, never raised — the
/// next request recovers from whichever field is freshest.
fn save_session(deps: &EngineDeps, session_id: &str, request: &str, result: &AgentResult) {
    if let Err(e) = deps
        .sessions
        .checkpoint_context(session_id, result.final_messages.clone())
    {
        tracing::warn!(error = %e, session_id, "failed to checkpoint agent context");
    }
    if let Err(e) = deps.sessions.append_messages(
        session_id,
        vec![
            Message::user(request),
            Message::assistant(result.answer.clone()),
        ],
    ) {
        tracing::warn!(error = %e, session_id, "failed to append display messages");
    }
    if let Err(e) = deps.sessions.flush() {
        tracing::warn!(error = %e, "failed to flush session store");
    }
}
