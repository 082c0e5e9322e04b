use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Engine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Top-level engine configuration. Every field has a serde default so a
/// partial config file (or none at all) yields a working engine.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub compression: CompressionConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub tools: ToolExecConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Limits
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Per-request turn budget.
    #[serde(default = "d_60")]
    pub max_turns: u32,
    /// Output-token ceiling for ordinary turns.
    #[serde(default = "d_16384")]
    pub max_output_tokens: u32,
    /// Output-token allowance for the final summary after the turn
    /// budget is exhausted, and for compression summaries.
    #[serde(default = "d_4096")]
    pub summary_max_tokens: u32,
    /// Event-stream channel capacity (bounded; pushes apply backpressure).
    #[serde(default = "d_64")]
    pub event_capacity: usize,
}

impl LimitsConfig {
    /// Clamp a caller-supplied turn budget into the accepted range.
    pub fn clamp_max_turns(requested: u32) -> u32 {
        requested.clamp(1, 60_000)
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_turns: 60,
            max_output_tokens: 16_384,
            summary_max_tokens: 4_096,
            event_capacity: 64,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Compression
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Context-window compression collapses old logical turns into a
/// structured summary once input tokens approach the model's limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    /// Compress when the last call's input tokens exceed this fraction
    /// of the context limit (strict inequality).
    #[serde(default = "d_0_70")]
    pub threshold_ratio: f64,
    /// Recent turns kept verbatim may use up to this fraction of the
    /// context limit.
    #[serde(default = "d_0_25")]
    pub recent_turns_token_budget: f64,
    /// Hard cap on the number of recent logical turns kept verbatim.
    #[serde(default = "d_5")]
    pub max_recent_turns: usize,
    /// Token estimate: serialized characters per token.
    #[serde(default = "d_3_5")]
    pub chars_per_token: f64,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            threshold_ratio: 0.70,
            recent_turns_token_budget: 0.25,
            max_recent_turns: 5,
            chars_per_token: 3.5,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Retry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Retry policy for transient LLM failures. The turn loop owns this;
/// provider adapters never retry internally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "d_3")]
    pub max_retries: u32,
    /// Exponential backoff delays, one per retry attempt.
    #[serde(default = "d_backoffs")]
    pub backoff_secs: Vec<u64>,
}

impl RetryConfig {
    /// Delay before retry `attempt` (1-based). Attempts past the table
    /// reuse the last entry.
    pub fn backoff_for(&self, attempt: u32) -> std::time::Duration {
        let idx = (attempt.saturating_sub(1) as usize).min(self.backoff_secs.len().saturating_sub(1));
        std::time::Duration::from_secs(*self.backoff_secs.get(idx).unwrap_or(&2))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_secs: vec![2, 4, 8],
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool execution
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolExecConfig {
    /// Hard timeout for shell/code execution, seconds.
    #[serde(default = "d_120")]
    pub timeout_sec: u64,
    /// Truncation cap for tool output returned to the model.
    #[serde(default = "d_20000")]
    pub max_output_chars: usize,
}

impl Default for ToolExecConfig {
    fn default() -> Self {
        Self {
            timeout_sec: 120,
            max_output_chars: 20_000,
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_60() -> u32 {
    60
}
fn d_16384() -> u32 {
    16_384
}
fn d_4096() -> u32 {
    4_096
}
fn d_64() -> usize {
    64
}
fn d_0_70() -> f64 {
    0.70
}
fn d_0_25() -> f64 {
    0.25
}
fn d_5() -> usize {
    5
}
fn d_3_5() -> f64 {
    3.5
}
fn d_3() -> u32 {
    3
}
fn d_backoffs() -> Vec<u64> {
    vec![2, 4, 8]
}
fn d_120() -> u64 {
    120
}
fn d_20000() -> usize {
    20_000
}
