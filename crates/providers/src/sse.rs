//! Shared SSE streaming infrastructure for all provider adapters.
//!
//! Every provider follows the same pattern: receive a `reqwest::Response`,
//! buffer chunks, split on `\n\n`, extract `data:` payloads, and feed each
//! payload to a provider-specific parser that returns
//! `Vec<Result<LlmStreamEvent>>`.
//!
//! This module extracts that shared logic into two functions:
//! - [`drain_data_lines`] -- pull complete `data:` payloads from an SSE buffer
//! - [`sse_response_stream`] -- build a `BoxStream` from a response + parser closure

use crate::util::from_reqwest;
use sk_domain::error::Result;
use sk_domain::stream::{BoxStream, LlmStreamEvent, StopReason};

/// Extract complete `data:` payloads from an SSE buffer.
///
/// SSE events are delimited by `\n\n`.  Each event block may contain
/// `event:`, `data:`, `id:`, or `retry:` lines.  We only care about
/// `data:` lines.
///
/// The buffer is drained in-place: consumed bytes are removed and any
/// trailing partial event remains for the next call.
pub(crate) fn drain_data_lines(buffer: &mut String) -> Vec<String> {
    let mut data_lines = Vec::new();

    while let Some(pos) = buffer.find("\n\n") {
        let block: String = buffer.drain(..pos).collect();
        buffer.drain(..2); // remove the \n\n delimiter

        for line in block.lines() {
            let line = line.trim();
            if let Some(data) = line.strip_prefix("data:") {
                let data = data.trim();
                if !data.is_empty() {
                    data_lines.push(data.to_string());
                }
            }
        }
    }

    data_lines
}

/// Build a [`BoxStream`] from an SSE `reqwest::Response` and a provider-specific
/// parser closure.
///
/// The closure receives each `data:` payload string and returns zero or more
/// stream events.  It is `FnMut` (not `Fn`) because some providers (Anthropic)
/// need mutable state across calls (tool-call assembly).
///
/// The stream automatically:
/// 1. Buffers incoming chunks and drains complete SSE events
/// 2. Flushes the remaining buffer when the response body closes
/// 3. Emits a fallback `Done` event if the parser never produced one
pub(crate) fn sse_response_stream<F>(
    response: reqwest::Response,
    mut parse_data: F,
) -> BoxStream<'static, Result<LlmStreamEvent>>
where
    F: FnMut(&str) -> Vec<Result<LlmStreamEvent>> + Send + 'static,
{
    let stream = async_stream::stream! {
        let mut response = response;
        let mut buffer = String::new();
        let mut done_emitted = false;

        loop {
            match response.chunk().await {
                Ok(Some(bytes)) => {
                    buffer.push_str(&String::from_utf8_lossy(&bytes));

                    let data_lines = drain_data_lines(&mut buffer);
                    for data in data_lines {
                        let events = parse_data(&data);
                        for event in events {
                            if matches!(&event, Ok(LlmStreamEvent::Done { .. })) {
                                done_emitted = true;
                            }
                            yield event;
                        }
                    }
                }
                Ok(None) => {
                    // Stream ended -- flush any remaining partial event.
                    if !buffer.trim().is_empty() {
                        buffer.push_str("\n\n");
                        let data_lines = drain_data_lines(&mut buffer);
                        for data in data_lines {
                            let events = parse_data(&data);
                            for event in events {
                                if matches!(&event, Ok(LlmStreamEvent::Done { .. })) {
                                    done_emitted = true;
                                }
                                yield event;
                            }
                        }
                    }
                    break;
                }
                Err(e) => {
                    yield Err(from_reqwest(e));
                    break;
                }
            }
        }

        if !done_emitted {
            yield Ok(LlmStreamEvent::Done {
                usage: None,
                stop_reason: Some(StopReason::EndTurn),
            });
        }
    };

    Box::pin(stream)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
