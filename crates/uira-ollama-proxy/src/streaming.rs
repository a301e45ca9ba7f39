//! Streaming conversion (SSE -> NDJSON).
//!
//! OpenAI-compatible backends stream Server-Sent Events with `data: {json}`
//! lines and a terminal `data: [DONE]` marker. Ollama clients expect one JSON
//! object per line, the last one carrying `done: true`.
//!
//! [`StreamRelay`] is the synchronous state machine that turns raw backend
//! bytes into [`ChatResponseChunk`]s:
//!
//! ```text
//! Idle -> Open -> Chunk* -> Closing -> Closed
//!           \________________\______-> Errored
//! ```
//!
//! [`relay`] drives it from an async byte stream. The result is pull-based:
//! the backend is only read when the client side asks for the next chunk, so
//! a slow client slows the backend read instead of growing a buffer, and
//! dropping the stream closes the backend connection.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use tracing::{debug, warn};

use crate::error::{ProxyError, ProxyResult};
use crate::ir::{ChatResponseChunk, FinishReason, ToolCall, Usage};
use crate::openai::{self, ChatCompletionChunk, ToolCallDelta};
use crate::translation::{self, parse_arguments};

/// Longest SSE line we are willing to hold while waiting for its newline.
pub const MAX_LINE_BYTES: usize = 4 * 1024 * 1024;

/// Upper bound on buffered arguments for a single streamed tool call.
pub const MAX_TOOL_ARGUMENT_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Idle,
    Open,
    Chunk,
    Closing,
    Closed,
    Errored,
}

/// True once `text` holds a complete JSON object or array.
///
/// Bare scalars are never reported complete: `12` could still become `123`,
/// so they are only released when the stream ends.
pub fn json_value_complete(text: &str) -> bool {
    let trimmed = text.trim();
    let closed = matches!(
        (trimmed.chars().next(), trimmed.chars().last()),
        (Some('{'), Some('}')) | (Some('['), Some(']'))
    );
    closed && serde_json::from_str::<serde::de::IgnoredAny>(trimmed).is_ok()
}

#[derive(Debug, Default)]
struct PendingToolCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

impl PendingToolCall {
    fn into_tool_call(self) -> ToolCall {
        if !self.arguments.trim().is_empty() && !json_value_complete(&self.arguments) {
            warn!(
                name = %self.name,
                "tool call arguments incomplete at end of stream"
            );
        }
        ToolCall {
            id: self.id.unwrap_or_else(translation::synthesize_call_id),
            name: self.name,
            arguments: parse_arguments(&self.arguments),
        }
    }
}

/// Backend index -> the call currently assembled (or last released) there.
#[derive(Debug)]
struct IndexSlot {
    seq: u64,
    id: Option<String>,
}

/// Accumulates streamed tool-call fragments and releases calls in arrival
/// order once their arguments parse.
///
/// Calls are keyed by a sequence number, not by the backend's `index`: some
/// backends send every call at index 0 (or omit it), telling calls apart only
/// by a fresh `id`.
#[derive(Debug, Default)]
struct ToolCallBuffer {
    pending: BTreeMap<u64, PendingToolCall>,
    slots: HashMap<u32, IndexSlot>,
    next_seq: u64,
}

impl ToolCallBuffer {
    fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Sequence number of the call `index`/`id` continues, if any.
    fn continued_call(&self, index: u32, id: Option<&str>) -> Option<u64> {
        let slot = self.slots.get(&index)?;
        let open = self.pending.contains_key(&slot.seq);
        match (slot.id.as_deref(), id) {
            (_, None) => Some(slot.seq),
            (Some(current), Some(id)) if current == id => Some(slot.seq),
            (None, Some(_)) if open => Some(slot.seq),
            _ => None,
        }
    }

    fn push(&mut self, delta: ToolCallDelta) -> ProxyResult<()> {
        let id = delta.id.filter(|id| !id.is_empty());

        let seq = match self.continued_call(delta.index, id.as_deref()) {
            Some(seq) if !self.pending.contains_key(&seq) => {
                warn!(index = delta.index, "ignoring fragment for an already released tool call");
                return Ok(());
            }
            Some(seq) => seq,
            None => {
                let seq = self.next_seq;
                self.next_seq += 1;
                seq
            }
        };
        let slot_id = id.clone().or_else(|| {
            self.slots
                .get(&delta.index)
                .filter(|slot| slot.seq == seq)
                .and_then(|slot| slot.id.clone())
        });
        self.slots.insert(delta.index, IndexSlot { seq, id: slot_id });

        let entry = self.pending.entry(seq).or_default();
        if let Some(id) = id {
            entry.id = Some(id);
        }
        if let Some(function) = delta.function {
            if let Some(name) = function.name {
                entry.name.push_str(&name);
            }
            if let Some(args) = function.arguments {
                entry.arguments.push_str(&args);
            }
        }

        if entry.arguments.len() > MAX_TOOL_ARGUMENT_BYTES {
            return Err(ProxyError::StreamInterrupted(format!(
                "tool call arguments exceeded {} bytes",
                MAX_TOOL_ARGUMENT_BYTES
            )));
        }
        Ok(())
    }

    /// Pop complete calls from the front. Stops at the first incomplete one.
    fn release_ready(&mut self) -> Vec<ToolCall> {
        let mut ready = Vec::new();
        while let Some(entry) = self.pending.first_entry() {
            let call = entry.get();
            if call.name.is_empty() || !json_value_complete(&call.arguments) {
                break;
            }
            ready.push(entry.remove().into_tool_call());
        }
        ready
    }

    fn drain(&mut self) -> Vec<ToolCall> {
        std::mem::take(&mut self.pending)
            .into_values()
            .map(PendingToolCall::into_tool_call)
            .collect()
    }
}

/// Synchronous SSE -> chunk decoder. Knows nothing about sockets or time.
#[derive(Debug)]
pub struct StreamRelay {
    state: RelayState,
    line_buf: Vec<u8>,
    tool_calls: ToolCallBuffer,
    /// Content that arrived while a tool call was still being assembled.
    held_content: String,
    finish_reason: Option<FinishReason>,
    usage: Option<Usage>,
    saw_tool_calls: bool,
    delivered: usize,
    failure: Option<ProxyError>,
}

impl Default for StreamRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamRelay {
    pub fn new() -> Self {
        Self {
            state: RelayState::Idle,
            line_buf: Vec::new(),
            tool_calls: ToolCallBuffer::default(),
            held_content: String::new(),
            finish_reason: None,
            usage: None,
            saw_tool_calls: false,
            delivered: 0,
            failure: None,
        }
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    /// Number of chunks handed out so far.
    pub fn delivered(&self) -> usize {
        self.delivered
    }

    /// Decode one transport fragment. A fragment may end mid-line; the tail is
    /// kept until the next call.
    ///
    /// On a decoding failure the chunks decoded before it are still returned
    /// and the error is parked for [`StreamRelay::take_failure`].
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<ChatResponseChunk> {
        match self.state {
            RelayState::Closing | RelayState::Closed | RelayState::Errored => return Vec::new(),
            RelayState::Idle => self.state = RelayState::Open,
            RelayState::Open | RelayState::Chunk => {}
        }

        // The kept tail never holds a newline, so only the new bytes need scanning.
        let mut scan = self.line_buf.len();
        self.line_buf.extend_from_slice(bytes);
        let mut out = Vec::new();
        let mut consumed = 0;

        while let Some(offset) = self.line_buf[scan..].iter().position(|b| *b == b'\n') {
            let end = scan + offset + 1;
            let line = self.line_buf[consumed..end].to_vec();
            consumed = end;
            scan = end;
            if let Err(e) = self.handle_line(&line, &mut out) {
                self.set_failure(e);
                break;
            }
            if self.state == RelayState::Closing {
                break;
            }
        }

        if self.state == RelayState::Closing {
            self.line_buf.clear();
        } else {
            self.line_buf.drain(..consumed);
        }

        if self.line_buf.len() > MAX_LINE_BYTES {
            self.set_failure(ProxyError::StreamInterrupted(format!(
                "backend sent a line longer than {} bytes",
                MAX_LINE_BYTES
            )));
        }

        if !out.is_empty() && self.state == RelayState::Open {
            self.state = RelayState::Chunk;
        }
        self.delivered += out.len();
        out
    }

    /// End of stream (`[DONE]` or connection close). Flushes buffered tool
    /// calls and content, then returns exactly one terminal chunk last.
    pub fn finish(&mut self) -> Vec<ChatResponseChunk> {
        if matches!(self.state, RelayState::Closed | RelayState::Errored) {
            return Vec::new();
        }
        let mut out = Vec::new();

        if self.state != RelayState::Closing && !self.line_buf.is_empty() {
            let tail = std::mem::take(&mut self.line_buf);
            if let Err(e) = self.handle_line(&tail, &mut out) {
                self.delivered += out.len();
                self.set_failure(e);
                return out;
            }
        }
        self.state = RelayState::Closing;

        let calls = self.tool_calls.drain();
        if !calls.is_empty() {
            self.saw_tool_calls = true;
            out.push(ChatResponseChunk {
                delta_tool_calls: calls,
                ..ChatResponseChunk::default()
            });
        }
        if !self.held_content.is_empty() {
            out.push(ChatResponseChunk::content(std::mem::take(&mut self.held_content)));
        }

        let default_reason = if self.saw_tool_calls {
            FinishReason::ToolCalls
        } else {
            FinishReason::Stop
        };
        out.push(ChatResponseChunk {
            finish_reason: Some(self.finish_reason.unwrap_or(default_reason)),
            usage: self.usage,
            ..ChatResponseChunk::default()
        });

        self.state = RelayState::Closed;
        self.delivered += out.len();
        out
    }

    /// The error that moved the relay to [`RelayState::Errored`], if any.
    pub fn take_failure(&mut self) -> Option<ProxyError> {
        self.failure.take()
    }

    /// Abnormal end. Returns a terminal error chunk when the client has
    /// already seen output; `None` means the error should be reported as a
    /// plain request failure instead.
    pub fn fail(&mut self, err: &ProxyError) -> Option<ChatResponseChunk> {
        if self.state == RelayState::Closed {
            return None;
        }
        self.state = RelayState::Errored;
        if self.delivered == 0 {
            return None;
        }
        self.delivered += 1;
        Some(ChatResponseChunk {
            finish_reason: Some(FinishReason::Error),
            usage: self.usage,
            error: Some(err.to_string()),
            ..ChatResponseChunk::default()
        })
    }

    fn set_failure(&mut self, err: ProxyError) {
        self.state = RelayState::Errored;
        self.failure = Some(err);
    }

    fn handle_line(&mut self, raw: &[u8], out: &mut Vec<ChatResponseChunk>) -> ProxyResult<()> {
        // Lines are complete here, so multi-byte characters are never split.
        let line = String::from_utf8_lossy(raw);
        let line = line.trim_end_matches(['\r', '\n']);

        let Some(data) = line.strip_prefix("data:") else {
            // Blank separators, `event:`, `id:` and `: keep-alive` comments.
            return Ok(());
        };
        let data = data.trim();
        if data.is_empty() {
            return Ok(());
        }
        if data == "[DONE]" {
            self.state = RelayState::Closing;
            return Ok(());
        }

        let chunk: ChatCompletionChunk = match serde_json::from_str(data) {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!(error = %e, line = %data, "skipping malformed backend SSE line");
                return Ok(());
            }
        };

        if let Some(error) = &chunk.error {
            let message = openai::error_message_from_value(&serde_json::json!({ "error": error }))
                .unwrap_or_else(|| error.to_string());
            return Err(ProxyError::StreamInterrupted(message));
        }

        if let Some(usage) = chunk.usage.and_then(translation::usage_from_backend) {
            self.usage = Some(usage);
        }

        let Some(choice) = chunk.choices.into_iter().find(|c| c.index == 0) else {
            return Ok(());
        };
        if let Some(reason) = choice.finish_reason.as_deref() {
            self.finish_reason = Some(FinishReason::from_openai(reason));
        }

        if let Some(text) = choice.delta.content.filter(|t| !t.is_empty()) {
            if self.tool_calls.is_empty() {
                out.push(ChatResponseChunk::content(text));
            } else {
                self.held_content.push_str(&text);
            }
        }

        for delta in choice.delta.tool_calls.unwrap_or_default() {
            self.tool_calls.push(delta)?;
        }

        let ready = self.tool_calls.release_ready();
        if !ready.is_empty() {
            self.saw_tool_calls = true;
            out.push(ChatResponseChunk {
                delta_tool_calls: ready,
                ..ChatResponseChunk::default()
            });
        }
        if self.tool_calls.is_empty() && !self.held_content.is_empty() {
            out.push(ChatResponseChunk::content(std::mem::take(&mut self.held_content)));
        }
        Ok(())
    }
}

/// Logs when a relay is dropped before it finished, i.e. the client hung up.
struct DisconnectGuard {
    armed: bool,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        if self.armed {
            debug!("client disconnected mid-stream; backend stream closed");
        }
    }
}

/// Relay a backend SSE byte stream as intermediate chunks.
///
/// Errors surface as `Err` only when nothing was delivered yet; after that an
/// abnormal end becomes a terminal chunk with [`FinishReason::Error`].
pub fn relay<S, E>(
    upstream: S,
    idle_timeout: Duration,
) -> impl Stream<Item = ProxyResult<ChatResponseChunk>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    async_stream::stream! {
        let mut guard = DisconnectGuard { armed: true };
        let mut relay = StreamRelay::new();
        let mut upstream = Box::pin(upstream);

        let failure = loop {
            let next = match tokio::time::timeout(idle_timeout, upstream.next()).await {
                Ok(next) => next,
                Err(_) => {
                    break Some(ProxyError::StreamInterrupted(format!(
                        "backend stream stalled for {}s",
                        idle_timeout.as_secs_f32()
                    )))
                }
            };

            match next {
                Some(Ok(bytes)) => {
                    for chunk in relay.feed(&bytes) {
                        yield Ok(chunk);
                    }
                    if let Some(e) = relay.take_failure() {
                        break Some(e);
                    }
                    if relay.state() == RelayState::Closing {
                        break None;
                    }
                }
                Some(Err(e)) => break Some(ProxyError::StreamInterrupted(e.to_string())),
                None => break None,
            }
        };
        drop(upstream);

        let failure = match failure {
            Some(e) => Some(e),
            None => {
                for chunk in relay.finish() {
                    yield Ok(chunk);
                }
                relay.take_failure()
            }
        };

        if let Some(err) = failure {
            warn!(error = %err, delivered = relay.delivered(), "backend stream ended abnormally");
            match relay.fail(&err) {
                Some(chunk) => yield Ok(chunk),
                None => yield Err(err),
            }
        }
        guard.armed = false;
    }
}

/// Serialize a chunk as Ollama NDJSON lines.
pub fn ndjson_lines(chunk: &ChatResponseChunk, model: &str, created_at: DateTime<Utc>) -> Bytes {
    let mut buf = Vec::new();
    for line in translation::chunk_to_ollama(chunk, model, created_at) {
        if let Ok(encoded) = serde_json::to_vec(&line) {
            buf.extend_from_slice(&encoded);
            buf.push(b'\n');
        }
    }
    Bytes::from(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn sse(payload: serde_json::Value) -> String {
        format!("data: {}\n\n", payload)
    }

    fn content_event(text: &str) -> String {
        sse(json!({"choices": [{"index": 0, "delta": {"content": text}}]}))
    }

    fn hello_world_body() -> String {
        let mut body = String::new();
        for part in ["Hel", "lo, ", "world"] {
            body.push_str(&content_event(part));
        }
        body.push_str(&sse(json!({"choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}]})));
        body.push_str("data: [DONE]\n\n");
        body
    }

    fn run(packets: &[&[u8]]) -> Vec<ChatResponseChunk> {
        let mut relay = StreamRelay::new();
        let mut out = Vec::new();
        for p in packets {
            out.extend(relay.feed(p));
        }
        out.extend(relay.finish());
        assert_eq!(relay.state(), RelayState::Closed);
        out
    }

    fn contents(chunks: &[ChatResponseChunk]) -> Vec<String> {
        chunks.iter().filter_map(|c| c.delta_content.clone()).collect()
    }

    #[test]
    fn json_value_complete_detects_closed_documents() {
        assert!(json_value_complete(r#"{"a": 1}"#));
        assert!(json_value_complete(" [1, {\"b\": \"}\"}] "));
        assert!(!json_value_complete(r#"{"a": 1"#));
        assert!(!json_value_complete(r#"{"a": "}"#));
        assert!(!json_value_complete(""));
        assert!(!json_value_complete("12"));
        assert!(!json_value_complete(r#"{"a": 1}}"#));
    }

    #[test]
    fn packetization_does_not_change_output() {
        let body = hello_world_body();
        let bytes = body.as_bytes();

        let whole = run(&[bytes]);

        let events: Vec<&[u8]> = body
            .split_inclusive("\n\n")
            .map(str::as_bytes)
            .collect();
        let per_event = run(&events);

        let per_byte: Vec<&[u8]> = bytes.chunks(1).collect();
        let tiny = run(&per_byte);

        for chunks in [&whole, &per_event, &tiny] {
            assert_eq!(contents(chunks), vec!["Hel", "lo, ", "world"]);
            let terminals: Vec<_> = chunks.iter().filter(|c| c.is_terminal()).collect();
            assert_eq!(terminals.len(), 1);
            assert_eq!(terminals[0].finish_reason, Some(FinishReason::Stop));
            assert!(chunks.last().unwrap().is_terminal());
        }
    }

    #[test]
    fn split_multibyte_characters_survive() {
        let body = content_event("héllo ✓");
        let bytes = body.as_bytes();
        let split = bytes.iter().position(|b| *b == 0xC3).unwrap() + 1;
        let chunks = run(&[&bytes[..split], &bytes[split..]]);
        assert_eq!(contents(&chunks), vec!["héllo ✓"]);
    }

    #[test]
    fn tool_call_held_until_arguments_complete() {
        let mut relay = StreamRelay::new();
        let first = sse(json!({"choices": [{"index": 0, "delta": {"tool_calls": [
            {"index": 0, "id": "call_9", "type": "function",
             "function": {"name": "get_weather", "arguments": ""}}
        ]}}]}));
        let second = sse(json!({"choices": [{"index": 0, "delta": {"tool_calls": [
            {"index": 0, "function": {"arguments": "{\"city\": \"Par"}}
        ]}}]}));
        let third = sse(json!({"choices": [{"index": 0, "delta": {"tool_calls": [
            {"index": 0, "function": {"arguments": "is\"}"}}
        ]}, "finish_reason": "tool_calls"}]}));

        assert!(relay.feed(first.as_bytes()).is_empty());
        assert!(relay.feed(second.as_bytes()).is_empty());
        let released = relay.feed(third.as_bytes());
        assert_eq!(released.len(), 1);
        assert_eq!(
            released[0].delta_tool_calls,
            vec![ToolCall {
                id: "call_9".into(),
                name: "get_weather".into(),
                arguments: json!({"city": "Paris"}),
            }]
        );

        let tail = relay.finish();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].finish_reason, Some(FinishReason::ToolCalls));
    }

    #[test]
    fn incomplete_tool_call_flushed_on_close() {
        let mut relay = StreamRelay::new();
        let event = sse(json!({"choices": [{"index": 0, "delta": {"tool_calls": [
            {"index": 0, "id": "c", "function": {"name": "f", "arguments": "{\"a\":"}}
        ]}}]}));
        assert!(relay.feed(event.as_bytes()).is_empty());

        let tail = relay.finish();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].delta_tool_calls[0].arguments, json!({"raw": "{\"a\":"}));
        assert!(tail[1].is_terminal());
    }

    #[test]
    fn content_behind_pending_tool_call_keeps_order() {
        let mut relay = StreamRelay::new();
        let start = sse(json!({"choices": [{"index": 0, "delta": {"tool_calls": [
            {"index": 0, "id": "c", "function": {"name": "f", "arguments": "{"}}
        ]}}]}));
        let text = content_event("after");
        let end = sse(json!({"choices": [{"index": 0, "delta": {"tool_calls": [
            {"index": 0, "function": {"arguments": "}"}}
        ]}}]}));

        assert!(relay.feed(start.as_bytes()).is_empty());
        assert!(relay.feed(text.as_bytes()).is_empty());
        let out = relay.feed(end.as_bytes());
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].delta_tool_calls[0].name, "f");
        assert_eq!(out[1].delta_content.as_deref(), Some("after"));
    }

    #[test]
    fn calls_sharing_an_index_are_told_apart_by_id() {
        let mut relay = StreamRelay::new();
        let first = sse(json!({"choices": [{"index": 0, "delta": {"tool_calls": [
            {"index": 0, "id": "a", "function": {"name": "f", "arguments": "{\"x\":1}"}}
        ]}}]}));
        // No index at all: serde defaults it to 0.
        let second = sse(json!({"choices": [{"index": 0, "delta": {"tool_calls": [
            {"id": "b", "function": {"name": "g", "arguments": "{\"y\":2}"}}
        ]}}]}));
        let stray = sse(json!({"choices": [{"index": 0, "delta": {"tool_calls": [
            {"index": 0, "function": {"arguments": "ignored"}}
        ]}}]}));

        let mut out = relay.feed(first.as_bytes());
        out.extend(relay.feed(second.as_bytes()));
        out.extend(relay.feed(stray.as_bytes()));
        out.extend(relay.finish());

        let calls: Vec<&ToolCall> = out.iter().flat_map(|c| &c.delta_tool_calls).collect();
        assert_eq!(calls.len(), 2);
        assert_eq!((calls[0].id.as_str(), calls[0].name.as_str()), ("a", "f"));
        assert_eq!(calls[0].arguments, json!({"x": 1}));
        assert_eq!((calls[1].id.as_str(), calls[1].name.as_str()), ("b", "g"));
        assert_eq!(calls[1].arguments, json!({"y": 2}));
        assert_eq!(out.last().unwrap().finish_reason, Some(FinishReason::ToolCalls));
    }

    #[test]
    fn long_line_in_small_packets() {
        let text = "x".repeat(256 * 1024);
        let body = content_event(&text);
        let packets: Vec<&[u8]> = body.as_bytes().chunks(16).collect();
        let chunks = run(&packets);
        assert_eq!(contents(&chunks), vec![text]);
    }

    #[test]
    fn usage_and_noise_lines() {
        let body = format!(
            ": keep-alive\n\nevent: message\n{}data: {{not json\n\n{}data: [DONE]\n\n",
            content_event("ok"),
            sse(json!({"choices": [], "usage": {"prompt_tokens": 7, "completion_tokens": 1}}))
        );
        let chunks = run(&[body.as_bytes()]);
        assert_eq!(contents(&chunks), vec!["ok"]);
        let terminal = chunks.last().unwrap();
        assert_eq!(
            terminal.usage,
            Some(Usage {
                prompt_tokens: Some(7),
                completion_tokens: Some(1)
            })
        );
    }

    #[test]
    fn connection_close_without_done_marker_still_terminates() {
        let chunks = run(&[content_event("bye").as_bytes()]);
        assert_eq!(contents(&chunks), vec!["bye"]);
        assert_eq!(chunks.last().unwrap().finish_reason, Some(FinishReason::Stop));
    }

    #[test]
    fn bytes_after_done_are_ignored() {
        let body = format!("{}data: [DONE]\n\n{}", content_event("a"), content_event("b"));
        let chunks = run(&[body.as_bytes()]);
        assert_eq!(contents(&chunks), vec!["a"]);
    }

    fn byte_stream(
        parts: Vec<Result<String, String>>,
    ) -> impl Stream<Item = Result<Bytes, String>> + Send + 'static {
        futures::stream::iter(parts.into_iter().map(|p| p.map(Bytes::from)))
    }

    #[tokio::test]
    async fn relay_stream_emits_in_order() {
        let upstream = byte_stream(vec![Ok(hello_world_body())]);
        let chunks: Vec<_> = relay(upstream, Duration::from_secs(5)).collect().await;
        let chunks: Vec<ChatResponseChunk> = chunks.into_iter().map(Result::unwrap).collect();
        assert_eq!(contents(&chunks), vec!["Hel", "lo, ", "world"]);
        assert_eq!(chunks.iter().filter(|c| c.is_terminal()).count(), 1);
    }

    #[tokio::test]
    async fn error_before_any_output_is_request_level() {
        let upstream = byte_stream(vec![Err("connection reset".into())]);
        let items: Vec<_> = relay(upstream, Duration::from_secs(5)).collect().await;
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(ProxyError::StreamInterrupted(_))));
    }

    #[tokio::test]
    async fn error_after_output_becomes_error_chunk() {
        let upstream = byte_stream(vec![
            Ok(content_event("partial")),
            Ok(sse(json!({"error": {"message": "model crashed"}}))),
        ]);
        let items: Vec<_> = relay(upstream, Duration::from_secs(5)).collect().await;
        assert_eq!(items.len(), 2);
        let last = items[1].as_ref().unwrap();
        assert_eq!(last.finish_reason, Some(FinishReason::Error));
        assert!(last.error.as_deref().unwrap().contains("model crashed"));
    }

    #[tokio::test]
    async fn stalled_backend_is_errored() {
        let upstream = futures::stream::pending::<Result<Bytes, String>>();
        let items: Vec<_> = relay(upstream, Duration::from_millis(50)).collect().await;
        assert_eq!(items.len(), 1);
        assert!(items[0].as_ref().unwrap_err().to_string().contains("stalled"));
    }

    #[tokio::test]
    async fn client_drop_closes_backend_stream() {
        let (tx, rx) = mpsc::unbounded::<Result<Bytes, String>>();
        let mut chunks = Box::pin(relay(rx, Duration::from_secs(5)));

        tx.unbounded_send(Ok(Bytes::from(content_event("one")))).unwrap();
        tx.unbounded_send(Ok(Bytes::from(content_event("two")))).unwrap();
        let first = chunks.next().await.unwrap().unwrap();
        let second = chunks.next().await.unwrap().unwrap();
        assert_eq!(first.delta_content.as_deref(), Some("one"));
        assert_eq!(second.delta_content.as_deref(), Some("two"));
        assert!(!tx.is_closed());

        drop(chunks);
        assert!(tx.is_closed());
        assert!(tx
            .unbounded_send(Ok(Bytes::from(content_event("three"))))
            .is_err());
    }

    #[tokio::test]
    async fn upstream_is_read_only_as_fast_as_chunks_are_pulled() {
        let pulled = Arc::new(AtomicUsize::new(0));
        let counter = pulled.clone();
        let upstream = futures::stream::iter(
            (0..100).map(|i| Ok::<_, String>(Bytes::from(content_event(&format!("t{}", i))))),
        )
        .inspect(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let mut chunks = Box::pin(relay(upstream, Duration::from_secs(5)));

        let first = chunks.next().await.unwrap().unwrap();
        assert_eq!(first.delta_content.as_deref(), Some("t0"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pulled.load(Ordering::SeqCst), 1);

        chunks.next().await.unwrap().unwrap();
        chunks.next().await.unwrap().unwrap();
        assert_eq!(pulled.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn ndjson_lines_are_newline_terminated_json() {
        let chunk = ChatResponseChunk::content("hi");
        let bytes = ndjson_lines(&chunk, "m1", Utc::now());
        let text = std::str::from_utf8(&bytes).unwrap();
        assert!(text.ends_with('\n'));
        let v: serde_json::Value = serde_json::from_str(text.trim_end()).unwrap();
        assert_eq!(v["message"]["content"], "hi");
        assert_eq!(v["done"], false);
    }
}
