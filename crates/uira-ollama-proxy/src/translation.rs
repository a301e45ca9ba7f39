//! Ollama <-> OpenAI translation.
//!
//! This module implements the core format conversions:
//! - Ollama `/api/chat` request -> intermediate [`ChatRequest`] (with validation)
//! - intermediate request -> OpenAI `chat/completions` request
//! - OpenAI `chat/completions` response -> intermediate [`ChatResponse`]
//! - intermediate response/chunks -> Ollama `/api/chat` response lines
//!
//! Tool calls get one encode/decode pair per wire format. Both pairs go
//! through the canonical [`ToolCall`], so a call survives either round trip
//! with its id, name and parsed arguments intact.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::config::SamplingDefaults;
use crate::error::{ProxyError, ProxyResult};
use crate::ir::{
    ChatMessage, ChatRequest, ChatResponse, ChatResponseChunk, FinishReason, Role,
    SamplingOptions, ToolCall, ToolSpec, Usage,
};
use crate::{openai, types};

// ---------------------------------------------------------------------------
// Tool calls
// ---------------------------------------------------------------------------

/// Parse a tool-call argument string into a JSON value.
///
/// Empty input means "no arguments". Text that is not JSON is wrapped as
/// `{"raw": text}` so the result is always a valid document.
pub fn parse_arguments(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return json!({});
    }
    serde_json::from_str(raw).unwrap_or_else(|_| json!({ "raw": raw }))
}

pub fn encode_openai_tool_call(call: &ToolCall) -> openai::ToolCall {
    openai::ToolCall {
        id: call.id.clone(),
        kind: "function".to_string(),
        function: openai::FunctionCall {
            name: call.name.clone(),
            arguments: call.arguments.to_string(),
        },
    }
}

pub fn decode_openai_tool_call(call: &openai::ToolCall) -> ToolCall {
    ToolCall {
        id: non_empty_id(Some(call.id.as_str())),
        name: call.function.name.clone(),
        arguments: parse_arguments(&call.function.arguments),
    }
}

pub fn encode_ollama_tool_call(call: &ToolCall, index: usize) -> types::ToolCall {
    types::ToolCall {
        id: Some(call.id.clone()),
        function: types::ToolCallFunction {
            index: u32::try_from(index).ok(),
            name: call.name.clone(),
            arguments: call.arguments.clone(),
        },
    }
}

pub fn decode_ollama_tool_call(call: &types::ToolCall) -> ToolCall {
    let arguments = match &call.function.arguments {
        Value::String(s) => parse_arguments(s),
        Value::Null => json!({}),
        other => other.clone(),
    };
    ToolCall {
        id: non_empty_id(call.id.as_deref()),
        name: call.function.name.clone(),
        arguments,
    }
}

fn non_empty_id(id: Option<&str>) -> String {
    match id.map(str::trim) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => synthesize_call_id(),
    }
}

pub(crate) fn synthesize_call_id() -> String {
    format!("call_{}", uuid::Uuid::new_v4().simple())
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Validate an Ollama chat request and lift it into the intermediate shape.
pub fn request_from_ollama(req: types::ChatRequest) -> ProxyResult<ChatRequest> {
    let model = req.model.trim().to_string();
    if model.is_empty() {
        return Err(ProxyError::client_input("missing required field 'model'"));
    }
    if req.messages.is_empty() {
        return Err(ProxyError::client_input("'messages' must not be empty"));
    }

    let mut messages = Vec::with_capacity(req.messages.len());
    // Calls from the latest assistant turn that no tool message answered yet.
    let mut unanswered: VecDeque<(String, String)> = VecDeque::new();

    for (i, msg) in req.messages.into_iter().enumerate() {
        let role = Role::parse(&msg.role).ok_or_else(|| {
            ProxyError::client_input(format!("unknown role '{}' in messages[{}]", msg.role, i))
        })?;

        let tool_calls: Vec<ToolCall> = msg
            .tool_calls
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(decode_ollama_tool_call)
            .collect();
        if let Some(call) = tool_calls.iter().find(|c| c.name.trim().is_empty()) {
            return Err(ProxyError::client_input(format!(
                "tool call '{}' in messages[{}] has no function name",
                call.id, i
            )));
        }

        let tool_call_id = match role {
            Role::Assistant => {
                unanswered = tool_calls
                    .iter()
                    .map(|c| (c.id.clone(), c.name.clone()))
                    .collect();
                None
            }
            Role::Tool => resolve_tool_call_id(
                msg.tool_call_id.as_deref(),
                msg.tool_name.as_deref(),
                &mut unanswered,
            ),
            Role::System | Role::User => None,
        };

        messages.push(ChatMessage {
            role,
            content: msg.content,
            tool_calls,
            tool_call_id,
            images: msg.images.unwrap_or_default(),
        });
    }

    let tools = req
        .tools
        .map(|tools| {
            tools
                .into_iter()
                .map(|t| {
                    if t.function.name.trim().is_empty() {
                        return Err(ProxyError::client_input("tool definition without a name"));
                    }
                    Ok(ToolSpec {
                        name: t.function.name,
                        description: t.function.description,
                        parameters: t.function.parameters,
                    })
                })
                .collect::<ProxyResult<Vec<_>>>()
        })
        .transpose()?;

    let options = req.options.unwrap_or_default();

    Ok(ChatRequest {
        model,
        messages,
        stream: req.stream.unwrap_or(false),
        tools,
        tool_choice: req.tool_choice,
        options: SamplingOptions {
            temperature: options.temperature,
            // Ollama uses negative values for "no limit"; treat as unset.
            max_tokens: options.num_predict.and_then(|n| u32::try_from(n).ok()),
            top_p: options.top_p,
            stop: options.stop,
            seed: options.seed,
        },
        format: req.format,
    })
}

/// Ollama clients often omit `tool_call_id`; OpenAI backends require it.
/// Match by tool name first, then by order.
fn resolve_tool_call_id(
    explicit: Option<&str>,
    tool_name: Option<&str>,
    unanswered: &mut VecDeque<(String, String)>,
) -> Option<String> {
    if let Some(id) = explicit.filter(|id| !id.is_empty()) {
        unanswered.retain(|(pending, _)| pending != id);
        return Some(id.to_string());
    }

    let position = match tool_name {
        Some(name) => unanswered.iter().position(|(_, n)| n == name),
        None => None,
    }
    .or(if unanswered.is_empty() { None } else { Some(0) })?;

    unanswered.remove(position).map(|(id, _)| id)
}

impl TryFrom<types::ChatRequest> for ChatRequest {
    type Error = ProxyError;

    fn try_from(req: types::ChatRequest) -> ProxyResult<Self> {
        request_from_ollama(req)
    }
}

/// Build the backend request. Temperature and max tokens are always present;
/// configured defaults only fill in what the client left out.
pub fn to_backend(
    req: &ChatRequest,
    defaults: &SamplingDefaults,
) -> openai::ChatCompletionRequest {
    let tools: Option<Vec<openai::Tool>> = req
        .tools
        .as_ref()
        .filter(|tools| !tools.is_empty())
        .map(|tools| {
            tools
                .iter()
                .map(|t| openai::Tool {
                    kind: "function".to_string(),
                    function: openai::FunctionDefinition {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        parameters: if t.parameters.is_null() {
                            json!({"type": "object", "properties": {}})
                        } else {
                            t.parameters.clone()
                        },
                    },
                })
                .collect()
        });

    let tool_choice = if tools.is_some() {
        req.tool_choice.clone()
    } else {
        None
    };

    openai::ChatCompletionRequest {
        model: req.model.clone(),
        messages: req.messages.iter().map(message_to_backend).collect(),
        stream: req.stream,
        stream_options: req
            .stream
            .then_some(openai::StreamOptions { include_usage: true }),
        max_tokens: req.options.max_tokens.unwrap_or(defaults.max_tokens),
        temperature: req.options.temperature.unwrap_or(defaults.temperature),
        top_p: req.options.top_p,
        stop: req.options.stop.clone(),
        seed: req.options.seed,
        tools,
        tool_choice,
        response_format: req.format.as_ref().and_then(response_format),
    }
}

/// Ollama `format` -> OpenAI `response_format`.
fn response_format(format: &Value) -> Option<Value> {
    match format {
        Value::String(s) if s == "json" => Some(json!({"type": "json_object"})),
        Value::Object(_) => Some(json!({
            "type": "json_schema",
            "json_schema": {"name": "response", "schema": format}
        })),
        _ => None,
    }
}

pub fn message_to_backend(msg: &ChatMessage) -> openai::ChatMessage {
    let content = if !msg.images.is_empty() {
        let mut parts = Vec::with_capacity(msg.images.len() + 1);
        if !msg.content.is_empty() {
            parts.push(openai::ContentPart::Text {
                text: msg.content.clone(),
            });
        }
        parts.extend(msg.images.iter().map(|img| openai::ContentPart::ImageUrl {
            image_url: openai::ImageUrl {
                url: image_data_url(img),
            },
        }));
        Some(openai::MessageContent::Parts(parts))
    } else if msg.content.is_empty() && !msg.tool_calls.is_empty() {
        None
    } else {
        Some(openai::MessageContent::Text(msg.content.clone()))
    };

    openai::ChatMessage {
        role: msg.role.as_str().to_string(),
        content,
        tool_calls: if msg.tool_calls.is_empty() {
            None
        } else {
            Some(msg.tool_calls.iter().map(encode_openai_tool_call).collect())
        },
        tool_call_id: msg.tool_call_id.clone(),
    }
}

/// Ollama sends bare base64; OpenAI wants a data URL with a media type.
fn image_data_url(image: &str) -> String {
    if image.starts_with("data:") {
        return image.to_string();
    }
    let media_type = if image.starts_with("/9j/") {
        "image/jpeg"
    } else if image.starts_with("R0lGOD") {
        "image/gif"
    } else if image.starts_with("UklGR") {
        "image/webp"
    } else {
        "image/png"
    };
    format!("data:{};base64,{}", media_type, image)
}

/// Reverse of [`message_to_backend`].
pub fn message_from_backend(msg: &openai::ChatMessage) -> ProxyResult<ChatMessage> {
    let role = Role::parse(&msg.role).ok_or_else(|| ProxyError::BackendProtocol {
        status: 502,
        message: format!("backend used unknown role '{}'", msg.role),
    })?;

    let images = match &msg.content {
        Some(openai::MessageContent::Parts(parts)) => parts
            .iter()
            .filter_map(|p| match p {
                openai::ContentPart::ImageUrl { image_url } => Some(
                    image_url
                        .url
                        .split_once(";base64,")
                        .map(|(_, data)| data.to_string())
                        .unwrap_or_else(|| image_url.url.clone()),
                ),
                openai::ContentPart::Text { .. } => None,
            })
            .collect(),
        _ => Vec::new(),
    };

    Ok(ChatMessage {
        role,
        content: msg
            .content
            .as_ref()
            .map(openai::MessageContent::to_plaintext)
            .unwrap_or_default(),
        tool_calls: msg
            .tool_calls
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(decode_openai_tool_call)
            .collect(),
        tool_call_id: msg.tool_call_id.clone(),
        images,
    })
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

/// Convert a non-streaming backend response. `model` is the name the client
/// asked for, which is what Ollama clients expect to see echoed back.
pub fn from_backend(resp: openai::ChatCompletionResponse, model: &str) -> ProxyResult<ChatResponse> {
    let choice = resp
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ProxyError::BackendProtocol {
            status: 502,
            message: "backend response contained no choices".to_string(),
        })?;

    let message = ChatMessage {
        role: Role::Assistant,
        content: choice.message.content.unwrap_or_default(),
        tool_calls: choice
            .message
            .tool_calls
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(decode_openai_tool_call)
            .collect(),
        tool_call_id: None,
        images: Vec::new(),
    };

    Ok(ChatResponse {
        model: model.to_string(),
        finish_reason: choice
            .finish_reason
            .as_deref()
            .map(FinishReason::from_openai),
        usage: resp.usage.and_then(usage_from_backend),
        message,
    })
}

pub fn usage_from_backend(usage: openai::UsageInfo) -> Option<Usage> {
    Usage {
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
    }
    .non_empty()
}

/// Ollama's `done_reason`. Ollama reports tool-call turns as a plain stop.
pub fn done_reason(reason: FinishReason) -> &'static str {
    match reason {
        FinishReason::Stop | FinishReason::ToolCalls => "stop",
        FinishReason::Length => "length",
        FinishReason::Error => "error",
    }
}

fn ollama_tool_calls(calls: &[ToolCall]) -> Option<Vec<types::ToolCall>> {
    if calls.is_empty() {
        return None;
    }
    Some(
        calls
            .iter()
            .enumerate()
            .map(|(i, c)| encode_ollama_tool_call(c, i))
            .collect(),
    )
}

pub fn response_to_ollama(resp: ChatResponse) -> types::ChatResponse {
    let usage = resp.usage.unwrap_or_default();
    types::ChatResponse {
        model: resp.model,
        created_at: Utc::now(),
        message: types::ResponseMessage {
            role: resp.message.role.as_str().to_string(),
            tool_calls: ollama_tool_calls(&resp.message.tool_calls),
            content: resp.message.content,
        },
        done: true,
        done_reason: Some(done_reason(resp.finish_reason.unwrap_or(FinishReason::Stop)).to_string()),
        prompt_eval_count: usage.prompt_tokens,
        eval_count: usage.completion_tokens,
        error: None,
    }
}

/// Render one intermediate chunk as Ollama stream lines.
///
/// Content and tool calls go out as `done: false` lines; a terminal chunk
/// additionally produces the closing `done: true` line.
pub fn chunk_to_ollama(
    chunk: &ChatResponseChunk,
    model: &str,
    created_at: DateTime<Utc>,
) -> Vec<types::ChatResponse> {
    let line = |content: String, tool_calls: Option<Vec<types::ToolCall>>| types::ChatResponse {
        model: model.to_string(),
        created_at,
        message: types::ResponseMessage {
            role: "assistant".to_string(),
            content,
            tool_calls,
        },
        done: false,
        done_reason: None,
        prompt_eval_count: None,
        eval_count: None,
        error: None,
    };

    let mut out = Vec::new();
    if let Some(text) = chunk.delta_content.as_ref().filter(|t| !t.is_empty()) {
        out.push(line(text.clone(), None));
    }
    if let Some(calls) = ollama_tool_calls(&chunk.delta_tool_calls) {
        out.push(line(String::new(), Some(calls)));
    }
    if let Some(reason) = chunk.finish_reason {
        let usage = chunk.usage.unwrap_or_default();
        let mut done = line(String::new(), None);
        done.done = true;
        done.done_reason = Some(done_reason(reason).to_string());
        done.prompt_eval_count = usage.prompt_tokens;
        done.eval_count = usage.completion_tokens;
        done.error = chunk.error.clone();
        out.push(done);
    }
    out
}
