//! Anthropic Messages API driver.
//!
//! This module implements the [`LlmDriver`] trait for the Anthropic Messages
//! API (`/v1/messages`). The conversation history is kept in `OpenAI` chat
//! shape by the agent and converted to Anthropic content blocks here.

use std::collections::BTreeMap;

use futures::StreamExt;
use serde_json::json;

use crate::normalized::{NormalizedEvent, take_sse_frame};

use super::{EventStream, LlmDriver, LlmProtocol, LlmRequest, LlmSettings, Message, MessageRole};

/// API version header value.
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Driver for the Anthropic Messages API.
#[derive(Clone)]
pub struct AnthropicDriver {
    http: reqwest::Client,
    settings: LlmSettings,
}

impl std::fmt::Debug for AnthropicDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicDriver")
            .field("settings", &self.settings)
            .finish()
    }
}

impl AnthropicDriver {
    /// Create a new Messages driver with the given settings.
    #[must_use]
    pub fn new(settings: LlmSettings) -> Self {
        Self {
            http: reqwest::Client::new(),
            settings,
        }
    }
}

/// Convert chat-shaped history into Anthropic `system` text and `messages`.
///
/// Tool results become `tool_result` blocks in a user turn; consecutive
/// results are merged into one turn since roles must alternate.
pub fn to_anthropic_messages(
    system: Option<&str>,
    messages: &[Message],
) -> (Option<String>, Vec<serde_json::Value>) {
    let mut system_parts: Vec<String> = system.map(ToString::to_string).into_iter().collect();
    let mut out: Vec<serde_json::Value> = Vec::with_capacity(messages.len());

    for m in messages {
        match m.role {
            MessageRole::System => {
                if let Some(text) = &m.content {
                    system_parts.push(text.clone());
                }
            }
            MessageRole::User => {
                out.push(json!({
                    "role": "user",
                    "content": m.content.clone().unwrap_or_default()
                }));
            }
            MessageRole::Assistant => {
                let Some(calls) = m.tool_calls.as_ref().filter(|c| !c.is_empty()) else {
                    out.push(json!({
                        "role": "assistant",
                        "content": m.content.clone().unwrap_or_default()
                    }));
                    continue;
                };

                let mut blocks = Vec::with_capacity(calls.len() + 1);
                if let Some(text) = m.content.as_ref().filter(|t| !t.is_empty()) {
                    blocks.push(json!({ "type": "text", "text": text }));
                }
                for call in calls {
                    let input: serde_json::Value = serde_json::from_str(&call.function.arguments)
                        .unwrap_or_else(|_| json!({}));
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": call.id,
                        "name": call.function.name,
                        "input": input
                    }));
                }
                out.push(json!({ "role": "assistant", "content": blocks }));
            }
            MessageRole::Tool => {
                let block = json!({
                    "type": "tool_result",
                    "tool_use_id": m.tool_call_id.clone().unwrap_or_default(),
                    "content": m.content.clone().unwrap_or_default()
                });

                let merged = out.last().is_some_and(|last| {
                    last["role"] == "user"
                        && last["content"]
                            .as_array()
                            .and_then(|a| a.first())
                            .is_some_and(|b| b["type"] == "tool_result")
                });
                if merged {
                    if let Some(arr) = out
                        .last_mut()
                        .and_then(|last| last["content"].as_array_mut())
                    {
                        arr.push(block);
                    }
                } else {
                    out.push(json!({ "role": "user", "content": [block] }));
                }
            }
        }
    }

    let system = (!system_parts.is_empty()).then(|| system_parts.join("\n\n"));
    (system, out)
}

/// Convert `OpenAI` function tools into Anthropic tool definitions.
pub fn to_anthropic_tools(tools: &[serde_json::Value]) -> Vec<serde_json::Value> {
    tools
        .iter()
        .filter_map(|t| {
            let f = t.get("function")?;
            Some(json!({
                "name": f.get("name")?,
                "description": f.get("description").cloned().unwrap_or_else(|| json!("")),
                "input_schema": f.get("parameters").cloned().unwrap_or_else(|| json!({"type": "object", "properties": {}}))
            }))
        })
        .collect()
}

fn build_body(settings: &LlmSettings, req: &LlmRequest) -> serde_json::Value {
    let (system, messages) = to_anthropic_messages(req.system.as_deref(), &req.messages);

    let mut body = json!({
        "model": settings.model,
        "max_tokens": settings.max_tokens,
        "stream": true,
        "messages": messages,
    });
    if let Some(sys) = system {
        body["system"] = json!(sys);
    }
    let tools = to_anthropic_tools(&req.tools);
    if !tools.is_empty() {
        body["tools"] = json!(tools);
    }
    body
}

/// Per-stream decoding state.
#[derive(Debug, Default)]
struct StreamState {
    // block index -> (id, name, partial json)
    tool_blocks: BTreeMap<usize, (String, String, String)>,
    input_tokens: u64,
}

/// Translate one decoded SSE payload into normalized events.
fn sse_events(v: &serde_json::Value, state: &mut StreamState) -> Vec<NormalizedEvent> {
    let index = v["index"].as_u64().unwrap_or(0) as usize;

    match v["type"].as_str().unwrap_or_default() {
        "message_start" => {
            state.input_tokens = v["message"]["usage"]["input_tokens"].as_u64().unwrap_or(0);
            Vec::new()
        }
        "content_block_start" => {
            let block = &v["content_block"];
            match block["type"].as_str() {
                Some("tool_use") => {
                    let id = block["id"].as_str().unwrap_or_default().to_string();
                    let name = block["name"].as_str().unwrap_or_default().to_string();
                    state
                        .tool_blocks
                        .insert(index, (id.clone(), name.clone(), String::new()));
                    vec![NormalizedEvent::ToolCallDelta {
                        call_index: index,
                        id: Some(id),
                        name: Some(name),
                        arguments_delta: None,
                    }]
                }
                Some("text") => block["text"]
                    .as_str()
                    .filter(|t| !t.is_empty())
                    .map(|t| NormalizedEvent::MessageDelta { text: t.to_string() })
                    .into_iter()
                    .collect(),
                _ => Vec::new(),
            }
        }
        "content_block_delta" => {
            let delta = &v["delta"];
            match delta["type"].as_str() {
                Some("text_delta") => delta["text"]
                    .as_str()
                    .filter(|t| !t.is_empty())
                    .map(|t| NormalizedEvent::MessageDelta { text: t.to_string() })
                    .into_iter()
                    .collect(),
                Some("input_json_delta") => {
                    let partial = delta["partial_json"].as_str().unwrap_or_default();
                    if let Some((_, _, args)) = state.tool_blocks.get_mut(&index) {
                        args.push_str(partial);
                    }
                    vec![NormalizedEvent::ToolCallDelta {
                        call_index: index,
                        id: None,
                        name: None,
                        arguments_delta: Some(partial.to_string()),
                    }]
                }
                _ => Vec::new(),
            }
        }
        "content_block_stop" => match state.tool_blocks.remove(&index) {
            Some((id, name, args)) => vec![NormalizedEvent::ToolCallComplete {
                call_index: index,
                id,
                name,
                arguments_json: if args.trim().is_empty() {
                    "{}".to_string()
                } else {
                    args
                },
            }],
            None => Vec::new(),
        },
        "message_delta" => v["usage"]["output_tokens"]
            .as_u64()
            .map(|output_tokens| NormalizedEvent::Usage {
                input_tokens: state.input_tokens,
                output_tokens,
            })
            .into_iter()
            .collect(),
        "message_stop" => vec![NormalizedEvent::Done],
        "error" => vec![NormalizedEvent::Error {
            message: v["error"]["message"]
                .as_str()
                .unwrap_or("unknown error")
                .to_string(),
            code: v["error"]["type"].as_str().map(ToString::to_string),
        }],
        // ping and unknown events
        _ => Vec::new(),
    }
}

#[async_trait::async_trait]
impl LlmDriver for AnthropicDriver {
    async fn stream(&self, req: LlmRequest) -> anyhow::Result<EventStream> {
        let url = self
            .settings
            .provider
            .build_url(&self.settings.base_url, LlmProtocol::Messages);
        let body = build_body(&self.settings, &req);

        let mut rb = self
            .http
            .post(&url)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body);
        if let Some(k) = &self.settings.api_key {
            rb = rb.header("x-api-key", k);
        }

        let resp = rb.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let error_body = resp
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            anyhow::bail!("Anthropic API error {status}: {error_body}");
        }
        let byte_stream = resp.bytes_stream();

        let out = async_stream::try_stream! {
            let mut buf = Vec::<u8>::new();
            let mut state = StreamState::default();

            futures::pin_mut!(byte_stream);
            while let Some(chunk) = byte_stream.next().await {
                let chunk = chunk?;
                buf.extend_from_slice(&chunk);

                while let Some(text) = take_sse_frame(&mut buf) {
                    for line in text.lines() {
                        let line = line.trim();
                        if !line.starts_with("data:") {
                            continue;
                        }
                        let data = line.trim_start_matches("data:").trim();
                        if data.is_empty() {
                            continue;
                        }

                        let v: serde_json::Value = serde_json::from_str(data)?;
                        for event in sse_events(&v, &mut state) {
                            yield event;
                        }
                    }
                }
            }
        };

        Ok(Box::pin(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ToolCall, ToolCallFunction};

    fn call(id: &str, name: &str, args: &str) -> ToolCall {
        ToolCall {
            id: id.to_string(),
            call_type: "function".to_string(),
            function: ToolCallFunction {
                name: name.to_string(),
                arguments: args.to_string(),
            },
        }
    }

    #[test]
    fn test_history_conversion() {
        let history = vec![
            Message::user("Find the best restaurant"),
            Message::assistant_tool_calls(
                Some("Searching.".to_string()),
                vec![
                    call("toolu_1", "search__google", r#"{"q":"london"}"#),
                    call("toolu_2", "search__maps", ""),
                ],
            ),
            Message::tool_result("toolu_1", "results"),
            Message::tool_result("toolu_2", "map"),
        ];

        let (system, msgs) = to_anthropic_messages(Some("sys"), &history);
        assert_eq!(system.as_deref(), Some("sys"));
        assert_eq!(msgs.len(), 3);

        assert_eq!(msgs[1]["content"][0]["type"], "text");
        assert_eq!(msgs[1]["content"][1]["type"], "tool_use");
        assert_eq!(msgs[1]["content"][1]["input"]["q"], "london");
        assert_eq!(msgs[1]["content"][2]["input"], json!({}));

        assert_eq!(msgs[2]["role"], "user");
        let results = msgs[2]["content"].as_array().unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[1]["tool_use_id"], "toolu_2");
    }

    #[test]
    fn test_tool_conversion() {
        let tools = vec![json!({
            "type": "function",
            "function": {
                "name": "search__google",
                "description": "Search",
                "parameters": {"type": "object"}
            }
        })];
        let out = to_anthropic_tools(&tools);
        assert_eq!(out[0]["name"], "search__google");
        assert_eq!(out[0]["input_schema"]["type"], "object");
    }

    #[test]
    fn test_stream_decoding_tool_use() {
        let mut state = StreamState::default();
        let frames = [
            json!({"type": "message_start", "message": {"usage": {"input_tokens": 12}}}),
            json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}}),
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "Let me search."}}),
            json!({"type": "content_block_stop", "index": 0}),
            json!({"type": "content_block_start", "index": 1, "content_block": {"type": "tool_use", "id": "toolu_1", "name": "search__google", "input": {}}}),
            json!({"type": "content_block_delta", "index": 1, "delta": {"type": "input_json_delta", "partial_json": "{\"q\":"}}),
            json!({"type": "content_block_delta", "index": 1, "delta": {"type": "input_json_delta", "partial_json": "\"london\"}"}}),
            json!({"type": "content_block_stop", "index": 1}),
            json!({"type": "message_delta", "delta": {"stop_reason": "tool_use"}, "usage": {"output_tokens": 30}}),
            json!({"type": "message_stop"}),
        ];

        let events: Vec<NormalizedEvent> =
            frames.iter().flat_map(|f| sse_events(f, &mut state)).collect();

        assert!(events.contains(&NormalizedEvent::MessageDelta {
            text: "Let me search.".to_string()
        }));
        assert!(events.contains(&NormalizedEvent::ToolCallComplete {
            call_index: 1,
            id: "toolu_1".to_string(),
            name: "search__google".to_string(),
            arguments_json: "{\"q\":\"london\"}".to_string(),
        }));
        assert!(events.contains(&NormalizedEvent::Usage {
            input_tokens: 12,
            output_tokens: 30
        }));
        assert_eq!(events.last(), Some(&NormalizedEvent::Done));
    }

    #[test]
    fn test_stream_error_event() {
        let mut state = StreamState::default();
        let events = sse_events(
            &json!({"type": "error", "error": {"type": "overloaded_error", "message": "Overloaded"}}),
            &mut state,
        );
        assert_eq!(
            events,
            vec![NormalizedEvent::Error {
                message: "Overloaded".to_string(),
                code: Some("overloaded_error".to_string()),
            }]
        );
    }

    #[test]
    fn test_body_carries_system_and_tools() {
        let settings = LlmSettings::anthropic("claude-3-5-sonnet-20240620", None);
        let req = LlmRequest {
            system: Some("sys".to_string()),
            messages: vec![Message::user("hi")],
            tools: vec![],
        };
        let body = build_body(&settings, &req);
        assert_eq!(body["system"], "sys");
        assert_eq!(body["max_tokens"], 4096);
        assert!(body.get("tools").is_none());
    }
}
