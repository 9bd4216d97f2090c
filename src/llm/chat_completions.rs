//! OpenAI Chat Completions API driver.
//!
//! This module implements the [`LlmDriver`] trait for the OpenAI Chat Completions
//! API (`/v1/chat/completions`), supporting streaming responses and tool calls.

use std::collections::BTreeMap;

use futures::StreamExt;

use crate::normalized::{NormalizedEvent, take_sse_frame};

use super::{EventStream, LlmDriver, LlmProtocol, LlmRequest, LlmSettings, Message, MessageRole};

/// Accumulated state for a streaming tool call.
#[derive(Debug, Default)]
struct ToolAccum {
    id: Option<String>,
    name: Option<String>,
    args: String,
}

/// Driver for the OpenAI Chat Completions API.
///
/// Connects to `/v1/chat/completions` and streams responses as
/// [`NormalizedEvent`]s.
#[derive(Clone)]
pub struct ChatCompletionsDriver {
    http: reqwest::Client,
    settings: LlmSettings,
}

impl std::fmt::Debug for ChatCompletionsDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatCompletionsDriver")
            .field("settings", &self.settings)
            .finish()
    }
}

impl ChatCompletionsDriver {
    /// Create a new Chat Completions driver with the given settings.
    #[must_use]
    pub fn new(settings: LlmSettings) -> Self {
        Self {
            http: reqwest::Client::new(),
            settings,
        }
    }
}

/// Build the request body, prepending the system prompt as a message.
fn build_body(settings: &LlmSettings, req: &LlmRequest) -> serde_json::Value {
    let mut messages: Vec<Message> = Vec::with_capacity(req.messages.len() + 1);
    if let Some(system) = &req.system {
        messages.push(Message {
            role: MessageRole::System,
            content: Some(system.clone()),
            tool_call_id: None,
            tool_calls: None,
        });
    }
    messages.extend(req.messages.iter().cloned());

    serde_json::json!({
        "model": settings.model,
        "stream": true,
        "max_tokens": settings.max_tokens,
        "messages": messages,
        "tools": if req.tools.is_empty() { serde_json::Value::Null } else { serde_json::Value::Array(req.tools.clone()) }
    })
}

/// Translate one decoded `data:` chunk into normalized events.
fn chunk_events(
    v: &serde_json::Value,
    tool_accum: &mut BTreeMap<usize, ToolAccum>,
) -> Vec<NormalizedEvent> {
    let mut out = Vec::new();
    let choice = &v["choices"][0];
    let delta = &choice["delta"];

    // Assistant text delta
    if let Some(s) = delta.get("content").and_then(|x| x.as_str()) {
        if !s.is_empty() {
            out.push(NormalizedEvent::MessageDelta { text: s.to_string() });
        }
    }

    // Tool calls streaming deltas
    if let Some(arr) = delta.get("tool_calls").and_then(|x| x.as_array()) {
        for tc in arr {
            let idx = tc.get("index").and_then(serde_json::Value::as_u64).unwrap_or(0) as usize;
            let id = tc.get("id").and_then(|x| x.as_str()).map(ToString::to_string);
            let name = tc
                .get("function")
                .and_then(|f| f.get("name"))
                .and_then(|x| x.as_str())
                .map(ToString::to_string);
            let args_delta = tc
                .get("function")
                .and_then(|f| f.get("arguments"))
                .and_then(|x| x.as_str())
                .map(ToString::to_string);

            let entry = tool_accum.entry(idx).or_default();
            if entry.id.is_none() {
                entry.id.clone_from(&id);
            }
            if entry.name.is_none() {
                entry.name.clone_from(&name);
            }
            if let Some(ad) = &args_delta {
                entry.args.push_str(ad);
            }

            out.push(NormalizedEvent::ToolCallDelta {
                call_index: idx,
                id,
                name,
                arguments_delta: args_delta,
            });
        }
    }

    // Completion boundary: emit assembled tool calls
    if choice.get("finish_reason").and_then(|x| x.as_str()) == Some("tool_calls") {
        for (idx, a) in std::mem::take(tool_accum) {
            if let (Some(id), Some(name)) = (a.id, a.name) {
                out.push(NormalizedEvent::ToolCallComplete {
                    call_index: idx,
                    id,
                    name,
                    arguments_json: a.args,
                });
            }
        }
    }

    if let Some(usage) = v.get("usage").filter(|u| u.is_object()) {
        out.push(NormalizedEvent::Usage {
            input_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0),
            output_tokens: usage["completion_tokens"].as_u64().unwrap_or(0),
        });
    }

    out
}

#[async_trait::async_trait]
impl LlmDriver for ChatCompletionsDriver {
    async fn stream(&self, req: LlmRequest) -> anyhow::Result<EventStream> {
        let url = self
            .settings
            .provider
            .build_url(&self.settings.base_url, LlmProtocol::Chat);
        let body = build_body(&self.settings, &req);

        let mut rb = self.http.post(&url).json(&body);
        if let Some(k) = &self.settings.api_key {
            rb = rb.bearer_auth(k);
        }

        let resp = rb.send().await?.error_for_status()?;
        let byte_stream = resp.bytes_stream();

        let out = async_stream::try_stream! {
            let mut buf = Vec::<u8>::new();
            let mut tool_accum: BTreeMap<usize, ToolAccum> = BTreeMap::new();

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

                        if data == "[DONE]" {
                            yield NormalizedEvent::Done;
                            continue;
                        }

                        let v: serde_json::Value = serde_json::from_str(data)?;
                        for event in chunk_events(&v, &mut tool_accum) {
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
    use serde_json::json;

    #[test]
    fn test_body_prepends_system_prompt() {
        let settings = LlmSettings {
            provider: super::super::Provider::OpenAI,
            ..LlmSettings::anthropic("gpt-4o", None)
        };
        let req = LlmRequest {
            system: Some("be brief".to_string()),
            messages: vec![Message::user("hi")],
            tools: vec![],
        };
        let body = build_body(&settings, &req);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hi");
        assert!(body["tools"].is_null());
    }

    #[test]
    fn test_text_delta() {
        let mut acc = BTreeMap::new();
        let events = chunk_events(
            &json!({"choices": [{"delta": {"content": "Dishoom"}}]}),
            &mut acc,
        );
        assert_eq!(
            events,
            vec![NormalizedEvent::MessageDelta { text: "Dishoom".to_string() }]
        );
    }

    #[test]
    fn test_tool_call_assembled_on_finish() {
        let mut acc = BTreeMap::new();
        chunk_events(
            &json!({"choices": [{"delta": {"tool_calls": [
                {"index": 0, "id": "call_1", "function": {"name": "search__google", "arguments": "{\"q\":"}}
            ]}}]}),
            &mut acc,
        );
        chunk_events(
            &json!({"choices": [{"delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": "\"london\"}"}}
            ]}}]}),
            &mut acc,
        );
        let events = chunk_events(
            &json!({"choices": [{"delta": {}, "finish_reason": "tool_calls"}]}),
            &mut acc,
        );

        assert_eq!(
            events,
            vec![NormalizedEvent::ToolCallComplete {
                call_index: 0,
                id: "call_1".to_string(),
                name: "search__google".to_string(),
                arguments_json: "{\"q\":\"london\"}".to_string(),
            }]
        );
        assert!(acc.is_empty());
    }
}
