//! Language-model drivers.
//!
//! The [`LlmDriver`] trait defines the streaming interface every backend
//! implements. A [`ModelHandle`] binds a driver to its [`LlmSettings`] and is
//! what the agent holds.
//!
//! # Drivers
//!
//! - [`AnthropicDriver`]: Anthropic Messages API (`/v1/messages`)
//! - [`ChatCompletionsDriver`]: `OpenAI` Chat Completions API (`/v1/chat/completions`)
//!
//! # Example
//!
//! ```rust,ignore
//! use mcp_runner::llm::{LlmSettings, ModelHandle};
//!
//! let settings = LlmSettings::anthropic("claude-3-5-sonnet-20240620", None);
//! let model = ModelHandle::new(settings);
//! ```

pub mod anthropic;
pub mod chat_completions;
pub mod provider;

pub use anthropic::AnthropicDriver;
pub use chat_completions::ChatCompletionsDriver;
pub use provider::Provider;

use std::sync::Arc;

use crate::normalized::NormalizedEvent;
use futures::Stream;

/// Default completion limit for providers that require one.
pub const DEFAULT_MAX_TOKENS: u32 = 4096;

/// LLM connection and model settings.
#[derive(Clone)]
pub struct LlmSettings {
    /// Base URL for the LLM API (e.g., `https://api.anthropic.com`).
    pub base_url: String,
    /// Optional API key. Absence is only detected when the model is called.
    pub api_key: Option<String>,
    /// Model identifier (e.g., `claude-3-5-sonnet-20240620`).
    pub model: String,
    /// Protocol to use for communication.
    pub protocol: LlmProtocol,
    /// Provider type (auto-detected from `base_url` if not specified).
    pub provider: Provider,
    /// Maximum tokens per completion.
    pub max_tokens: u32,
}

impl std::fmt::Debug for LlmSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmSettings")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("model", &self.model)
            .field("protocol", &self.protocol)
            .field("provider", &self.provider)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

impl LlmSettings {
    /// Settings for the Anthropic API with the given model.
    #[must_use]
    pub fn anthropic(model: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            base_url: Provider::Anthropic.default_base_url().to_string(),
            api_key,
            model: model.into(),
            protocol: LlmProtocol::Auto,
            provider: Provider::Anthropic,
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }

    /// Resolve [`LlmProtocol::Auto`] against the provider.
    #[must_use]
    pub fn effective_protocol(&self) -> LlmProtocol {
        match self.protocol {
            LlmProtocol::Auto => {
                if self.provider == Provider::Anthropic {
                    LlmProtocol::Messages
                } else {
                    LlmProtocol::Chat
                }
            }
            p => p,
        }
    }
}

/// LLM protocol variants.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LlmProtocol {
    /// Pick the protocol from the provider.
    #[default]
    Auto,
    /// Anthropic Messages API (`/v1/messages`).
    Messages,
    /// `OpenAI` Chat Completions API (`/v1/chat/completions`).
    Chat,
}

impl std::str::FromStr for LlmProtocol {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "messages" | "anthropic" => Self::Messages,
            "chat" => Self::Chat,
            _ => Self::Auto,
        })
    }
}

/// Role of a message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// System prompt.
    System,
    /// User message.
    User,
    /// Assistant response.
    Assistant,
    /// Tool response.
    Tool,
}

/// A message in the conversation history, in `OpenAI` chat shape.
///
/// Drivers for other protocols convert from this shape.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Message {
    /// Role of the message author.
    pub role: MessageRole,
    /// Text content. `None` for assistant turns that only call tools.
    pub content: Option<String>,
    /// Tool call this message answers (tool role only).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tool_call_id: Option<String>,
    /// Tool calls made by the assistant.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tool_calls: Option<Vec<ToolCall>>,
}

impl Message {
    #[must_use]
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: Some(text.into()),
            tool_call_id: None,
            tool_calls: None,
        }
    }

    #[must_use]
    pub fn assistant_tool_calls(text: Option<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: text,
            tool_call_id: None,
            tool_calls: Some(tool_calls),
        }
    }

    #[must_use]
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Tool,
            content: Some(content.into()),
            tool_call_id: Some(tool_call_id.into()),
            tool_calls: None,
        }
    }
}

/// A tool call made by the assistant.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ToolCall {
    /// Unique identifier for this tool call.
    pub id: String,
    /// Type of tool (always "function" for now).
    #[serde(rename = "type")]
    pub call_type: String,
    /// Function details.
    pub function: ToolCallFunction,
}

/// Function details in a tool call.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ToolCallFunction {
    /// Function name.
    pub name: String,
    /// Arguments as JSON string.
    pub arguments: String,
}

/// Request to an LLM driver.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    /// System prompt, sent the way the protocol expects it.
    pub system: Option<String>,
    /// Conversation messages.
    pub messages: Vec<Message>,
    /// Available tools in `OpenAI` function schema format.
    pub tools: Vec<serde_json::Value>,
}

/// Boxed stream of normalized driver events.
pub type EventStream =
    std::pin::Pin<Box<dyn Stream<Item = anyhow::Result<NormalizedEvent>> + Send>>;

/// Trait for LLM streaming drivers.
///
/// Implementations of this trait provide streaming access to LLM responses,
/// emitting [`NormalizedEvent`]s as the model generates output.
#[async_trait::async_trait]
pub trait LlmDriver: Send + Sync {
    /// Stream a response from the LLM.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the connection is interrupted.
    async fn stream(&self, req: LlmRequest) -> anyhow::Result<EventStream>;
}

/// Reference to a remote model endpoint: settings plus the driver speaking
/// its protocol. Cheap to clone.
#[derive(Clone)]
pub struct ModelHandle {
    settings: LlmSettings,
    driver: Arc<dyn LlmDriver>,
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle")
            .field("settings", &self.settings)
            .finish()
    }
}

impl ModelHandle {
    /// Create a handle, choosing the driver from the settings. Performs no I/O.
    #[must_use]
    pub fn new(settings: LlmSettings) -> Self {
        let driver: Arc<dyn LlmDriver> = match settings.effective_protocol() {
            LlmProtocol::Messages => Arc::new(AnthropicDriver::new(settings.clone())),
            LlmProtocol::Chat | LlmProtocol::Auto => {
                Arc::new(ChatCompletionsDriver::new(settings.clone()))
            }
        };
        Self { settings, driver }
    }

    /// Create a handle around a custom driver.
    #[must_use]
    pub fn with_driver(settings: LlmSettings, driver: Arc<dyn LlmDriver>) -> Self {
        Self { settings, driver }
    }

    #[must_use]
    pub fn model_id(&self) -> &str {
        &self.settings.model
    }

    pub async fn stream(&self, req: LlmRequest) -> anyhow::Result<EventStream> {
        self.driver.stream(req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_protocol_follows_provider() {
        let s = LlmSettings::anthropic("claude-3-5-sonnet-20240620", None);
        assert_eq!(s.effective_protocol(), LlmProtocol::Messages);

        let mut s = s;
        s.provider = Provider::OpenAI;
        assert_eq!(s.effective_protocol(), LlmProtocol::Chat);

        s.protocol = LlmProtocol::Messages;
        assert_eq!(s.effective_protocol(), LlmProtocol::Messages);
    }

    #[test]
    fn test_debug_redacts_api_key() {
        let s = LlmSettings::anthropic("m", Some("sk-secret".to_string()));
        let dbg = format!("{s:?}");
        assert!(!dbg.contains("sk-secret"));
        assert!(dbg.contains("<redacted>"));
    }

    #[test]
    fn test_protocol_from_str() {
        assert_eq!("chat".parse::<LlmProtocol>().unwrap(), LlmProtocol::Chat);
        assert_eq!("Messages".parse::<LlmProtocol>().unwrap(), LlmProtocol::Messages);
        assert_eq!("whatever".parse::<LlmProtocol>().unwrap(), LlmProtocol::Auto);
    }

    #[test]
    fn test_message_serializes_openai_shape() {
        let m = Message::tool_result("call_1", "ok");
        let v = serde_json::to_value(&m).unwrap();
        assert_eq!(v["role"], "tool");
        assert_eq!(v["tool_call_id"], "call_1");
        assert!(v.get("tool_calls").is_none());
    }
}
