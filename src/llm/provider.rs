//! Provider detection and endpoint layout.

use super::LlmProtocol;

/// Supported LLM providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    /// Anthropic (api.anthropic.com)
    Anthropic,
    /// `OpenAI` (api.openai.com)
    OpenAI,
    /// `OpenRouter` (openrouter.ai)
    OpenRouter,
    /// Groq (groq.com)
    Groq,
    /// Generic OpenAI-compatible provider
    Generic,
}

impl Provider {
    /// Detect provider from base URL.
    ///
    /// # Example
    ///
    /// ```rust
    /// use mcp_runner::llm::Provider;
    ///
    /// let provider = Provider::detect_from_url("https://api.anthropic.com");
    /// assert_eq!(provider, Provider::Anthropic);
    /// ```
    #[must_use]
    pub fn detect_from_url(base_url: &str) -> Self {
        let lower = base_url.to_lowercase();

        if lower.contains("anthropic.com") {
            Self::Anthropic
        } else if lower.contains("openrouter.ai") {
            Self::OpenRouter
        } else if lower.contains("groq.com") {
            Self::Groq
        } else if lower.contains("openai.com") {
            Self::OpenAI
        } else {
            Self::Generic
        }
    }

    /// Base URL used when none is configured.
    #[must_use]
    pub fn default_base_url(&self) -> &'static str {
        match self {
            Self::Anthropic => "https://api.anthropic.com",
            Self::OpenAI | Self::Generic => "https://api.openai.com",
            Self::OpenRouter => "https://openrouter.ai/api",
            Self::Groq => "https://api.groq.com/openai",
        }
    }

    /// Build the endpoint URL for a protocol.
    #[must_use]
    pub fn build_url(&self, base_url: &str, protocol: LlmProtocol) -> String {
        let base = base_url.trim_end_matches('/');

        match protocol {
            LlmProtocol::Messages => format!("{base}/v1/messages"),
            LlmProtocol::Chat | LlmProtocol::Auto => format!("{base}/v1/chat/completions"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_anthropic() {
        let provider = Provider::detect_from_url("https://api.anthropic.com/");
        assert_eq!(provider, Provider::Anthropic);
    }

    #[test]
    fn test_detect_openai() {
        let provider = Provider::detect_from_url("https://api.openai.com");
        assert_eq!(provider, Provider::OpenAI);
    }

    #[test]
    fn test_detect_openrouter() {
        let provider = Provider::detect_from_url("https://openrouter.ai/api");
        assert_eq!(provider, Provider::OpenRouter);
    }

    #[test]
    fn test_detect_generic() {
        let provider = Provider::detect_from_url("http://localhost:11434");
        assert_eq!(provider, Provider::Generic);
    }

    #[test]
    fn test_build_url_messages() {
        let url = Provider::Anthropic.build_url("https://api.anthropic.com/", LlmProtocol::Messages);
        assert_eq!(url, "https://api.anthropic.com/v1/messages");
    }

    #[test]
    fn test_build_url_chat() {
        let url = Provider::Groq.build_url("https://api.groq.com/openai", LlmProtocol::Chat);
        assert_eq!(url, "https://api.groq.com/openai/v1/chat/completions");
    }
}
