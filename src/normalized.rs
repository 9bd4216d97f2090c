//! Normalized event types for streaming model responses.
//!
//! Drivers translate their wire protocol (Anthropic Messages, Chat Completions)
//! into [`NormalizedEvent`]s so the agent loop only deals with one shape:
//! text deltas, tool call lifecycle and stream termination.
//!
//! # Example
//!
//! ```rust
//! use mcp_runner::normalized::NormalizedEvent;
//!
//! let event = NormalizedEvent::MessageDelta {
//!     text: "Hello".to_string(),
//! };
//! assert_eq!(event.event_name(), "message.delta");
//! ```

use serde::{Deserialize, Serialize};

/// Normalized streaming events emitted by model drivers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum NormalizedEvent {
    /// Incremental assistant text.
    #[serde(rename = "message.delta")]
    MessageDelta {
        /// Text fragment.
        text: String,
    },

    /// Incremental tool call data. `id` and `name` arrive once, arguments in pieces.
    #[serde(rename = "tool_call.delta")]
    ToolCallDelta {
        /// Position of the call within the response.
        call_index: usize,
        /// Provider-assigned call id.
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        /// Tool name.
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        /// JSON argument fragment.
        #[serde(skip_serializing_if = "Option::is_none")]
        arguments_delta: Option<String>,
    },

    /// A fully assembled tool call.
    #[serde(rename = "tool_call.complete")]
    ToolCallComplete {
        /// Position of the call within the response.
        call_index: usize,
        /// Provider-assigned call id.
        id: String,
        /// Tool name.
        name: String,
        /// Complete JSON arguments.
        arguments_json: String,
    },

    /// Token accounting reported by the provider.
    #[serde(rename = "usage")]
    Usage {
        /// Prompt tokens.
        input_tokens: u64,
        /// Completion tokens.
        output_tokens: u64,
    },

    /// The response is complete.
    #[serde(rename = "done")]
    Done,

    /// The provider reported an error inside the stream.
    #[serde(rename = "error")]
    Error {
        /// Error message.
        message: String,
        /// Provider error type, if any.
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

impl NormalizedEvent {
    /// Dotted event name, used as a log field.
    #[must_use]
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::MessageDelta { .. } => "message.delta",
            Self::ToolCallDelta { .. } => "tool_call.delta",
            Self::ToolCallComplete { .. } => "tool_call.complete",
            Self::Usage { .. } => "usage",
            Self::Done => "done",
            Self::Error { .. } => "error",
        }
    }
}

/// Find the first SSE frame boundary (`\n\n` or `\r\n\r\n`) in the buffer.
/// Returns its position and length.
pub(crate) fn find_frame_boundary(buf: &[u8]) -> Option<(usize, usize)> {
    (0..buf.len()).find_map(|i| {
        let rest = &buf[i..];
        if rest.starts_with(b"\n\n") {
            Some((i, 2))
        } else if rest.starts_with(b"\r\n\r\n") {
            Some((i, 4))
        } else {
            None
        }
    })
}

/// Remove the first complete SSE frame from the buffer and return its text.
pub(crate) fn take_sse_frame(buf: &mut Vec<u8>) -> Option<String> {
    let (pos, len) = find_frame_boundary(buf)?;
    let frame: Vec<u8> = buf.drain(..pos + len).collect();
    Some(String::from_utf8_lossy(&frame[..pos]).into_owned())
}
