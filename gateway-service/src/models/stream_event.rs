//! Events flowing from an upstream responder to the client.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One event of a response stream.
///
/// Serialized with a `type` tag, which is also the outbound wire shape:
/// `{"type":"content","content":"..."}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Start {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    Content {
        content: String,
    },
    ToolCall {
        name: String,
        #[serde(default)]
        args: Value,
    },
    ToolResult {
        id: String,
    },
    Heartbeat,
    Complete {
        #[serde(default)]
        metadata: Map<String, Value>,
    },
    Error {
        message: String,
    },
}

impl StreamEvent {
    pub fn content(text: impl Into<String>) -> Self {
        StreamEvent::Content {
            content: text.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        StreamEvent::Error {
            message: message.into(),
        }
    }

    pub fn complete() -> Self {
        StreamEvent::Complete {
            metadata: Map::new(),
        }
    }

    /// `complete` and `error` end a stream; nothing is forwarded after them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Complete { .. } | StreamEvent::Error { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::Start { .. } => "start",
            StreamEvent::Content { .. } => "content",
            StreamEvent::ToolCall { .. } => "tool_call",
            StreamEvent::ToolResult { .. } => "tool_result",
            StreamEvent::Heartbeat => "heartbeat",
            StreamEvent::Complete { .. } => "complete",
            StreamEvent::Error { .. } => "error",
        }
    }
}
