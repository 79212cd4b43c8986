//! Conversation turns and the message history handed to upstream responders.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One completed question/response exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub question: String,
    pub response: String,
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    pub fn new(question: String, response: String) -> Self {
        Self {
            question,
            response,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }

    /// Expand prior turns into alternating user/assistant messages, then
    /// append the new question.
    pub fn history(turns: &[Turn], question: &str) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(turns.len() * 2 + 1);
        for turn in turns {
            messages.push(ChatMessage::user(turn.question.clone()));
            messages.push(ChatMessage::assistant(turn.response.clone()));
        }
        messages.push(ChatMessage::user(question));
        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_interleaves_turns_and_ends_with_question() {
        let turns = vec![
            Turn::new("q1".into(), "r1".into()),
            Turn::new("q2".into(), "r2".into()),
        ];

        let messages = ChatMessage::history(&turns, "q3");

        assert_eq!(
            messages,
            vec![
                ChatMessage::user("q1"),
                ChatMessage::assistant("r1"),
                ChatMessage::user("q2"),
                ChatMessage::assistant("r2"),
                ChatMessage::user("q3"),
            ]
        );
    }
}
