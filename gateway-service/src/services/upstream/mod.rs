//! Upstream responder abstraction.
//!
//! A responder turns a conversation history into a lazy sequence of
//! [`StreamEvent`]s. The gateway never looks inside; it only relays.

pub mod http;
pub mod mock;

use async_trait::async_trait;
use std::pin::Pin;
use thiserror::Error;
use tokio_stream::Stream;

use crate::models::{ChatMessage, StreamEvent};

#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("Upstream not configured: {0}")]
    NotConfigured(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("API error: {0}")]
    Api(String),

    #[error("Malformed upstream event: {0}")]
    Decode(String),
}

/// Type alias for responder event streams.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, UpstreamError>> + Send>>;

#[async_trait]
pub trait UpstreamResponder: Send + Sync {
    fn model_name(&self) -> &str;

    /// Start producing events for `messages`. Dropping the stream stops the work.
    async fn respond(&self, messages: Vec<ChatMessage>) -> Result<EventStream, UpstreamError>;

    async fn health_check(&self) -> Result<(), UpstreamError>;
}

pub use http::HttpResponder;
pub use mock::ScriptedResponder;
