//! Scripted responder for tests and local runs without an upstream.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{EventStream, UpstreamError, UpstreamResponder};
use crate::models::{ChatMessage, StreamEvent};

#[derive(Debug, Clone)]
enum ScriptItem {
    Event(StreamEvent),
    Fault(String),
}

#[derive(Debug, Clone)]
struct ScriptStep {
    delay: Duration,
    item: ScriptItem,
}

/// Counts streams dropped before their script ran out.
struct AbandonGuard {
    abandoned: Arc<AtomicUsize>,
    finished: bool,
}

impl Drop for AbandonGuard {
    fn drop(&mut self) {
        if !self.finished {
            self.abandoned.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Replays a fixed script of events on every call.
pub struct ScriptedResponder {
    model: String,
    script: Vec<ScriptStep>,
    fail_before_start: Option<String>,
    calls: AtomicUsize,
    abandoned: Arc<AtomicUsize>,
    last_messages: Mutex<Vec<ChatMessage>>,
}

impl Default for ScriptedResponder {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedResponder {
    pub fn new() -> Self {
        Self {
            model: "scripted".to_string(),
            script: Vec::new(),
            fail_before_start: None,
            calls: AtomicUsize::new(0),
            abandoned: Arc::new(AtomicUsize::new(0)),
            last_messages: Mutex::new(Vec::new()),
        }
    }

    /// Content deltas followed by `complete`.
    pub fn answering(parts: &[&str]) -> Self {
        parts
            .iter()
            .fold(Self::new(), |responder, part| responder.event(StreamEvent::content(*part)))
            .event(StreamEvent::complete())
    }

    pub fn event(self, event: StreamEvent) -> Self {
        self.event_after(Duration::ZERO, event)
    }

    pub fn event_after(mut self, delay: Duration, event: StreamEvent) -> Self {
        self.script.push(ScriptStep {
            delay,
            item: ScriptItem::Event(event),
        });
        self
    }

    /// Fail mid-stream after whatever came before.
    pub fn fault(mut self, message: impl Into<String>) -> Self {
        self.script.push(ScriptStep {
            delay: Duration::ZERO,
            item: ScriptItem::Fault(message.into()),
        });
        self
    }

    /// Fail the call itself, before any event is produced.
    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.fail_before_start = Some(message.into());
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn abandoned_streams(&self) -> usize {
        self.abandoned.load(Ordering::SeqCst)
    }

    pub fn last_messages(&self) -> Vec<ChatMessage> {
        self.last_messages
            .lock()
            .map(|m| m.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl UpstreamResponder for ScriptedResponder {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn respond(&self, messages: Vec<ChatMessage>) -> Result<EventStream, UpstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut last) = self.last_messages.lock() {
            *last = messages;
        }

        if let Some(message) = &self.fail_before_start {
            return Err(UpstreamError::Api(message.clone()));
        }

        let steps: VecDeque<ScriptStep> = self.script.iter().cloned().collect();
        let guard = AbandonGuard {
            abandoned: self.abandoned.clone(),
            finished: false,
        };

        let stream = futures::stream::unfold((steps, guard), |(mut steps, mut guard)| async move {
            match steps.pop_front() {
                Some(step) => {
                    if !step.delay.is_zero() {
                        tokio::time::sleep(step.delay).await;
                    }
                    let item = match step.item {
                        ScriptItem::Event(event) => Ok(event),
                        ScriptItem::Fault(message) => Err(UpstreamError::Api(message)),
                    };
                    Some((item, (steps, guard)))
                }
                None => {
                    guard.finished = true;
                    None
                }
            }
        });

        Ok(Box::pin(stream))
    }

    async fn health_check(&self) -> Result<(), UpstreamError> {
        match &self.fail_before_start {
            Some(message) => Err(UpstreamError::Api(message.clone())),
            None => Ok(()),
        }
    }
}
