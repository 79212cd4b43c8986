//! Heartbeat-injecting bridge between an upstream responder and a client.
//!
//! One relay run owns a bounded queue, a producer task that drains the
//! responder into it, and a consumer loop that forwards queued events. While
//! the queue stays empty for a full heartbeat interval the consumer emits a
//! synthetic `heartbeat`, so intermediaries never see a silent connection.
//!
//! The producer always finishes with exactly one terminal event followed by
//! an end marker. Whatever ends the run (end marker, cancellation, a closed
//! sink) the producer task is aborted and awaited before `run` returns.

use async_trait::async_trait;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::models::{ChatMessage, StreamEvent};
use crate::services::metrics;
use crate::services::upstream::UpstreamResponder;

/// The receiving side went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkClosed;

/// Destination for relayed events.
#[async_trait]
pub trait EventSink: Send {
    async fn deliver(&mut self, event: StreamEvent) -> Result<(), SinkClosed>;
}

#[async_trait]
impl EventSink for mpsc::Sender<StreamEvent> {
    async fn deliver(&mut self, event: StreamEvent) -> Result<(), SinkClosed> {
        self.send(event).await.map_err(|_| SinkClosed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// A `complete` event was delivered.
    Completed,
    /// An `error` event was delivered.
    Failed,
    /// Cancelled, or the sink closed, before a terminal event was delivered.
    Cancelled,
}

impl RelayOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            RelayOutcome::Completed => "completed",
            RelayOutcome::Failed => "failed",
            RelayOutcome::Cancelled => "cancelled",
        }
    }
}

enum RelayItem {
    Event(StreamEvent),
    End,
}

#[derive(Debug, Clone)]
pub struct StreamRelay {
    heartbeat_interval: Duration,
    queue_capacity: usize,
}

impl StreamRelay {
    pub fn new(heartbeat_interval: Duration, queue_capacity: usize) -> Self {
        Self {
            heartbeat_interval,
            queue_capacity: queue_capacity.max(1),
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    pub async fn run(
        &self,
        responder: Arc<dyn UpstreamResponder>,
        messages: Vec<ChatMessage>,
        sink: &mut dyn EventSink,
        cancel: &CancellationToken,
    ) -> RelayOutcome {
        let (tx, mut rx) = mpsc::channel(self.queue_capacity);
        let finished = Arc::new(AtomicBool::new(false));

        let producer = tokio::spawn(produce(responder, messages, tx, finished.clone()));

        let outcome = self.consume(&mut rx, sink, cancel, &finished).await;

        producer.abort();
        if let Err(e) = producer.await {
            if e.is_panic() {
                tracing::error!(error = %e, "Relay producer panicked");
            }
        }
        drop(rx);

        tracing::debug!(outcome = outcome.as_str(), "Relay finished");
        outcome
    }

    async fn consume(
        &self,
        rx: &mut mpsc::Receiver<RelayItem>,
        sink: &mut dyn EventSink,
        cancel: &CancellationToken,
        finished: &AtomicBool,
    ) -> RelayOutcome {
        let mut terminal: Option<RelayOutcome> = None;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return RelayOutcome::Cancelled,
                next = tokio::time::timeout(self.heartbeat_interval, rx.recv()) => next,
            };

            let event = match next {
                Ok(Some(RelayItem::Event(event))) => event,
                Ok(Some(RelayItem::End)) => return terminal.unwrap_or(RelayOutcome::Failed),
                Ok(None) => {
                    // Producer went away without its end marker.
                    if terminal.is_some() {
                        return terminal.unwrap_or(RelayOutcome::Failed);
                    }
                    StreamEvent::error("Stream interrupted")
                }
                Err(_) if finished.load(Ordering::SeqCst) => {
                    return terminal.unwrap_or(RelayOutcome::Failed);
                }
                // Nothing follows a terminal event, not even a heartbeat.
                Err(_) if terminal.is_some() => continue,
                Err(_) => {
                    metrics::record_heartbeat();
                    StreamEvent::Heartbeat
                }
            };

            if terminal.is_some() {
                tracing::debug!(kind = event.kind(), "Discarding event after terminal");
                continue;
            }

            let outcome = match &event {
                StreamEvent::Complete { .. } => Some(RelayOutcome::Completed),
                StreamEvent::Error { .. } => Some(RelayOutcome::Failed),
                _ => None,
            };

            let delivered = tokio::select! {
                biased;
                _ = cancel.cancelled() => return RelayOutcome::Cancelled,
                delivered = sink.deliver(event) => delivered,
            };
            if delivered.is_err() {
                tracing::debug!("Relay sink closed, cancelling");
                return RelayOutcome::Cancelled;
            }

            if outcome.is_some() {
                terminal = outcome;
            }
        }
    }
}

/// Drain the responder into the queue, ending with one terminal event and the end marker.
async fn produce(
    responder: Arc<dyn UpstreamResponder>,
    messages: Vec<ChatMessage>,
    tx: mpsc::Sender<RelayItem>,
    finished: Arc<AtomicBool>,
) {
    let mut terminated = false;

    match responder.respond(messages).await {
        Ok(mut events) => {
            while let Some(item) = events.next().await {
                let event = match item {
                    Ok(StreamEvent::Heartbeat) => continue,
                    Ok(event) => event,
                    Err(e) => {
                        tracing::warn!(error = %e, "Upstream failed mid-stream");
                        StreamEvent::error(e.to_string())
                    }
                };

                let is_terminal = event.is_terminal();
                if tx.send(RelayItem::Event(event)).await.is_err() {
                    return;
                }
                if is_terminal {
                    terminated = true;
                    break;
                }
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "Upstream failed before producing events");
            let _ = tx.send(RelayItem::Event(StreamEvent::error(e.to_string()))).await;
            terminated = true;
        }
    }

    if !terminated {
        tracing::warn!("Upstream ended without a terminal event");
        let _ = tx
            .send(RelayItem::Event(StreamEvent::error(
                "Upstream ended without a result",
            )))
            .await;
    }

    finished.store(true, Ordering::SeqCst);
    let _ = tx.send(RelayItem::End).await;
}
