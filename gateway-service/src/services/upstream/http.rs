//! Responder backed by an HTTP endpoint speaking `data: <json>` event framing.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt::Display;
use std::time::Duration;
use tokio_stream::Stream;

use super::{EventStream, UpstreamError, UpstreamResponder};
use crate::config::UpstreamConfig;
use crate::models::{ChatMessage, StreamEvent};
use service_core::observability::inject_trace_context;

const DONE_MARKER: &str = "[DONE]";

#[derive(Serialize)]
struct RespondRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
}

pub struct HttpResponder {
    config: UpstreamConfig,
    client: Client,
}

impl HttpResponder {
    pub fn new(config: UpstreamConfig) -> Result<Self, UpstreamError> {
        // Streams may run for minutes, so only connecting and silence are bounded.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_seconds))
            .read_timeout(Duration::from_secs(config.idle_timeout_seconds))
            .build()
            .map_err(|e| UpstreamError::NotConfigured(format!("HTTP client: {}", e)))?;

        tracing::info!(url = %config.url, model = %config.model, "Upstream responder configured");

        Ok(Self { config, client })
    }
}

#[async_trait]
impl UpstreamResponder for HttpResponder {
    fn model_name(&self) -> &str {
        &self.config.model
    }

    async fn respond(&self, messages: Vec<ChatMessage>) -> Result<EventStream, UpstreamError> {
        let mut headers = reqwest::header::HeaderMap::new();
        inject_trace_context(&mut headers);

        tracing::debug!(
            model = %self.config.model,
            message_count = messages.len(),
            "Starting upstream stream"
        );

        let response = self
            .client
            .post(&self.config.url)
            .headers(headers)
            .json(&RespondRequest {
                model: &self.config.model,
                messages: &messages,
                stream: true,
            })
            .send()
            .await
            .map_err(|e| UpstreamError::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(UpstreamError::Api(format!(
                "Upstream error {}: {}",
                status, error_text
            )));
        }

        Ok(decode_event_stream(Box::pin(response.bytes_stream())))
    }

    async fn health_check(&self) -> Result<(), UpstreamError> {
        self.client
            .head(&self.config.url)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| UpstreamError::Network(e.to_string()))
    }
}

/// Incremental parser for `data:` frames separated by blank lines.
///
/// Bytes are buffered until a whole frame has arrived, so multibyte
/// characters and CRLF pairs may be split across network chunks.
#[derive(Default)]
struct FrameDecoder {
    buffer: Vec<u8>,
    pending: VecDeque<Result<StreamEvent, UpstreamError>>,
    finished: bool,
}

/// Offset just past the blank line that closes the first frame.
fn frame_end(buffer: &[u8]) -> Option<usize> {
    buffer
        .iter()
        .enumerate()
        .filter(|(_, byte)| **byte == b'\n')
        .find_map(|(i, _)| match &buffer[i + 1..] {
            [b'\n', ..] => Some(i + 2),
            [b'\r', b'\n', ..] => Some(i + 3),
            _ => None,
        })
}

impl FrameDecoder {
    fn feed(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);

        while let Some(end) = frame_end(&self.buffer) {
            let frame: Vec<u8> = self.buffer.drain(..end).collect();
            self.decode_frame(&frame);
            if self.finished {
                self.buffer.clear();
                return;
            }
        }
    }

    /// A trailing frame without its blank line still counts at end of body.
    fn finish(&mut self) {
        if !self.finished && !self.buffer.iter().all(u8::is_ascii_whitespace) {
            let frame = std::mem::take(&mut self.buffer);
            self.decode_frame(&frame);
        }
        self.finished = true;
    }

    fn decode_frame(&mut self, frame: &[u8]) {
        let frame = match std::str::from_utf8(frame) {
            Ok(frame) => frame,
            Err(e) => {
                self.fail(UpstreamError::Decode(format!("invalid UTF-8: {}", e)));
                return;
            }
        };

        let data: Vec<&str> = frame
            .lines()
            .filter_map(|line| line.strip_prefix("data:"))
            .map(|d| d.strip_prefix(' ').unwrap_or(d))
            .collect();

        if data.is_empty() {
            return;
        }

        let payload = data.join("\n");
        if payload.trim() == DONE_MARKER {
            self.finished = true;
            return;
        }

        match serde_json::from_str::<StreamEvent>(&payload) {
            Ok(event) => self.pending.push_back(Ok(event)),
            Err(e) => self.fail(UpstreamError::Decode(e.to_string())),
        }
    }

    fn fail(&mut self, err: UpstreamError) {
        self.pending.push_back(Err(err));
        self.finished = true;
    }
}

/// Turn a raw body into events without spawning; dropping the result drops the body.
fn decode_event_stream<S, B, E>(body: S) -> EventStream
where
    S: Stream<Item = Result<B, E>> + Unpin + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let stream = futures::stream::unfold(
        (body, FrameDecoder::default()),
        |(mut body, mut decoder)| async move {
            loop {
                if let Some(item) = decoder.pending.pop_front() {
                    return Some((item, (body, decoder)));
                }
                if decoder.finished {
                    return None;
                }
                match body.next().await {
                    Some(Ok(chunk)) => decoder.feed(chunk.as_ref()),
                    Some(Err(e)) => {
                        decoder
                            .pending
                            .push_back(Err(UpstreamError::Network(e.to_string())));
                        decoder.finished = true;
                    }
                    None => decoder.finish(),
                }
            }
        },
    );

    Box::pin(stream)
}
