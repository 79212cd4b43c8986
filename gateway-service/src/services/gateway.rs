//! Request orchestration: authenticate, gate on quota, relay, then meter.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use service_core::error::AppError;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::GatewayConfig;
use crate::models::{ChatMessage, StreamEvent, Tier};
use crate::services::credentials::{CredentialError, CredentialManager, CredentialType};
use crate::services::metrics;
use crate::services::quota::{QuotaLedger, QuotaReservation};
use crate::services::relay::{EventSink, RelayOutcome, SinkClosed, StreamRelay};
use crate::services::sessions::SessionStore;
use crate::services::upstream::UpstreamResponder;
use crate::services::usage_store::StoreError;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Not authenticated")]
    Unauthenticated,

    #[error("Daily limit of {limit} queries reached. {}", reset_hint(.retry_after_seconds))]
    QuotaExceeded { limit: u32, retry_after_seconds: u64 },

    #[error("Service misconfigured: {0}")]
    Configuration(String),

    #[error("{0}")]
    Unavailable(String),

    #[error(transparent)]
    Storage(#[from] StoreError),

    #[error("Upstream failed: {0}")]
    Upstream(String),
}

impl From<CredentialError> for GatewayError {
    fn from(err: CredentialError) -> Self {
        match err {
            CredentialError::NotConfigured => {
                GatewayError::Configuration("AUTH_JWT_SECRET is not configured".to_string())
            }
            CredentialError::Encoding(e) => GatewayError::Configuration(e),
            CredentialError::Rejected => GatewayError::Unauthenticated,
        }
    }
}

impl From<GatewayError> for AppError {
    fn from(err: GatewayError) -> Self {
        let message = err.to_string();
        match err {
            GatewayError::Unauthenticated => AppError::Unauthorized(anyhow::anyhow!(message)),
            GatewayError::QuotaExceeded {
                retry_after_seconds,
                ..
            } => AppError::TooManyRequests(message, Some(retry_after_seconds)),
            GatewayError::Configuration(msg) => AppError::ConfigError(anyhow::anyhow!(msg)),
            GatewayError::Unavailable(msg) => AppError::ServiceUnavailable(msg),
            GatewayError::Storage(e) => AppError::StorageError(anyhow::Error::new(e)),
            GatewayError::Upstream(msg) => AppError::BadGateway(msg),
        }
    }
}

/// Human-readable time until the allowance resets.
pub fn reset_hint(seconds: &u64) -> String {
    let total_minutes = seconds.div_ceil(60);
    let hours = total_minutes / 60;
    let minutes = total_minutes % 60;
    if hours > 0 {
        format!("Resets at midnight UTC (in {}h {}m).", hours, minutes)
    } else {
        format!("Resets at midnight UTC (in {}m).", minutes.max(1))
    }
}

/// The authenticated party behind a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub identity: Option<String>,
    pub tier: Tier,
}

impl Caller {
    pub fn anonymous() -> Self {
        Self {
            identity: None,
            tier: Tier::Full,
        }
    }

    /// Identity to meter against, only for quota-bound callers.
    fn metered_identity(&self) -> Option<&str> {
        if self.tier.is_quota_bound() {
            self.identity.as_deref()
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GatewayPolicy {
    pub auth_required: bool,
    pub quota_enforced: bool,
    pub fail_open: bool,
    pub history_limit: usize,
    pub queue_capacity: usize,
}

impl GatewayPolicy {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            auth_required: config.auth.auth_required,
            quota_enforced: config.quota.enforced,
            fail_open: config.quota.fail_open,
            history_limit: config.session.history_limit,
            queue_capacity: config.stream.queue_capacity,
        }
    }
}

/// Outcome of a collected (non-streaming) query.
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub response: String,
    pub metadata: Map<String, Value>,
}

pub struct GatewayService {
    credentials: CredentialManager,
    quota: QuotaLedger,
    sessions: Arc<SessionStore>,
    responder: Option<Arc<dyn UpstreamResponder>>,
    relay: StreamRelay,
    policy: GatewayPolicy,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl GatewayService {
    pub fn new(
        credentials: CredentialManager,
        quota: QuotaLedger,
        sessions: Arc<SessionStore>,
        responder: Option<Arc<dyn UpstreamResponder>>,
        relay: StreamRelay,
        policy: GatewayPolicy,
    ) -> Self {
        Self {
            credentials,
            quota,
            sessions,
            responder,
            relay,
            policy,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    pub fn credentials(&self) -> &CredentialManager {
        &self.credentials
    }

    pub fn quota(&self) -> &QuotaLedger {
        &self.quota
    }

    pub fn policy(&self) -> GatewayPolicy {
        self.policy
    }

    pub fn responder_model(&self) -> Option<&str> {
        self.responder.as_deref().map(|r| r.model_name())
    }

    pub async fn upstream_health(&self) -> Result<(), GatewayError> {
        match &self.responder {
            Some(responder) => responder
                .health_check()
                .await
                .map_err(|e| GatewayError::Upstream(e.to_string())),
            None => Err(GatewayError::Unavailable(
                "Upstream responder not configured".to_string(),
            )),
        }
    }

    /// Resolve an access credential into a caller.
    pub fn authenticate(&self, token: Option<&str>) -> Result<Caller, GatewayError> {
        if !self.policy.auth_required {
            return Ok(Caller::anonymous());
        }

        if !self.credentials.is_configured() {
            return Err(CredentialError::NotConfigured.into());
        }

        let Some(token) = token else {
            metrics::record_auth_failure("missing");
            return Err(GatewayError::Unauthenticated);
        };

        if !self.credentials.verify(token, CredentialType::Access) {
            let reason = match self.credentials.decode(token) {
                Some(claims) if claims.credential_type != CredentialType::Access => "wrong_type",
                Some(_) => "expired",
                None => "invalid",
            };
            metrics::record_auth_failure(reason);
            tracing::debug!(reason, "Access credential rejected");
            return Err(GatewayError::Unauthenticated);
        }

        let claims = self
            .credentials
            .decode(token)
            .ok_or(GatewayError::Unauthenticated)?;
        let tier = claims.tier();

        if tier.is_quota_bound() && claims.sub.is_none() {
            metrics::record_auth_failure("missing_subject");
            return Err(GatewayError::Unauthenticated);
        }

        Ok(Caller {
            identity: claims.sub,
            tier,
        })
    }

    /// Hold one unit of allowance for a quota-bound caller until the stream ends.
    /// `None` when the caller is not gated or the store is down and policy fails open.
    pub async fn reserve_quota(
        &self,
        caller: &Caller,
    ) -> Result<Option<QuotaReservation>, GatewayError> {
        if !self.policy.quota_enforced {
            return Ok(None);
        }
        let Some(identity) = caller.metered_identity() else {
            return Ok(None);
        };

        match self.quota.reserve(identity).await {
            Ok(Some(reservation)) => Ok(Some(reservation)),
            Ok(None) => {
                metrics::record_quota_rejection();
                tracing::info!(identity = %identity, "Daily quota exhausted");
                Err(GatewayError::QuotaExceeded {
                    limit: self.quota.daily_limit(),
                    retry_after_seconds: self.quota.seconds_until_reset(),
                })
            }
            Err(e) if self.policy.fail_open => {
                metrics::record_store_error("remaining");
                tracing::warn!(identity = %identity, error = %e, "Usage store unreachable, failing open");
                Ok(None)
            }
            Err(e) => {
                metrics::record_store_error("remaining");
                tracing::error!(identity = %identity, error = %e, "Usage store unreachable, failing closed");
                Err(e.into())
            }
        }
    }

    /// Gate the request and start relaying. The first event is always `start`.
    pub async fn open_stream(
        &self,
        caller: Caller,
        question: String,
        session_id: Option<String>,
    ) -> Result<mpsc::Receiver<StreamEvent>, GatewayError> {
        let responder = self.responder.clone().ok_or_else(|| {
            GatewayError::Unavailable("Upstream responder not configured".to_string())
        })?;

        let reservation = self.reserve_quota(&caller).await?;

        let history = session_id
            .as_deref()
            .map(|id| self.sessions.recent(id, self.policy.history_limit))
            .unwrap_or_default();
        let messages = ChatMessage::history(&history, &question);

        let (tx, rx) = mpsc::channel(self.policy.queue_capacity.max(2));
        let _ = tx.try_send(StreamEvent::Start {
            session_id: session_id.clone(),
        });

        tracing::info!(
            identity = caller.identity.as_deref().unwrap_or("-"),
            tier = caller.tier.as_str(),
            session_id = session_id.as_deref().unwrap_or("-"),
            history_turns = history.len(),
            "Stream opened"
        );

        let sink = MeteringSink {
            tx,
            caller,
            question,
            session_id,
            response: String::new(),
            reservation,
            quota: self.quota.clone(),
            sessions: self.sessions.clone(),
            fail_open: self.policy.fail_open,
            started: Instant::now(),
        };

        let relay = self.relay.clone();
        let cancel = self.shutdown.child_token();
        let shutdown = self.shutdown.clone();

        metrics::inc_streams_in_flight();
        self.tracker.spawn(async move {
            let started = sink.started;
            let (outcome, sink) = drive(relay, responder, messages, sink, cancel).await;

            if outcome == RelayOutcome::Cancelled && shutdown.is_cancelled() {
                let _ = sink
                    .tx
                    .try_send(StreamEvent::error("Server is shutting down"));
            }

            metrics::dec_streams_in_flight();
            metrics::record_stream(outcome.as_str(), started.elapsed().as_secs_f64());
            tracing::info!(
                identity = sink.caller.identity.as_deref().unwrap_or("-"),
                session_id = sink.session_id.as_deref().unwrap_or("-"),
                outcome = outcome.as_str(),
                "Stream closed"
            );
        });

        Ok(rx)
    }

    /// Run the same gated pipeline and collect the answer.
    pub async fn query(
        &self,
        caller: Caller,
        question: String,
        session_id: Option<String>,
    ) -> Result<QueryResult, GatewayError> {
        let mut rx = self.open_stream(caller, question, session_id).await?;
        let mut response = String::new();

        while let Some(event) = rx.recv().await {
            match event {
                StreamEvent::Content { content } => response.push_str(&content),
                StreamEvent::Complete { metadata } => {
                    return Ok(QueryResult { response, metadata })
                }
                StreamEvent::Error { message } => return Err(GatewayError::Upstream(message)),
                _ => {}
            }
        }

        Err(GatewayError::Upstream("Stream ended unexpectedly".to_string()))
    }

    /// Drop one session's history. The shared responder is left untouched.
    pub fn clear_session(&self, session_id: &str) -> bool {
        tracing::info!(session_id, "Session history cleared");
        self.sessions.clear(session_id)
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.active_sessions()
    }

    /// Cancel every live relay and wait for their producers to stop.
    pub async fn shutdown(&self) {
        tracing::info!(active = self.tracker.len(), "Stopping live streams");
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

/// Relay while watching for the client to go away.
async fn drive(
    relay: StreamRelay,
    responder: Arc<dyn UpstreamResponder>,
    messages: Vec<ChatMessage>,
    mut sink: MeteringSink,
    cancel: CancellationToken,
) -> (RelayOutcome, MeteringSink) {
    let watched = sink.tx.clone();

    let run = async {
        let outcome = relay.run(responder, messages, &mut sink, &cancel).await;
        cancel.cancel();
        outcome
    };
    let watch = async {
        tokio::select! {
            _ = watched.closed() => {
                tracing::debug!("Client disconnected, cancelling relay");
                cancel.cancel();
            }
            _ = cancel.cancelled() => {}
        }
    };

    let (outcome, ()) = tokio::join!(run, watch);
    (outcome, sink)
}

/// Forwards relayed events to the client, metering usage on `complete`.
struct MeteringSink {
    tx: mpsc::Sender<StreamEvent>,
    caller: Caller,
    question: String,
    session_id: Option<String>,
    response: String,
    reservation: Option<QuotaReservation>,
    quota: QuotaLedger,
    sessions: Arc<SessionStore>,
    fail_open: bool,
    started: Instant,
}

impl MeteringSink {
    async fn on_complete(&mut self, mut metadata: Map<String, Value>) -> StreamEvent {
        let elapsed = self.started.elapsed().as_secs_f64();
        metadata.insert(
            "execution_time".to_string(),
            json!((elapsed * 100.0).round() / 100.0),
        );

        let recorded = match (self.reservation.take(), self.caller.metered_identity()) {
            (Some(reservation), _) => Some(reservation.commit().await),
            (None, Some(identity)) => Some(self.quota.increment(identity).await),
            (None, None) => None,
        };

        if let Some(result) = recorded {
            let identity = self.caller.identity.as_deref().unwrap_or("-");
            match result {
                Ok(count) => {
                    let remaining =
                        u64::from(self.quota.daily_limit()).saturating_sub(count);
                    metadata.insert("queries_remaining".to_string(), json!(remaining));
                }
                Err(e) if self.fail_open => {
                    metrics::record_store_error("increment");
                    tracing::warn!(identity = %identity, error = %e, "Usage not recorded, failing open");
                }
                Err(e) => {
                    metrics::record_store_error("increment");
                    tracing::error!(identity = %identity, error = %e, "Usage not recorded, failing closed");
                    return StreamEvent::error("Usage could not be recorded, please retry");
                }
            }
        }

        if let Some(session_id) = &self.session_id {
            self.sessions.append(
                session_id,
                self.question.clone(),
                std::mem::take(&mut self.response),
            );
        }

        StreamEvent::Complete { metadata }
    }
}

#[async_trait]
impl EventSink for MeteringSink {
    async fn deliver(&mut self, event: StreamEvent) -> Result<(), SinkClosed> {
        let event = match event {
            StreamEvent::Content { content } => {
                self.response.push_str(&content);
                StreamEvent::Content { content }
            }
            StreamEvent::Complete { metadata } => self.on_complete(metadata).await,
            other => other,
        };
        self.tx.send(event).await.map_err(|_| SinkClosed)
    }
}
