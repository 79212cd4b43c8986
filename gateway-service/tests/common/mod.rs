//! Shared setup for gateway-service integration tests.
//!
//! Each test gets its own server on a random port, backed by an in-memory
//! usage store, a manual clock and a scripted upstream responder.

#![allow(dead_code)]

use argon2::password_hash::{rand_core::OsRng, PasswordHasher, SaltString};
use argon2::Argon2;
use gateway_service::config::{
    AuthConfig, GatewayConfig, QuotaConfig, RateLimitConfig, SecurityConfig, SessionConfig,
    StreamConfig,
};
use gateway_service::models::StreamEvent;
use gateway_service::services::{
    GatewayService, InMemoryUsageStore, ManualClock, ScriptedResponder, UpstreamResponder,
};
use gateway_service::startup::{Application, Dependencies};
use service_core::config::{Config, Environment};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const TEST_PASSWORD: &str = "correct horse battery staple";
pub const TEST_SECRET: &str = "integration-test-signing-secret";

pub fn test_config() -> GatewayConfig {
    let salt = SaltString::generate(&mut OsRng);
    let password_hash = Argon2::default()
        .hash_password(TEST_PASSWORD.as_bytes(), &salt)
        .expect("Failed to hash test password")
        .to_string();

    GatewayConfig {
        common: Config { port: 0 },
        environment: Environment::Test,
        service_name: "gateway-service-test".to_string(),
        log_level: "debug".to_string(),
        otlp_endpoint: None,
        auth: AuthConfig {
            signing_secret: Some(TEST_SECRET.to_string()),
            password_hash: Some(password_hash),
            access_ttl_seconds: 900,
            refresh_ttl_seconds: 604_800,
            auth_required: true,
            cookie_secure: false,
        },
        quota: QuotaConfig {
            daily_limit: 2,
            enforced: true,
            fail_open: false,
        },
        stream: StreamConfig {
            heartbeat_interval_seconds: 5,
            queue_capacity: 16,
        },
        session: SessionConfig {
            history_limit: 10,
            max_stored_turns: 100,
        },
        redis: None,
        upstream: None,
        rate_limit: RateLimitConfig {
            calls: 1000,
            window_seconds: 60,
        },
        security: SecurityConfig {
            allowed_origins: vec!["http://localhost:3000".to_string()],
        },
    }
}

pub struct TestApp {
    pub address: String,
    pub store: Arc<InMemoryUsageStore>,
    pub clock: Arc<ManualClock>,
    pub responder: Arc<ScriptedResponder>,
    pub gateway: Arc<GatewayService>,
    shutdown: CancellationToken,
    server: Option<JoinHandle<std::io::Result<()>>>,
}

impl TestApp {
    pub async fn spawn() -> Self {
        Self::spawn_with(test_config(), ScriptedResponder::answering(&["Hello", ", world"])).await
    }

    pub async fn spawn_with(config: GatewayConfig, responder: ScriptedResponder) -> Self {
        let store = Arc::new(InMemoryUsageStore::new());
        let clock = Arc::new(ManualClock::new(
            "2026-03-01T12:00:00Z".parse().expect("valid timestamp"),
        ));
        let responder = Arc::new(responder);

        let deps = Dependencies {
            store: store.clone(),
            responder: Some(responder.clone() as Arc<dyn UpstreamResponder>),
            clock: clock.clone(),
        };

        let app = Application::build_with(config, deps)
            .await
            .expect("Failed to build application");
        let address = format!("http://127.0.0.1:{}", app.port());
        let gateway = app.gateway();

        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        let server = tokio::spawn(async move {
            app.run_until_stopped(async move { signal.cancelled().await })
                .await
        });

        Self {
            address,
            store,
            clock,
            responder,
            gateway,
            shutdown,
            server: Some(server),
        }
    }

    /// Client that keeps cookies between requests, like a browser.
    pub fn client(&self) -> reqwest::Client {
        reqwest::Client::builder()
            .cookie_store(true)
            .build()
            .expect("Failed to build client")
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.address, path)
    }

    pub async fn login(&self, client: &reqwest::Client) -> reqwest::Response {
        client
            .post(self.url("/api/v1/auth/login"))
            .json(&serde_json::json!({ "password": TEST_PASSWORD }))
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn register(&self, client: &reqwest::Client, email: &str) -> reqwest::Response {
        client
            .post(self.url("/api/v1/auth/academic/register"))
            .json(&serde_json::json!({ "email": email }))
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn ask(&self, client: &reqwest::Client, question: &str) -> reqwest::Response {
        client
            .post(self.url("/api/v1/chat/stream"))
            .json(&serde_json::json!({ "question": question }))
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn stop(mut self) {
        self.shutdown.cancel();
        if let Some(server) = self.server.take() {
            let _ = server.await;
        }
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Events of a finished SSE body, plus whether it ended with `[DONE]`.
pub fn parse_sse(body: &str) -> (Vec<StreamEvent>, bool) {
    let mut events = Vec::new();
    let mut done = false;

    for line in body.lines() {
        let Some(data) = line.strip_prefix("data:") else {
            continue;
        };
        let data = data.trim();
        if data == "[DONE]" {
            done = true;
            continue;
        }
        events.push(serde_json::from_str(data).expect("Failed to parse SSE event"));
    }

    (events, done)
}

/// Value of a `Set-Cookie` header for `name`, if the response carries one.
pub fn set_cookie<'a>(response: &'a reqwest::Response, name: &str) -> Option<&'a str> {
    response
        .headers()
        .get_all(reqwest::header::SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find(|value| value.starts_with(&format!("{}=", name)))
}
