pub mod config;
pub mod dtos;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod startup;
pub mod utils;

use axum::{
    http::{header, HeaderValue, Method},
    middleware::{from_fn, from_fn_with_state},
    routing::{delete, get, post},
    Router,
};
use service_core::middleware::{
    rate_limit::{ip_rate_limit_middleware, IpRateLimiter},
    security_headers::security_headers_middleware,
    tracing::{request_id_middleware, RequestId},
};
use std::sync::Arc;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};

use crate::config::GatewayConfig;
use crate::services::GatewayService;
use crate::utils::PasswordHashString;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub gateway: Arc<GatewayService>,
    pub password_hash: Option<PasswordHashString>,
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let allow_origin = if allowed_origins.iter().any(|o| o == "*") {
        // Credentialed requests cannot use a literal wildcard.
        AllowOrigin::mirror_request()
    } else {
        AllowOrigin::list(allowed_origins.iter().filter_map(|o| {
            o.parse::<HeaderValue>()
                .map_err(|e| tracing::error!("Invalid CORS origin '{}': {}. Skipping.", o, e))
                .ok()
        }))
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
}

pub fn build_router(state: AppState, ip_limiter: IpRateLimiter) -> Router {
    let auth_routes = Router::new()
        .route("/login", post(handlers::auth::login))
        .route("/academic/register", post(handlers::auth::academic_register))
        .route("/refresh", post(handlers::auth::refresh))
        .route("/logout", post(handlers::auth::logout))
        .route("/verify", get(handlers::auth::verify))
        .merge(
            Router::new()
                .route("/usage", get(handlers::auth::usage))
                .layer(from_fn_with_state(
                    state.clone(),
                    middleware::auth_middleware,
                )),
        );

    let chat_routes = Router::new()
        .route("/stream", post(handlers::chat::stream))
        .route("/query", post(handlers::chat::query))
        .route("/history", delete(handlers::chat::clear_history))
        .route("/status", get(handlers::chat::status))
        .layer(from_fn_with_state(state.clone(), middleware::auth_middleware));

    let api_routes = Router::new()
        .nest("/auth", auth_routes)
        .nest("/chat", chat_routes)
        .layer(from_fn_with_state(ip_limiter, ip_rate_limit_middleware));

    let allowed_origins = state.config.security.allowed_origins.clone();

    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/ready", get(handlers::health::readiness_check))
        .route("/metrics", get(handlers::metrics::metrics))
        .nest("/api/v1", api_routes)
        .with_state(state)
        // Add tracing layer
        .layer(TraceLayer::new_for_http().make_span_with(
            |request: &axum::http::Request<_>| {
                let request_id = request
                    .extensions()
                    .get::<RequestId>()
                    .map(|id| id.0.as_str())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri(),
                    version = ?request.version(),
                )
            },
        ))
        // Outside the trace layer so the span sees the request id
        .layer(from_fn(request_id_middleware))
        // Add security headers middleware
        .layer(from_fn(security_headers_middleware))
        .layer(cors_layer(&allowed_origins))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        AuthConfig, QuotaConfig, RateLimitConfig, SecurityConfig, SessionConfig, StreamConfig,
    };
    use crate::services::{
        CredentialManager, GatewayPolicy, InMemoryUsageStore, QuotaLedger, SessionStore,
        StreamRelay, SystemClock,
    };
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use service_core::config::{Config, Environment};
    use service_core::middleware::rate_limit::create_ip_rate_limiter;
    use std::time::Duration;
    use tower::ServiceExt;

    fn router(allowed_origins: Vec<String>) -> Router {
        let config = GatewayConfig {
            common: Config { port: 0 },
            environment: Environment::Test,
            service_name: "gateway-service-test".to_string(),
            log_level: "debug".to_string(),
            otlp_endpoint: None,
            auth: AuthConfig {
                signing_secret: Some("router-test-secret".to_string()),
                password_hash: None,
                access_ttl_seconds: 900,
                refresh_ttl_seconds: 3600,
                auth_required: true,
                cookie_secure: false,
            },
            quota: QuotaConfig {
                daily_limit: 5,
                enforced: true,
                fail_open: false,
            },
            stream: StreamConfig {
                heartbeat_interval_seconds: 5,
                queue_capacity: 8,
            },
            session: SessionConfig {
                history_limit: 10,
                max_stored_turns: 20,
            },
            redis: None,
            upstream: None,
            rate_limit: RateLimitConfig {
                calls: 100,
                window_seconds: 60,
            },
            security: SecurityConfig { allowed_origins },
        };

        let gateway = GatewayService::new(
            CredentialManager::new(&config.auth),
            QuotaLedger::new(
                Arc::new(InMemoryUsageStore::new()),
                Arc::new(SystemClock),
                config.quota.daily_limit,
            ),
            Arc::new(SessionStore::new(config.session.max_stored_turns)),
            None,
            StreamRelay::new(Duration::from_secs(5), 8),
            GatewayPolicy::from_config(&config),
        );

        let state = AppState {
            config: Arc::new(config),
            gateway: Arc::new(gateway),
            password_hash: None,
        };
        build_router(state, create_ip_rate_limiter(100, 60))
    }

    #[tokio::test]
    async fn responses_carry_request_id_and_security_headers() {
        let res = router(vec!["http://localhost:3000".to_string()])
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .header("x-request-id", "req-123")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers()["x-request-id"], "req-123");
        assert_eq!(res.headers()["x-content-type-options"], "nosniff");
    }

    #[tokio::test]
    async fn cors_allows_credentials_for_listed_origin() {
        let res = router(vec!["http://localhost:3000".to_string()])
            .oneshot(
                Request::builder()
                    .method("OPTIONS")
                    .uri("/api/v1/auth/login")
                    .header("origin", "http://localhost:3000")
                    .header("access-control-request-method", "POST")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(
            res.headers()["access-control-allow-origin"],
            "http://localhost:3000"
        );
        assert_eq!(res.headers()["access-control-allow-credentials"], "true");
    }

    #[tokio::test]
    async fn wildcard_origin_is_mirrored_not_starred() {
        let res = router(vec!["*".to_string()])
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .header("origin", "http://example.test")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(
            res.headers()["access-control-allow-origin"],
            "http://example.test"
        );
    }

    #[tokio::test]
    async fn readiness_fails_without_upstream() {
        let res = router(vec![])
            .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
