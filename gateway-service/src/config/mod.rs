use serde::Deserialize;
use service_core::config::{self as core_config, get_env, get_optional_env, parse_env, Environment};
use service_core::error::AppError;
use std::time::Duration;

/// Path the refresh cookie is scoped to.
pub const AUTH_PATH: &str = "/api/v1/auth";

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    #[serde(flatten)]
    pub common: core_config::Config,
    pub environment: Environment,
    pub service_name: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub auth: AuthConfig,
    pub quota: QuotaConfig,
    pub stream: StreamConfig,
    pub session: SessionConfig,
    pub redis: Option<RedisConfig>,
    pub upstream: Option<UpstreamConfig>,
    pub rate_limit: RateLimitConfig,
    pub security: SecurityConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// HS256 secret; credentials cannot be issued without it.
    pub signing_secret: Option<String>,
    /// Argon2 PHC string for the shared password login.
    pub password_hash: Option<String>,
    pub access_ttl_seconds: i64,
    pub refresh_ttl_seconds: i64,
    pub auth_required: bool,
    pub cookie_secure: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuotaConfig {
    pub daily_limit: u32,
    pub enforced: bool,
    /// Let requests through when the usage store is unreachable.
    pub fail_open: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    pub heartbeat_interval_seconds: u64,
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    pub history_limit: usize,
    pub max_stored_turns: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    pub url: String,
    pub model: String,
    pub connect_timeout_seconds: u64,
    /// Longest silence tolerated between body reads.
    pub idle_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    pub calls: u32,
    pub window_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    pub allowed_origins: Vec<String>,
}

impl StreamConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }
}

impl GatewayConfig {
    pub fn load() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;
        let environment = Environment::from_env()?;
        let is_prod = environment.is_prod();

        let config = GatewayConfig {
            common: common_config,
            environment,
            service_name: get_env("SERVICE_NAME", Some("gateway-service"), is_prod)?,
            log_level: get_env("LOG_LEVEL", Some("info"), is_prod)?,
            otlp_endpoint: get_optional_env("OTLP_ENDPOINT"),
            auth: AuthConfig {
                signing_secret: if is_prod {
                    Some(get_env("AUTH_JWT_SECRET", None, true)?)
                } else {
                    get_optional_env("AUTH_JWT_SECRET")
                },
                password_hash: get_optional_env("AUTH_PASSWORD_HASH"),
                access_ttl_seconds: parse_env("AUTH_ACCESS_TOKEN_EXPIRE", 900, is_prod)?,
                refresh_ttl_seconds: parse_env("AUTH_REFRESH_TOKEN_EXPIRE", 604_800, is_prod)?,
                auth_required: parse_env("AUTH_REQUIRED", true, is_prod)?,
                cookie_secure: parse_env("AUTH_COOKIE_SECURE", true, is_prod)?,
            },
            quota: QuotaConfig {
                daily_limit: parse_env("ACADEMIC_DAILY_QUERY_LIMIT", 50, is_prod)?,
                enforced: parse_env("QUOTA_ENFORCED", true, is_prod)?,
                fail_open: parse_env("QUOTA_FAIL_OPEN", false, is_prod)?,
            },
            stream: StreamConfig {
                heartbeat_interval_seconds: parse_env(
                    "STREAM_HEARTBEAT_INTERVAL_SECONDS",
                    5,
                    is_prod,
                )?,
                queue_capacity: parse_env("STREAM_QUEUE_CAPACITY", 64, is_prod)?,
            },
            session: SessionConfig {
                history_limit: parse_env("SESSION_HISTORY_LIMIT", 10, is_prod)?,
                max_stored_turns: parse_env("SESSION_MAX_STORED_TURNS", 100, is_prod)?,
            },
            redis: get_optional_env("REDIS_URL").map(|url| RedisConfig { url }),
            upstream: match get_optional_env("UPSTREAM_URL") {
                Some(url) => Some(UpstreamConfig {
                    url,
                    model: get_env("UPSTREAM_MODEL", Some("default"), is_prod)?,
                    connect_timeout_seconds: parse_env(
                        "UPSTREAM_CONNECT_TIMEOUT_SECONDS",
                        10,
                        is_prod,
                    )?,
                    idle_timeout_seconds: parse_env("UPSTREAM_TIMEOUT_SECONDS", 300, is_prod)?,
                }),
                None => None,
            },
            rate_limit: RateLimitConfig {
                calls: parse_env("RATE_LIMIT_CALLS", 60, is_prod)?,
                window_seconds: parse_env("RATE_LIMIT_WINDOW_SECONDS", 60, is_prod)?,
            },
            security: SecurityConfig {
                allowed_origins: get_env("ALLOWED_ORIGINS", Some("http://localhost:3000"), is_prod)?
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.auth.access_ttl_seconds <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "AUTH_ACCESS_TOKEN_EXPIRE must be positive"
            )));
        }

        if self.auth.refresh_ttl_seconds <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "AUTH_REFRESH_TOKEN_EXPIRE must be positive"
            )));
        }

        if self.stream.heartbeat_interval_seconds == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "STREAM_HEARTBEAT_INTERVAL_SECONDS must be greater than 0"
            )));
        }

        if self.stream.queue_capacity == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "STREAM_QUEUE_CAPACITY must be greater than 0"
            )));
        }

        if self.session.history_limit == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "SESSION_HISTORY_LIMIT must be greater than 0"
            )));
        }

        if self.environment.is_prod() {
            if self.security.allowed_origins.iter().any(|o| o == "*") {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "Wildcard CORS origin not allowed in production"
                )));
            }

            if !self.auth.auth_required {
                tracing::error!("AUTH_REQUIRED=false in production - the gateway is publicly accessible");
            }
        }

        if self.auth.auth_required && self.auth.signing_secret.is_none() {
            tracing::warn!("AUTH_JWT_SECRET not set - credentials cannot be issued");
        }

        Ok(())
    }
}
