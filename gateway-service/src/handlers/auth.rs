use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use service_core::error::AppError;

use crate::{
    config::AUTH_PATH,
    dtos::{AcademicRegisterRequest, AuthResponse, LoginRequest},
    middleware::{credential_token, AuthCaller, ACCESS_COOKIE, REFRESH_COOKIE},
    models::{Tier, UsageStats},
    services::{metrics, CredentialError, CredentialPair, CredentialType, GatewayError},
    utils::{verify_password, Password, ValidatedJson},
    AppState,
};

fn auth_cookie(
    name: &'static str,
    value: String,
    path: &'static str,
    max_age: time::Duration,
    secure: bool,
) -> Cookie<'static> {
    // Browsers drop SameSite=None cookies that are not also Secure.
    let same_site = if secure { SameSite::None } else { SameSite::Lax };

    Cookie::build((name, value))
        .path(path)
        .http_only(true)
        .secure(secure)
        .same_site(same_site)
        .max_age(max_age)
        .build()
}

fn set_auth_cookies(state: &AppState, jar: CookieJar, pair: CredentialPair) -> CookieJar {
    let credentials = state.gateway.credentials();
    let secure = state.config.auth.cookie_secure;

    jar.add(auth_cookie(
        ACCESS_COOKIE,
        pair.access,
        "/",
        time::Duration::seconds(credentials.ttl(CredentialType::Access).num_seconds()),
        secure,
    ))
    .add(auth_cookie(
        REFRESH_COOKIE,
        pair.refresh,
        AUTH_PATH,
        time::Duration::seconds(credentials.ttl(CredentialType::Refresh).num_seconds()),
        secure,
    ))
}

fn clear_auth_cookies(state: &AppState, jar: CookieJar) -> CookieJar {
    let secure = state.config.auth.cookie_secure;
    let expire = |cookie: Cookie<'static>| {
        let mut cookie = cookie;
        cookie.set_expires(time::OffsetDateTime::UNIX_EPOCH);
        cookie
    };

    jar.add(expire(auth_cookie(
        ACCESS_COOKIE,
        String::new(),
        "/",
        time::Duration::ZERO,
        secure,
    )))
    .add(expire(auth_cookie(
        REFRESH_COOKIE,
        String::new(),
        AUTH_PATH,
        time::Duration::ZERO,
        secure,
    )))
}

/// Login with the shared password; grants the unrestricted tier.
pub async fn login(
    State(state): State<AppState>,
    jar: CookieJar,
    ValidatedJson(req): ValidatedJson<LoginRequest>,
) -> Result<Response, AppError> {
    let hash = state.password_hash.clone().ok_or_else(|| {
        AppError::ConfigError(anyhow::anyhow!("AUTH_PASSWORD_HASH is not configured"))
    })?;

    let password = Password::new(req.password);
    let verified = tokio::task::spawn_blocking(move || verify_password(&password, &hash))
        .await
        .map_err(|e| AppError::InternalError(anyhow::anyhow!("Password check aborted: {}", e)))?;

    if verified.is_err() {
        metrics::record_auth_failure("bad_password");
        tracing::warn!("Failed login attempt - invalid password");
        return Ok((
            StatusCode::UNAUTHORIZED,
            Json(AuthResponse::new(false, "Invalid password")),
        )
            .into_response());
    }

    let pair = state
        .gateway
        .credentials()
        .issue_pair(None, Some(Tier::Full))
        .map_err(GatewayError::from)?;

    tracing::info!("User authenticated successfully");

    let mut body = AuthResponse::new(true, "Login successful");
    body.tier = Some(Tier::Full);
    Ok((set_auth_cookies(&state, jar, pair), Json(body)).into_response())
}

/// Register an email for quota-bound academic access.
pub async fn academic_register(
    State(state): State<AppState>,
    jar: CookieJar,
    ValidatedJson(req): ValidatedJson<AcademicRegisterRequest>,
) -> Result<impl IntoResponse, AppError> {
    let quota = state.gateway.quota();
    let record = quota.register(&req.email).await.map_err(GatewayError::from)?;

    let pair = state
        .gateway
        .credentials()
        .issue_pair(Some(&record.identity), Some(Tier::Academic))
        .map_err(GatewayError::from)?;

    let (_, remaining) = quota
        .has_quota(&record.identity)
        .await
        .map_err(GatewayError::from)?;

    let mut body = AuthResponse::new(true, "Academic access granted");
    body.identity = Some(record.identity);
    body.tier = Some(Tier::Academic);
    body.queries_remaining = Some(remaining);
    body.daily_limit = Some(quota.daily_limit());

    Ok((set_auth_cookies(&state, jar, pair), Json(body)))
}

/// Rotate both credentials using the refresh cookie.
pub async fn refresh(State(state): State<AppState>, jar: CookieJar) -> Result<Response, AppError> {
    let Some(token) = jar.get(REFRESH_COOKIE).map(|c| c.value().to_string()) else {
        let jar = clear_auth_cookies(&state, jar);
        return Ok((
            StatusCode::UNAUTHORIZED,
            jar,
            Json(AuthResponse::new(false, "No refresh token provided")),
        )
            .into_response());
    };

    match state.gateway.credentials().rotate(&token) {
        Ok(pair) => Ok((
            set_auth_cookies(&state, jar, pair),
            Json(AuthResponse::new(true, "Token refreshed")),
        )
            .into_response()),
        Err(CredentialError::Rejected) => {
            metrics::record_auth_failure("refresh_rejected");
            let jar = clear_auth_cookies(&state, jar);
            Ok((
                StatusCode::UNAUTHORIZED,
                jar,
                Json(AuthResponse::new(false, "Invalid or expired refresh token")),
            )
                .into_response())
        }
        Err(e) => Err(GatewayError::from(e).into()),
    }
}

pub async fn logout(State(state): State<AppState>, jar: CookieJar) -> impl IntoResponse {
    (
        clear_auth_cookies(&state, jar),
        Json(AuthResponse::new(false, "Logged out successfully")),
    )
}

/// Report whether the presented access credential is currently valid.
pub async fn verify(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<AuthResponse>, AppError> {
    if !state.config.auth.auth_required {
        return Ok(Json(AuthResponse::new(true, "Authentication disabled")));
    }

    let token = credential_token(&headers);
    let has_token = token.is_some();

    match state.gateway.authenticate(token.as_deref()) {
        Ok(caller) => {
            let mut body = AuthResponse::new(true, "Authenticated");
            body.identity = caller.identity;
            body.tier = Some(caller.tier);
            Ok(Json(body))
        }
        Err(GatewayError::Unauthenticated) if has_token => {
            Ok(Json(AuthResponse::new(false, "Invalid or expired token")))
        }
        Err(GatewayError::Unauthenticated) => Ok(Json(AuthResponse::new(false, "Not authenticated"))),
        Err(e) => Err(e.into()),
    }
}

/// Usage statistics for the calling academic identity.
pub async fn usage(
    State(state): State<AppState>,
    AuthCaller(caller): AuthCaller,
) -> Result<Json<UsageStats>, AppError> {
    let identity = match (&caller.identity, caller.tier) {
        (Some(identity), Tier::Academic) => identity,
        _ => {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Usage is only tracked for academic access"
            )))
        }
    };

    let stats = state
        .gateway
        .quota()
        .stats(identity)
        .await
        .map_err(GatewayError::from)?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("No usage recorded for {}", identity)))?;

    Ok(Json(stats))
}
