use axum::{
    async_trait,
    extract::{FromRequestParts, Request, State},
    http::{header, request::Parts, HeaderMap},
    middleware::Next,
    response::Response,
};
use axum_extra::extract::cookie::CookieJar;
use service_core::error::AppError;

use crate::services::Caller;
use crate::AppState;

pub const ACCESS_COOKIE: &str = "access_token";
pub const REFRESH_COOKIE: &str = "refresh_token";

/// Access credential from the `access_token` cookie, else a `Bearer` header.
pub fn credential_token(headers: &HeaderMap) -> Option<String> {
    let jar = CookieJar::from_headers(headers);
    if let Some(cookie) = jar.get(ACCESS_COOKIE) {
        if !cookie.value().is_empty() {
            return Some(cookie.value().to_string());
        }
    }

    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
}

/// Middleware to require authentication
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = credential_token(req.headers());
    let caller = state.gateway.authenticate(token.as_deref())?;

    // Store the caller in request extensions so handlers can access it
    req.extensions_mut().insert(caller);

    Ok(next.run(req).await)
}

/// Extractor for the caller resolved by [`auth_middleware`].
pub struct AuthCaller(pub Caller);

#[async_trait]
impl<S> FromRequestParts<S> for AuthCaller
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let caller = parts.extensions.get::<Caller>().ok_or_else(|| {
            AppError::InternalError(anyhow::anyhow!(
                "Caller missing from request extensions"
            ))
        })?;

        Ok(AuthCaller(caller.clone()))
    }
}
