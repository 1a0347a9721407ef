use std::net::SocketAddr;
use std::sync::Arc;

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use axum::extract::{ConnectInfo, FromRequestParts, Query, Request, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode, Uri, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use libnudge::{AuthContext, ClientMeta, GateOutcome, NudgeError};

use crate::AppState;
use crate::error::{ApiError, ApiResult};

const MIN_PASSWORD_LEN: usize = 8;

/// The authenticated caller, as attached by [`require_session`].
pub struct Caller(pub AuthContext);

impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthContext>()
            .cloned()
            .map(Caller)
            .ok_or(ApiError(NudgeError::Unauthenticated))
    }
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// Every non-empty session token on the request: cookie, bearer header,
/// then `?token=`.
pub fn token_candidates(headers: &HeaderMap, uri: &Uri, cookie_name: &str) -> Vec<String> {
    let from_cookie = headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == cookie_name)
        .map(|(_, value)| value.to_string());

    let from_bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string());

    let from_query = Query::<TokenQuery>::try_from_uri(uri)
        .ok()
        .and_then(|Query(q)| q.token);

    let mut tokens: Vec<String> = Vec::with_capacity(3);
    for token in [from_cookie, from_bearer, from_query].into_iter().flatten() {
        if !token.is_empty() && !tokens.contains(&token) {
            tokens.push(token);
        }
    }
    tokens
}

/// Gate middleware: every request passes through the access gate before routing.
///
/// Tokens are tried in order and the first one that authenticates wins, so a
/// stale cookie does not shadow a valid bearer token. When none does, the
/// first token's outcome is reported.
pub async fn require_session(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> ApiResult<Response> {
    let tokens = token_candidates(req.headers(), req.uri(), &state.config.cookie_name);
    let path = req.uri().path().to_string();

    let mut first = None;
    for token in &tokens {
        let outcome = state.gate.admit(&path, Some(token.as_str())).await;
        if matches!(outcome, Ok(GateOutcome::Authenticated(_))) {
            first = Some(outcome);
            break;
        }
        if first.is_none() {
            first = Some(outcome);
        } else {
            debug!(path = %path, "fallback session token rejected");
        }
    }
    let outcome = match first {
        Some(outcome) => outcome,
        None => state.gate.admit(&path, None).await,
    };

    if let GateOutcome::Authenticated(ctx) = outcome? {
        req.extensions_mut().insert(ctx);
    }
    Ok(next.run(req).await)
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

pub async fn register(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RegisterRequest>,
) -> ApiResult<impl IntoResponse> {
    let username = body.username.trim().to_string();
    let email = body.email.trim().to_string();
    if username.is_empty() || email.is_empty() {
        return Err(ApiError::validation("username and email are required"));
    }
    if !email.contains('@') {
        return Err(ApiError::validation("email is not valid"));
    }
    if body.password.chars().count() < MIN_PASSWORD_LEN {
        return Err(ApiError::validation(format!(
            "password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }

    let password = body.password;
    let hash = tokio::task::spawn_blocking(move || hash_password(&password))
        .await
        .map_err(|e| ApiError::internal(e.to_string()))??;

    let principal = state.store.create_user(&username, &email, &hash).await?;
    info!(principal_id = principal.id, "user registered");
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "id": principal.id,
            "username": principal.username,
            "email": email,
            "is_active": principal.is_active,
        })),
    ))
}

pub async fn login(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<LoginRequest>,
) -> ApiResult<impl IntoResponse> {
    let Some((principal, stored_hash)) = state.store.user_credentials(body.username.trim()).await?
    else {
        return Err(ApiError(NudgeError::InvalidCredentials));
    };

    let password = body.password;
    let verified = tokio::task::spawn_blocking(move || verify_password(&password, &stored_hash))
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    if !verified {
        return Err(ApiError(NudgeError::InvalidCredentials));
    }
    if !principal.is_active {
        return Err(ApiError(NudgeError::Forbidden));
    }

    let meta = ClientMeta {
        ip_address: peer.ip().to_string(),
        user_agent: headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string(),
    };
    let session = state.sessions.create_session(principal.id, meta).await?;
    let cookie = format!(
        "{}={}; HttpOnly; SameSite=Lax; Path=/; Max-Age={}",
        state.config.cookie_name, session.token, state.config.session_ttl_secs
    );

    Ok((
        [(header::SET_COOKIE, cookie)],
        Json(json!({
            "message": "Login successful",
            "username": principal.username,
            "session_token": session.token,
        })),
    ))
}

pub async fn logout(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
) -> ApiResult<impl IntoResponse> {
    state.sessions.invalidate(&ctx.session.token).await?;
    let cookie = format!(
        "{}=; HttpOnly; SameSite=Lax; Path=/; Max-Age=0",
        state.config.cookie_name
    );
    Ok((
        [(header::SET_COOKIE, cookie)],
        Json(json!({ "message": "Logout successful" })),
    ))
}

pub async fn me(Caller(ctx): Caller) -> Json<serde_json::Value> {
    Json(json!({
        "id": ctx.principal.id,
        "username": ctx.principal.username,
        "is_active": ctx.principal.is_active,
        "session_expires_at": ctx.session.expires_at,
    }))
}

fn hash_password(password: &str) -> ApiResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| ApiError::internal(format!("password hashing failed: {e}")))
}

fn verify_password(password: &str, stored_hash: &str) -> bool {
    match PasswordHash::new(stored_hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}
