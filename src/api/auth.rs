//! Cookie-based session auth for the dashboard.
//!
//! - `POST /api/auth/login` checks username/password and sets the `totp_session` cookie
//! - `POST /api/auth/logout` clears it
//! - Every protected endpoint goes through [`require_auth`], which verifies the cookie and
//!   exposes the [`SessionPayload`] as a request extension
//!
//! Sessions are stateless signed tokens; there is no server-side revocation.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, Request},
    middleware::Next,
    response::{IntoResponse, Response},
    Extension, Json,
};

use super::routes::AppState;
use super::types::{ApiError, ApiResult, LoginRequest, OkResponse};
use crate::config::BootstrapAdmin;
use crate::password::{hash_password, verify_password};
use crate::session::{token_from_cookie_header, Role, SessionPayload};
use crate::store::{AuditEntry, SecretStore};
use crate::util::{client_ip, internal_error};

/// Verify the session cookie carried by `headers`, if any.
pub fn session_from_headers(state: &AppState, headers: &HeaderMap) -> Option<SessionPayload> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .filter_map(token_from_cookie_header)
        .find_map(|token| state.sessions.verify(token))
}

/// Reject non-admin sessions with 403.
pub fn require_admin(session: &SessionPayload) -> ApiResult<()> {
    if session.is_admin() {
        Ok(())
    } else {
        Err(ApiError::forbidden())
    }
}

/// Write an audit entry. Failures are logged and never fail the request.
pub async fn record_audit(store: &dyn SecretStore, entry: AuditEntry) {
    let action = entry.action.clone();
    if let Err(e) = store.log_audit(entry).await {
        tracing::warn!(action = %action, "Failed to write audit entry: {}", e);
    }
}

pub async fn login(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<LoginRequest>,
) -> ApiResult<Response> {
    let ip = client_ip(&headers);
    let (username, password) = match (req.username, req.password) {
        (Some(u), Some(p)) if !u.trim().is_empty() && !p.is_empty() => (u.trim().to_string(), p),
        _ => return Err(ApiError::bad_request("Username and password required")),
    };

    let user = state
        .store
        .find_user(&username)
        .await
        .map_err(internal_error)?;

    let Some(user) = user else {
        record_audit(
            state.store.as_ref(),
            AuditEntry::new(None, "login_failed", None, &ip),
        )
        .await;
        tracing::info!("Login failed for unknown user");
        return Err(ApiError::invalid_credentials());
    };

    let stored = user.password_hash.clone();
    let valid = tokio::task::spawn_blocking(move || verify_password(&password, &stored))
        .await
        .map_err(internal_error)?;

    if !valid {
        record_audit(
            state.store.as_ref(),
            AuditEntry::new(Some(user.id), "login_failed", None, &ip),
        )
        .await;
        tracing::info!(user_id = user.id, "Login failed");
        return Err(ApiError::invalid_credentials());
    }

    let token = state.sessions.issue(user.id, &user.username, user.role);
    let cookie = state
        .sessions
        .session_cookie(&token, state.config.secure_cookies);

    record_audit(
        state.store.as_ref(),
        AuditEntry::new(Some(user.id), "login", None, &ip),
    )
    .await;
    tracing::info!(user_id = user.id, role = user.role.as_str(), "User logged in");

    Ok(([(header::SET_COOKIE, cookie)], OkResponse::ok()).into_response())
}

pub async fn logout(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Some(session) = session_from_headers(&state, &headers) {
        record_audit(
            state.store.as_ref(),
            AuditEntry::new(Some(session.user_id), "logout", None, &client_ip(&headers)),
        )
        .await;
    }

    let cookie = state.sessions.clear_cookie(state.config.secure_cookies);
    ([(header::SET_COOKIE, cookie)], OkResponse::ok()).into_response()
}

/// GET /api/auth/session
pub async fn current_session(
    Extension(session): Extension<SessionPayload>,
) -> Json<SessionPayload> {
    Json(session)
}

pub async fn require_auth(
    State(state): State<Arc<AppState>>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    match session_from_headers(&state, req.headers()) {
        Some(session) => {
            req.extensions_mut().insert(session);
            next.run(req).await
        }
        None => ApiError::unauthorized().into_response(),
    }
}

/// Create the configured admin account unless a user with that name already exists.
pub async fn ensure_bootstrap_admin(
    store: &dyn SecretStore,
    admin: &BootstrapAdmin,
) -> anyhow::Result<()> {
    if store.find_user(&admin.username).await?.is_some() {
        tracing::debug!(username = %admin.username, "Bootstrap admin already exists");
        return Ok(());
    }

    let password = admin.password.clone();
    let hash = tokio::task::spawn_blocking(move || hash_password(&password)).await??;
    store.insert_user(&admin.username, &hash, Role::Admin).await?;
    tracing::info!(username = %admin.username, "Created bootstrap admin account");
    Ok(())
}
