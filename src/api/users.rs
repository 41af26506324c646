//! API endpoints for managing dashboard accounts (admin only).

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::{delete, get},
    Extension, Router,
};

use super::auth::{record_audit, require_admin};
use super::routes::AppState;
use super::types::{ApiError, ApiResult, CreateUserRequest, CreatedUser, OkResponse, UserSummary};
use crate::password::hash_password;
use crate::session::{Role, SessionPayload};
use crate::store::{AuditEntry, StoreError};
use crate::util::{client_ip, internal_error};

/// Create the users API routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_users).post(create_user))
        .route("/:id", delete(delete_user))
}

#[derive(Debug)]
struct UserInput {
    username: String,
    password: String,
    role: Role,
}

fn parse_create_request(req: CreateUserRequest) -> Result<UserInput, ApiError> {
    let (username, password) = match (req.username, req.password) {
        (Some(u), Some(p)) if !u.trim().is_empty() && !p.is_empty() => (u.trim().to_string(), p),
        _ => return Err(ApiError::bad_request("Username and password required")),
    };
    let role = match req.role.filter(|r| !r.trim().is_empty()) {
        Some(r) => r
            .trim()
            .parse::<Role>()
            .map_err(|_| ApiError::bad_request("Role must be admin or viewer"))?,
        None => Role::Viewer,
    };
    Ok(UserInput {
        username,
        password,
        role,
    })
}

/// GET /api/users
async fn list_users(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<SessionPayload>,
) -> ApiResult<Json<Vec<UserSummary>>> {
    require_admin(&session)?;
    let users = state.store.list_users().await.map_err(internal_error)?;
    Ok(Json(users.iter().map(UserSummary::from).collect()))
}

/// POST /api/users
async fn create_user(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<SessionPayload>,
    headers: HeaderMap,
    Json(req): Json<CreateUserRequest>,
) -> ApiResult<(StatusCode, Json<CreatedUser>)> {
    require_admin(&session)?;
    let input = parse_create_request(req)?;

    let password = input.password;
    let hash = tokio::task::spawn_blocking(move || hash_password(&password))
        .await
        .map_err(internal_error)?
        .map_err(internal_error)?;

    let id = match state
        .store
        .insert_user(&input.username, &hash, input.role)
        .await
    {
        Ok(id) => id,
        Err(StoreError::Conflict(_)) => {
            return Err(ApiError::conflict("Username already exists"));
        }
        Err(e) => return Err(internal_error(e).into()),
    };

    record_audit(
        state.store.as_ref(),
        AuditEntry::new(Some(session.user_id), "user_created", None, &client_ip(&headers)),
    )
    .await;
    tracing::info!(
        user_id = id,
        role = input.role.as_str(),
        created_by = session.user_id,
        "User created"
    );

    Ok((
        StatusCode::CREATED,
        Json(CreatedUser {
            id,
            username: input.username,
            role: input.role,
        }),
    ))
}

/// DELETE /api/users/:id
async fn delete_user(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<SessionPayload>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> ApiResult<Json<OkResponse>> {
    require_admin(&session)?;
    if id == session.user_id {
        return Err(ApiError::bad_request("Cannot delete yourself"));
    }

    let user = state
        .store
        .get_user(id)
        .await
        .map_err(internal_error)?
        .ok_or_else(ApiError::not_found)?;
    if user.role == Role::Admin {
        let admins = state.store.count_admins().await.map_err(internal_error)?;
        if admins <= 1 {
            return Err(ApiError::bad_request("Cannot delete the last admin"));
        }
    }

    if !state.store.delete_user(id).await.map_err(internal_error)? {
        return Err(ApiError::not_found());
    }

    record_audit(
        state.store.as_ref(),
        AuditEntry::new(Some(session.user_id), "user_deleted", None, &client_ip(&headers)),
    )
    .await;
    tracing::info!(user_id = id, deleted_by = session.user_id, "User deleted");

    Ok(OkResponse::ok())
}
