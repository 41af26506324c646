//! API request and response types.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::session::Role;
use crate::store::{SecretRecord, UserRecord};

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Service status
    pub status: String,

    /// Service version
    pub version: String,

    /// Whether the secret store survives restarts
    pub persistent_store: bool,
}

/// Login request.
#[derive(Debug, Clone, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// Generic success body.
#[derive(Debug, Clone, Serialize)]
pub struct OkResponse {
    pub ok: bool,
}

impl OkResponse {
    pub fn ok() -> Json<Self> {
        Json(Self { ok: true })
    }
}

/// Error body returned by every failing endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Handler error rendered as `{"error": "..."}` with the given status.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "Unauthorized")
    }

    pub fn invalid_credentials() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "Invalid credentials")
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }

    pub fn forbidden() -> Self {
        Self::new(StatusCode::FORBIDDEN, "Admin access required")
    }

    pub fn not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, "Not found")
    }
}

impl From<(StatusCode, String)> for ApiError {
    fn from((status, message): (StatusCode, String)) -> Self {
        Self { status, message }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
            }),
        )
            .into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Sync target as shown to clients. The credential is never echoed back.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    pub enabled: bool,
    pub url: String,
    pub target_key: String,
    pub has_credential: bool,
}

/// Secret metadata. Never includes seed material.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretSummary {
    pub id: i64,
    pub label: String,
    pub issuer: String,
    pub algorithm: String,
    pub digits: u32,
    pub period: u64,
    pub owner_id: Option<i64>,
    pub created_at: String,
    pub sync: SyncSummary,
}

impl From<&SecretRecord> for SecretSummary {
    fn from(record: &SecretRecord) -> Self {
        Self {
            id: record.id,
            label: record.label.clone(),
            issuer: record.issuer.clone(),
            algorithm: record.algorithm.clone(),
            digits: record.digits,
            period: record.period,
            owner_id: record.owner_id,
            created_at: record.created_at.clone(),
            sync: SyncSummary {
                enabled: record.sync.enabled,
                url: record.sync.url.clone(),
                target_key: record.sync.target_key.clone(),
                has_credential: !record.sync.credential.is_empty(),
            },
        }
    }
}

/// Body of `POST /api/secrets`: either an `otpauth://` URI or explicit fields.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateSecretRequest {
    pub uri: Option<String>,
    pub label: Option<String>,
    pub secret: Option<String>,
    pub issuer: Option<String>,
    pub algorithm: Option<String>,
    pub digits: Option<u32>,
    pub period: Option<u64>,
}

/// Response of `POST /api/secrets`.
#[derive(Debug, Clone, Serialize)]
pub struct CreatedSecret {
    pub id: i64,
    pub label: String,
    pub issuer: String,
}

/// User account as shown to admins. Never includes the password hash.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub id: i64,
    pub username: String,
    pub role: Role,
    pub created_at: String,
}

impl From<&UserRecord> for UserSummary {
    fn from(user: &UserRecord) -> Self {
        Self {
            id: user.id,
            username: user.username.clone(),
            role: user.role,
            created_at: user.created_at.clone(),
        }
    }
}

/// Body of `POST /api/users`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateUserRequest {
    pub username: Option<String>,
    pub password: Option<String>,
    pub role: Option<String>,
}

/// Response of `POST /api/users`.
#[derive(Debug, Clone, Serialize)]
pub struct CreatedUser {
    pub id: i64,
    pub username: String,
    pub role: Role,
}
