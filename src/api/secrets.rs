//! API endpoints for managing stored TOTP secrets and their sync targets.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::{get, put},
    Extension, Router,
};

use super::auth::{record_audit, require_admin};
use super::routes::AppState;
use super::types::{
    ApiError, ApiResult, CreateSecretRequest, CreatedSecret, OkResponse, SecretSummary,
};
use crate::session::SessionPayload;
use crate::store::{AuditEntry, NewSecret, SyncTargetConfig};
use crate::sync::PushTargetStatus;
use crate::totp::{self, Algorithm, DEFAULT_DIGITS, DEFAULT_PERIOD};
use crate::util::{client_ip, internal_error};

/// Create the secrets API routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_secrets).post(create_secret))
        .route("/push-status", get(push_status))
        .route("/:id", get(get_secret).delete(delete_secret))
        .route("/:id/sync", put(update_sync))
}

/// Validated fields for a new secret.
#[derive(Debug)]
struct SecretInput {
    label: String,
    issuer: String,
    seed_base32: String,
    algorithm: Algorithm,
    digits: u32,
    period: u64,
}

fn parse_create_request(req: CreateSecretRequest) -> Result<SecretInput, ApiError> {
    if let Some(uri) = req.uri.filter(|u| !u.trim().is_empty()) {
        let parsed = totp::parse_uri(&uri)
            .map_err(|e| ApiError::bad_request(format!("Invalid URI: {}", e)))?;
        if parsed.label.is_empty() {
            return Err(ApiError::bad_request("Invalid URI: missing label"));
        }
        return Ok(SecretInput {
            label: parsed.label,
            issuer: parsed.issuer,
            seed_base32: parsed.seed_base32,
            algorithm: parsed.algorithm,
            digits: parsed.digits,
            period: parsed.period,
        });
    }

    let label = req.label.map(|l| l.trim().to_string()).unwrap_or_default();
    let secret = req.secret.unwrap_or_default();
    if label.is_empty() || secret.trim().is_empty() {
        return Err(ApiError::bad_request("Provide either uri or label+secret"));
    }

    let invalid = |e: totp::TotpError| ApiError::bad_request(e.to_string());
    let algorithm = match req.algorithm.filter(|a| !a.trim().is_empty()) {
        Some(a) => a.parse().map_err(invalid)?,
        None => Algorithm::default(),
    };

    Ok(SecretInput {
        label,
        issuer: req.issuer.map(|i| i.trim().to_string()).unwrap_or_default(),
        seed_base32: totp::normalize_seed(&secret).map_err(invalid)?,
        algorithm,
        digits: totp::validate_digits(req.digits.unwrap_or(DEFAULT_DIGITS)).map_err(invalid)?,
        period: totp::validate_period(req.period.unwrap_or(DEFAULT_PERIOD)).map_err(invalid)?,
    })
}

fn validate_sync_config(config: &SyncTargetConfig) -> Result<(), ApiError> {
    let url = config.url.trim();
    if url.is_empty() {
        return if config.enabled {
            Err(ApiError::bad_request("Sync URL is required when sync is enabled"))
        } else {
            Ok(())
        };
    }
    match url::Url::parse(url) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Ok(()),
        Ok(_) => Err(ApiError::bad_request("Sync URL must use http or https")),
        Err(e) => Err(ApiError::bad_request(format!("Invalid sync URL: {}", e))),
    }
}

/// GET /api/secrets
async fn list_secrets(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<SecretSummary>>> {
    let records = state.store.list_secrets().await.map_err(internal_error)?;
    Ok(Json(records.iter().map(SecretSummary::from).collect()))
}

/// GET /api/secrets/:id
async fn get_secret(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<SecretSummary>> {
    match state.store.get_secret(id).await.map_err(internal_error)? {
        Some(record) => Ok(Json(SecretSummary::from(&record))),
        None => Err(ApiError::not_found()),
    }
}

/// POST /api/secrets
async fn create_secret(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<SessionPayload>,
    headers: HeaderMap,
    Json(req): Json<CreateSecretRequest>,
) -> ApiResult<(StatusCode, Json<CreatedSecret>)> {
    require_admin(&session)?;
    let input = parse_create_request(req)?;

    let sealed = state
        .vault
        .encrypt(&input.seed_base32)
        .map_err(internal_error)?;

    let id = state
        .store
        .insert_secret(NewSecret {
            label: input.label.clone(),
            issuer: input.issuer.clone(),
            sealed,
            algorithm: input.algorithm.as_str().to_string(),
            digits: input.digits,
            period: input.period,
            owner_id: Some(session.user_id),
        })
        .await
        .map_err(internal_error)?;

    record_audit(
        state.store.as_ref(),
        AuditEntry::new(Some(session.user_id), "secret_added", Some(id), &client_ip(&headers)),
    )
    .await;
    tracing::info!(secret_id = id, user_id = session.user_id, "Secret added");

    Ok((
        StatusCode::CREATED,
        Json(CreatedSecret {
            id,
            label: input.label,
            issuer: input.issuer,
        }),
    ))
}

/// DELETE /api/secrets/:id
async fn delete_secret(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<SessionPayload>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> ApiResult<Json<OkResponse>> {
    require_admin(&session)?;

    if !state.store.delete_secret(id).await.map_err(internal_error)? {
        return Err(ApiError::not_found());
    }

    record_audit(
        state.store.as_ref(),
        AuditEntry::new(Some(session.user_id), "secret_deleted", Some(id), &client_ip(&headers)),
    )
    .await;
    tracing::info!(secret_id = id, user_id = session.user_id, "Secret deleted");

    Ok(OkResponse::ok())
}

/// PUT /api/secrets/:id/sync
async fn update_sync(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<SessionPayload>,
    Path(id): Path<i64>,
    Json(config): Json<SyncTargetConfig>,
) -> ApiResult<Json<SecretSummary>> {
    require_admin(&session)?;
    validate_sync_config(&config)?;

    let config = SyncTargetConfig {
        enabled: config.enabled,
        url: config.url.trim().to_string(),
        credential: config.credential.trim().to_string(),
        target_key: config.target_key.trim().to_string(),
    };
    if !state
        .store
        .update_sync_target(id, config)
        .await
        .map_err(internal_error)?
    {
        return Err(ApiError::not_found());
    }

    let record = state
        .store
        .get_secret(id)
        .await
        .map_err(internal_error)?
        .ok_or_else(ApiError::not_found)?;
    tracing::info!(secret_id = id, enabled = record.sync.enabled, "Sync target updated");
    Ok(Json(SecretSummary::from(&record)))
}

/// GET /api/secrets/push-status
async fn push_status(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<SessionPayload>,
) -> ApiResult<Json<HashMap<i64, PushTargetStatus>>> {
    require_admin(&session)?;
    Ok(Json(state.dispatcher.statuses().await))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_request_is_parsed() {
        let input = parse_create_request(CreateSecretRequest {
            uri: Some(
                "otpauth://totp/GitHub:user@example.com?secret=JBSWY3DPEHPK3PXP&issuer=GitHub"
                    .to_string(),
            ),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(input.label, "user@example.com");
        assert_eq!(input.issuer, "GitHub");
        assert_eq!(input.seed_base32, "JBSWY3DPEHPK3PXP");
        assert_eq!(input.digits, 6);
    }

    #[test]
    fn manual_request_applies_defaults_and_normalizes_seed() {
        let input = parse_create_request(CreateSecretRequest {
            label: Some(" backup ".to_string()),
            secret: Some("jbsw y3dp ehpk 3pxp".to_string()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(input.label, "backup");
        assert_eq!(input.seed_base32, "JBSWY3DPEHPK3PXP");
        assert_eq!(input.algorithm, Algorithm::Sha1);
        assert_eq!(input.period, 30);
    }

    #[test]
    fn bad_requests_are_rejected() {
        let cases = [
            CreateSecretRequest::default(),
            CreateSecretRequest {
                uri: Some("otpauth://hotp/Test?secret=JBSWY3DPEHPK3PXP&counter=0".to_string()),
                ..Default::default()
            },
            CreateSecretRequest {
                label: Some("x".to_string()),
                secret: Some("not base32!".to_string()),
                ..Default::default()
            },
            CreateSecretRequest {
                label: Some("x".to_string()),
                secret: Some("JBSWY3DPEHPK3PXP".to_string()),
                digits: Some(7),
                ..Default::default()
            },
            CreateSecretRequest {
                label: Some("x".to_string()),
                secret: Some("JBSWY3DPEHPK3PXP".to_string()),
                algorithm: Some("MD5".to_string()),
                ..Default::default()
            },
        ];
        for req in cases {
            let err = parse_create_request(req).unwrap_err();
            assert_eq!(err.status, StatusCode::BAD_REQUEST);
        }
    }

    #[test]
    fn sync_url_must_be_http() {
        let mut config = SyncTargetConfig {
            enabled: true,
            url: "https://rtdb.example.test".to_string(),
            credential: "c".to_string(),
            target_key: "k".to_string(),
        };
        assert!(validate_sync_config(&config).is_ok());
        config.url = "ftp://rtdb.example.test".to_string();
        assert!(validate_sync_config(&config).is_err());
        config.url = String::new();
        assert!(validate_sync_config(&config).is_err());
        config.enabled = false;
        assert!(validate_sync_config(&config).is_ok());
    }
}
