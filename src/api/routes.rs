//! HTTP route wiring and server startup.

use std::sync::Arc;

use axum::middleware;
use axum::{
    extract::State,
    response::Json,
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::session::SessionService;
use crate::store::{SecretStore, SqliteStore};
use crate::sync::{HttpPusher, SyncDispatcher};
use crate::vault::SecretVault;

use super::auth;
use super::codes;
use super::secrets as secrets_api;
use super::types::HealthResponse;
use super::users as users_api;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    /// Users, secrets and audit log
    pub store: Arc<dyn SecretStore>,
    /// Seals and opens seed material
    pub vault: SecretVault,
    /// Issues and verifies session cookies
    pub sessions: SessionService,
    /// External code sync; its status map backs `/api/secrets/push-status`
    pub dispatcher: SyncDispatcher,
}

impl AppState {
    pub fn new(config: Config, store: Arc<dyn SecretStore>) -> Self {
        let vault = SecretVault::new(&config.vault_key);
        let sessions = SessionService::new(config.session_key, config.session_ttl);
        let dispatcher = SyncDispatcher::new(
            Arc::clone(&store),
            vault.clone(),
            Arc::new(HttpPusher::new(config.sync.push_timeout)),
            config.sync.push_timeout,
        );
        Self {
            config,
            store,
            vault,
            sessions,
            dispatcher,
        }
    }
}

/// Build the application router.
pub fn router(state: Arc<AppState>) -> Router {
    let public_routes = Router::new()
        .route("/api/health", get(health))
        .route("/api/auth/login", post(auth::login))
        .route("/api/auth/logout", post(auth::logout));

    let protected_routes = Router::new()
        .route("/api/auth/session", get(auth::current_session))
        .route("/api/codes", get(codes::list_codes))
        .route("/api/codes/stream", get(codes::stream_codes))
        .nest("/api/secrets", secrets_api::routes())
        .nest("/api/users", users_api::routes())
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth::require_auth,
        ));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let store: Arc<dyn SecretStore> = Arc::new(SqliteStore::new(config.db_path.clone()).await?);
    tracing::info!("Secret store opened at {}", config.db_path.display());

    if let Some(admin) = &config.bootstrap_admin {
        auth::ensure_bootstrap_admin(store.as_ref(), admin).await?;
    }

    let state = Arc::new(AppState::new(config.clone(), store));

    let mut sync_task = if config.sync.enabled {
        Some(state.dispatcher.start(config.sync.interval))
    } else {
        tracing::info!("Sync dispatcher disabled");
        None
    };

    let app = router(Arc::clone(&state));

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on {}", addr);

    // Setup graceful shutdown on SIGTERM/SIGINT
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(task) = sync_task.as_mut() {
        task.stop().await;
    }
    tracing::info!("Graceful shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}

/// Health check endpoint.
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        persistent_store: state.store.is_persistent(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KEY_LENGTH;
    use crate::password::hash_with_iterations;
    use crate::session::Role;
    use crate::store::InMemoryStore;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use futures::StreamExt;
    use tower::ServiceExt;

    const SEED_URI: &str =
        "otpauth://totp/GitHub:user@example.com?secret=JBSWY3DPEHPK3PXP&issuer=GitHub";

    struct TestApp {
        state: Arc<AppState>,
        store: InMemoryStore,
    }

    impl TestApp {
        fn new() -> Self {
            let store = InMemoryStore::new();
            let mut config = Config::new([1u8; KEY_LENGTH], [2u8; KEY_LENGTH]);
            config.secure_cookies = false;
            let state = Arc::new(AppState::new(config, Arc::new(store.clone())));
            Self { state, store }
        }

        fn cookie(&self, role: Role) -> String {
            let user_id = match role {
                Role::Admin => 1,
                Role::Viewer => 2,
            };
            let token = self.state.sessions.issue(user_id, role.as_str(), role);
            format!("totp_session={}", token)
        }

        async fn send(&self, req: Request<Body>) -> axum::response::Response {
            router(Arc::clone(&self.state)).oneshot(req).await.unwrap()
        }
    }

    fn get(uri: &str, cookie: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        if let Some(cookie) = cookie {
            builder = builder.header(header::COOKIE, cookie);
        }
        builder.body(Body::empty()).unwrap()
    }

    fn delete(uri: &str, cookie: &str) -> Request<Body> {
        Request::builder()
            .method("DELETE")
            .uri(uri)
            .header(header::COOKIE, cookie)
            .body(Body::empty())
            .unwrap()
    }

    fn json_request(
        method: &str,
        uri: &str,
        cookie: Option<&str>,
        body: serde_json::Value,
    ) -> Request<Body> {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(cookie) = cookie {
            builder = builder.header(header::COOKIE, cookie);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn add_secret(app: &TestApp) -> i64 {
        let admin = app.cookie(Role::Admin);
        let response = app
            .send(json_request(
                "POST",
                "/api/secrets",
                Some(&admin),
                serde_json::json!({ "uri": SEED_URI }),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        body_json(response).await["id"].as_i64().unwrap()
    }

    #[tokio::test]
    async fn health_is_public() {
        let app = TestApp::new();
        let response = app.send(get("/api/health", None)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["persistent_store"], false);
    }

    #[tokio::test]
    async fn protected_routes_require_a_valid_cookie() {
        let app = TestApp::new();
        for uri in ["/api/codes", "/api/codes/stream", "/api/secrets", "/api/auth/session"] {
            let response = app.send(get(uri, None)).await;
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{}", uri);

            let response = app.send(get(uri, Some("totp_session=forged.token"))).await;
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{}", uri);
        }

        let expired = app.state.sessions.issue_at(1, "admin", Role::Admin, 0);
        let response = app
            .send(get("/api/codes", Some(&format!("totp_session={}", expired))))
            .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn login_sets_cookie_and_audits() {
        let app = TestApp::new();
        let hash = hash_with_iterations("hunter2", 1_000).unwrap();
        app.store.insert_user("alice", &hash, Role::Viewer).await.unwrap();

        let response = app
            .send(json_request(
                "POST",
                "/api/auth/login",
                None,
                serde_json::json!({ "username": "alice", "password": "wrong" }),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().get(header::SET_COOKIE).is_none());
        assert_eq!(body_json(response).await["error"], "Invalid credentials");

        let response = app
            .send(json_request(
                "POST",
                "/api/auth/login",
                None,
                serde_json::json!({ "username": "alice", "password": "hunter2" }),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let set_cookie = response
            .headers()
            .get(header::SET_COOKIE)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(set_cookie.starts_with("totp_session="));
        assert!(set_cookie.contains("HttpOnly"));
        assert!(set_cookie.contains("Max-Age=28800"));

        let cookie = set_cookie.split(';').next().unwrap().to_string();
        let response = app.send(get("/api/auth/session", Some(&cookie))).await;
        assert_eq!(response.status(), StatusCode::OK);
        let session = body_json(response).await;
        assert_eq!(session["username"], "alice");
        assert_eq!(session["role"], "viewer");

        let actions: Vec<String> = app
            .store
            .audit_entries()
            .await
            .into_iter()
            .map(|e| e.action)
            .collect();
        assert_eq!(actions, vec!["login_failed", "login"]);
    }

    #[tokio::test]
    async fn unknown_user_gets_the_same_rejection() {
        let app = TestApp::new();
        let response = app
            .send(json_request(
                "POST",
                "/api/auth/login",
                None,
                serde_json::json!({ "username": "mallory", "password": "x" }),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["error"], "Invalid credentials");
        assert_eq!(app.store.audit_entries().await[0].action, "login_failed");
    }

    #[tokio::test]
    async fn login_requires_both_fields() {
        let app = TestApp::new();
        let response = app
            .send(json_request(
                "POST",
                "/api/auth/login",
                None,
                serde_json::json!({ "username": "alice" }),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn logout_clears_cookie() {
        let app = TestApp::new();
        let cookie = app.cookie(Role::Viewer);
        let response = app
            .send(
                Request::builder()
                    .method("POST")
                    .uri("/api/auth/logout")
                    .header(header::COOKIE, &cookie)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let set_cookie = response.headers().get(header::SET_COOKIE).unwrap();
        assert!(set_cookie.to_str().unwrap().contains("Max-Age=0"));
        assert_eq!(app.store.audit_entries().await[0].action, "logout");
    }

    #[tokio::test]
    async fn only_admins_manage_secrets() {
        let app = TestApp::new();
        let viewer = app.cookie(Role::Viewer);

        let response = app
            .send(json_request(
                "POST",
                "/api/secrets",
                Some(&viewer),
                serde_json::json!({ "uri": SEED_URI }),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let id = add_secret(&app).await;

        let response = app.send(delete(&format!("/api/secrets/{}", id), &viewer)).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = app.send(get("/api/secrets/push-status", Some(&viewer))).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn secret_lifecycle() {
        let app = TestApp::new();
        let admin = app.cookie(Role::Admin);
        let viewer = app.cookie(Role::Viewer);
        let id = add_secret(&app).await;

        let response = app.send(get("/api/secrets", Some(&viewer))).await;
        assert_eq!(response.status(), StatusCode::OK);
        let listed = body_json(response).await;
        assert_eq!(listed[0]["label"], "user@example.com");
        assert_eq!(listed[0]["issuer"], "GitHub");
        assert!(!listed.to_string().contains("JBSWY3DPEHPK3PXP"));

        let response = app.send(get(&format!("/api/secrets/{}", id), Some(&viewer))).await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = app.send(get("/api/codes", Some(&viewer))).await;
        let codes = body_json(response).await;
        let code = codes[0]["code"].as_str().unwrap();
        assert_eq!(code.len(), 6);
        assert!(code.chars().all(|c| c.is_ascii_digit()));

        let uri = format!("/api/secrets/{}", id);
        assert_eq!(app.send(delete(&uri, &admin)).await.status(), StatusCode::OK);
        assert_eq!(app.send(delete(&uri, &admin)).await.status(), StatusCode::NOT_FOUND);

        let response = app.send(get(&format!("/api/secrets/{}", id), Some(&viewer))).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let actions: Vec<String> = app
            .store
            .audit_entries()
            .await
            .into_iter()
            .map(|e| e.action)
            .collect();
        assert_eq!(actions, vec!["secret_added", "secret_deleted"]);
    }

    #[tokio::test]
    async fn hotp_uri_is_rejected() {
        let app = TestApp::new();
        let admin = app.cookie(Role::Admin);
        let response = app
            .send(json_request(
                "POST",
                "/api/secrets",
                Some(&admin),
                serde_json::json!({
                    "uri": "otpauth://hotp/Test?secret=JBSWY3DPEHPK3PXP&counter=0"
                }),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert!(body["error"].as_str().unwrap().contains("Unsupported credential type"));
    }

    #[tokio::test]
    async fn sync_target_configuration() {
        let app = TestApp::new();
        let admin = app.cookie(Role::Admin);
        let id = add_secret(&app).await;

        let response = app
            .send(json_request(
                "PUT",
                &format!("/api/secrets/{}/sync", id),
                Some(&admin),
                serde_json::json!({
                    "enabled": true,
                    "url": "https://rtdb.example.test",
                    "credential": "secret-cred",
                    "targetKey": "tok1"
                }),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let summary = body_json(response).await;
        assert_eq!(summary["sync"]["enabled"], true);
        assert_eq!(summary["sync"]["targetKey"], "tok1");
        assert!(!summary.to_string().contains("secret-cred"));

        let targets = app.store.list_sync_targets().await.unwrap();
        assert_eq!(targets.len(), 1);

        let response = app
            .send(json_request(
                "PUT",
                "/api/secrets/999/sync",
                Some(&admin),
                serde_json::json!({
                    "enabled": false,
                    "url": "",
                    "credential": "",
                    "targetKey": ""
                }),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app.send(get("/api/secrets/push-status", Some(&admin))).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, serde_json::json!({}));
    }

    #[tokio::test]
    async fn code_stream_emits_sse_frames() {
        let app = TestApp::new();
        add_secret(&app).await;
        let viewer = app.cookie(Role::Viewer);

        let response = app.send(get("/api/codes/stream", Some(&viewer))).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/event-stream"
        );
        assert_eq!(response.headers().get("x-accel-buffering").unwrap(), "no");
        assert_eq!(response.headers().get(header::CACHE_CONTROL).unwrap(), "no-cache");

        let mut body = response.into_body().into_data_stream();
        let frame = body.next().await.unwrap().unwrap();
        let frame = String::from_utf8(frame.to_vec()).unwrap();
        assert!(frame.starts_with("data: ["), "{}", frame);
        assert!(frame.ends_with("\n\n"));
        let json: serde_json::Value =
            serde_json::from_str(frame.trim_start_matches("data: ").trim()).unwrap();
        assert_eq!(json[0]["label"], "user@example.com");
        assert_eq!(json[0]["period"], 30);
    }

    #[tokio::test]
    async fn admin_creates_viewer_who_can_log_in() {
        let app = TestApp::new();
        let hash = hash_with_iterations("pw", 1_000).unwrap();
        app.store.insert_user("root", &hash, Role::Admin).await.unwrap();
        let admin = app.cookie(Role::Admin);

        let response = app
            .send(json_request(
                "POST",
                "/api/users",
                Some(&admin),
                serde_json::json!({ "username": "carol", "password": "s3cret" }),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let created = body_json(response).await;
        assert_eq!(created["username"], "carol");
        assert_eq!(created["role"], "viewer");
        let id = created["id"].as_i64().unwrap();

        let response = app
            .send(json_request(
                "POST",
                "/api/users",
                Some(&admin),
                serde_json::json!({ "username": "carol", "password": "other", "role": "admin" }),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(body_json(response).await["error"], "Username already exists");

        let response = app.send(get("/api/users", Some(&admin))).await;
        assert_eq!(response.status(), StatusCode::OK);
        let users = body_json(response).await;
        assert_eq!(users.as_array().unwrap().len(), 2);
        assert_eq!(users[1]["username"], "carol");
        assert_eq!(users[1]["role"], "viewer");
        assert!(users[1].get("passwordHash").is_none());
        assert!(!users.to_string().contains("pbkdf2"));

        let response = app
            .send(json_request(
                "POST",
                "/api/auth/login",
                None,
                serde_json::json!({ "username": "carol", "password": "s3cret" }),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let set_cookie = response.headers().get(header::SET_COOKIE).unwrap();
        let cookie = set_cookie.to_str().unwrap().split(';').next().unwrap().to_string();

        let response = app.send(get("/api/codes", Some(&cookie))).await;
        assert_eq!(response.status(), StatusCode::OK);
        let response = app.send(get("/api/users", Some(&cookie))).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let uri = format!("/api/users/{}", id);
        assert_eq!(app.send(delete(&uri, &admin)).await.status(), StatusCode::OK);
        assert_eq!(app.send(delete(&uri, &admin)).await.status(), StatusCode::NOT_FOUND);

        let actions: Vec<String> = app
            .store
            .audit_entries()
            .await
            .into_iter()
            .map(|e| e.action)
            .collect();
        assert_eq!(actions, vec!["user_created", "login", "user_deleted"]);
    }

    #[tokio::test]
    async fn viewers_cannot_manage_users() {
        let app = TestApp::new();
        let viewer = app.cookie(Role::Viewer);
        let response = app
            .send(json_request(
                "POST",
                "/api/users",
                Some(&viewer),
                serde_json::json!({ "username": "x", "password": "y", "role": "admin" }),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(app.send(delete("/api/users/1", &viewer)).await.status(), StatusCode::FORBIDDEN);
        assert!(app.store.list_users().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn user_deletion_guards() {
        let app = TestApp::new();
        let hash = hash_with_iterations("pw", 1_000).unwrap();
        let root = app.store.insert_user("root", &hash, Role::Admin).await.unwrap();
        let root_cookie = format!(
            "totp_session={}",
            app.state.sessions.issue(root, "root", Role::Admin)
        );

        let response = app.send(delete(&format!("/api/users/{}", root), &root_cookie)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"], "Cannot delete yourself");

        // A still-valid admin token whose account is gone cannot remove the only admin left.
        let stale = format!(
            "totp_session={}",
            app.state.sessions.issue(root + 100, "former", Role::Admin)
        );
        let response = app.send(delete(&format!("/api/users/{}", root), &stale)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"], "Cannot delete the last admin");

        let second = app.store.insert_user("second", &hash, Role::Admin).await.unwrap();
        let response = app.send(delete(&format!("/api/users/{}", root), &stale)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(app.store.get_user(root).await.unwrap().is_none());
        assert_eq!(app.store.count_admins().await.unwrap(), 1);

        let response = app.send(delete("/api/users/9999", &stale)).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(app.store.get_user(second).await.unwrap().is_some());
    }
}
