//! HTTP API for the TOTP vault.
//!
//! ## Endpoints
//!
//! - `GET /api/health` - Health check
//! - `POST /api/auth/login` - Exchange username/password for a session cookie
//! - `POST /api/auth/logout` - Clear the session cookie
//! - `GET /api/auth/session` - Current session
//! - `GET /api/codes` - Current codes for every secret
//! - `GET /api/codes/stream` - Stream codes via SSE, one snapshot per second
//! - `GET /api/secrets` - List secret metadata
//! - `POST /api/secrets` - Add a secret from an `otpauth://` URI or explicit fields (admin)
//! - `GET /api/secrets/{id}` - Secret metadata
//! - `DELETE /api/secrets/{id}` - Remove a secret (admin)
//! - `PUT /api/secrets/{id}/sync` - Configure the external sync target (admin)
//! - `GET /api/secrets/push-status` - External sync status per secret (admin)
//! - `GET /api/users` - List accounts (admin)
//! - `POST /api/users` - Create an admin or viewer account (admin)
//! - `DELETE /api/users/{id}` - Remove an account; never yourself or the last admin (admin)

mod auth;
mod codes;
mod routes;
mod secrets;
pub mod types;
mod users;

pub use routes::{router, serve, AppState};
pub use types::*;
