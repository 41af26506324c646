//! # TOTP Vault
//!
//! Shared vault of TOTP seeds with live code distribution.
//!
//! This library provides:
//! - Envelope encryption of seeds at rest (AES-256-GCM)
//! - Stateless signed session cookies (HMAC-SHA256)
//! - RFC 6238 code derivation and `otpauth://` URI parsing
//! - A per-viewer SSE feed of current codes
//! - A background dispatcher pushing changed codes to external HTTP targets
//!
//! ## Architecture
//!
//! ```text
//!   viewer ──cookie──▶ api ──▶ live::LiveChannel ──┐
//!                       │                          ├─▶ vault ─▶ totp
//!                       │      sync::SyncDispatcher┘
//!                       ▼                 │
//!                  store (sqlite)         └──PUT──▶ external target
//! ```
//!
//! ## Modules
//! - `vault`: seed encryption
//! - `session`: token issue/verify and cookie helpers
//! - `totp`: code derivation and URI parsing
//! - `live`: code snapshots and per-viewer channels
//! - `sync`: external push dispatcher
//! - `ticker`: cancellable periodic tasks shared by `live` and `sync`
//! - `store`: users, secrets and audit log

pub mod api;
pub mod config;
pub mod live;
pub mod password;
pub mod session;
pub mod store;
pub mod sync;
pub mod ticker;
pub mod totp;
pub mod util;
pub mod vault;

pub use config::Config;
pub use session::{Role, SessionPayload, SessionService};
pub use store::{InMemoryStore, SecretStore, SqliteStore};
pub use sync::SyncDispatcher;
pub use vault::SecretVault;
