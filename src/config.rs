//! Configuration management for the TOTP vault.
//!
//! Configuration is read once at startup from environment variables:
//! - `SECRET_ENCRYPTION_KEY` - Required. 64 hex characters (32 bytes) used to seal TOTP seeds.
//! - `SESSION_SECRET` - Required. 64 hex characters (32 bytes) used to sign session tokens.
//! - `DB_PATH` - Optional. SQLite database path. Defaults to `./data/totp.db`.
//! - `HOST` - Optional. Server host. Defaults to `127.0.0.1`.
//! - `PORT` - Optional. Server port. Defaults to `3000`.
//! - `SESSION_TTL_SECS` - Optional. Session lifetime. Defaults to 8 hours.
//! - `STREAM_INTERVAL_MS` - Optional. Live code stream cadence. Defaults to `1000`.
//! - `SYNC_ENABLED` - Optional. Run the external sync dispatcher. Defaults to `true`.
//! - `SYNC_INTERVAL_SECS` - Optional. External sync cadence. Defaults to `30`.
//! - `SYNC_PUSH_TIMEOUT_SECS` - Optional. Upper bound for one outbound push. Defaults to `10`.
//! - `ADMIN_USERNAME` / `ADMIN_PASSWORD` - Optional. Bootstrap admin account.
//! - `SECURE_COOKIES` - Optional. Mark the session cookie `Secure`. Defaults to `true`.
//!
//! Missing or malformed keys are fatal: the process must not run with weak key material.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::util::env_var_bool;

/// Length in bytes of both the vault key and the session signing key.
pub const KEY_LENGTH: usize = 32;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),

    #[error("Invalid key in {0}: {1}")]
    InvalidKey(String, String),
}

/// Settings for the background push of codes to external targets.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Whether the dispatcher runs at all
    pub enabled: bool,

    /// Time between two dispatcher ticks
    pub interval: Duration,

    /// Upper bound on a single outbound push
    pub push_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(30),
            push_timeout: Duration::from_secs(10),
        }
    }
}

/// Credentials for the admin account created at startup.
#[derive(Clone)]
pub struct BootstrapAdmin {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for BootstrapAdmin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootstrapAdmin")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Service configuration.
#[derive(Clone)]
pub struct Config {
    /// AES-256-GCM key for seed material
    pub vault_key: [u8; KEY_LENGTH],

    /// HMAC-SHA256 key for session tokens
    pub session_key: [u8; KEY_LENGTH],

    /// SQLite database path
    pub db_path: PathBuf,

    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// Lifetime of an issued session token
    pub session_ttl: Duration,

    /// Whether the session cookie is marked `Secure`
    pub secure_cookies: bool,

    /// Cadence of the live code stream
    pub stream_interval: Duration,

    /// External sync dispatcher settings
    pub sync: SyncConfig,

    /// Admin account to create if missing
    pub bootstrap_admin: Option<BootstrapAdmin>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("vault_key", &"<redacted>")
            .field("session_key", &"<redacted>")
            .field("db_path", &self.db_path)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("session_ttl", &self.session_ttl)
            .field("secure_cookies", &self.secure_cookies)
            .field("stream_interval", &self.stream_interval)
            .field("sync", &self.sync)
            .field("bootstrap_admin", &self.bootstrap_admin)
            .finish()
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnvVar` if a key variable is not set and
    /// `ConfigError::InvalidKey` if it does not decode to exactly 32 bytes.
    pub fn from_env() -> Result<Self, ConfigError> {
        let vault_key = required_key("SECRET_ENCRYPTION_KEY")?;
        let session_key = required_key("SESSION_SECRET")?;

        let db_path = std::env::var("DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data/totp.db"));

        let host = std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());

        let port = parse_env("PORT", 3000u16)?;
        let session_ttl = Duration::from_secs(parse_env("SESSION_TTL_SECS", 8 * 60 * 60u64)?);
        let stream_interval = Duration::from_millis(parse_env("STREAM_INTERVAL_MS", 1000u64)?);

        let sync = SyncConfig {
            enabled: env_var_bool("SYNC_ENABLED", true),
            interval: Duration::from_secs(parse_env("SYNC_INTERVAL_SECS", 30u64)?),
            push_timeout: Duration::from_secs(parse_env("SYNC_PUSH_TIMEOUT_SECS", 10u64)?),
        };

        if session_ttl.is_zero() {
            return Err(ConfigError::InvalidValue(
                "SESSION_TTL_SECS".to_string(),
                "must be greater than zero".to_string(),
            ));
        }
        if stream_interval.is_zero() || sync.interval.is_zero() || sync.push_timeout.is_zero() {
            return Err(ConfigError::InvalidValue(
                "STREAM_INTERVAL_MS/SYNC_INTERVAL_SECS/SYNC_PUSH_TIMEOUT_SECS".to_string(),
                "intervals must be greater than zero".to_string(),
            ));
        }

        let bootstrap_admin = match std::env::var("ADMIN_PASSWORD") {
            Ok(password) if !password.is_empty() => Some(BootstrapAdmin {
                username: std::env::var("ADMIN_USERNAME").unwrap_or_else(|_| "admin".to_string()),
                password,
            }),
            _ => None,
        };

        Ok(Self {
            vault_key,
            session_key,
            db_path,
            host,
            port,
            session_ttl,
            secure_cookies: env_var_bool("SECURE_COOKIES", true),
            stream_interval,
            sync,
            bootstrap_admin,
        })
    }

    /// Create a config with custom keys and defaults elsewhere (useful for testing).
    pub fn new(vault_key: [u8; KEY_LENGTH], session_key: [u8; KEY_LENGTH]) -> Self {
        Self {
            vault_key,
            session_key,
            db_path: PathBuf::from("./data/totp.db"),
            host: "127.0.0.1".to_string(),
            port: 3000,
            session_ttl: Duration::from_secs(8 * 60 * 60),
            secure_cookies: true,
            stream_interval: Duration::from_secs(1),
            sync: SyncConfig::default(),
            bootstrap_admin: None,
        }
    }
}

fn required_key(name: &str) -> Result<[u8; KEY_LENGTH], ConfigError> {
    let value =
        std::env::var(name).map_err(|_| ConfigError::MissingEnvVar(name.to_string()))?;
    parse_hex_key(value.trim()).map_err(|reason| ConfigError::InvalidKey(name.to_string(), reason))
}

/// Decode a 64-character hex string into a 32-byte key.
pub fn parse_hex_key(value: &str) -> Result<[u8; KEY_LENGTH], String> {
    if value.len() != KEY_LENGTH * 2 {
        return Err(format!(
            "expected {} hex characters, got {}",
            KEY_LENGTH * 2,
            value.len()
        ));
    }
    let bytes = hex::decode(value).map_err(|e| format!("not valid hex: {}", e))?;
    let mut key = [0u8; KEY_LENGTH];
    key.copy_from_slice(&bytes);
    Ok(key)
}

fn parse_env<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue(name.to_string(), format!("{}", e))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_hex_key_accepts_64_hex_chars() {
        let key = parse_hex_key(&"ab".repeat(32)).expect("valid key");
        assert_eq!(key, [0xab; KEY_LENGTH]);
    }

    #[test]
    fn parse_hex_key_rejects_wrong_length() {
        assert!(parse_hex_key(&"ab".repeat(31)).is_err());
        assert!(parse_hex_key(&"ab".repeat(33)).is_err());
        assert!(parse_hex_key("").is_err());
    }

    #[test]
    fn parse_hex_key_rejects_non_hex() {
        assert!(parse_hex_key(&"zz".repeat(32)).is_err());
    }

    #[test]
    fn debug_output_redacts_keys() {
        let config = Config::new([7u8; KEY_LENGTH], [9u8; KEY_LENGTH]);
        let rendered = format!("{:?}", config);
        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains("[7, 7"));
    }

    #[test]
    fn new_uses_default_cadences() {
        let config = Config::new([1u8; KEY_LENGTH], [2u8; KEY_LENGTH]);
        assert_eq!(config.stream_interval, Duration::from_secs(1));
        assert_eq!(config.sync.interval, Duration::from_secs(30));
        assert_eq!(config.session_ttl, Duration::from_secs(28_800));
    }
}
