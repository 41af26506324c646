//! Password hashing for dashboard accounts.
//!
//! Stored format: `pbkdf2:<iterations>:<hex salt>:<hex hash>` (PBKDF2-HMAC-SHA256).

use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;

const PBKDF2_ITERATIONS: u32 = 210_000;
const SALT_LENGTH: usize = 16;
const HASH_LENGTH: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PasswordError {
    #[error("Password must not be empty")]
    Empty,

    #[error("Malformed password hash")]
    MalformedHash,
}

/// Hash a password with a fresh random salt.
pub fn hash_password(password: &str) -> Result<String, PasswordError> {
    hash_with_iterations(password, PBKDF2_ITERATIONS)
}

pub(crate) fn hash_with_iterations(
    password: &str,
    iterations: u32,
) -> Result<String, PasswordError> {
    if password.is_empty() {
        return Err(PasswordError::Empty);
    }
    let mut salt = [0u8; SALT_LENGTH];
    rand::thread_rng().fill_bytes(&mut salt);

    let mut hash = [0u8; HASH_LENGTH];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, iterations, &mut hash);

    Ok(format!(
        "pbkdf2:{}:{}:{}",
        iterations,
        hex::encode(salt),
        hex::encode(hash)
    ))
}

/// Check `password` against a stored hash. Malformed hashes never match.
pub fn verify_password(password: &str, stored: &str) -> bool {
    match parse_stored(stored) {
        Ok((iterations, salt, expected)) => {
            let mut derived = vec![0u8; expected.len()];
            pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, iterations, &mut derived);
            constant_time_eq(&derived, &expected)
        }
        Err(_) => false,
    }
}

fn parse_stored(stored: &str) -> Result<(u32, Vec<u8>, Vec<u8>), PasswordError> {
    let mut parts = stored.split(':');
    if parts.next() != Some("pbkdf2") {
        return Err(PasswordError::MalformedHash);
    }
    let iterations: u32 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .filter(|n| *n > 0)
        .ok_or(PasswordError::MalformedHash)?;
    let salt = parts
        .next()
        .and_then(|s| hex::decode(s).ok())
        .ok_or(PasswordError::MalformedHash)?;
    let hash = parts
        .next()
        .and_then(|s| hex::decode(s).ok())
        .filter(|h| !h.is_empty())
        .ok_or(PasswordError::MalformedHash)?;
    if parts.next().is_some() {
        return Err(PasswordError::MalformedHash);
    }
    Ok((iterations, salt, hash))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |diff, (x, y)| diff | (x ^ y)) == 0
}
