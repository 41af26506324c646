//! RFC 6238 TOTP code derivation and `otpauth://` URI parsing.
//!
//! Seeds travel through the rest of the crate as base32 strings (the form they are
//! entered and stored in). They are decoded here, right before the HMAC is computed.

use std::sync::OnceLock;

use data_encoding::{Encoding, BASE32_NOPAD};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Sha256, Sha512};
use thiserror::Error;
use url::Url;

pub const DEFAULT_DIGITS: u32 = 6;
pub const DEFAULT_PERIOD: u64 = 30;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TotpError {
    #[error("Unsupported credential type: {0} (only totp is supported)")]
    UnsupportedCredentialType(String),

    #[error("Invalid otpauth URI: {0}")]
    InvalidUri(String),

    #[error("Missing secret parameter")]
    MissingSecret,

    #[error("Secret is not valid base32")]
    InvalidSecret,

    #[error("Invalid {name}: {value}")]
    InvalidParameter { name: &'static str, value: String },
}

/// HMAC algorithm used for derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Algorithm {
    #[default]
    #[serde(rename = "SHA1")]
    Sha1,
    #[serde(rename = "SHA256")]
    Sha256,
    #[serde(rename = "SHA512")]
    Sha512,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Sha1 => "SHA1",
            Algorithm::Sha256 => "SHA256",
            Algorithm::Sha512 => "SHA512",
        }
    }
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Algorithm {
    type Err = TotpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('-', "").as_str() {
            "SHA1" => Ok(Algorithm::Sha1),
            "SHA256" => Ok(Algorithm::Sha256),
            "SHA512" => Ok(Algorithm::Sha512),
            _ => Err(TotpError::InvalidParameter {
                name: "algorithm",
                value: s.to_string(),
            }),
        }
    }
}

/// Fields extracted from an `otpauth://totp/...` URI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OtpAuthUri {
    pub label: String,
    pub issuer: String,
    pub seed_base32: String,
    pub algorithm: Algorithm,
    pub digits: u32,
    pub period: u64,
}

/// Base32 decoder tolerant of non-zero trailing bits, as emitted by some issuers.
fn base32() -> &'static Encoding {
    static LENIENT: OnceLock<Encoding> = OnceLock::new();
    LENIENT.get_or_init(|| {
        let mut format = BASE32_NOPAD.specification();
        format.check_trailing_bits = false;
        format.encoding().unwrap_or_else(|_| BASE32_NOPAD.clone())
    })
}

/// Canonicalise a user-supplied base32 seed: strip whitespace, dashes and padding, uppercase.
///
/// Fails if the result is empty or does not decode.
pub fn normalize_seed(seed: &str) -> Result<String, TotpError> {
    let normalized: String = seed
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-' && *c != '=')
        .map(|c| c.to_ascii_uppercase())
        .collect();
    decode_seed(&normalized)?;
    Ok(normalized)
}

fn decode_seed(seed_base32: &str) -> Result<Vec<u8>, TotpError> {
    let bytes = base32()
        .decode(seed_base32.as_bytes())
        .map_err(|_| TotpError::InvalidSecret)?;
    if bytes.is_empty() {
        return Err(TotpError::InvalidSecret);
    }
    Ok(bytes)
}

pub fn validate_digits(digits: u32) -> Result<u32, TotpError> {
    match digits {
        6 | 8 => Ok(digits),
        other => Err(TotpError::InvalidParameter {
            name: "digits",
            value: other.to_string(),
        }),
    }
}

pub fn validate_period(period: u64) -> Result<u64, TotpError> {
    if period == 0 {
        return Err(TotpError::InvalidParameter {
            name: "period",
            value: "0".to_string(),
        });
    }
    Ok(period)
}

fn sign<M: Mac + hmac::digest::KeyInit>(
    secret: &[u8],
    message: &[u8],
) -> Result<Vec<u8>, TotpError> {
    let mut mac = <M as Mac>::new_from_slice(secret).map_err(|_| TotpError::InvalidSecret)?;
    mac.update(message);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// HOTP (RFC 4226) over raw secret bytes.
pub fn hotp(
    secret: &[u8],
    counter: u64,
    algorithm: Algorithm,
    digits: u32,
) -> Result<String, TotpError> {
    let digits = validate_digits(digits)?;
    if secret.is_empty() {
        return Err(TotpError::InvalidSecret);
    }

    let counter_bytes = counter.to_be_bytes();
    let digest = match algorithm {
        Algorithm::Sha1 => sign::<Hmac<Sha1>>(secret, &counter_bytes)?,
        Algorithm::Sha256 => sign::<Hmac<Sha256>>(secret, &counter_bytes)?,
        Algorithm::Sha512 => sign::<Hmac<Sha512>>(secret, &counter_bytes)?,
    };

    // Dynamic truncation: low nibble of the last byte picks a 4-byte window.
    let offset = (digest[digest.len() - 1] & 0x0f) as usize;
    let binary = u32::from_be_bytes([
        digest[offset] & 0x7f,
        digest[offset + 1],
        digest[offset + 2],
        digest[offset + 3],
    ]);

    let code = binary % 10u32.pow(digits);
    Ok(format!("{:0width$}", code, width = digits as usize))
}

/// Derive the TOTP code for `seed_base32` at unix time `at_time` (seconds).
pub fn generate(
    seed_base32: &str,
    algorithm: Algorithm,
    digits: u32,
    period: u64,
    at_time: u64,
) -> Result<String, TotpError> {
    let period = validate_period(period)?;
    let secret = decode_seed(seed_base32)?;
    hotp(&secret, at_time / period, algorithm, digits)
}

/// Seconds left in the current window. Always in `1..=period`.
pub fn remaining_seconds(period: u64, now: u64) -> u64 {
    if period == 0 {
        return 0;
    }
    period - (now % period)
}

/// Parse an `otpauth://totp/...` URI, applying SHA1/6/30 defaults.
pub fn parse_uri(uri: &str) -> Result<OtpAuthUri, TotpError> {
    let url = Url::parse(uri.trim()).map_err(|e| TotpError::InvalidUri(e.to_string()))?;
    if !url.scheme().eq_ignore_ascii_case("otpauth") {
        return Err(TotpError::InvalidUri(format!(
            "expected otpauth scheme, got {}",
            url.scheme()
        )));
    }

    let kind = url.host_str().unwrap_or_default().to_ascii_lowercase();
    if kind != "totp" {
        return Err(TotpError::UnsupportedCredentialType(kind));
    }

    let raw_label = urlencoding::decode(url.path().trim_start_matches('/'))
        .map_err(|e| TotpError::InvalidUri(e.to_string()))?
        .into_owned();
    let (path_issuer, label) = match raw_label.split_once(':') {
        Some((issuer, account)) => (Some(issuer.trim().to_string()), account.trim().to_string()),
        None => (None, raw_label.trim().to_string()),
    };

    let mut secret = None;
    let mut query_issuer = None;
    let mut algorithm = Algorithm::default();
    let mut digits = DEFAULT_DIGITS;
    let mut period = DEFAULT_PERIOD;

    for (key, value) in url.query_pairs() {
        match key.to_ascii_lowercase().as_str() {
            "secret" => secret = Some(value.into_owned()),
            "issuer" => query_issuer = Some(value.trim().to_string()),
            "algorithm" => algorithm = value.parse()?,
            "digits" => {
                digits = value.trim().parse().map_err(|_| TotpError::InvalidParameter {
                    name: "digits",
                    value: value.to_string(),
                })?;
            }
            "period" => {
                period = value.trim().parse().map_err(|_| TotpError::InvalidParameter {
                    name: "period",
                    value: value.to_string(),
                })?;
            }
            _ => {}
        }
    }

    let secret = secret
        .filter(|s| !s.trim().is_empty())
        .ok_or(TotpError::MissingSecret)?;

    Ok(OtpAuthUri {
        label,
        issuer: query_issuer.or(path_issuer).unwrap_or_default(),
        seed_base32: normalize_seed(&secret)?,
        algorithm,
        digits: validate_digits(digits)?,
        period: validate_period(period)?,
    })
}
