//! RFC 6238 time-based one-time passwords (HMAC-SHA1, 30 s step, 6 digits).
//!
//! Pure functions only: the caller supplies the timestamp, so codes can be
//! checked against known vectors without a clock or the network.

use data_encoding::BASE32_NOPAD;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use thiserror::Error;

type HmacSha1 = Hmac<Sha1>;

/// Seconds per TOTP time step.
pub const TOTP_STEP_SECS: i64 = 30;

/// Number of digits in a generated code.
pub const TOTP_DIGITS: u32 = 6;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TotpError {
    #[error("TOTP secret is not valid base32")]
    InvalidSecret,

    #[error("timestamp {0} is before the Unix epoch")]
    InvalidTimestamp(i64),
}

/// Decode a base32 seed as shown by authenticator setup screens. Spaces,
/// lowercase and `=` padding are tolerated.
pub fn decode_secret(secret: &str) -> Result<Vec<u8>, TotpError> {
    let normalized: String = secret
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '=')
        .map(|c| c.to_ascii_uppercase())
        .collect();
    if normalized.is_empty() {
        return Err(TotpError::InvalidSecret);
    }
    BASE32_NOPAD
        .decode(normalized.as_bytes())
        .map_err(|_| TotpError::InvalidSecret)
}

/// Compute the code for `secret` at Unix time `timestamp` (seconds).
pub fn generate_code(secret: &str, timestamp: i64) -> Result<String, TotpError> {
    if timestamp < 0 {
        return Err(TotpError::InvalidTimestamp(timestamp));
    }
    let key = decode_secret(secret)?;
    let counter = (timestamp / TOTP_STEP_SECS) as u64;

    let mut mac = HmacSha1::new_from_slice(&key).map_err(|_| TotpError::InvalidSecret)?;
    mac.update(&counter.to_be_bytes());
    let hash = mac.finalize().into_bytes();

    // Dynamic truncation (RFC 4226 section 5.3)
    let offset = (hash[hash.len() - 1] & 0x0f) as usize;
    let binary = (u32::from(hash[offset] & 0x7f) << 24)
        | (u32::from(hash[offset + 1]) << 16)
        | (u32::from(hash[offset + 2]) << 8)
        | u32::from(hash[offset + 3]);

    let code = binary % 10u32.pow(TOTP_DIGITS);
    Ok(format!("{:0width$}", code, width = TOTP_DIGITS as usize))
}
