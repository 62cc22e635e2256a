//! Access-token expiry inspection.
//!
//! Access tokens are JWTs. The client never verifies their signature; it only
//! reads the `exp` claim to decide whether a refresh is due. Anything that
//! cannot be decoded counts as expired.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

use crate::error::SessionError;

#[derive(Debug, Deserialize)]
struct Claims {
    exp: Option<f64>,
}

/// Read the `exp` claim of a JWT without verifying it.
pub fn decode_expiry(token: &str) -> Result<DateTime<Utc>, SessionError> {
    let mut parts = token.split('.');
    let payload = match (parts.next(), parts.next()) {
        (Some(_header), Some(payload)) if !payload.is_empty() => payload,
        _ => return Err(SessionError::TokenDecode("expected header.payload.signature".into())),
    };

    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| SessionError::TokenDecode(format!("payload is not base64url: {}", e)))?;
    let claims: Claims = serde_json::from_slice(&bytes)
        .map_err(|e| SessionError::TokenDecode(format!("payload is not JSON: {}", e)))?;
    let exp = claims
        .exp
        .ok_or_else(|| SessionError::TokenDecode("missing exp claim".into()))?;

    DateTime::from_timestamp(exp.trunc() as i64, 0)
        .ok_or_else(|| SessionError::TokenDecode(format!("exp out of range: {}", exp)))
}

/// Check a token against `now`, treating anything within `buffer` of its
/// expiry as already expired.
///
/// Returns `Ok(())` for a usable token, `Err(Expired)` or `Err(TokenDecode)`
/// otherwise. Callers treat both errors the same way.
pub fn check_expiry(token: &str, buffer: Duration, now: DateTime<Utc>) -> Result<(), SessionError> {
    let expires_at = decode_expiry(token)?;
    if now + buffer >= expires_at {
        Err(SessionError::Expired)
    } else {
        Ok(())
    }
}

pub fn is_expired(token: &str, buffer: Duration, now: DateTime<Utc>) -> bool {
    check_expiry(token, buffer, now).is_err()
}
