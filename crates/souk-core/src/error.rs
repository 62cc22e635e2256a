use thiserror::Error;

use crate::api::ApiError;

/// Failure categories of the token lifecycle.
///
/// Most of these never leave the crate: `SessionManager::get_valid_access_token`
/// collapses them into `None` after running teardown. They exist so the
/// internal paths and their log lines say exactly what went wrong.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("No access token stored")]
    NoCredential,

    #[error("Malformed access token: {0}")]
    TokenDecode(String),

    #[error("Access token expired")]
    Expired,

    #[error("Refresh attempts exhausted after {0} consecutive failures")]
    RefreshExhausted(u32),

    #[error("Refresh request failed: {0}")]
    RefreshNetwork(#[from] ApiError),

    #[error("Refresh response missing expected fields")]
    RefreshMalformedResponse,

    #[error("Session invalidated by a login on another device")]
    ConcurrentSessionInvalidated,

    #[error("Unauthorized")]
    OrdinaryUnauthorized,

    #[error("Credential store error: {0:#}")]
    Store(#[from] anyhow::Error),
}

impl SessionError {
    /// Whether this failure means the session is gone for good and the user
    /// has to sign in again.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SessionError::RefreshExhausted(_)
                | SessionError::RefreshNetwork(_)
                | SessionError::RefreshMalformedResponse
                | SessionError::ConcurrentSessionInvalidated
        )
    }
}
