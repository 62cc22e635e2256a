//! Typed views of the auth endpoints' JSON.

use serde::Deserialize;

use crate::error::SessionError;

/// 401 message fragment sent when the account signed in on another device.
pub const CONCURRENT_SESSION_PHRASE: &str = "logged in elsewhere";

/// 401 message fragment sent when the server expired the session.
pub const SESSION_EXPIRED_PHRASE: &str = "Session expired";

/// Machine-readable codes, preferred over the phrases when the server sends them.
const CONCURRENT_SESSION_CODE: &str = "CONCURRENT_SESSION";
const SESSION_EXPIRED_CODE: &str = "SESSION_EXPIRED";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshEnvelope {
    #[serde(default)]
    success: bool,
    data: Option<RefreshData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshData {
    access_token: Option<String>,
    refresh_token: Option<String>,
}

/// Tokens issued by a successful refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenPair {
    pub access_token: String,
    /// `None` when the server did not rotate the refresh token.
    pub refresh_token: Option<String>,
}

/// Decode a 2xx refresh body. Anything short of
/// `{ success: true, data: { accessToken } }` is malformed.
pub fn parse_refresh_response(body: &str) -> Result<TokenPair, SessionError> {
    let envelope: RefreshEnvelope =
        serde_json::from_str(body).map_err(|_| SessionError::RefreshMalformedResponse)?;

    match envelope {
        RefreshEnvelope {
            success: true,
            data:
                Some(RefreshData {
                    access_token: Some(access_token),
                    refresh_token,
                }),
        } if !access_token.is_empty() => Ok(TokenPair {
            access_token,
            refresh_token: refresh_token.filter(|t| !t.is_empty()),
        }),
        _ => Err(SessionError::RefreshMalformedResponse),
    }
}

#[derive(Debug, Default, Deserialize)]
struct UnauthorizedBody {
    message: Option<String>,
    code: Option<String>,
}

/// What a 401 from the session probe means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnauthorizedKind {
    ConcurrentSession,
    SessionExpired,
    /// Not a session-level signal; left to the ordinary request path.
    Other,
}

impl From<UnauthorizedKind> for SessionError {
    fn from(kind: UnauthorizedKind) -> Self {
        match kind {
            UnauthorizedKind::ConcurrentSession => SessionError::ConcurrentSessionInvalidated,
            UnauthorizedKind::SessionExpired => SessionError::Expired,
            UnauthorizedKind::Other => SessionError::OrdinaryUnauthorized,
        }
    }
}

/// Classify a 401 body.
///
/// A known `code` wins. Otherwise the `message` (or the raw body, if it is
/// not JSON) is matched case-sensitively against the known phrases.
pub fn classify_unauthorized(body: &str) -> UnauthorizedKind {
    let parsed: UnauthorizedBody = serde_json::from_str(body).unwrap_or_default();

    match parsed.code.as_deref() {
        Some(CONCURRENT_SESSION_CODE) => return UnauthorizedKind::ConcurrentSession,
        Some(SESSION_EXPIRED_CODE) => return UnauthorizedKind::SessionExpired,
        _ => {}
    }

    let message = parsed.message.as_deref().unwrap_or(body);
    if message.contains(CONCURRENT_SESSION_PHRASE) {
        UnauthorizedKind::ConcurrentSession
    } else if message.contains(SESSION_EXPIRED_PHRASE) {
        UnauthorizedKind::SessionExpired
    } else {
        UnauthorizedKind::Other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refresh_with_rotation() {
        let pair = parse_refresh_response(
            r#"{"success":true,"data":{"accessToken":"A2","refreshToken":"R2"}}"#,
        )
        .unwrap();
        assert_eq!(
            pair,
            TokenPair {
                access_token: "A2".into(),
                refresh_token: Some("R2".into()),
            }
        );
    }

    #[test]
    fn test_refresh_without_rotation() {
        let pair = parse_refresh_response(r#"{"success":true,"data":{"accessToken":"A2"}}"#).unwrap();
        assert_eq!(pair.refresh_token, None);

        let blank = parse_refresh_response(
            r#"{"success":true,"data":{"accessToken":"A2","refreshToken":""}}"#,
        )
        .unwrap();
        assert_eq!(blank.refresh_token, None);
    }

    #[test]
    fn test_refresh_malformed_shapes() {
        let bodies = [
            "",
            "<html>502</html>",
            r#"{"success":false,"data":{"accessToken":"A2"}}"#,
            r#"{"data":{"accessToken":"A2"}}"#,
            r#"{"success":true}"#,
            r#"{"success":true,"data":{}}"#,
            r#"{"success":true,"data":{"accessToken":""}}"#,
            r#"{"success":true,"data":{"accessToken":42}}"#,
        ];
        for body in bodies {
            assert!(
                matches!(parse_refresh_response(body), Err(SessionError::RefreshMalformedResponse)),
                "body {:?} should be rejected",
                body
            );
        }
    }

    #[test]
    fn test_classify_by_message() {
        assert_eq!(
            classify_unauthorized(r#"{"message":"You have been logged in elsewhere"}"#),
            UnauthorizedKind::ConcurrentSession
        );
        assert_eq!(
            classify_unauthorized(r#"{"message":"Session expired. Please log in again"}"#),
            UnauthorizedKind::SessionExpired
        );
        assert_eq!(
            classify_unauthorized(r#"{"message":"Invalid credentials"}"#),
            UnauthorizedKind::Other
        );
    }

    #[test]
    fn test_classify_is_case_sensitive() {
        assert_eq!(
            classify_unauthorized(r#"{"message":"session expired"}"#),
            UnauthorizedKind::Other
        );
        assert_eq!(
            classify_unauthorized(r#"{"message":"Logged In Elsewhere"}"#),
            UnauthorizedKind::Other
        );
    }

    #[test]
    fn test_code_wins_over_message() {
        assert_eq!(
            classify_unauthorized(r#"{"code":"SESSION_EXPIRED","message":"logged in elsewhere"}"#),
            UnauthorizedKind::SessionExpired
        );
        assert_eq!(
            classify_unauthorized(r#"{"code":"CONCURRENT_SESSION","message":"Unauthorized"}"#),
            UnauthorizedKind::ConcurrentSession
        );
        // Unknown codes fall back to the message
        assert_eq!(
            classify_unauthorized(r#"{"code":"E401","message":"You have been logged in elsewhere"}"#),
            UnauthorizedKind::ConcurrentSession
        );
    }

    #[test]
    fn test_kind_maps_to_error() {
        let concurrent = SessionError::from(UnauthorizedKind::ConcurrentSession);
        assert!(matches!(concurrent, SessionError::ConcurrentSessionInvalidated));
        assert!(concurrent.is_fatal());

        let other = SessionError::from(UnauthorizedKind::Other);
        assert!(matches!(other, SessionError::OrdinaryUnauthorized));
        assert!(!other.is_fatal());

        assert!(matches!(
            SessionError::from(UnauthorizedKind::SessionExpired),
            SessionError::Expired
        ));
    }

    #[test]
    fn test_classify_plain_text_body() {
        assert_eq!(
            classify_unauthorized("Session expired"),
            UnauthorizedKind::SessionExpired
        );
        assert_eq!(classify_unauthorized(""), UnauthorizedKind::Other);
    }
}
