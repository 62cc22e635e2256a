/// Why a session was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownReason {
    /// The validator saw the account signed in on another device.
    ConcurrentSession,
    /// The server reported the session as expired.
    SessionExpired,
    /// Too many consecutive refresh failures.
    RefreshExhausted,
    /// The refresh call failed, timed out or returned garbage.
    RefreshFailed,
    /// Access token expired and no refresh token was stored.
    MissingRefreshToken,
    /// An ordinary authenticated request came back 401.
    Unauthorized,
    /// The user signed out.
    LoggedOut,
}

impl TeardownReason {
    /// One-time message for the login screen, if this reason warrants one.
    pub fn notice(self) -> Option<&'static str> {
        match self {
            TeardownReason::ConcurrentSession => {
                Some("You have been logged in on another device. Please log in again.")
            }
            TeardownReason::SessionExpired
            | TeardownReason::RefreshExhausted
            | TeardownReason::RefreshFailed => Some("Your session has expired. Please log in again."),
            TeardownReason::MissingRefreshToken
            | TeardownReason::Unauthorized
            | TeardownReason::LoggedOut => None,
        }
    }
}

/// Signals from the session core to the host app.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Credentials are gone; route to the sign-in screen.
    ReauthRequired {
        reason: TeardownReason,
        notice: Option<String>,
    },
}

/// Foreground state of the host application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    Active,
    Inactive,
    Background,
}

/// Host lifecycle signals consumed by the session validator. Adapters for
/// a concrete UI framework translate its callbacks into these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    RouteChanged(String),
    AppStateChanged(AppState),
}
