//! Session lifecycle: token resolution, refresh, teardown and validation.
//!
//! This module provides:
//! - `SessionManager`: hands out valid access tokens, refreshing through a
//!   single-flight gate, and owns teardown
//! - `SessionValidator`: background probe that notices when the server has
//!   dropped the session (for example after a login on another device)
//!
//! Teardown is announced on a broadcast channel as `SessionEvent`s; the host
//! app reacts by routing to its sign-in screen.

pub mod events;
pub mod manager;
pub mod protocol;
pub mod validator;

pub use events::{AppState, LifecycleEvent, SessionEvent, TeardownReason};
pub use manager::SessionManager;
pub use protocol::{classify_unauthorized, parse_refresh_response, TokenPair, UnauthorizedKind};
pub use validator::{SessionValidator, SkipReason, ValidationOutcome, ValidatorHandle};
