//! Souk session core - authenticated-session plumbing for the Souk client.
//!
//! This crate contains everything the marketplace screens need to talk to
//! the backend as a signed-in user:
//! - `store`: credential storage (memory, file, OS keychain) and the typed vault
//! - `token`: access-token expiry inspection
//! - `gate`: single-flight coordination for token refresh
//! - `session`: the token lifecycle manager and the background session validator
//! - `api`: the bare HTTP transport and the token-attaching API client
//! - `config`: tunables for timeouts, intervals and endpoints

pub mod api;
pub mod config;
pub mod error;
pub mod gate;
pub mod session;
pub mod store;
pub mod token;

#[cfg(test)]
pub(crate) mod test_support;

pub use api::{ApiClient, ApiError, HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};
pub use config::SessionConfig;
pub use error::SessionError;
pub use gate::RefreshGate;
pub use session::{
    AppState, LifecycleEvent, SessionEvent, SessionManager, SessionValidator, TeardownReason,
    ValidationOutcome, ValidatorHandle,
};
pub use store::{CredentialStore, CredentialVault, FileStore, KeyringStore, LoginCredentials, MemoryStore};
