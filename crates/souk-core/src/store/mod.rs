//! Credential storage for the session core.
//!
//! This module provides:
//! - `CredentialStore`: the key-value seam the session core writes through
//! - `MemoryStore`: process-local store for tests and embedding
//! - `FileStore`: JSON document on disk, replaced atomically on every batch
//! - `KeyringStore`: the whole credential map as one OS keychain secret
//! - `CredentialVault`: typed access to the well-known credential keys
//!
//! Batch operations are all-or-nothing in every implementation, so teardown
//! never leaves half a session behind.

pub mod file;
pub mod keychain;
pub mod memory;
pub mod vault;

use anyhow::Result;

pub use file::FileStore;
pub use keychain::KeyringStore;
pub use memory::MemoryStore;
pub use vault::{CredentialVault, LoginCredentials};

/// Persistent key-value store holding session credentials.
///
/// Implementations must be internally synchronized and must apply
/// `set_many` / `remove_many` atomically: after a failed batch the store
/// shows exactly the state it had before the call.
pub trait CredentialStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;

    fn set_many(&self, entries: &[(&str, &str)]) -> Result<()>;

    fn remove_many(&self, keys: &[&str]) -> Result<()>;

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.set_many(&[(key, value)])
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.remove_many(&[key])
    }
}
