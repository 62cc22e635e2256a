use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use keyring::Entry;

use super::CredentialStore;

const SERVICE_NAME: &str = "souk";

/// Keychain account holding the credential map
const DEFAULT_ACCOUNT: &str = "session";

type Entries = BTreeMap<String, String>;

/// Credential store backed by the OS keychain.
///
/// All keys live in one keychain secret as a JSON map, which makes every
/// batch a single keychain write.
pub struct KeyringStore {
    entry: Entry,
    // Serializes read-modify-write cycles against the keychain
    lock: Mutex<()>,
}

impl KeyringStore {
    pub fn new() -> Result<Self> {
        Self::for_account(DEFAULT_ACCOUNT)
    }

    pub fn for_account(account: &str) -> Result<Self> {
        let entry = Entry::new(SERVICE_NAME, account).context("Failed to create keyring entry")?;
        Ok(Self {
            entry,
            lock: Mutex::new(()),
        })
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn load(&self) -> Result<Entries> {
        match self.entry.get_password() {
            Ok(secret) => {
                serde_json::from_str(&secret).context("Failed to parse credentials from keychain")
            }
            Err(keyring::Error::NoEntry) => Ok(Entries::new()),
            Err(e) => Err(e).context("Failed to retrieve credentials from keychain"),
        }
    }

    fn save(&self, entries: &Entries) -> Result<()> {
        if entries.is_empty() {
            return match self.entry.delete_credential() {
                Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
                Err(e) => Err(e).context("Failed to delete credentials from keychain"),
            };
        }
        let secret = serde_json::to_string(entries)?;
        self.entry
            .set_password(&secret)
            .context("Failed to store credentials in keychain")
    }
}

impl CredentialStore for KeyringStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let _guard = self.guard();
        Ok(self.load()?.remove(key))
    }

    fn set_many(&self, entries: &[(&str, &str)]) -> Result<()> {
        let _guard = self.guard();
        let mut map = self.load()?;
        for (key, value) in entries {
            map.insert(key.to_string(), value.to_string());
        }
        self.save(&map)
    }

    fn remove_many(&self, keys: &[&str]) -> Result<()> {
        let _guard = self.guard();
        let mut map = self.load()?;
        for key in keys {
            map.remove(*key);
        }
        self.save(&map)
    }
}
