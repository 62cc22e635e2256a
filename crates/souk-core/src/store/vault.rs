use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::CredentialStore;

pub const ACCESS_TOKEN: &str = "accessToken";
pub const REFRESH_TOKEN: &str = "refreshToken";
pub const REFRESH_ATTEMPTS: &str = "refreshAttempts";
pub const TOKEN_TIMESTAMP: &str = "tokenTimestamp";
pub const USER_ID: &str = "userId";
pub const USER_ROLE: &str = "userRole";
pub const USER_EMAIL: &str = "userEmail";

/// One-time message for the login screen. Kept outside `CREDENTIAL_KEYS`
/// so it survives teardown.
pub const SESSION_NOTICE: &str = "sessionNotice";

/// Every key removed by teardown.
pub const CREDENTIAL_KEYS: &[&str] = &[
    ACCESS_TOKEN,
    REFRESH_TOKEN,
    TOKEN_TIMESTAMP,
    USER_ID,
    USER_ROLE,
    USER_EMAIL,
];

/// Result of a login or registration, handed over by the auth screens.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginCredentials {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub user_id: Option<String>,
    pub user_role: Option<String>,
    pub user_email: Option<String>,
}

/// Typed view over the credential keys in a `CredentialStore`.
#[derive(Clone)]
pub struct CredentialVault {
    store: Arc<dyn CredentialStore>,
}

impl CredentialVault {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }

    pub fn access_token(&self) -> Result<Option<String>> {
        self.store.get(ACCESS_TOKEN)
    }

    pub fn refresh_token(&self) -> Result<Option<String>> {
        self.store.get(REFRESH_TOKEN)
    }

    /// Consecutive failed refreshes. Missing or garbled values read as 0.
    pub fn refresh_attempts(&self) -> Result<u32> {
        let raw = self.store.get(REFRESH_ATTEMPTS)?;
        Ok(match raw {
            Some(value) => value.trim().parse().unwrap_or_else(|_| {
                warn!(value = %value, "Unparsable refresh attempt counter, treating as 0");
                0
            }),
            None => 0,
        })
    }

    pub fn set_refresh_attempts(&self, attempts: u32) -> Result<()> {
        self.store.set(REFRESH_ATTEMPTS, &attempts.to_string())
    }

    /// Persist a refreshed token pair and clear the attempt counter in one
    /// batch. A `None` refresh token keeps the stored one.
    pub fn store_tokens(&self, access_token: &str, refresh_token: Option<&str>) -> Result<()> {
        let timestamp = Utc::now().timestamp_millis().to_string();
        let mut entries = vec![
            (ACCESS_TOKEN, access_token),
            (TOKEN_TIMESTAMP, timestamp.as_str()),
            (REFRESH_ATTEMPTS, "0"),
        ];
        if let Some(refresh) = refresh_token {
            entries.push((REFRESH_TOKEN, refresh));
        }
        self.store.set_many(&entries)
    }

    /// Persist a fresh login. Any leftover identity fields from a previous
    /// account are dropped in the same pass.
    pub fn store_login(&self, login: &LoginCredentials) -> Result<()> {
        self.store.remove_many(CREDENTIAL_KEYS)?;

        let timestamp = Utc::now().timestamp_millis().to_string();
        let mut entries = vec![
            (ACCESS_TOKEN, login.access_token.as_str()),
            (TOKEN_TIMESTAMP, timestamp.as_str()),
            (REFRESH_ATTEMPTS, "0"),
        ];
        let optional = [
            (REFRESH_TOKEN, &login.refresh_token),
            (USER_ID, &login.user_id),
            (USER_ROLE, &login.user_role),
            (USER_EMAIL, &login.user_email),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                entries.push((key, value.as_str()));
            }
        }
        self.store.set_many(&entries)
    }

    /// Remove every credential key in one batch. The attempt counter and
    /// the session notice are left alone.
    pub fn clear_credentials(&self) -> Result<()> {
        self.store.remove_many(CREDENTIAL_KEYS)
    }

    /// Remove credentials, the attempt counter and any pending notice.
    pub fn clear_all(&self) -> Result<()> {
        let mut keys = CREDENTIAL_KEYS.to_vec();
        keys.push(REFRESH_ATTEMPTS);
        keys.push(SESSION_NOTICE);
        self.store.remove_many(&keys)
    }

    pub fn set_notice(&self, notice: &str) -> Result<()> {
        self.store.set(SESSION_NOTICE, notice)
    }

    /// Read the pending notice and remove it so it is shown only once.
    pub fn take_notice(&self) -> Result<Option<String>> {
        let notice = self.store.get(SESSION_NOTICE)?;
        if notice.is_some() {
            self.store.remove(SESSION_NOTICE)?;
        }
        Ok(notice)
    }

    pub fn user_id(&self) -> Result<Option<String>> {
        self.store.get(USER_ID)
    }

    pub fn user_role(&self) -> Result<Option<String>> {
        self.store.get(USER_ROLE)
    }

    pub fn user_email(&self) -> Result<Option<String>> {
        self.store.get(USER_EMAIL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn vault() -> (Arc<MemoryStore>, CredentialVault) {
        let store = Arc::new(MemoryStore::new());
        let vault = CredentialVault::new(store.clone());
        (store, vault)
    }

    fn login() -> LoginCredentials {
        LoginCredentials {
            access_token: "A1".into(),
            refresh_token: Some("R1".into()),
            user_id: Some("42".into()),
            user_role: Some("vendor".into()),
            user_email: Some("vendor@example.com".into()),
        }
    }

    #[test]
    fn test_attempts_default_and_garbage() {
        let (store, vault) = vault();
        assert_eq!(vault.refresh_attempts().unwrap(), 0);

        store.set(REFRESH_ATTEMPTS, "two").unwrap();
        assert_eq!(vault.refresh_attempts().unwrap(), 0);

        vault.set_refresh_attempts(2).unwrap();
        assert_eq!(vault.refresh_attempts().unwrap(), 2);
    }

    #[test]
    fn test_store_tokens_keeps_refresh_when_absent() {
        let (_store, vault) = vault();
        vault.store_login(&login()).unwrap();
        vault.set_refresh_attempts(2).unwrap();

        vault.store_tokens("A2", None).unwrap();
        assert_eq!(vault.access_token().unwrap().as_deref(), Some("A2"));
        assert_eq!(vault.refresh_token().unwrap().as_deref(), Some("R1"));
        assert_eq!(vault.refresh_attempts().unwrap(), 0);

        vault.store_tokens("A3", Some("R3")).unwrap();
        assert_eq!(vault.refresh_token().unwrap().as_deref(), Some("R3"));
    }

    #[test]
    fn test_store_login_replaces_identity() {
        let (store, vault) = vault();
        vault.store_login(&login()).unwrap();
        assert_eq!(vault.user_id().unwrap().as_deref(), Some("42"));
        assert_eq!(vault.user_email().unwrap().as_deref(), Some("vendor@example.com"));

        vault
            .store_login(&LoginCredentials {
                access_token: "B1".into(),
                ..LoginCredentials::default()
            })
            .unwrap();
        assert_eq!(vault.access_token().unwrap().as_deref(), Some("B1"));
        assert_eq!(vault.refresh_token().unwrap(), None);
        assert_eq!(vault.user_role().unwrap(), None);
        assert_eq!(vault.user_id().unwrap(), None);
        assert!(store.get(TOKEN_TIMESTAMP).unwrap().is_some());
    }

    #[test]
    fn test_clear_credentials_keeps_counter_and_notice() {
        let (store, vault) = vault();
        vault.store_login(&login()).unwrap();
        vault.set_refresh_attempts(1).unwrap();
        vault.set_notice("Please log in again").unwrap();

        vault.clear_credentials().unwrap();
        for key in CREDENTIAL_KEYS {
            assert_eq!(store.get(key).unwrap(), None, "{} should be gone", key);
        }
        assert_eq!(vault.refresh_attempts().unwrap(), 1);
        assert_eq!(store.keys(), vec![REFRESH_ATTEMPTS, SESSION_NOTICE]);
    }

    #[test]
    fn test_clear_all() {
        let (store, vault) = vault();
        vault.store_login(&login()).unwrap();
        vault.set_refresh_attempts(1).unwrap();
        vault.set_notice("Please log in again").unwrap();

        vault.clear_all().unwrap();
        assert!(store.keys().is_empty());
    }

    #[test]
    fn test_notice_is_taken_once() {
        let (_store, vault) = vault();
        assert_eq!(vault.take_notice().unwrap(), None);

        vault.set_notice("logged in elsewhere").unwrap();
        assert_eq!(vault.take_notice().unwrap().as_deref(), Some("logged in elsewhere"));
        assert_eq!(vault.take_notice().unwrap(), None);
    }
}
