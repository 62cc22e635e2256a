//! Access-token lifecycle.
//!
//! `SessionManager::get_valid_access_token` is the only way the rest of the
//! app obtains a token. It returns the stored token while it is fresh,
//! refreshes it through the `RefreshGate` when it is not, and tears the
//! session down on any failure it cannot recover from.
//!
//! Every credential write goes through the session epoch lock. Teardown,
//! logout and establish bump the epoch; a refresh that started under an
//! older epoch drops its result instead of writing it back.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::events::{SessionEvent, TeardownReason};
use super::protocol::{parse_refresh_response, TokenPair};
use crate::api::{ApiError, HttpRequest, HttpTransport, ResponseCache};
use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::gate::RefreshGate;
use crate::store::{CredentialStore, CredentialVault, LoginCredentials};
use crate::token;

/// Buffer size for the session event channel.
/// Teardown emits one event; 16 leaves room for slow subscribers.
const EVENT_CHANNEL_CAPACITY: usize = 16;

struct Inner {
    vault: CredentialVault,
    transport: Arc<dyn HttpTransport>,
    config: SessionConfig,
    gate: RefreshGate,
    cache: ResponseCache,
    events: broadcast::Sender<SessionEvent>,
    /// Bumped whenever the stored session is replaced or removed.
    epoch: Mutex<u64>,
}

/// Owns the access/refresh token lifecycle.
/// Clone is cheap and every clone shares the same gate, cache and channel.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        transport: Arc<dyn HttpTransport>,
        config: SessionConfig,
    ) -> Self {
        Self::with_gate(store, transport, config, RefreshGate::new())
    }

    /// Build with an explicit refresh gate, e.g. one shared with another
    /// manager over the same store.
    pub fn with_gate(
        store: Arc<dyn CredentialStore>,
        transport: Arc<dyn HttpTransport>,
        config: SessionConfig,
        gate: RefreshGate,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                vault: CredentialVault::new(store),
                transport,
                config,
                gate,
                cache: ResponseCache::new(),
                events,
                epoch: Mutex::new(0),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn vault(&self) -> &CredentialVault {
        &self.inner.vault
    }

    pub fn gate(&self) -> &RefreshGate {
        &self.inner.gate
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.inner.cache
    }

    /// The bare transport. Requests sent through it carry no token.
    pub fn transport(&self) -> &Arc<dyn HttpTransport> {
        &self.inner.transport
    }

    /// Cheap local check: is there an access token at all?
    pub fn is_authenticated(&self) -> bool {
        match self.inner.vault.access_token() {
            Ok(token) => token.is_some(),
            Err(e) => {
                warn!(error = %e, "Failed to read access token");
                false
            }
        }
    }

    /// Return a usable access token, refreshing it if needed.
    ///
    /// `None` means the caller is unauthenticated: either nobody signed in,
    /// or the session could not be recovered and has been torn down.
    pub async fn get_valid_access_token(&self) -> Option<String> {
        match self.resolve().await {
            Ok(token) => Some(token),
            Err(SessionError::NoCredential) => None,
            Err(e) if e.is_fatal() => {
                warn!(error = %e, "No usable access token");
                None
            }
            Err(e) => {
                debug!(error = %e, "No usable access token");
                None
            }
        }
    }

    async fn resolve(&self) -> Result<String, SessionError> {
        let inner = &self.inner;
        let epoch = inner.epoch();
        let access_token = inner.vault.access_token()?.ok_or(SessionError::NoCredential)?;
        let attempts = inner.vault.refresh_attempts()?;

        match token::check_expiry(&access_token, inner.config.expiry_buffer(), Utc::now()) {
            Ok(()) => {
                if attempts != 0 {
                    if let Some(Err(e)) =
                        inner.write_if_current(epoch, |vault| vault.set_refresh_attempts(0))
                    {
                        warn!(error = %e, "Failed to reset refresh attempt counter");
                    }
                }
                return Ok(access_token);
            }
            Err(e) => debug!(reason = %e, "Access token needs refresh"),
        }

        if attempts >= inner.config.max_refresh_attempts {
            inner.teardown_if_current(epoch, TeardownReason::RefreshExhausted);
            return Err(SessionError::RefreshExhausted(attempts));
        }

        if inner.vault.refresh_token()?.is_none() {
            inner.teardown_if_current(epoch, TeardownReason::MissingRefreshToken);
            return Err(SessionError::Expired);
        }

        let leader = Arc::clone(&self.inner);
        inner
            .gate
            .run(move || refresh_once(leader))
            .await
            .ok_or(SessionError::Expired)
    }

    /// Remove credentials, clear the response cache and ask the host app to
    /// route to sign-in. Safe to call repeatedly.
    pub fn teardown(&self, reason: TeardownReason) {
        self.inner.teardown(reason);
    }

    /// Persist the result of a login or registration.
    pub fn establish(&self, login: &LoginCredentials) -> Result<()> {
        {
            let mut epoch = self.inner.lock_epoch();
            *epoch += 1;
            self.inner.vault.store_login(login)?;
            // A notice from the previous session must not greet the new one
            self.inner.vault.take_notice()?;
            self.inner.cache.clear();
        }
        info!(user_id = ?login.user_id, "Session established");
        Ok(())
    }

    /// Explicit sign-out. Unlike teardown this also forgets the refresh
    /// attempt counter and any pending notice.
    pub fn logout(&self) -> Result<()> {
        let result = {
            let mut epoch = self.inner.lock_epoch();
            *epoch += 1;
            let result = self.inner.vault.clear_all();
            self.inner.cache.clear();
            result
        };
        self.inner.gate.reset();
        self.inner.announce(TeardownReason::LoggedOut);
        info!("Logged out");
        result
    }

    /// One-time explanation for the sign-in screen, removed once read.
    pub fn take_session_notice(&self) -> Option<String> {
        match self.inner.vault.take_notice() {
            Ok(notice) => notice,
            Err(e) => {
                warn!(error = %e, "Failed to read session notice");
                None
            }
        }
    }
}

impl Inner {
    fn lock_epoch(&self) -> MutexGuard<'_, u64> {
        self.epoch.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn epoch(&self) -> u64 {
        *self.lock_epoch()
    }

    /// Run `write` under the epoch lock unless the session changed since
    /// `seen`. `None` means the write was skipped.
    fn write_if_current<T>(
        &self,
        seen: u64,
        write: impl FnOnce(&CredentialVault) -> Result<T>,
    ) -> Option<Result<T>> {
        let epoch = self.lock_epoch();
        if *epoch != seen {
            return None;
        }
        Some(write(&self.vault))
    }

    fn teardown(&self, reason: TeardownReason) {
        {
            let mut epoch = self.lock_epoch();
            *epoch += 1;
            self.clear_session(reason);
        }
        self.announce(reason);
    }

    /// Teardown on behalf of work that started under `seen`. Skipped when
    /// someone else already replaced or removed that session.
    fn teardown_if_current(&self, seen: u64, reason: TeardownReason) {
        {
            let mut epoch = self.lock_epoch();
            if *epoch != seen {
                debug!(reason = ?reason, "Session already changed, skipping teardown");
                return;
            }
            *epoch += 1;
            self.clear_session(reason);
        }
        self.announce(reason);
    }

    /// Caller holds the epoch lock.
    fn clear_session(&self, reason: TeardownReason) {
        warn!(reason = ?reason, "Tearing down session");

        // The notice lives outside the credential keys, so write it first
        if let Some(notice) = reason.notice() {
            if let Err(e) = self.vault.set_notice(notice) {
                error!(error = %e, "Failed to store session notice");
            }
        }
        if let Err(e) = self.vault.clear_credentials() {
            error!(error = %e, "Failed to remove credentials during teardown");
        }
        self.cache.clear();
    }

    fn announce(&self, reason: TeardownReason) {
        let event = SessionEvent::ReauthRequired {
            reason,
            notice: reason.notice().map(String::from),
        };
        if self.events.send(event).is_err() {
            debug!("No subscribers for session event");
        }
    }

    async fn request_refresh(&self, refresh_token: &str) -> Result<TokenPair, SessionError> {
        let timeout = self.config.refresh_timeout();
        let request = HttpRequest::post(self.config.refresh_url())
            .bearer(refresh_token)
            .timeout(timeout);

        let response = tokio::time::timeout(timeout, self.transport.send(request))
            .await
            .map_err(|_| ApiError::Timeout(timeout))??;
        let response = response.error_for_status()?;
        parse_refresh_response(&response.body)
    }
}

/// One refresh attempt. Runs as the gate's single in-flight future.
///
/// Reads the tokens afresh: callers may have queued behind a refresh that
/// already failed and tore the session down.
async fn refresh_once(inner: Arc<Inner>) -> Option<String> {
    let epoch = inner.epoch();
    let tokens = (inner.vault.access_token(), inner.vault.refresh_token());
    let (access_token, refresh_token) = match tokens {
        (Ok(access), Ok(refresh)) => (access, refresh),
        (Err(e), _) | (_, Err(e)) => {
            error!(error = %e, "Failed to read tokens before refresh");
            inner.teardown_if_current(epoch, TeardownReason::RefreshFailed);
            return None;
        }
    };

    let Some(access_token) = access_token else {
        debug!("Session cleared before refresh started");
        return None;
    };
    // Another caller may have finished a refresh between our expiry check
    // and entering the gate
    if !token::is_expired(&access_token, inner.config.expiry_buffer(), Utc::now()) {
        debug!("Access token already refreshed");
        return Some(access_token);
    }
    let Some(refresh_token) = refresh_token else {
        inner.teardown_if_current(epoch, TeardownReason::MissingRefreshToken);
        return None;
    };

    // Counted before the call so a crash mid-request still uses up an attempt
    let counted = inner.write_if_current(epoch, |vault| {
        let attempt = vault.refresh_attempts()?.saturating_add(1);
        vault.set_refresh_attempts(attempt)?;
        Ok(attempt)
    });
    let attempt = match counted {
        Some(Ok(attempt)) => attempt,
        Some(Err(e)) => {
            error!(error = %e, "Failed to update refresh attempt counter");
            inner.teardown_if_current(epoch, TeardownReason::RefreshFailed);
            return None;
        }
        None => {
            debug!("Session changed before refresh started");
            return None;
        }
    };

    info!(attempt = attempt, "Refreshing access token");
    let pair = match inner.request_refresh(&refresh_token).await {
        Ok(pair) => pair,
        Err(e) => {
            warn!(error = %e, attempt = attempt, "Token refresh failed");
            inner.teardown_if_current(epoch, TeardownReason::RefreshFailed);
            return None;
        }
    };

    let stored = inner.write_if_current(epoch, |vault| {
        vault.store_tokens(&pair.access_token, pair.refresh_token.as_deref())
    });
    match stored {
        Some(Ok(())) => {
            info!(rotated = pair.refresh_token.is_some(), "Access token refreshed");
            Some(pair.access_token)
        }
        Some(Err(e)) => {
            error!(error = %e, "Failed to persist refreshed tokens");
            inner.teardown_if_current(epoch, TeardownReason::RefreshFailed);
            None
        }
        None => {
            info!("Session changed during refresh, discarding new tokens");
            None
        }
    }
}
