//! Background session validation.
//!
//! A client-side expiry check cannot see the server dropping a session, for
//! example when the same account signs in on another phone. The validator
//! probes the backend's "who am I" endpoint on three triggers:
//! - a fixed interval
//! - shortly after every route change
//! - whenever the app comes back to the foreground
//!
//! A 401 whose message says the session was replaced or expired tears the
//! session down. Every other probe failure is ignored until the next trigger.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::events::{AppState, LifecycleEvent, TeardownReason};
use super::manager::SessionManager;
use super::protocol::{classify_unauthorized, UnauthorizedKind};
use crate::api::{ApiClient, ApiError};
use crate::error::SessionError;

/// Why a validation call did not reach the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AuthRoute,
    NoToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationOutcome {
    Skipped(SkipReason),
    /// The server accepted the session.
    Valid,
    /// The session was torn down.
    Invalidated(TeardownReason),
    /// A 401 without a session-level message; left to the request path.
    Unauthorized,
    /// Network error, timeout or unexpected status. Ignored.
    ProbeFailed,
}

#[derive(Debug, Clone, Copy)]
enum Trigger {
    Interval,
    Navigation,
    Foreground,
}

/// Probes the backend for server-side session invalidation.
/// Clone is cheap; clones share the current route.
#[derive(Clone)]
pub struct SessionValidator {
    api: ApiClient,
    current_route: Arc<Mutex<Option<String>>>,
}

impl SessionValidator {
    pub fn new(api: ApiClient) -> Self {
        Self {
            api,
            current_route: Arc::new(Mutex::new(None)),
        }
    }

    fn session(&self) -> &SessionManager {
        self.api.session()
    }

    fn route(&self) -> MutexGuard<'_, Option<String>> {
        self.current_route.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn current_route(&self) -> Option<String> {
        self.route().clone()
    }

    pub fn set_route(&self, route: impl Into<String>) {
        *self.route() = Some(route.into());
    }

    /// Run one validation call.
    pub async fn validate(&self) -> ValidationOutcome {
        if let Some(route) = self.current_route() {
            if self.session().config().is_auth_route(&route) {
                return ValidationOutcome::Skipped(SkipReason::AuthRoute);
            }
        }
        if !self.session().is_authenticated() {
            return ValidationOutcome::Skipped(SkipReason::NoToken);
        }

        match self.api.probe_session().await {
            Ok(_) => ValidationOutcome::Valid,
            Err(ApiError::NotAuthenticated) => ValidationOutcome::Skipped(SkipReason::NoToken),
            Err(ApiError::Unauthorized(body)) => {
                let kind = classify_unauthorized(&body);
                let error = SessionError::from(kind);
                match kind {
                    UnauthorizedKind::ConcurrentSession => {
                        self.invalidate(TeardownReason::ConcurrentSession, &error)
                    }
                    UnauthorizedKind::SessionExpired => {
                        self.invalidate(TeardownReason::SessionExpired, &error)
                    }
                    UnauthorizedKind::Other => {
                        debug!(error = %error, "Session probe got a plain 401, leaving it to the request path");
                        ValidationOutcome::Unauthorized
                    }
                }
            }
            Err(e) => {
                debug!(error = %e, "Session probe failed, ignoring");
                ValidationOutcome::ProbeFailed
            }
        }
    }

    fn invalidate(&self, reason: TeardownReason, error: &SessionError) -> ValidationOutcome {
        warn!(error = %error, reason = ?reason, route = ?self.current_route(), "Session invalidated by server");
        self.session().teardown(reason);
        ValidationOutcome::Invalidated(reason)
    }

    /// Start the validation loop on the current tokio runtime.
    pub fn spawn(self, events: mpsc::Receiver<LifecycleEvent>) -> ValidatorHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(self.run(events, shutdown_rx));
        ValidatorHandle {
            shutdown: Some(shutdown_tx),
            task,
        }
    }

    /// Drive the three triggers until `events` closes or `shutdown` fires.
    /// Validation calls in flight when the loop stops are awaited.
    pub async fn run(
        self,
        mut events: mpsc::Receiver<LifecycleEvent>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        let config = self.session().config().clone();
        let period = config.validation_interval();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut app_state = AppState::Active;
        let mut checks = JoinSet::new();
        info!(interval_ms = config.validation_interval_ms, "Session validator started");

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    self.schedule(&mut checks, Trigger::Interval, Duration::ZERO);
                }
                event = events.recv() => match event {
                    None => break,
                    Some(LifecycleEvent::RouteChanged(route)) => {
                        self.set_route(route);
                        self.schedule(&mut checks, Trigger::Navigation, config.navigation_debounce());
                    }
                    Some(LifecycleEvent::AppStateChanged(next)) => {
                        let previous = std::mem::replace(&mut app_state, next);
                        if next == AppState::Active && previous != AppState::Active {
                            self.schedule(&mut checks, Trigger::Foreground, Duration::ZERO);
                        }
                    }
                },
                // Reap finished checks so the set does not grow unbounded
                Some(_) = checks.join_next(), if !checks.is_empty() => {}
            }
        }

        while checks.join_next().await.is_some() {}
        info!("Session validator stopped");
    }

    fn schedule(&self, checks: &mut JoinSet<()>, trigger: Trigger, delay: Duration) {
        let validator = self.clone();
        checks.spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let outcome = validator.validate().await;
            debug!(trigger = ?trigger, outcome = ?outcome, "Session validation finished");
        });
    }
}

/// Handle to a spawned validation loop.
pub struct ValidatorHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl ValidatorHandle {
    /// Stop the loop and wait for in-flight validations to finish.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.task).await {
            warn!(error = %e, "Session validator task failed");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::api::VALIDATION_HEADER;
    use crate::config::SessionConfig;
    use crate::session::SessionEvent;
    use crate::store::vault::{ACCESS_TOKEN, REFRESH_TOKEN, SESSION_NOTICE};
    use crate::store::{CredentialStore, MemoryStore};
    use crate::test_support::{jwt_expiring_in, json_response, seed_tokens, ScriptedTransport};

    fn validator(store: &Arc<MemoryStore>, transport: &Arc<ScriptedTransport>) -> SessionValidator {
        let session = SessionManager::new(store.clone(), transport.clone(), SessionConfig::default());
        SessionValidator::new(ApiClient::new(session))
    }

    fn signed_in_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        seed_tokens(&store, &jwt_expiring_in(3600), Some("R1"));
        store
    }

    #[tokio::test]
    async fn test_concurrent_login_tears_down() {
        let store = signed_in_store();
        let transport = ScriptedTransport::new(|_| {
            Ok(json_response(401, json!({"message": "You have been logged in elsewhere"})))
        });
        let validator = validator(&store, &transport);
        validator.set_route("Home");
        let mut events = validator.session().subscribe();

        assert_eq!(
            validator.validate().await,
            ValidationOutcome::Invalidated(TeardownReason::ConcurrentSession)
        );
        assert_eq!(store.get(ACCESS_TOKEN).unwrap(), None);
        assert_eq!(store.get(REFRESH_TOKEN).unwrap(), None);
        assert_eq!(
            store.get(SESSION_NOTICE).unwrap().as_deref(),
            TeardownReason::ConcurrentSession.notice()
        );
        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::ReauthRequired {
                reason: TeardownReason::ConcurrentSession,
                notice: TeardownReason::ConcurrentSession.notice().map(String::from),
            }
        );
    }

    #[tokio::test]
    async fn test_session_expired_tears_down() {
        let store = signed_in_store();
        let transport = ScriptedTransport::new(|_| {
            Ok(json_response(401, json!({"message": "Session expired, please log in again"})))
        });
        let validator = validator(&store, &transport);

        assert_eq!(
            validator.validate().await,
            ValidationOutcome::Invalidated(TeardownReason::SessionExpired)
        );
        assert_eq!(store.get(ACCESS_TOKEN).unwrap(), None);
    }

    #[tokio::test]
    async fn test_plain_401_is_not_fatal() {
        let store = signed_in_store();
        let transport =
            ScriptedTransport::new(|_| Ok(json_response(401, json!({"message": "Invalid credentials"}))));
        let validator = validator(&store, &transport);
        let mut events = validator.session().subscribe();

        assert_eq!(validator.validate().await, ValidationOutcome::Unauthorized);
        assert!(store.get(ACCESS_TOKEN).unwrap().is_some());
        assert_eq!(store.get(SESSION_NOTICE).unwrap(), None);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_probe_errors_ignored() {
        let store = signed_in_store();
        let transport = ScriptedTransport::sequence(vec![
            Err(ApiError::NetworkError("offline".into())),
            Ok(json_response(502, json!({"message": "Session expired"}))),
        ]);
        let validator = validator(&store, &transport);

        assert_eq!(validator.validate().await, ValidationOutcome::ProbeFailed);
        assert_eq!(validator.validate().await, ValidationOutcome::ProbeFailed);
        assert!(store.get(ACCESS_TOKEN).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_success_changes_nothing() {
        let store = signed_in_store();
        let transport = ScriptedTransport::new(|_| Ok(json_response(200, json!({"id": "42"}))));
        let validator = validator(&store, &transport);

        assert_eq!(validator.validate().await, ValidationOutcome::Valid);
        assert!(store.get(ACCESS_TOKEN).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_skips_auth_routes_and_missing_token() {
        let store = signed_in_store();
        let transport = ScriptedTransport::new(|_| Ok(json_response(200, json!({}))));
        let validator = validator(&store, &transport);

        validator.set_route("Login");
        assert_eq!(validator.validate().await, ValidationOutcome::Skipped(SkipReason::AuthRoute));

        validator.set_route("Home");
        store.remove(ACCESS_TOKEN).unwrap();
        assert_eq!(validator.validate().await, ValidationOutcome::Skipped(SkipReason::NoToken));
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_triggers_send_nothing() {
        let store = Arc::new(MemoryStore::new());
        let transport = ScriptedTransport::new(|_| Ok(json_response(200, json!({}))));
        let validator = validator(&store, &transport);
        let interval = validator.session().config().validation_interval();

        let (tx, rx) = mpsc::channel(8);
        let handle = validator.spawn(rx);

        tx.send(LifecycleEvent::RouteChanged("Home".into())).await.unwrap();
        tx.send(LifecycleEvent::AppStateChanged(AppState::Background)).await.unwrap();
        tx.send(LifecycleEvent::AppStateChanged(AppState::Active)).await.unwrap();
        tokio::time::sleep(interval * 2 + Duration::from_secs(1)).await;

        drop(tx);
        handle.shutdown().await;
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_trigger_probes() {
        let store = signed_in_store();
        let transport = ScriptedTransport::new(|_| Ok(json_response(200, json!({"id": "42"}))));
        let validator = validator(&store, &transport);
        let config = validator.session().config().clone();

        let (tx, rx) = mpsc::channel(8);
        let handle = validator.spawn(rx);

        // Foreground: background -> active fires immediately
        tx.send(LifecycleEvent::AppStateChanged(AppState::Background)).await.unwrap();
        tx.send(LifecycleEvent::AppStateChanged(AppState::Active)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(transport.calls(), 1);

        // Active -> active is not a transition
        tx.send(LifecycleEvent::AppStateChanged(AppState::Active)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(transport.calls(), 1);

        // Navigation waits for the debounce
        tx.send(LifecycleEvent::RouteChanged("Listings".into())).await.unwrap();
        tokio::time::sleep(config.navigation_debounce() / 2).await;
        assert_eq!(transport.calls(), 1);
        tokio::time::sleep(config.navigation_debounce()).await;
        assert_eq!(transport.calls(), 2);

        // Interval
        tokio::time::sleep(config.validation_interval()).await;
        assert_eq!(transport.calls(), 3);

        handle.shutdown().await;
        for request in transport.requests() {
            assert!(request.url.ends_with("/auth/me"));
            assert_eq!(request.header_value(VALIDATION_HEADER), Some("true"));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_navigation_to_auth_route_skips() {
        let store = signed_in_store();
        let transport = ScriptedTransport::new(|_| Ok(json_response(200, json!({}))));
        let validator = validator(&store, &transport);
        let debounce = validator.session().config().navigation_debounce();

        let (tx, rx) = mpsc::channel(8);
        let handle = validator.clone().spawn(rx);

        tx.send(LifecycleEvent::RouteChanged("ForgotPassword".into())).await.unwrap();
        tokio::time::sleep(debounce * 2).await;

        assert_eq!(validator.current_route().as_deref(), Some("ForgotPassword"));
        assert_eq!(transport.calls(), 0);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_keeps_running() {
        let store = signed_in_store();
        let transport = ScriptedTransport::new(|_| Ok(json_response(200, json!({}))));
        let config = SessionConfig {
            validation_interval_ms: 0,
            ..SessionConfig::default()
        };
        let session = SessionManager::new(store.clone(), transport.clone(), config);
        let validator = SessionValidator::new(ApiClient::new(session));
        let interval = validator.session().config().validation_interval();
        assert!(!interval.is_zero());

        let (tx, rx) = mpsc::channel(1);
        let handle = validator.spawn(rx);
        tokio::time::sleep(interval * 2 + Duration::from_millis(10)).await;

        assert!(!handle.is_finished());
        assert_eq!(transport.calls(), 2);
        drop(tx);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_stops_when_events_close() {
        let store = signed_in_store();
        let transport = ScriptedTransport::new(|_| Ok(json_response(200, json!({}))));
        let validator = validator(&store, &transport);

        let (tx, rx) = mpsc::channel(1);
        let handle = validator.spawn(rx);
        drop(tx);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(handle.is_finished());
    }
}
