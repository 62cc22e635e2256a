//! Authenticated API client for the Souk backend.
//!
//! `ApiClient` is the standard request pathway: it asks the session manager
//! for a token, attaches it, retries on rate limiting, and tears the session
//! down when an authenticated request is rejected with a 401.

use std::time::Duration;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use super::{ApiError, HttpRequest, HttpResponse};
use crate::session::{SessionManager, TeardownReason};

/// Header marking a request as a session validation probe.
pub const VALIDATION_HEADER: &str = "X-Session-Validation";

/// Maximum number of retries for rate-limited (429) requests.
/// 3 retries with exponential backoff usually succeeds without excessive delay.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// Clone is cheap - the session manager and transport are shared.
#[derive(Clone)]
pub struct ApiClient {
    session: SessionManager,
}

impl ApiClient {
    pub fn new(session: SessionManager) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    pub fn url(&self, path: &str) -> String {
        self.session.config().url(path)
    }

    /// Send `request` with the current access token attached.
    ///
    /// With no usable token the request goes out unauthenticated. A 401 on a
    /// request that did carry a token tears the session down, except for
    /// validation probes, which interpret their own 401s.
    pub async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, ApiError> {
        let request = match self.session.get_valid_access_token().await {
            Some(token) => request.bearer(token),
            None => request,
        };
        self.dispatch(request).await
    }

    async fn dispatch(&self, request: HttpRequest) -> Result<HttpResponse, ApiError> {
        let authenticated = request.bearer.is_some();
        let is_probe = request.header_value(VALIDATION_HEADER).is_some();

        let response = self.session.transport().send(request).await?;
        match response.error_for_status() {
            Ok(response) => Ok(response),
            Err(err) => {
                if err.is_unauthorized() && authenticated && !is_probe {
                    self.session.teardown(TeardownReason::Unauthorized);
                }
                Err(err)
            }
        }
    }

    /// `execute` with exponential backoff on 429.
    async fn execute_with_retry(&self, request: HttpRequest) -> Result<HttpResponse, ApiError> {
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            match self.execute(request.clone()).await {
                Err(ApiError::RateLimited) => {
                    retries += 1;
                    if retries > MAX_RATE_LIMIT_RETRIES {
                        return Err(ApiError::RateLimited);
                    }
                    warn!(url = %request.url, retry = retries, backoff_ms = backoff_ms, "Rate limited, backing off");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms *= 2; // Exponential backoff
                }
                other => return other,
            }
        }
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let response = self.execute_with_retry(HttpRequest::get(self.url(path))).await?;
        response.json()
    }

    pub async fn post_json<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let body = serde_json::to_value(body)
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to encode request body: {}", e)))?;
        let response = self
            .execute_with_retry(HttpRequest::post(self.url(path)).json(body))
            .await?;
        response.json()
    }

    /// GET through the session's response cache.
    pub async fn get_json_cached<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let url = self.url(path);
        let cache = self.session.cache();

        let value = match cache.get(&url) {
            Some(value) => {
                debug!(url = %url, "Response cache hit");
                value
            }
            None => {
                let value: serde_json::Value = self
                    .execute_with_retry(HttpRequest::get(url.as_str()))
                    .await?
                    .json()?;
                cache.insert(url, value.clone());
                value
            }
        };
        serde_json::from_value(value)
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to decode cached response: {}", e)))
    }

    /// Lightweight "who am I" call used to detect server-side invalidation.
    ///
    /// Never sent without a token: if none can be resolved this returns
    /// `NotAuthenticated` without touching the network.
    pub async fn probe_session(&self) -> Result<HttpResponse, ApiError> {
        let config = self.session.config();
        let timeout = config.probe_timeout();

        let Some(token) = self.session.get_valid_access_token().await else {
            return Err(ApiError::NotAuthenticated);
        };
        let request = HttpRequest::get(config.probe_url())
            .query("_t", Utc::now().timestamp_millis().to_string())
            .header(VALIDATION_HEADER, "true")
            .bearer(token)
            .timeout(timeout);

        tokio::time::timeout(timeout, self.dispatch(request))
            .await
            .map_err(|_| ApiError::Timeout(timeout))?
    }
}
