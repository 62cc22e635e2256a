//! Shared fixtures for unit tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use serde_json::json;

use crate::api::{ApiError, HttpRequest, HttpResponse, HttpTransport};
use crate::store::vault::{ACCESS_TOKEN, REFRESH_TOKEN};
use crate::store::{CredentialStore, MemoryStore};

/// Unsigned JWT carrying `payload` verbatim.
pub fn jwt_with_payload(payload: &str) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(payload.as_bytes());
    format!("{}.{}.signature", header, payload)
}

pub fn jwt_expiring_at(exp: i64) -> String {
    jwt_with_payload(&json!({ "sub": "42", "exp": exp }).to_string())
}

/// JWT whose `exp` is `secs` from now (negative for the past).
pub fn jwt_expiring_in(secs: i64) -> String {
    jwt_expiring_at(Utc::now().timestamp() + secs)
}

/// Overwrite the token keys without touching the attempt counter.
pub fn seed_tokens(store: &MemoryStore, access: &str, refresh: Option<&str>) {
    store.set(ACCESS_TOKEN, access).unwrap();
    match refresh {
        Some(refresh) => store.set(REFRESH_TOKEN, refresh).unwrap(),
        None => store.remove(REFRESH_TOKEN).unwrap(),
    }
}

pub fn json_response(status: u16, body: serde_json::Value) -> HttpResponse {
    HttpResponse::new(status, body.to_string())
}

pub fn refresh_ok(access: &str, refresh: Option<&str>) -> HttpResponse {
    let mut data = json!({ "accessToken": access });
    if let Some(refresh) = refresh {
        data["refreshToken"] = json!(refresh);
    }
    json_response(200, json!({ "success": true, "data": data }))
}

type Responder = Box<dyn Fn(&HttpRequest) -> Result<HttpResponse, ApiError> + Send + Sync>;

/// Transport that records every request and answers from a closure.
pub struct ScriptedTransport {
    responder: Responder,
    delay: Duration,
    requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    pub fn new<F>(responder: F) -> Arc<Self>
    where
        F: Fn(&HttpRequest) -> Result<HttpResponse, ApiError> + Send + Sync + 'static,
    {
        Arc::new(Self {
            responder: Box::new(responder),
            delay: Duration::ZERO,
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Answer with `responses` in order; requests past the end get a 500.
    pub fn sequence(responses: Vec<Result<HttpResponse, ApiError>>) -> Arc<Self> {
        let queue = Mutex::new(VecDeque::from(responses));
        Self::new(move |_| {
            queue
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(HttpResponse::new(500, "script exhausted")))
        })
    }

    /// Delay every response. Only valid right after construction.
    pub fn with_delay(self: Arc<Self>, delay: Duration) -> Arc<Self> {
        let mut this = Arc::try_unwrap(self).unwrap_or_else(|_| panic!("transport already shared"));
        this.delay = delay;
        Arc::new(this)
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn calls_to(&self, path: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.url.ends_with(path))
            .count()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, ApiError> {
        self.requests.lock().unwrap().push(request.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.responder)(&request)
    }
}
