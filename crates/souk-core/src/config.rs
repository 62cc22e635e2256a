//! Session configuration management.
//!
//! Every timing constant and endpoint used by the session core lives here so
//! the host app can override it. Configuration is stored at
//! `~/.config/souk/config.json` and any field may be overridden through a
//! `SOUK_*` environment variable.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Application name used for config/data directory paths
const APP_NAME: &str = "souk";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Default backend root.
const DEFAULT_API_BASE_URL: &str = "https://api.souk.app/api";

/// How often the validator probes the backend while signed in.
/// 30s catches a login on another device quickly without noticeable traffic.
const DEFAULT_VALIDATION_INTERVAL_MS: u64 = 30_000;

/// Hard ceiling on the refresh call.
const DEFAULT_REFRESH_TIMEOUT_MS: u64 = 10_000;

/// Hard ceiling on the validation probe.
const DEFAULT_PROBE_TIMEOUT_MS: u64 = 8_000;

/// Tokens this close to `exp` are treated as already expired.
const DEFAULT_EXPIRY_BUFFER_SECS: i64 = 30;

/// Consecutive refresh failures tolerated before the session is dropped.
const DEFAULT_MAX_REFRESH_ATTEMPTS: u32 = 3;

/// Floor for the validation interval. Zero would spin the probe loop.
const MIN_VALIDATION_INTERVAL_MS: u64 = 1_000;

/// Ceiling for the expiry buffer. A buffer longer than any token lifetime
/// would refresh on every call.
const MAX_EXPIRY_BUFFER_SECS: i64 = 86_400;

/// Delay between a route change and its validation probe, so the probe
/// does not fire mid-transition.
const DEFAULT_NAVIGATION_DEBOUNCE_MS: u64 = 500;

/// Screens that belong to the sign-in flow. No probe runs while one is active.
const DEFAULT_AUTH_ROUTES: &[&str] = &[
    "Login",
    "Register",
    "ForgotPassword",
    "ResetPassword",
    "VerifyOtp",
    "Welcome",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub api_base_url: String,
    pub refresh_path: String,
    pub probe_path: String,
    pub validation_interval_ms: u64,
    pub refresh_timeout_ms: u64,
    pub probe_timeout_ms: u64,
    pub expiry_buffer_secs: i64,
    pub max_refresh_attempts: u32,
    pub navigation_debounce_ms: u64,
    pub auth_routes: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            refresh_path: "/auth/refresh-token".to_string(),
            probe_path: "/auth/me".to_string(),
            validation_interval_ms: DEFAULT_VALIDATION_INTERVAL_MS,
            refresh_timeout_ms: DEFAULT_REFRESH_TIMEOUT_MS,
            probe_timeout_ms: DEFAULT_PROBE_TIMEOUT_MS,
            expiry_buffer_secs: DEFAULT_EXPIRY_BUFFER_SECS,
            max_refresh_attempts: DEFAULT_MAX_REFRESH_ATTEMPTS,
            navigation_debounce_ms: DEFAULT_NAVIGATION_DEBOUNCE_MS,
            auth_routes: DEFAULT_AUTH_ROUTES.iter().map(|r| r.to_string()).collect(),
        }
    }
}

impl SessionConfig {
    /// Load from the default config path, falling back to defaults if absent.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            let config: Self = serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
            Ok(config.normalized())
        } else {
            Ok(Self::default())
        }
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Directory for locally persisted credentials (used by `FileStore`).
    pub fn data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME))
    }

    /// Apply `SOUK_*` environment overrides.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup. Unparsable values are
    /// logged and skipped.
    pub fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("SOUK_API_BASE_URL") {
            self.api_base_url = url;
        }
        if let Some(path) = lookup("SOUK_REFRESH_PATH") {
            self.refresh_path = path;
        }
        if let Some(path) = lookup("SOUK_PROBE_PATH") {
            self.probe_path = path;
        }
        override_parsed(&lookup, "SOUK_VALIDATION_INTERVAL_MS", &mut self.validation_interval_ms);
        override_parsed(&lookup, "SOUK_REFRESH_TIMEOUT_MS", &mut self.refresh_timeout_ms);
        override_parsed(&lookup, "SOUK_PROBE_TIMEOUT_MS", &mut self.probe_timeout_ms);
        override_parsed(&lookup, "SOUK_EXPIRY_BUFFER_SECS", &mut self.expiry_buffer_secs);
        override_parsed(&lookup, "SOUK_MAX_REFRESH_ATTEMPTS", &mut self.max_refresh_attempts);
        override_parsed(&lookup, "SOUK_NAVIGATION_DEBOUNCE_MS", &mut self.navigation_debounce_ms);
        if let Some(routes) = lookup("SOUK_AUTH_ROUTES") {
            self.auth_routes = routes
                .split(',')
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(String::from)
                .collect();
        }
        self.normalized()
    }

    /// Clamp values that would break the timers into their usable range.
    pub fn normalized(mut self) -> Self {
        if self.validation_interval_ms < MIN_VALIDATION_INTERVAL_MS {
            warn!(
                value = self.validation_interval_ms,
                min = MIN_VALIDATION_INTERVAL_MS,
                "validation_interval_ms too small, clamping"
            );
            self.validation_interval_ms = MIN_VALIDATION_INTERVAL_MS;
        }
        let buffer = self.expiry_buffer_secs.clamp(0, MAX_EXPIRY_BUFFER_SECS);
        if buffer != self.expiry_buffer_secs {
            warn!(value = self.expiry_buffer_secs, clamped = buffer, "expiry_buffer_secs out of range");
            self.expiry_buffer_secs = buffer;
        }
        self
    }

    pub fn refresh_url(&self) -> String {
        self.url(&self.refresh_path)
    }

    pub fn probe_url(&self) -> String {
        self.url(&self.probe_path)
    }

    /// Join a path onto the API base URL.
    pub fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.api_base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    pub fn validation_interval(&self) -> Duration {
        Duration::from_millis(self.validation_interval_ms.max(MIN_VALIDATION_INTERVAL_MS))
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_millis(self.refresh_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn navigation_debounce(&self) -> Duration {
        Duration::from_millis(self.navigation_debounce_ms)
    }

    pub fn expiry_buffer(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.expiry_buffer_secs.clamp(0, MAX_EXPIRY_BUFFER_SECS))
    }

    pub fn is_auth_route(&self, route: &str) -> bool {
        self.auth_routes.iter().any(|r| r == route)
    }
}

fn override_parsed<F, T>(lookup: &F, key: &str, target: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    if let Some(raw) = lookup(key) {
        match raw.trim().parse() {
            Ok(value) => *target = value,
            Err(_) => warn!(key = key, value = %raw, "Ignoring unparsable config override"),
        }
    }
}
