//! Configuration for the session core.
//!
//! The embedding client supplies the auth service base URL plus the device
//! labels sent with every login/register payload. Timeouts and the watcher
//! poll interval default to the values below and can be overridden.

use std::time::Duration;

// ============================================================================
// Constants
// ============================================================================

/// Timeout for auth service calls in seconds.
/// 15s fails fast enough for login UX while tolerating slow mobile links.
const AUTH_TIMEOUT_SECS: u64 = 15;

/// Session watcher poll interval in seconds.
/// Bounds the detection latency for "logged out elsewhere" to ~10s.
const WATCHER_INTERVAL_SECS: u64 = 10;

#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Base URL of the auth service, e.g. `https://api.daybook.app`
    pub base_url: String,
    /// Platform label sent with login/register payloads (e.g. "android", "ios")
    pub platform: String,
    /// Human-readable device name label
    pub device_name: String,
    /// App version string reported to the server
    pub app_version: String,
    /// Timeout applied to every auth service call
    pub auth_timeout: Duration,
    /// Session watcher poll interval
    pub watcher_interval: Duration,
}

impl AuthConfig {
    pub fn new(
        base_url: impl Into<String>,
        platform: impl Into<String>,
        device_name: impl Into<String>,
        app_version: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            platform: platform.into(),
            device_name: device_name.into(),
            app_version: app_version.into(),
            auth_timeout: Duration::from_secs(AUTH_TIMEOUT_SECS),
            watcher_interval: Duration::from_secs(WATCHER_INTERVAL_SECS),
        }
    }

    pub fn with_auth_timeout(mut self, timeout: Duration) -> Self {
        self.auth_timeout = timeout;
        self
    }

    pub fn with_watcher_interval(mut self, interval: Duration) -> Self {
        self.watcher_interval = interval;
        self
    }
}
