//! Token endpoint client and authenticated call wrapper.
//!
//! `AuthClient` owns the four auth operations (login, register, refresh,
//! logout) against the remote token service, plus the one-shot
//! refresh-and-retry wrapper every protected call goes through. Refresh
//! is single-flight: concurrent 401s coalesce into one wire call so the
//! single-use refresh token is never sent twice.

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::AuthConfig;
use crate::device::DeviceIdentity;
use crate::error::AuthError;
use crate::session::{CredentialStore, ReasonCode, Session, UserProfile};

// ============================================================================
// Wire types
// ============================================================================

/// How the user proves their identity on login.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    Password,
    Pin,
}

impl AuthMethod {
    /// Payload field name carrying the secret
    fn field(&self) -> &'static str {
        match self {
            AuthMethod::Password => "password",
            AuthMethod::Pin => "pin",
        }
    }
}

/// Raw payload returned by the token service for login/register/refresh.
///
/// Failure payloads carry `success: false` plus `message` (credential
/// errors) or `reason` (refresh rejections); every other field is absent.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
    /// Legacy field: older servers return the access token here
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub access_token_expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub refresh_token_expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub device_uuid: Option<String>,
    #[serde(default)]
    pub user: Option<UserProfile>,
}

impl AuthResponse {
    /// The usable access token, preferring the current `access_token`
    /// field and falling back to the legacy `token` field. Empty strings
    /// count as absent.
    pub fn bearer_token(&self) -> Option<&str> {
        self.access_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .or_else(|| self.token.as_deref().filter(|t| !t.is_empty()))
    }
}

// ============================================================================
// Client
// ============================================================================

/// Client for the remote token service.
/// Clone is cheap - reqwest::Client uses Arc internally for connection
/// pooling, and the store and refresh guard are shared handles.
#[derive(Clone)]
pub struct AuthClient {
    http: Client,
    config: Arc<AuthConfig>,
    store: CredentialStore,
    device: DeviceIdentity,
    /// Serializes refresh attempts per session (single-flight)
    refresh_guard: Arc<tokio::sync::Mutex<()>>,
}

impl AuthClient {
    pub fn new(config: AuthConfig, store: CredentialStore, device: DeviceIdentity) -> Result<Self> {
        let http = Client::builder().timeout(config.auth_timeout).build()?;
        Ok(Self {
            http,
            config: Arc::new(config),
            store,
            device,
            refresh_guard: Arc::new(tokio::sync::Mutex::new(())),
        })
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// Common device fields carried by every login/register payload
    fn device_payload(&self, device_id: &str) -> serde_json::Value {
        json!({
            "device_uuid": device_id,
            "platform": self.config.platform,
            "device_name": self.config.device_name,
            "app_version": self.config.app_version,
        })
    }

    /// Parse an auth payload regardless of HTTP status: the token service
    /// reports credential failures in-band via `success: false`, so a
    /// parseable body wins over the status code.
    async fn parse_payload(response: reqwest::Response) -> Result<AuthResponse> {
        let status = response.status();
        let text = response
            .text()
            .await
            .context("Failed to read auth response body")?;
        match serde_json::from_str::<AuthResponse>(&text) {
            Ok(payload) => Ok(payload),
            Err(_) if !status.is_success() => Err(AuthError::from_status(status, &text).into()),
            Err(e) => {
                Err(AuthError::InvalidResponse(format!("malformed auth payload: {e}")).into())
            }
        }
    }

    /// Check if a protected-endpoint response is successful, returning an
    /// error with body if not.
    async fn check_response(response: reqwest::Response) -> Result<reqwest::Response> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(AuthError::from_status(status, &body).into())
        }
    }

    /// Store the session carried by a successful login/register payload.
    /// Failure payloads and token-less payloads leave the store untouched.
    fn adopt_session(&self, payload: &AuthResponse, sent_device_id: &str) {
        if !payload.success {
            return;
        }
        let Some(access_token) = payload.bearer_token() else {
            return;
        };

        // The server may reassign the device id; the assigned value is
        // what future refreshes must present, so persist it too.
        let device_id = payload
            .device_uuid
            .clone()
            .unwrap_or_else(|| sent_device_id.to_string());
        if device_id != sent_device_id {
            if let Err(e) = self.device.adopt(&device_id) {
                warn!(error = %e, "failed to persist server-assigned device id");
            }
        }

        self.store.save(Session {
            access_token: access_token.to_string(),
            refresh_token: payload
                .refresh_token
                .clone()
                .filter(|t| !t.is_empty()),
            device_id,
            user: payload.user.clone(),
            access_token_expires_at: payload.access_token_expires_at,
            refresh_token_expires_at: payload.refresh_token_expires_at,
        });
        info!("session established");
    }

    // ===== Auth operations =====

    /// Authenticate with email plus a password or PIN. On success the
    /// session is stored; either way the raw server payload is returned
    /// for the caller to inspect (`success`, `message`).
    pub async fn login(
        &self,
        email: &str,
        method: AuthMethod,
        secret: &str,
    ) -> Result<AuthResponse> {
        let device_id = self.device.get_or_create()?;

        let mut body = self.device_payload(&device_id);
        body["email"] = json!(email);
        body[method.field()] = json!(secret);

        debug!(email = %email, method = ?method, "sending login request");
        let response = self
            .http
            .post(self.url("/auth/login"))
            .json(&body)
            .send()
            .await
            .context("Failed to send login request")?;

        let payload = Self::parse_payload(response).await?;
        self.adopt_session(&payload, &device_id);
        Ok(payload)
    }

    /// Register a new account. Same device payload and same
    /// save-on-success contract as `login`.
    pub async fn register(
        &self,
        name: &str,
        email: &str,
        password: &str,
        password_confirmation: &str,
        company_code: &str,
    ) -> Result<AuthResponse> {
        let device_id = self.device.get_or_create()?;

        let mut body = self.device_payload(&device_id);
        body["name"] = json!(name);
        body["email"] = json!(email);
        body["password"] = json!(password);
        body["password_confirmation"] = json!(password_confirmation);
        body["company_code"] = json!(company_code);

        debug!(email = %email, "sending register request");
        let response = self
            .http
            .post(self.url("/auth/register"))
            .json(&body)
            .send()
            .await
            .context("Failed to send register request")?;

        let payload = Self::parse_payload(response).await?;
        self.adopt_session(&payload, &device_id);
        Ok(payload)
    }

    /// Request a password reset email. No session mutation either way.
    pub async fn forgot_password(&self, email: &str) -> Result<AuthResponse> {
        let response = self
            .http
            .post(self.url("/auth/forgot-password"))
            .json(&json!({ "email": email }))
            .send()
            .await
            .context("Failed to send forgot-password request")?;

        Self::parse_payload(response).await
    }

    /// Exchange the current refresh token for a new token pair.
    ///
    /// Returns true only when the pair was rotated (or a concurrent
    /// attempt already rotated it). On any failure the session is left
    /// unchanged and the failure reason is recorded in the store for
    /// `consume_failure_reason`.
    pub async fn refresh(&self) -> bool {
        self.refresh_inner(None).await
    }

    /// Refresh triggered by a rejected access token. If a peer already
    /// repaired the session while we waited for the guard, report success
    /// without spending the new refresh token.
    async fn refresh_after_rejection(&self, rejected_access: &str) -> bool {
        self.refresh_inner(Some(rejected_access)).await
    }

    async fn refresh_inner(&self, rejected_access: Option<&str>) -> bool {
        // Capture the pair we intend to replace before queueing: a peer
        // holding the guard may rotate it while we wait.
        let Some(observed) = self.store.refresh_token() else {
            warn!("refresh requested but no refresh token is stored");
            self.store.set_failure_reason(ReasonCode::NoRefreshToken);
            return false;
        };

        let _guard = self.refresh_guard.lock().await;

        let Some(session) = self.store.get() else {
            // Logged out while waiting for the guard
            self.store.set_failure_reason(ReasonCode::NoRefreshToken);
            return false;
        };
        let already_repaired = match rejected_access {
            Some(rejected) => session.access_token != rejected,
            None => session.refresh_token.as_deref() != Some(observed.as_str()),
        };
        if already_repaired {
            debug!("refresh coalesced with a concurrent attempt");
            return true;
        }
        let Some(current) = session.refresh_token.clone() else {
            self.store.set_failure_reason(ReasonCode::NoRefreshToken);
            return false;
        };

        match self.exchange_refresh_token(&current, &session.device_id).await {
            Ok(rotated) => rotated,
            Err(e) => {
                warn!(error = %e, "refresh failed");
                self.store
                    .set_failure_reason(ReasonCode::SessionInvalidated);
                false
            }
        }
    }

    async fn exchange_refresh_token(&self, refresh_token: &str, device_id: &str) -> Result<bool> {
        let body = json!({
            "refresh_token": refresh_token,
            "device_uuid": device_id,
        });

        let response = self
            .http
            .post(self.url("/auth/refresh"))
            .json(&body)
            .send()
            .await
            .context("Failed to send refresh request")?;

        let payload = Self::parse_payload(response).await?;

        if !payload.success {
            let reason = payload
                .reason
                .as_deref()
                .map(ReasonCode::parse)
                .unwrap_or(ReasonCode::SessionInvalidated);
            warn!(reason = %reason, "server rejected refresh token");
            self.store.set_failure_reason(reason);
            return Ok(false);
        }

        let Some(access_token) = payload.bearer_token() else {
            self.store
                .set_failure_reason(ReasonCode::SessionInvalidated);
            return Ok(false);
        };

        let new_device_id = payload
            .device_uuid
            .clone()
            .unwrap_or_else(|| device_id.to_string());
        let swapped = self.store.swap_tokens(
            access_token.to_string(),
            payload.refresh_token.clone().filter(|t| !t.is_empty()),
            new_device_id,
            payload.access_token_expires_at,
            payload.refresh_token_expires_at,
        );
        if !swapped {
            debug!("refresh completed after logout, discarding new tokens");
            return Ok(false);
        }

        info!("access token refreshed");
        Ok(true)
    }

    /// End the session. The server-side revoke call is best-effort; the
    /// local session is always cleared and this never signals failure.
    pub async fn logout(&self) {
        if let Some(token) = self.store.access_token() {
            match self
                .http
                .post(self.url("/auth/logout"))
                .bearer_auth(&token)
                .send()
                .await
            {
                Ok(response) if response.status().is_success() => {
                    debug!("server session revoked");
                }
                Ok(response) => {
                    debug!(status = %response.status(), "logout rejected by server, clearing locally anyway");
                }
                Err(e) => {
                    debug!(error = %e, "logout call failed, clearing locally anyway");
                }
            }
        }
        self.store.clear();
        info!("local session cleared");
    }

    // ===== Authenticated call wrapper =====

    /// Run an authenticated operation with a single refresh-and-retry on
    /// authorization failure.
    ///
    /// The operation receives the shared HTTP client and the current
    /// access token. If it fails with a rejected token, one refresh is
    /// attempted; on refresh success the operation runs exactly once more
    /// and that result is returned unchanged. On refresh failure the
    /// original authorization error is returned. Any other failure is
    /// returned immediately without retry.
    pub async fn call_authenticated<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn(Client, String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let Some(token) = self.store.access_token() else {
            return Err(AuthError::Unauthorized.into());
        };

        match op(self.http.clone(), token.clone()).await {
            Ok(value) => Ok(value),
            Err(err) if AuthError::is_unauthorized(&err) => {
                debug!("access token rejected, attempting refresh");
                if !self.refresh_after_rejection(&token).await {
                    return Err(err);
                }
                match self.store.access_token() {
                    Some(token) => op(self.http.clone(), token).await,
                    None => Err(err),
                }
            }
            Err(err) => Err(err),
        }
    }

    /// Fetch the authenticated user's profile, updating the cached copy
    /// in the session on success. This is also the session watcher's
    /// health probe.
    pub async fn fetch_user(&self) -> Result<UserProfile> {
        let url = self.url("/auth/user");
        let profile = self
            .call_authenticated(|http, token| {
                let url = url.clone();
                async move {
                    let response = http
                        .get(&url)
                        .bearer_auth(&token)
                        .send()
                        .await
                        .context("Failed to send profile request")?;
                    let response = Self::check_response(response).await?;
                    response
                        .json::<UserProfile>()
                        .await
                        .context("Failed to parse profile response")
                }
            })
            .await?;

        self.store.update_user(profile.clone());
        Ok(profile)
    }
}
