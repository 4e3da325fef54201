//! In-memory session state and failure reason codes.
//!
//! The session lives in memory only: a process restart always requires
//! re-authentication. The persisted device identifier is the single value
//! that survives session destruction (see `device.rs`).

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Reason codes
// ============================================================================

/// Why a refresh or session-validity check failed.
///
/// The first four codes come from the server verbatim; the last two are
/// assigned client-locally. The UI layer maps each code to a user-facing
/// message when a forced logout fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
pub enum ReasonCode {
    /// Session invalidated by server action (e.g. login elsewhere)
    SessionRevoked,
    /// Refresh token past its TTL
    RefreshTokenExpired,
    /// Refresh token does not match the presenting device id
    DeviceMismatch,
    /// Token not found / already consumed
    InvalidRefreshToken,
    /// Client-local: no refresh token was ever stored
    NoRefreshToken,
    /// Client-local generic fallback for any other failure
    SessionInvalidated,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::SessionRevoked => "SESSION_REVOKED",
            ReasonCode::RefreshTokenExpired => "REFRESH_TOKEN_EXPIRED",
            ReasonCode::DeviceMismatch => "DEVICE_MISMATCH",
            ReasonCode::InvalidRefreshToken => "INVALID_REFRESH_TOKEN",
            ReasonCode::NoRefreshToken => "NO_REFRESH_TOKEN",
            ReasonCode::SessionInvalidated => "SESSION_INVALIDATED",
        }
    }

    /// Parse a server-sent reason string. Codes outside the known
    /// vocabulary fall back to the generic `SESSION_INVALIDATED`.
    pub fn parse(s: &str) -> Self {
        match s {
            "SESSION_REVOKED" => ReasonCode::SessionRevoked,
            "REFRESH_TOKEN_EXPIRED" => ReasonCode::RefreshTokenExpired,
            "DEVICE_MISMATCH" => ReasonCode::DeviceMismatch,
            "INVALID_REFRESH_TOKEN" => ReasonCode::InvalidRefreshToken,
            "NO_REFRESH_TOKEN" => ReasonCode::NoRefreshToken,
            _ => ReasonCode::SessionInvalidated,
        }
    }
}

impl std::fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Profile and session data
// ============================================================================

/// Last-known profile data returned by the server. Not authoritative -
/// may be stale until the next successful profile fetch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
pub struct UserProfile {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub company_code: Option<String>,
}

/// The authenticated state of one app installation for one user.
#[derive(Debug, Clone)]
pub struct Session {
    /// Opaque bearer credential, short-lived
    pub access_token: String,
    /// Opaque single-use credential. `None` after a legacy `token`-only
    /// login, which has no refresh path.
    pub refresh_token: Option<String>,
    /// Stable identifier for this installation
    pub device_id: String,
    /// Last-known profile, may be stale
    pub user: Option<UserProfile>,
    pub access_token_expires_at: Option<DateTime<Utc>>,
    pub refresh_token_expires_at: Option<DateTime<Utc>>,
}

impl Session {
    /// Whether the access token is past its server-reported expiry.
    /// Unknown expiry is treated as not expired; the server's 401 is
    /// authoritative either way.
    pub fn is_access_expired(&self) -> bool {
        match self.access_token_expires_at {
            Some(expiry) => Utc::now() > expiry,
            None => false,
        }
    }

    /// Whether this session can be repaired by a refresh once the access
    /// token expires. Legacy logins cannot.
    pub fn has_refresh_path(&self) -> bool {
        self.refresh_token.as_deref().is_some_and(|t| !t.is_empty())
    }

    /// Minutes remaining until access token expiry (for display)
    pub fn minutes_until_expiry(&self) -> Option<i64> {
        self.access_token_expires_at
            .map(|expiry| (expiry - Utc::now()).num_minutes().max(0))
    }
}

// ============================================================================
// Credential store
// ============================================================================

#[derive(Default)]
struct StoreInner {
    session: Option<Session>,
    last_failure_reason: Option<ReasonCode>,
}

/// In-memory holder for the current session.
///
/// A cloneable handle over a single shared instance; `save`/`clear` and the
/// internal token swap are applied under one lock so a concurrent reader
/// never observes a half-updated token pair. Nothing here touches durable
/// storage.
#[derive(Clone, Default)]
pub struct CredentialStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the whole session atomically. Clears any pending failure
    /// reason, since a successful save is a successful operation.
    pub fn save(&self, session: Session) {
        let mut inner = self.lock();
        inner.session = Some(session);
        inner.last_failure_reason = None;
    }

    /// Snapshot of the current session, if any.
    pub fn get(&self) -> Option<Session> {
        self.lock().session.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.lock()
            .session
            .as_ref()
            .is_some_and(|s| !s.access_token.is_empty())
    }

    pub fn access_token(&self) -> Option<String> {
        self.lock().session.as_ref().map(|s| s.access_token.clone())
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.lock()
            .session
            .as_ref()
            .and_then(|s| s.refresh_token.clone())
    }

    pub fn device_id(&self) -> Option<String> {
        self.lock().session.as_ref().map(|s| s.device_id.clone())
    }

    /// Reset to the absent state. Does not touch the persisted device
    /// identifier, which lives outside this store.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.session = None;
    }

    /// Return and clear the last refresh failure reason. Read-once, so a
    /// UI layer displaying a message does not redisplay it on next check.
    pub fn consume_failure_reason(&self) -> Option<ReasonCode> {
        self.lock().last_failure_reason.take()
    }

    pub(crate) fn set_failure_reason(&self, reason: ReasonCode) {
        self.lock().last_failure_reason = Some(reason);
    }

    /// Atomically replace the token pair after a successful refresh,
    /// preserving the cached user profile. Returns false without mutating
    /// anything if the session was cleared while the refresh was in
    /// flight - a completed refresh must not resurrect a logout.
    pub(crate) fn swap_tokens(
        &self,
        access_token: String,
        refresh_token: Option<String>,
        device_id: String,
        access_token_expires_at: Option<DateTime<Utc>>,
        refresh_token_expires_at: Option<DateTime<Utc>>,
    ) -> bool {
        let mut inner = self.lock();
        let Some(session) = inner.session.as_mut() else {
            return false;
        };
        session.access_token = access_token;
        session.refresh_token = refresh_token;
        session.device_id = device_id;
        session.access_token_expires_at = access_token_expires_at;
        session.refresh_token_expires_at = refresh_token_expires_at;
        inner.last_failure_reason = None;
        true
    }

    /// Update the cached profile after a successful authenticated fetch.
    pub(crate) fn update_user(&self, user: UserProfile) {
        if let Some(session) = self.lock().session.as_mut() {
            session.user = Some(user);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample_session() -> Session {
        Session {
            access_token: "access-1".into(),
            refresh_token: Some("refresh-1".into()),
            device_id: "device-1".into(),
            user: Some(UserProfile {
                id: Some(7),
                name: Some("Asha".into()),
                email: Some("asha@example.com".into()),
                ..Default::default()
            }),
            access_token_expires_at: Some(Utc::now() + Duration::minutes(60)),
            refresh_token_expires_at: Some(Utc::now() + Duration::days(7)),
        }
    }

    #[test]
    fn test_save_get_clear() {
        let store = CredentialStore::new();
        assert!(store.get().is_none());
        assert!(!store.is_authenticated());

        store.save(sample_session());
        assert!(store.is_authenticated());
        assert_eq!(store.access_token().as_deref(), Some("access-1"));
        assert_eq!(store.refresh_token().as_deref(), Some("refresh-1"));
        assert_eq!(store.device_id().as_deref(), Some("device-1"));

        store.clear();
        assert!(store.get().is_none());
        assert!(store.access_token().is_none());
    }

    #[test]
    fn test_failure_reason_is_read_once() {
        let store = CredentialStore::new();
        store.set_failure_reason(ReasonCode::RefreshTokenExpired);

        assert_eq!(
            store.consume_failure_reason(),
            Some(ReasonCode::RefreshTokenExpired)
        );
        assert_eq!(store.consume_failure_reason(), None);
    }

    #[test]
    fn test_save_clears_failure_reason() {
        let store = CredentialStore::new();
        store.set_failure_reason(ReasonCode::SessionRevoked);
        store.save(sample_session());
        assert_eq!(store.consume_failure_reason(), None);
    }

    #[test]
    fn test_swap_preserves_user_and_clears_reason() {
        let store = CredentialStore::new();
        store.save(sample_session());
        store.set_failure_reason(ReasonCode::SessionInvalidated);

        let swapped = store.swap_tokens(
            "access-2".into(),
            Some("refresh-2".into()),
            "device-1".into(),
            None,
            None,
        );
        assert!(swapped);

        let session = store.get().unwrap();
        assert_eq!(session.access_token, "access-2");
        assert_eq!(session.refresh_token.as_deref(), Some("refresh-2"));
        assert_eq!(session.user.unwrap().name.as_deref(), Some("Asha"));
        assert_eq!(store.consume_failure_reason(), None);
    }

    #[test]
    fn test_swap_after_logout_is_a_noop() {
        let store = CredentialStore::new();
        store.save(sample_session());
        store.clear();

        let swapped = store.swap_tokens(
            "access-2".into(),
            Some("refresh-2".into()),
            "device-1".into(),
            None,
            None,
        );
        assert!(!swapped);
        assert!(store.get().is_none());
    }

    #[test]
    fn test_concurrent_readers_see_matched_pairs() {
        let store = CredentialStore::new();
        store.save(sample_session());

        let writer_store = store.clone();
        let writer = std::thread::spawn(move || {
            for i in 0..500u32 {
                writer_store.swap_tokens(
                    format!("access-{i}"),
                    Some(format!("refresh-{i}")),
                    "device-1".into(),
                    None,
                    None,
                );
            }
        });

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let reader_store = store.clone();
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        let session = reader_store.get().unwrap();
                        let access_n = session
                            .access_token
                            .rsplit('-')
                            .next()
                            .unwrap()
                            .to_string();
                        let refresh_n = session
                            .refresh_token
                            .unwrap()
                            .rsplit('-')
                            .next()
                            .unwrap()
                            .to_string();
                        assert_eq!(access_n, refresh_n, "observed a half-updated pair");
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
    }

    #[test]
    fn test_reason_code_wire_strings() {
        for (code, wire) in [
            (ReasonCode::SessionRevoked, "SESSION_REVOKED"),
            (ReasonCode::RefreshTokenExpired, "REFRESH_TOKEN_EXPIRED"),
            (ReasonCode::DeviceMismatch, "DEVICE_MISMATCH"),
            (ReasonCode::InvalidRefreshToken, "INVALID_REFRESH_TOKEN"),
            (ReasonCode::NoRefreshToken, "NO_REFRESH_TOKEN"),
            (ReasonCode::SessionInvalidated, "SESSION_INVALIDATED"),
        ] {
            assert_eq!(code.as_str(), wire);
            assert_eq!(ReasonCode::parse(wire), code);
            assert_eq!(
                serde_json::to_string(&code).unwrap(),
                format!("\"{wire}\"")
            );
        }

        // Unknown codes fall back to the generic client-local value
        assert_eq!(
            ReasonCode::parse("SOMETHING_NEW"),
            ReasonCode::SessionInvalidated
        );
    }

    #[test]
    fn test_expiry_helpers() {
        let mut session = sample_session();
        assert!(!session.is_access_expired());
        assert!(session.has_refresh_path());
        assert!(session.minutes_until_expiry().unwrap() > 0);

        session.access_token_expires_at = Some(Utc::now() - Duration::minutes(1));
        assert!(session.is_access_expired());
        assert_eq!(session.minutes_until_expiry(), Some(0));

        session.access_token_expires_at = None;
        assert!(!session.is_access_expired());

        session.refresh_token = None;
        assert!(!session.has_refresh_path());
    }
}
