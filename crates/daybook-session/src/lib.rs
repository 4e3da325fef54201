//! Session and token lifecycle core for the Daybook client.
//!
//! This crate owns the authentication state machine the app embeds:
//! - `DeviceIdentity`: stable per-installation device identifier
//! - `CredentialStore`: in-memory session state (tokens, profile, failure reason)
//! - `AuthClient`: login/register/refresh/logout against the token service,
//!   plus the one-shot refresh-and-retry wrapper for protected calls
//! - `SessionWatcher`: periodic validity poll emitting typed forced-logout
//!   events when the server has invalidated the session
//!
//! Sessions live in memory only; a process restart requires
//! re-authentication. The device identifier is the single persisted value.

pub mod client;
pub mod config;
pub mod device;
pub mod error;
pub mod session;
pub mod watcher;

pub use client::{AuthClient, AuthMethod, AuthResponse};
pub use config::AuthConfig;
pub use device::{DeviceIdentity, DeviceStore, FileDeviceStore, KeyringDeviceStore};
pub use error::AuthError;
pub use session::{CredentialStore, ReasonCode, Session, UserProfile};
pub use watcher::{LogoutEvent, SessionWatcher};
