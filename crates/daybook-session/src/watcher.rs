//! Periodic session health check and forced-logout events.
//!
//! The client has no push channel for server-side revocation; the only
//! way to learn that a session was invalidated elsewhere is to attempt an
//! authenticated call. The watcher polls the profile endpoint through the
//! refresh-and-retry wrapper, bounding the detection latency for "logged
//! out elsewhere" to roughly one poll interval. `trigger_now` lets the UI
//! layer hook app-foreground transitions without the watcher depending on
//! any UI type.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::client::AuthClient;
use crate::error::AuthError;
use crate::session::ReasonCode;

/// Buffer size for the logout event channel.
/// Forced logouts are rare; a handful of slots is plenty.
const EVENT_CHANNEL_SIZE: usize = 16;

/// Emitted when the watcher detects an unrecoverable session failure.
/// The UI layer maps the reason code to a message and navigates to login.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
pub struct LogoutEvent {
    pub reason: ReasonCode,
}

/// Recurring session-validity poll, owned as a cancellable task.
pub struct SessionWatcher {
    client: AuthClient,
    interval: Duration,
    events: broadcast::Sender<LogoutEvent>,
    trigger: Arc<Notify>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionWatcher {
    /// Create a watcher using the poll interval from the client config.
    pub fn new(client: AuthClient) -> Self {
        let interval = client.config().watcher_interval;
        Self::with_interval(client, interval)
    }

    pub fn with_interval(client: AuthClient, interval: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        Self {
            client,
            interval,
            events,
            trigger: Arc::new(Notify::new()),
            task: Mutex::new(None),
        }
    }

    /// Subscribe to forced-logout events.
    pub fn subscribe(&self) -> broadcast::Receiver<LogoutEvent> {
        self.events.subscribe()
    }

    /// Start the background poll. Restarting an already-running watcher
    /// replaces the previous task.
    pub fn start(&self) {
        let client = self.client.clone();
        let events = self.events.clone();
        let trigger = self.trigger.clone();
        let interval = self.interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = trigger.notified() => {}
                }
                Self::check(&client, &events).await;
            }
        });

        let mut task = self.lock_task();
        if let Some(previous) = task.replace(handle) {
            previous.abort();
        }
    }

    /// Cancel the background poll. In-flight refreshes cannot corrupt the
    /// store: the token swap is a no-op once the session is cleared.
    pub fn stop(&self) {
        if let Some(handle) = self.lock_task().take() {
            handle.abort();
        }
    }

    /// Request an immediate check, e.g. on an app-foreground transition.
    /// Has no effect until `start` has been called.
    pub fn trigger_now(&self) {
        self.trigger.notify_one();
    }

    fn lock_task(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// One validity check. Healthy sessions and transient transport
    /// failures are left alone; only an authorization failure that even
    /// the refresh path could not repair ends the session.
    async fn check(client: &AuthClient, events: &broadcast::Sender<LogoutEvent>) {
        let store = client.store();
        if !store.is_authenticated() {
            return;
        }

        match client.fetch_user().await {
            Ok(_) => {
                debug!("session check passed");
            }
            Err(err) if AuthError::is_unauthorized(&err) => {
                // An explicit logout may have raced with this poll; do not
                // fire a forced-logout event for a session the user ended.
                if !store.is_authenticated() {
                    return;
                }
                let reason = store
                    .consume_failure_reason()
                    .unwrap_or(ReasonCode::SessionInvalidated);
                warn!(reason = %reason, "session no longer valid, forcing logout");
                store.clear();
                let _ = events.send(LogoutEvent { reason });
            }
            Err(err) => {
                debug!(error = %err, "session check failed transiently");
            }
        }
    }
}

impl Drop for SessionWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}
