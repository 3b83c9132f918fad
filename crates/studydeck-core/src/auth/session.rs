//! Application-level session state: who is signed in, if anyone.
//!
//! The controller owns an `AuthSession` and moves it through
//! `Unknown -> Pending -> LoggedIn / LoggedOut` in response to bootstrap,
//! explicit login/logout, and session events (failed refresh, other tabs).
//! The UI observes it through a `watch` channel.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use anyhow::Result as AnyResult;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[cfg(feature = "ts")]
use ts_rs::TS;

use super::{CredentialStore, SessionEvent, SessionEventBus};
use crate::api::{ApiClient, ApiError};
use crate::config::Config;
use crate::models::{Credentials, Profile};
use crate::storage::{CrossTabChannel, Storage};
use crate::utils::{lock, Subscription};

/// Where the UI goes after logout unless told otherwise
const DEFAULT_LOGOUT_REDIRECT: &str = "/login";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "ts", derive(TS), ts(export))]
pub enum SessionPhase {
    /// Nothing known yet (before bootstrap)
    Unknown,
    /// A token exists and is assumed valid while the profile loads
    Pending,
    LoggedIn,
    LoggedOut,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "ts", derive(TS), ts(export))]
pub struct AuthSession {
    pub phase: SessionPhase,
    pub user: Option<Profile>,
}

impl AuthSession {
    fn unknown() -> Self {
        Self {
            phase: SessionPhase::Unknown,
            user: None,
        }
    }

    fn logged_out() -> Self {
        Self {
            phase: SessionPhase::LoggedOut,
            user: None,
        }
    }

    /// Optimistic: a pending session counts as logged in.
    pub fn is_logged_in(&self) -> bool {
        matches!(self.phase, SessionPhase::Pending | SessionPhase::LoggedIn)
    }
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("A logout is in progress")]
    LogoutInProgress,

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("Failed to store access token: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, Default)]
pub struct LogoutOptions {
    /// Route to send the user to afterwards (default `/login`)
    pub redirect_to: Option<String>,
}

struct ControllerInner {
    api: ApiClient,
    state: watch::Sender<AuthSession>,
    /// Logouts currently running; overlapping calls each hold one count
    logouts_running: AtomicUsize,
}

/// Tracks the signed-in user and reacts to session events.
pub struct AuthSessionController {
    inner: Arc<ControllerInner>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl AuthSessionController {
    /// Wrap an API client. Subscribes to the client's event bus right away.
    pub fn new(api: ApiClient) -> Self {
        let (state, _) = watch::channel(AuthSession::unknown());
        let inner = Arc::new(ControllerInner {
            api,
            state,
            logouts_running: AtomicUsize::new(0),
        });

        let weak: Weak<ControllerInner> = Arc::downgrade(&inner);
        let subscription = inner.api.events().subscribe(move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_event(*event);
            }
        });

        Self {
            inner,
            subscriptions: Mutex::new(vec![subscription]),
        }
    }

    /// Build the whole stack for one tab: credential store and cross-tab
    /// bridge over `storage`, event bus, API client, controller.
    pub fn connect<S>(config: &Config, storage: Arc<S>) -> AnyResult<Self>
    where
        S: Storage + CrossTabChannel + 'static,
    {
        let shared: Arc<dyn Storage> = storage.clone();
        let credentials = CredentialStore::new(shared);
        let events = SessionEventBus::new();
        let bridge = events.attach_cross_tab(storage.as_ref());
        let api = ApiClient::new(config, credentials, events)?;

        let controller = Self::new(api);
        lock(&controller.subscriptions).push(bridge);
        Ok(controller)
    }

    pub fn api(&self) -> &ApiClient {
        &self.inner.api
    }

    pub fn current_session(&self) -> AuthSession {
        self.inner.state.borrow().clone()
    }

    /// Receive every session change.
    pub fn subscribe(&self) -> watch::Receiver<AuthSession> {
        self.inner.state.subscribe()
    }

    pub fn is_logout_in_progress(&self) -> bool {
        self.inner.is_logging_out()
    }

    /// Establish the session at startup from the stored token.
    ///
    /// With a token the session goes `Pending` (already counted as logged
    /// in) until the profile loads. Only an auth failure logs out; a server
    /// or network fault keeps the session, since the token may still be good.
    pub async fn bootstrap(&self) -> AuthSession {
        let inner = &self.inner;
        if self.is_logout_in_progress() {
            return self.current_session();
        }

        if !inner.api.credentials().has_token() {
            debug!("No stored token, starting logged out");
            inner.state.send_replace(AuthSession::logged_out());
            return self.current_session();
        }

        inner.state.send_modify(|session| session.phase = SessionPhase::Pending);
        let result = inner.api.fetch_profile().await;
        inner.apply_profile(result)
    }

    /// Sign in and store the new token. A failed profile load afterwards does
    /// not undo the login.
    pub async fn login(&self, credentials: &Credentials) -> Result<AuthSession, SessionError> {
        let inner = &self.inner;
        if self.is_logout_in_progress() {
            return Err(SessionError::LogoutInProgress);
        }

        let token = inner.api.sign_in(credentials).await?;
        if self.is_logout_in_progress() {
            return Err(SessionError::LogoutInProgress);
        }

        inner
            .api
            .credentials()
            .set_token(&token)
            .map_err(|e| SessionError::Storage(format!("{:#}", e)))?;
        inner.state.send_replace(AuthSession {
            phase: SessionPhase::LoggedIn,
            user: None,
        });

        match inner.api.fetch_profile().await {
            Ok(profile) => {
                inner.state.send_if_modified(|session| {
                    if session.phase != SessionPhase::LoggedIn {
                        return false;
                    }
                    session.user = Some(profile);
                    true
                });
            }
            Err(e) => warn!(error = %e, "Profile load after sign-in failed"),
        }

        Ok(self.current_session())
    }

    /// End the session. The sign-out call is best effort; the local token and
    /// state are cleared no matter what. Returns where the UI should go next.
    pub async fn logout(&self, options: LogoutOptions) -> String {
        let inner = &self.inner;
        let redirect = options
            .redirect_to
            .unwrap_or_else(|| DEFAULT_LOGOUT_REDIRECT.to_string());

        let _guard = LogoutGuard::enter(&inner.logouts_running);

        if let Err(e) = inner.api.sign_out().await {
            debug!(error = %e, "Sign-out request failed, clearing session anyway");
        }

        // No await between invalidate and clear; a refresh settling later
        // finds its generation gone and writes nothing.
        inner.api.refresh_coordinator().invalidate();
        if let Err(e) = inner.api.credentials().clear() {
            warn!(error = %e, "Failed to clear access token");
        }
        inner.state.send_replace(AuthSession::logged_out());
        inner.api.events().publish(SessionEvent::LoggedOut);
        info!(redirect = %redirect, "Logged out");

        redirect
    }
}

/// Counts one running logout; released when the logout finishes or is
/// abandoned.
struct LogoutGuard<'a>(&'a AtomicUsize);

impl<'a> LogoutGuard<'a> {
    fn enter(running: &'a AtomicUsize) -> Self {
        if running.fetch_add(1, Ordering::SeqCst) > 0 {
            debug!("Logout already in progress");
        }
        Self(running)
    }
}

impl Drop for LogoutGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ControllerInner {
    fn is_logging_out(&self) -> bool {
        self.logouts_running.load(Ordering::SeqCst) > 0
    }

    fn handle_event(self: Arc<Self>, event: SessionEvent) {
        match event {
            SessionEvent::LoggedOut => {
                self.api.refresh_coordinator().invalidate();
                self.mark_logged_out();
            }
            SessionEvent::TokenAdopted => self.adopt_token(),
        }
    }

    fn mark_logged_out(&self) {
        let changed = self.state.send_if_modified(|session| {
            if *session == AuthSession::logged_out() {
                return false;
            }
            *session = AuthSession::logged_out();
            true
        });
        if changed {
            info!("Session ended");
        }
    }

    /// Another tab logged in: treat its token as ours and load the profile.
    fn adopt_token(self: Arc<Self>) {
        if self.is_logging_out() {
            debug!("Ignoring adopted token during logout");
            return;
        }

        let adopted = self.state.send_if_modified(|session| {
            if session.is_logged_in() {
                return false;
            }
            session.phase = SessionPhase::Pending;
            true
        });
        if !adopted {
            return;
        }

        info!("Adopted session from another tab");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let result = self.api.fetch_profile().await;
                    self.apply_profile(result);
                });
            }
            Err(_) => {
                warn!("No async runtime to load the adopted profile");
                self.state.send_modify(|session| session.phase = SessionPhase::LoggedIn);
            }
        }
    }

    /// Settle a `Pending` session from a profile load. A result that arrives
    /// after the session moved on (logout, another login) changes nothing.
    fn apply_profile(&self, result: Result<Profile, ApiError>) -> AuthSession {
        let logging_out = self.is_logging_out();

        match result {
            Ok(profile) => {
                self.state.send_if_modified(|session| {
                    if logging_out || !session.is_logged_in() {
                        return false;
                    }
                    session.phase = SessionPhase::LoggedIn;
                    session.user = Some(profile);
                    true
                });
            }
            Err(e) if e.is_auth_failure() => {
                info!(error = %e, "Stored session rejected");
                if let Err(e) = self.api.credentials().clear() {
                    warn!(error = %e, "Failed to clear access token");
                }
                self.mark_logged_out();
            }
            Err(e) => {
                warn!(error = %e, "Profile load failed, keeping session");
                self.state.send_if_modified(|session| {
                    if logging_out || session.phase != SessionPhase::Pending {
                        return false;
                    }
                    session.phase = SessionPhase::LoggedIn;
                    true
                });
            }
        }

        self.state.borrow().clone()
    }
}
