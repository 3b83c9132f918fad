//! Single-flight access token refresh.
//!
//! When many calls hit a 401 at once, exactly one refresh request goes out.
//! Every caller, the one that triggered the refresh included, waits in a FIFO
//! queue and is completed exactly once with the outcome: the new token, or
//! the reason the session could not be renewed.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use reqwest::{header, Client};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::client::TokenResponse;
use super::ApiError;
use crate::auth::{CredentialStore, SessionEvent, SessionEventBus};
use crate::utils::lock;

/// Outcome delivered to every waiter. Failures carry a reason string so one
/// outcome can be cloned to all of them.
type RefreshOutcome = Result<String, String>;

type Waiter = oneshot::Sender<RefreshOutcome>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshState {
    Idle,
    InFlight,
}

struct RefreshQueue {
    state: RefreshState,
    waiters: VecDeque<Waiter>,
    /// Bumped when the session ends. A refresh started under an older
    /// generation is discarded when it settles.
    generation: u64,
}

/// The refresh call itself. Carries no bearer header: the server renews the
/// session from the cookie set at sign-in, held by the shared client's jar.
#[derive(Clone)]
pub(crate) struct RefreshEndpoint {
    http: Client,
    url: String,
}

impl RefreshEndpoint {
    pub(crate) fn new(http: Client, url: String) -> Self {
        Self { http, url }
    }

    async fn call(&self) -> RefreshOutcome {
        let response = self
            .http
            .post(&self.url)
            .header(header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    "refresh request timed out".to_string()
                } else {
                    format!("refresh request failed: {}", e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(format!("refresh endpoint returned {}", status));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| format!("invalid refresh response: {}", e))?;
        Ok(body.access_token)
    }
}

struct CoordinatorInner {
    queue: Mutex<RefreshQueue>,
    endpoint: RefreshEndpoint,
    credentials: CredentialStore,
    events: SessionEventBus,
}

/// Coalesces concurrent token refreshes into one call.
/// Clone is cheap - clones share the same state and queue.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl RefreshCoordinator {
    pub(crate) fn new(
        endpoint: RefreshEndpoint,
        credentials: CredentialStore,
        events: SessionEventBus,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                queue: Mutex::new(RefreshQueue {
                    state: RefreshState::Idle,
                    waiters: VecDeque::new(),
                    generation: 0,
                }),
                endpoint,
                credentials,
                events,
            }),
        }
    }

    pub fn state(&self) -> RefreshState {
        lock(&self.inner.queue).state
    }

    pub fn is_refreshing(&self) -> bool {
        self.state() == RefreshState::InFlight
    }

    /// Number of callers waiting on the in-flight refresh.
    pub fn waiting(&self) -> usize {
        lock(&self.inner.queue).waiters.len()
    }

    /// Wait for a fresh access token, starting a refresh if none is running.
    ///
    /// On success the new token is already stored. On failure the stored
    /// token is gone and `SessionEvent::LoggedOut` has been published once
    /// for the whole batch of waiters.
    pub async fn await_fresh_token(&self) -> Result<String, ApiError> {
        let (tx, rx) = oneshot::channel();

        // Check-and-set under one lock with no await in between: two callers
        // can never both see Idle.
        let (starts_refresh, position) = {
            let mut queue = lock(&self.inner.queue);
            queue.waiters.push_back(tx);
            let position = queue.waiters.len();
            match queue.state {
                RefreshState::InFlight => (None, position),
                RefreshState::Idle => {
                    queue.state = RefreshState::InFlight;
                    (Some(queue.generation), position)
                }
            }
        };

        if let Some(generation) = starts_refresh {
            info!("Access token rejected, refreshing");
            tokio::spawn(Arc::clone(&self.inner).run(generation));
        } else {
            debug!(position, "Refresh already in flight, queued");
        }

        match rx.await {
            Ok(Ok(token)) => Ok(token),
            Ok(Err(reason)) => Err(ApiError::RefreshFailed(reason)),
            Err(_) => Err(ApiError::RefreshFailed(
                "refresh ended without an outcome".to_string(),
            )),
        }
    }

    /// End the current session as far as refreshing goes. Waiters of a
    /// refresh in flight fail right away, and that refresh's result is
    /// dropped when it arrives, so it can never store a token again.
    pub fn invalidate(&self) {
        let abandoned = {
            let mut queue = lock(&self.inner.queue);
            queue.generation += 1;
            queue.state = RefreshState::Idle;
            std::mem::take(&mut queue.waiters)
        };

        if !abandoned.is_empty() {
            info!(waiters = abandoned.len(), "Session ended, abandoning token refresh");
        }
        for waiter in abandoned {
            let _ = waiter.send(Err("session ended during refresh".to_string()));
        }
    }
}

impl CoordinatorInner {
    async fn run(self: Arc<Self>, generation: u64) {
        // The call runs on its own task so a panic inside it still settles
        // the queue instead of stranding every waiter.
        let endpoint = self.endpoint.clone();
        let outcome = match tokio::spawn(async move { endpoint.call().await }).await {
            Ok(outcome) => outcome,
            Err(e) => Err(format!("refresh task failed: {}", e)),
        };
        self.settle(generation, outcome);
    }

    /// Store the token, go back to Idle, and take the waiters in one
    /// critical section, then complete them in FIFO order. On failure the
    /// token is cleared outside the lock, because other tabs' handlers run
    /// inside the clear and may invalidate their own coordinators.
    fn settle(&self, generation: u64, outcome: RefreshOutcome) {
        let waiters = {
            let mut queue = lock(&self.queue);
            if queue.generation != generation {
                debug!("Session ended while refreshing, discarding result");
                return;
            }

            if let Ok(token) = &outcome {
                if let Err(e) = self.credentials.set_token(token) {
                    warn!(error = %e, "Refreshed token could not be persisted");
                }
            }

            queue.state = RefreshState::Idle;
            std::mem::take(&mut queue.waiters)
        };

        if let Err(reason) = &outcome {
            warn!(reason = %reason, "Token refresh failed, ending session");
            if let Err(e) = self.credentials.clear() {
                warn!(error = %e, "Failed to clear access token");
            }
        }

        let completed = waiters.len();
        for waiter in waiters {
            // A dropped waiter gave up on the result; nothing to deliver.
            let _ = waiter.send(outcome.clone());
        }

        match outcome {
            Ok(_) => info!(waiters = completed, "Access token refreshed"),
            Err(_) => self.events.publish(SessionEvent::LoggedOut),
        }
    }
}
