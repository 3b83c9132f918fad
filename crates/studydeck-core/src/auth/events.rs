//! Process-local session signals, with a bridge from other tabs.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info};

use super::credentials::TOKEN_KEY;
use crate::storage::{CrossTabChannel, StorageChange};
use crate::utils::{Listeners, Subscription};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// The session ended: explicit logout, failed refresh, or another tab
    /// cleared the token.
    LoggedOut,
    /// Another tab stored a token while this one had none.
    TokenAdopted,
}

/// Publish/subscribe hub for `SessionEvent`s.
/// Clone is cheap - all clones deliver to the same subscribers.
#[derive(Clone)]
pub struct SessionEventBus {
    listeners: Arc<Listeners<SessionEvent>>,
}

impl SessionEventBus {
    pub fn new() -> Self {
        Self {
            listeners: Listeners::new(),
        }
    }

    /// Deliver `event` synchronously to every current subscriber.
    pub fn publish(&self, event: SessionEvent) {
        let delivered = self.listeners.notify(&event);
        debug!(?event, subscribers = delivered, "Published session event");
    }

    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.listeners.add(handler)
    }

    pub fn subscriber_count(&self) -> usize {
        self.listeners.len()
    }

    /// Re-publish other tabs' token writes as local events: a newly set
    /// token becomes `TokenAdopted`, a cleared one `LoggedOut`. A token
    /// replaced by another (a refresh in the other tab) needs no reaction.
    pub fn attach_cross_tab(&self, channel: &dyn CrossTabChannel) -> Subscription {
        let listeners = Arc::downgrade(&self.listeners);
        channel.on_external_change(Box::new(move |change| {
            let Some(event) = event_for_change(change) else {
                return;
            };
            if let Some(listeners) = listeners.upgrade() {
                info!(?event, "Session changed in another tab");
                listeners.notify(&event);
            }
        }))
    }
}

impl Default for SessionEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SessionEventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionEventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

fn event_for_change(change: &StorageChange) -> Option<SessionEvent> {
    if change.key != TOKEN_KEY {
        None
    } else if change.is_cleared() {
        Some(SessionEvent::LoggedOut)
    } else if change.is_newly_set() {
        Some(SessionEvent::TokenAdopted)
    } else {
        None
    }
}
