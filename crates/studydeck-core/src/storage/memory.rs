//! In-memory storage shared by several tabs of one origin.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use tracing::trace;

use super::{CrossTabChannel, Storage, StorageChange};
use crate::utils::{lock, Listeners, Subscription};

#[derive(Default)]
struct OriginInner {
    values: Mutex<HashMap<String, String>>,
    tabs: Mutex<BTreeMap<u64, Arc<Listeners<StorageChange>>>>,
    next_tab: AtomicU64,
}

impl OriginInner {
    /// Deliver a change to every tab except the one that made it.
    fn broadcast(&self, from: u64, change: StorageChange) {
        let others: Vec<Arc<Listeners<StorageChange>>> = lock(&self.tabs)
            .iter()
            .filter(|(id, _)| **id != from)
            .map(|(_, listeners)| Arc::clone(listeners))
            .collect();

        trace!(tab = from, key = %change.key, receivers = others.len(), "Broadcasting storage change");
        for listeners in others {
            listeners.notify(&change);
        }
    }
}

/// One origin's storage. Open a `TabStorage` per simulated tab.
#[derive(Clone, Default)]
pub struct SharedOrigin {
    inner: Arc<OriginInner>,
}

impl SharedOrigin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new tab onto this origin.
    pub fn open_tab(&self) -> TabStorage {
        let id = self.inner.next_tab.fetch_add(1, Ordering::Relaxed);
        let listeners = Listeners::new();
        lock(&self.inner.tabs).insert(id, Arc::clone(&listeners));
        TabStorage {
            id,
            origin: Arc::clone(&self.inner),
            listeners,
        }
    }

    pub fn tab_count(&self) -> usize {
        lock(&self.inner.tabs).len()
    }
}

/// A tab's view of a `SharedOrigin`.
///
/// Reads and writes go straight to the origin map. Writes are announced to
/// every other open tab, never to this one.
pub struct TabStorage {
    id: u64,
    origin: Arc<OriginInner>,
    listeners: Arc<Listeners<StorageChange>>,
}

impl TabStorage {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Storage for TabStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(lock(&self.origin.values).get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let old_value = lock(&self.origin.values).insert(key.to_string(), value.to_string());
        if old_value.as_deref() != Some(value) {
            self.origin.broadcast(
                self.id,
                StorageChange {
                    key: key.to_string(),
                    old_value,
                    new_value: Some(value.to_string()),
                },
            );
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<Option<String>> {
        let old_value = lock(&self.origin.values).remove(key);
        if old_value.is_some() {
            self.origin.broadcast(
                self.id,
                StorageChange {
                    key: key.to_string(),
                    old_value: old_value.clone(),
                    new_value: None,
                },
            );
        }
        Ok(old_value)
    }
}

impl CrossTabChannel for TabStorage {
    fn on_external_change(
        &self,
        handler: Box<dyn Fn(&StorageChange) + Send + Sync>,
    ) -> Subscription {
        self.listeners.add(move |change| handler(change))
    }
}

impl Drop for TabStorage {
    fn drop(&mut self) {
        lock(&self.origin.tabs).remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder(tab: &TabStorage) -> (Arc<Mutex<Vec<StorageChange>>>, Subscription) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let sub = tab.on_external_change(Box::new(move |change| lock(&sink).push(change.clone())));
        (seen, sub)
    }

    #[test]
    fn test_tabs_share_values() {
        let origin = SharedOrigin::new();
        let a = origin.open_tab();
        let b = origin.open_tab();

        a.set("accessToken", "tok1").unwrap();
        assert_eq!(b.get("accessToken").unwrap().as_deref(), Some("tok1"));

        assert_eq!(b.remove("accessToken").unwrap().as_deref(), Some("tok1"));
        assert_eq!(a.get("accessToken").unwrap(), None);
    }

    #[test]
    fn test_writer_does_not_see_its_own_change() {
        let origin = SharedOrigin::new();
        let a = origin.open_tab();
        let b = origin.open_tab();
        let (seen_a, _sub_a) = recorder(&a);
        let (seen_b, _sub_b) = recorder(&b);

        a.set("accessToken", "tok1").unwrap();

        assert!(lock(&seen_a).is_empty());
        assert_eq!(
            *lock(&seen_b),
            vec![StorageChange {
                key: "accessToken".to_string(),
                old_value: None,
                new_value: Some("tok1".to_string()),
            }]
        );
    }

    #[test]
    fn test_remove_of_missing_key_is_silent() {
        let origin = SharedOrigin::new();
        let a = origin.open_tab();
        let b = origin.open_tab();
        let (seen_b, _sub) = recorder(&b);

        assert_eq!(a.remove("accessToken").unwrap(), None);
        assert!(lock(&seen_b).is_empty());
    }

    #[test]
    fn test_rewriting_same_value_is_silent() {
        let origin = SharedOrigin::new();
        let a = origin.open_tab();
        let b = origin.open_tab();
        a.set("accessToken", "tok1").unwrap();
        let (seen_b, _sub) = recorder(&b);

        a.set("accessToken", "tok1").unwrap();
        assert!(lock(&seen_b).is_empty());
    }

    #[test]
    fn test_closed_tab_is_forgotten() {
        let origin = SharedOrigin::new();
        let a = origin.open_tab();
        {
            let _b = origin.open_tab();
            assert_eq!(origin.tab_count(), 2);
        }
        assert_eq!(origin.tab_count(), 1);
        a.set("k", "v").unwrap();
    }
}
