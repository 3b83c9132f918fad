//! File-backed storage shared between processes.
//!
//! Every process that opens the same path acts as one tab. The file holds a
//! flat JSON object of string keys to string values and is replaced atomically
//! on each write. Writes from other processes are picked up by polling.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use super::{CrossTabChannel, Storage, StorageChange};
use crate::utils::{lock, Listeners, Subscription};

type Snapshot = BTreeMap<String, String>;

pub struct FileStorage {
    path: PathBuf,
    /// Random tag for log lines and temp file names
    instance: String,
    /// Last file state this instance knows about. Held for the whole
    /// read-modify-write of `set`/`remove` and the whole diff of
    /// `poll_changes`, so an own write is never reported as external.
    known: Mutex<Snapshot>,
    listeners: Arc<Listeners<StorageChange>>,
}

impl FileStorage {
    /// Open (or lazily create) the storage file at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Arc<Self>> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create storage directory {}", parent.display()))?;
        }

        let known = read_snapshot(&path)?;
        let instance = format!("{:08x}", rand::thread_rng().gen::<u32>());
        debug!(path = %path.display(), instance = %instance, keys = known.len(), "Opened file storage");

        Ok(Arc::new(Self {
            path,
            instance,
            known: Mutex::new(known),
            listeners: Listeners::new(),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Compare the file against the last known state and announce every key
    /// another process changed since then.
    pub fn poll_changes(&self) -> Vec<StorageChange> {
        let changes = {
            let mut known = lock(&self.known);
            let current = match read_snapshot(&self.path) {
                Ok(current) => current,
                Err(e) => {
                    warn!(error = %e, path = %self.path.display(), "Skipping storage poll");
                    return Vec::new();
                }
            };
            let changes = diff(&known, &current);
            *known = current;
            changes
        };

        for change in &changes {
            debug!(instance = %self.instance, key = %change.key, "External storage change");
            self.listeners.notify(change);
        }
        changes
    }

    /// Poll for external changes every `every` until this storage is dropped.
    pub fn watch(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(storage) = weak.upgrade() else {
                    break;
                };
                storage.poll_changes();
            }
        })
    }

    fn write_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let tmp = self.path.with_extension(format!("{}.tmp", self.instance));
        let contents = serde_json::to_string_pretty(snapshot)?;
        std::fs::write(&tmp, contents)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

impl Storage for FileStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(read_snapshot(&self.path)?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut known = lock(&self.known);
        let mut current = read_snapshot(&self.path)?;
        current.insert(key.to_string(), value.to_string());
        self.write_snapshot(&current)?;
        known.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<Option<String>> {
        let mut known = lock(&self.known);
        let mut current = read_snapshot(&self.path)?;
        let old_value = current.remove(key);
        if old_value.is_some() {
            self.write_snapshot(&current)?;
        }
        known.remove(key);
        Ok(old_value)
    }
}

impl CrossTabChannel for FileStorage {
    fn on_external_change(
        &self,
        handler: Box<dyn Fn(&StorageChange) + Send + Sync>,
    ) -> Subscription {
        self.listeners.add(move |change| handler(change))
    }
}

fn read_snapshot(path: &Path) -> Result<Snapshot> {
    if !path.exists() {
        return Ok(Snapshot::new());
    }
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read storage file {}", path.display()))?;
    if contents.trim().is_empty() {
        return Ok(Snapshot::new());
    }
    serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse storage file {}", path.display()))
}

fn diff(before: &Snapshot, after: &Snapshot) -> Vec<StorageChange> {
    let keys: BTreeSet<&String> = before.keys().chain(after.keys()).collect();
    keys.into_iter()
        .filter_map(|key| {
            let old_value = before.get(key);
            let new_value = after.get(key);
            (old_value != new_value).then(|| StorageChange {
                key: key.clone(),
                old_value: old_value.cloned(),
                new_value: new_value.cloned(),
            })
        })
        .collect()
}
