//! Key-value storage shared between tabs of the same origin.
//!
//! The credential store sits on top of a `Storage`, and the session event bus
//! listens to a `CrossTabChannel` for writes made by other tabs. Two backends
//! are provided:
//!
//! - `SharedOrigin` / `TabStorage`: in-memory, several tabs in one process
//! - `FileStorage`: a JSON file shared by every process pointing at it

pub mod file;
pub mod memory;

use anyhow::Result;

use crate::utils::Subscription;

pub use file::FileStorage;
pub use memory::{SharedOrigin, TabStorage};

/// Synchronously readable key-value medium.
pub trait Storage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;

    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Remove a key, returning the value it held.
    fn remove(&self, key: &str) -> Result<Option<String>>;
}

/// A mutation of shared storage made by another tab.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageChange {
    pub key: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

impl StorageChange {
    /// True when the key went from absent to present.
    pub fn is_newly_set(&self) -> bool {
        self.old_value.is_none() && self.new_value.is_some()
    }

    pub fn is_cleared(&self) -> bool {
        self.new_value.is_none()
    }
}

/// Notifications about storage writes made by other tabs.
///
/// Implementations never deliver a change to the tab that made it.
pub trait CrossTabChannel: Send + Sync {
    fn on_external_change(
        &self,
        handler: Box<dyn Fn(&StorageChange) + Send + Sync>,
    ) -> Subscription;
}
