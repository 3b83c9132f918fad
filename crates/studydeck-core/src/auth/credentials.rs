use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::warn;

use crate::storage::Storage;

/// Storage key holding the access token.
pub const TOKEN_KEY: &str = "accessToken";

/// Owner of the current access token.
/// Clone is cheap - all clones share the same backing storage.
#[derive(Clone)]
pub struct CredentialStore {
    storage: Arc<dyn Storage>,
}

impl CredentialStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Current access token, if any. An unreadable store counts as no token.
    pub fn token(&self) -> Option<String> {
        match self.storage.get(TOKEN_KEY) {
            Ok(token) => token,
            Err(e) => {
                warn!(error = %e, "Failed to read access token");
                None
            }
        }
    }

    pub fn has_token(&self) -> bool {
        self.token().is_some()
    }

    pub fn set_token(&self, token: &str) -> Result<()> {
        self.storage
            .set(TOKEN_KEY, token)
            .context("Failed to store access token")
    }

    /// Remove the token, returning the one that was stored.
    pub fn clear(&self) -> Result<Option<String>> {
        self.storage
            .remove(TOKEN_KEY)
            .context("Failed to clear access token")
    }
}

impl fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialStore")
            .field("has_token", &self.has_token())
            .finish()
    }
}
