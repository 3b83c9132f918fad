//! Studydeck core - authenticated API session handling for the study app.
//!
//! This crate owns everything between "a screen wants data" and "bytes go
//! out on the wire":
//!
//! - `storage`: Key-value medium shared across tabs, with change notification
//! - `auth`: Credential store, session event bus, and the session controller
//! - `api`: Request dispatcher with single-flight token refresh and replay
//! - `config`: Persisted client configuration
//! - `models`: Wire models for sign-in and the user profile

pub mod api;
pub mod auth;
pub mod config;
pub mod models;
pub mod storage;
pub mod utils;

pub use api::{ApiClient, ApiError, ApiResponse, PendingRequest, RefreshCoordinator};
pub use auth::{
    AuthSession, AuthSessionController, CredentialStore, LogoutOptions, SessionError,
    SessionEvent, SessionEventBus, SessionPhase,
};
pub use config::Config;
pub use models::{Credentials, Profile};
pub use storage::{CrossTabChannel, FileStorage, SharedOrigin, Storage, StorageChange, TabStorage};
pub use utils::Subscription;
