//! Authentication state for the client side of a study session.
//!
//! This module provides:
//! - `CredentialStore`: The current access token, kept in shared storage
//! - `SessionEventBus`: In-process logout/adoption signals, fed by other tabs
//! - `AuthSessionController`: Logged-in state and the current user
//!
//! Only the access token is persisted. The refresh credential lives in the
//! HTTP client's cookie jar and never touches storage.

pub mod credentials;
pub mod events;
pub mod session;

pub use credentials::{CredentialStore, TOKEN_KEY};
pub use events::{SessionEvent, SessionEventBus};
pub use session::{AuthSession, AuthSessionController, LogoutOptions, SessionError, SessionPhase};
