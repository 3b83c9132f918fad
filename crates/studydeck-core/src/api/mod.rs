//! REST API client module for the study server.
//!
//! This module provides the `ApiClient` request dispatcher and the
//! `RefreshCoordinator` behind it. Every call carries the stored access token
//! as a bearer header. A 401 parks the caller behind a single shared token
//! refresh and replays the call once with the new token.

pub mod client;
pub mod error;
pub mod refresh;
pub mod request;

pub use client::{ApiClient, PROFILE_PATH, REFRESH_PATH, SIGNIN_PATH, SIGNOUT_PATH};
pub use error::ApiError;
pub use refresh::{RefreshCoordinator, RefreshState};
pub use request::{ApiResponse, Method, PendingRequest};
