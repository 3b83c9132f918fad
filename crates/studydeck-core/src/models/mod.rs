//! Wire models shared by the API client and the session controller.
//!
//! - `Profile`: The signed-in user, as returned by `GET /api/users/me`
//! - `Credentials`: Sign-in request body

pub mod profile;

pub use profile::{Credentials, Profile};
