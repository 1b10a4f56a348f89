//! Session data shared by every backend.
//!
//! A session is one ongoing agent conversation. Surfaces never hold the
//! runtime resources directly; they only see the [`SessionInfo`] summary
//! returned by the backend.

mod info;

pub use info::{project_id_for, SessionConfig, SessionInfo, DEFAULT_PROJECT_ID};
