//! Session backends.
//!
//! [`SessionBackend`] is the single seam through which every surface creates
//! and drives agent sessions. Two independent implementations exist:
//!
//! - [`MockBackend`] - in-memory, deterministic; dev mode and tests
//! - [`ProductionBackend`] - wraps a real [`AgentRuntime`](crate::runtime::AgentRuntime)
//!
//! One backend instance is shared by all surfaces (see [`crate::services`]).

mod mock;
mod production;

pub use mock::{HistoryEntry, MockBackend, MockCall, ResponseFn, Role};
pub use production::{ProductionBackend, RECONNECTED_SURFACE};

use async_trait::async_trait;
use thiserror::Error;

use crate::session::{SessionConfig, SessionInfo};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("Session backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Unknown session: {0}")]
    UnknownSession(String),

    #[error("Message to session {session_id} failed: {reason}")]
    MessageFailed { session_id: String, reason: String },
}

/// Capability interface over agent session backends.
///
/// Callers are expected to keep at most one request in flight per session;
/// ordering of sends to the same session is their responsibility.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    /// Allocate a new backend session.
    async fn create_session(&self, config: SessionConfig) -> Result<SessionInfo, BackendError>;

    /// Send a message and wait for the response text.
    async fn send_message(&self, session_id: &str, message: &str) -> Result<String, BackendError>;

    /// End a session. Unknown or already-ended ids are a no-op.
    async fn end_session(&self, session_id: &str);

    async fn get_session_info(&self, session_id: &str) -> Option<SessionInfo>;

    /// Sessions this instance currently holds in memory.
    fn list_active_sessions(&self) -> Vec<SessionInfo>;

    /// Graceful shutdown hook. Releases in-memory resources only; sessions
    /// stay resumable by the next process.
    async fn stop(&self) {}

    /// Short label for logs.
    fn backend_name(&self) -> &'static str;
}
