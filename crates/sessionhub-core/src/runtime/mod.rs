//! Agent runtime collaborator.
//!
//! The runtime owns actual agent execution and the durable conversation
//! transcript. SessionHub only needs four things from it: create a session,
//! run a message through a live handle, resume a handle from a session id,
//! and end a session. [`ProductionBackend`](crate::backend::ProductionBackend)
//! is written purely against these traits.

mod claude;

pub use claude::{ClaudeCliRuntime, ClaudeHandle, ClaudeResult};

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

/// Failures reported by an agent runtime.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Agent runtime unreachable: {0}")]
    Unreachable(String),

    #[error("Session not found in runtime: {0}")]
    NotFound(String),

    #[error("Session in invalid state: {0}")]
    InvalidState(String),

    #[error("Runtime I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unexpected runtime output: {0}")]
    Protocol(String),
}

/// Live, in-memory access to one runtime session.
#[async_trait]
pub trait RuntimeHandle: Send + Sync {
    fn session_id(&self) -> &str;

    fn project_id(&self) -> &str;

    fn working_dir(&self) -> &str;

    /// Run one user message and return the agent's final response text.
    async fn run(&self, message: &str) -> Result<String, RuntimeError>;
}

/// Factory and lifecycle owner for runtime sessions.
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    async fn create_session(
        &self,
        working_dir: &str,
        bundle_name: Option<&str>,
    ) -> Result<Arc<dyn RuntimeHandle>, RuntimeError>;

    /// Rebuild a handle for a session created earlier, possibly by a
    /// previous process.
    async fn resume_session(&self, session_id: &str)
        -> Result<Arc<dyn RuntimeHandle>, RuntimeError>;

    async fn end_session(&self, handle: Arc<dyn RuntimeHandle>) -> Result<(), RuntimeError>;
}
