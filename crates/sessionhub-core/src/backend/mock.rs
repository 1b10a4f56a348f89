//! In-memory backend for dev mode and tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{BackendError, SessionBackend};
use crate::session::{project_id_for, SessionConfig, SessionInfo};

/// Produces the assistant reply for `(session_id, message, history)`.
///
/// `history` already contains the user message being answered.
pub type ResponseFn = Arc<dyn Fn(&str, &str, &[HistoryEntry]) -> String + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One message in a mock session's conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: Role,
    pub content: String,
}

/// A recorded backend call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    CreateSession {
        working_dir: String,
        bundle_name: Option<String>,
        description: String,
        surface: String,
    },
    SendMessage {
        session_id: String,
        message: String,
    },
    EndSession {
        session_id: String,
    },
    GetSessionInfo {
        session_id: String,
    },
    ListActiveSessions,
}

#[derive(Default)]
struct MockState {
    counter: u64,
    sessions: HashMap<String, SessionInfo>,
    /// Creation order, for stable listings.
    order: Vec<String>,
    history: HashMap<String, Vec<HistoryEntry>>,
    calls: Vec<MockCall>,
    unavailable: bool,
}

/// Fully in-memory [`SessionBackend`].
///
/// Session ids come from a counter (`mock-session-0001`, `mock-session-0002`,
/// ...), every call is recorded, and replies come from an injectable
/// [`ResponseFn`] (echo by default).
pub struct MockBackend {
    state: Mutex<MockState>,
    responder: ResponseFn,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::with_responder(Arc::new(|_, message, _| format!("[mock] {message}")))
    }

    /// Create a backend whose replies come from `responder`.
    pub fn with_responder(responder: ResponseFn) -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            responder,
        }
    }

    /// Toggle simulated runtime reachability for `create_session`.
    pub fn set_available(&self, available: bool) {
        self.state().unavailable = !available;
    }

    /// Every call made so far, oldest first.
    pub fn calls(&self) -> Vec<MockCall> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// Conversation history of a session; empty for unknown ids.
    pub fn history(&self, session_id: &str) -> Vec<HistoryEntry> {
        self.state()
            .history
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionBackend for MockBackend {
    async fn create_session(&self, config: SessionConfig) -> Result<SessionInfo, BackendError> {
        let mut state = self.state();
        state.calls.push(MockCall::CreateSession {
            working_dir: config.working_dir.clone(),
            bundle_name: config.bundle_name.clone(),
            description: config.description.clone(),
            surface: config.surface.clone(),
        });

        if state.unavailable {
            return Err(BackendError::BackendUnavailable(
                "mock runtime marked unavailable".to_string(),
            ));
        }

        state.counter += 1;
        let session_id = format!("mock-session-{:04}", state.counter);
        let info = SessionInfo::new(
            session_id.clone(),
            &config,
            &project_id_for(&config.working_dir),
        );

        state.sessions.insert(session_id.clone(), info.clone());
        state.history.insert(session_id.clone(), Vec::new());
        state.order.push(session_id.clone());
        log::debug!("mock backend created session {}", session_id);

        Ok(info)
    }

    async fn send_message(&self, session_id: &str, message: &str) -> Result<String, BackendError> {
        let mut state = self.state();
        state.calls.push(MockCall::SendMessage {
            session_id: session_id.to_string(),
            message: message.to_string(),
        });

        let active = state
            .sessions
            .get(session_id)
            .map(|info| info.is_active)
            .unwrap_or(false);
        if !active {
            return Err(BackendError::UnknownSession(session_id.to_string()));
        }

        let history = state.history.entry(session_id.to_string()).or_default();
        history.push(HistoryEntry {
            role: Role::User,
            content: message.to_string(),
        });
        let reply = (self.responder)(session_id, message, history.as_slice());
        history.push(HistoryEntry {
            role: Role::Assistant,
            content: reply.clone(),
        });

        Ok(reply)
    }

    async fn end_session(&self, session_id: &str) {
        let mut state = self.state();
        state.calls.push(MockCall::EndSession {
            session_id: session_id.to_string(),
        });
        if let Some(info) = state.sessions.get_mut(session_id) {
            info.is_active = false;
        }
    }

    async fn get_session_info(&self, session_id: &str) -> Option<SessionInfo> {
        let mut state = self.state();
        state.calls.push(MockCall::GetSessionInfo {
            session_id: session_id.to_string(),
        });
        state.sessions.get(session_id).cloned()
    }

    fn list_active_sessions(&self) -> Vec<SessionInfo> {
        let mut state = self.state();
        state.calls.push(MockCall::ListActiveSessions);
        state
            .order
            .iter()
            .filter_map(|id| state.sessions.get(id))
            .filter(|info| info.is_active)
            .cloned()
            .collect()
    }

    fn backend_name(&self) -> &'static str {
        "mock"
    }
}
