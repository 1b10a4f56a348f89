//! Backend over a real agent runtime, with lazy reconnection.
//!
//! The session id -> handle table lives in process memory only. After a
//! restart (or an [`ProductionBackend::evict`]) the registries of the surfaces
//! still point at session ids this process has no handle for. The first
//! `send_message` to such an id asks the runtime to resume it once; on success
//! the handle is cached, on failure the caller sees `UnknownSession` exactly
//! as for an id that never existed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;

use super::{BackendError, SessionBackend};
use crate::runtime::{AgentRuntime, RuntimeError, RuntimeHandle};
use crate::session::{SessionConfig, SessionInfo};

/// `created_by_app` recorded for sessions recovered through resume.
pub const RECONNECTED_SURFACE: &str = "reconnected";

struct SessionEntry {
    info: SessionInfo,
    /// `None` once the session has been ended.
    handle: Option<Arc<dyn RuntimeHandle>>,
    /// Serializes turns on this session.
    turn_lock: Arc<AsyncMutex<()>>,
    seq: u64,
}

#[derive(Default)]
struct SessionTable {
    entries: HashMap<String, SessionEntry>,
    next_seq: u64,
}

impl SessionTable {
    fn insert(&mut self, info: SessionInfo, handle: Arc<dyn RuntimeHandle>) -> LiveSession {
        self.next_seq += 1;
        let turn_lock = Arc::new(AsyncMutex::new(()));
        let live = LiveSession {
            handle: Arc::clone(&handle),
            turn_lock: Arc::clone(&turn_lock),
        };
        self.entries.insert(
            info.session_id.clone(),
            SessionEntry {
                info,
                handle: Some(handle),
                turn_lock,
                seq: self.next_seq,
            },
        );
        live
    }
}

struct LiveSession {
    handle: Arc<dyn RuntimeHandle>,
    turn_lock: Arc<AsyncMutex<()>>,
}

enum Lookup {
    Live(LiveSession),
    Ended,
    Missing,
}

/// [`SessionBackend`] backed by an [`AgentRuntime`].
pub struct ProductionBackend {
    runtime: Arc<dyn AgentRuntime>,
    sessions: Mutex<SessionTable>,
    /// One lock per id being resumed, so racing sends on a cold id resume it
    /// once while other ids resume independently.
    resuming: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl ProductionBackend {
    pub fn new(runtime: Arc<dyn AgentRuntime>) -> Self {
        Self {
            runtime,
            sessions: Mutex::new(SessionTable::default()),
            resuming: Mutex::new(HashMap::new()),
        }
    }

    /// Drop the in-memory handle for a session without ending it in the
    /// runtime. The next send goes through reconnection.
    ///
    /// Returns `true` if a handle was held.
    pub fn evict(&self, session_id: &str) -> bool {
        let removed = self.table().entries.remove(session_id).is_some();
        if removed {
            log::debug!("Evicted handle for session {}", session_id);
        }
        removed
    }

    fn table(&self) -> MutexGuard<'_, SessionTable> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lookup(&self, session_id: &str) -> Lookup {
        match self.table().entries.get(session_id) {
            Some(entry) => match &entry.handle {
                Some(handle) => Lookup::Live(LiveSession {
                    handle: Arc::clone(handle),
                    turn_lock: Arc::clone(&entry.turn_lock),
                }),
                None => Lookup::Ended,
            },
            None => Lookup::Missing,
        }
    }

    /// Resume a session whose handle is not in memory. One attempt, no retry.
    async fn reconnect(&self, session_id: &str) -> Result<LiveSession, BackendError> {
        let lock = Arc::clone(
            self.resume_locks()
                .entry(session_id.to_string())
                .or_default(),
        );
        let result = {
            let _guard = lock.lock().await;
            self.resume_once(session_id).await
        };

        let mut locks = self.resume_locks();
        if locks
            .get(session_id)
            .is_some_and(|current| Arc::ptr_eq(current, &lock))
        {
            locks.remove(session_id);
        }
        result
    }

    fn resume_locks(&self) -> MutexGuard<'_, HashMap<String, Arc<AsyncMutex<()>>>> {
        self.resuming.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn resume_once(&self, session_id: &str) -> Result<LiveSession, BackendError> {
        // Another send may have reconnected while we waited for the lock.
        match self.lookup(session_id) {
            Lookup::Live(live) => return Ok(live),
            Lookup::Ended => return Err(BackendError::UnknownSession(session_id.to_string())),
            Lookup::Missing => {}
        }

        log::info!(
            "No live handle for session {}, attempting resume",
            session_id
        );
        let handle = match self.runtime.resume_session(session_id).await {
            Ok(handle) => handle,
            Err(err) => {
                log::warn!("Resume failed for session {}: {}", session_id, err);
                return Err(BackendError::UnknownSession(session_id.to_string()));
            }
        };

        let info = SessionInfo {
            session_id: session_id.to_string(),
            project_id: handle.project_id().to_string(),
            working_dir: handle.working_dir().to_string(),
            is_active: true,
            created_by_app: RECONNECTED_SURFACE.to_string(),
            description: String::new(),
        };
        log::info!("Reconnected session {}", session_id);
        Ok(self.table().insert(info, handle))
    }
}

fn message_failed(session_id: &str, err: RuntimeError) -> BackendError {
    match err {
        RuntimeError::NotFound(_) | RuntimeError::InvalidState(_) => {
            BackendError::UnknownSession(session_id.to_string())
        }
        other => BackendError::MessageFailed {
            session_id: session_id.to_string(),
            reason: other.to_string(),
        },
    }
}

#[async_trait]
impl SessionBackend for ProductionBackend {
    async fn create_session(&self, config: SessionConfig) -> Result<SessionInfo, BackendError> {
        let handle = self
            .runtime
            .create_session(&config.working_dir, config.bundle_name.as_deref())
            .await
            .map_err(|err| {
                log::error!(
                    "Failed to create session in {} for {}: {}",
                    config.working_dir,
                    config.surface,
                    err
                );
                BackendError::BackendUnavailable(err.to_string())
            })?;

        let info = SessionInfo {
            session_id: handle.session_id().to_string(),
            project_id: handle.project_id().to_string(),
            working_dir: handle.working_dir().to_string(),
            is_active: true,
            created_by_app: config.surface,
            description: config.description,
        };
        log::info!(
            "Created session {} for surface {} in {}",
            info.session_id,
            info.created_by_app,
            info.working_dir
        );

        self.table().insert(info.clone(), handle);
        Ok(info)
    }

    async fn send_message(&self, session_id: &str, message: &str) -> Result<String, BackendError> {
        let live = match self.lookup(session_id) {
            Lookup::Live(live) => live,
            Lookup::Ended => return Err(BackendError::UnknownSession(session_id.to_string())),
            Lookup::Missing => self.reconnect(session_id).await?,
        };

        let _turn = live.turn_lock.lock().await;
        live.handle.run(message).await.map_err(|err| {
            log::warn!("Message to session {} failed: {}", session_id, err);
            message_failed(session_id, err)
        })
    }

    async fn end_session(&self, session_id: &str) {
        let handle = {
            let mut table = self.table();
            match table.entries.get_mut(session_id) {
                Some(entry) => {
                    entry.info.is_active = false;
                    entry.handle.take()
                }
                None => None,
            }
        };

        if let Some(handle) = handle {
            if let Err(err) = self.runtime.end_session(handle).await {
                log::warn!("Runtime failed to end session {}: {}", session_id, err);
            }
            log::info!("Ended session {}", session_id);
        }
    }

    async fn get_session_info(&self, session_id: &str) -> Option<SessionInfo> {
        self.table()
            .entries
            .get(session_id)
            .map(|entry| entry.info.clone())
    }

    fn list_active_sessions(&self) -> Vec<SessionInfo> {
        let table = self.table();
        let mut active: Vec<&SessionEntry> = table
            .entries
            .values()
            .filter(|entry| entry.handle.is_some() && entry.info.is_active)
            .collect();
        active.sort_by_key(|entry| entry.seq);
        active.into_iter().map(|entry| entry.info.clone()).collect()
    }

    /// Release every in-memory handle. Sessions stay alive in the runtime so
    /// the next process can resume them; ending them is the surfaces' call.
    async fn stop(&self) {
        let released = {
            let mut table = self.table();
            let live = table
                .entries
                .values()
                .filter(|entry| entry.handle.is_some())
                .count();
            table.entries.clear();
            live
        };
        log::info!(
            "Stopping production backend, released {} live sessions",
            released
        );
    }

    fn backend_name(&self) -> &'static str {
        "production"
    }
}
