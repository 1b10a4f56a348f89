//! Process-wide access to the shared session backend.
//!
//! Exactly one backend exists per init epoch. `init` picks the
//! implementation from config; everything else asks `Services::get`.
//! The reference is guarded by a std mutex held only while reading or
//! replacing it, never across an await.

use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;

use crate::backend::{MockBackend, ProductionBackend, SessionBackend};
use crate::config::CoreConfig;
use crate::runtime::ClaudeCliRuntime;

type SharedBackend = Arc<dyn SessionBackend>;

static BACKEND: Mutex<Option<SharedBackend>> = Mutex::new(None);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServicesError {
    #[error("Services not initialized; call Services::init first")]
    NotInitialized,
}

pub struct Services;

impl Services {
    /// Construct the shared backend, or return the one already installed.
    ///
    /// `backend_override` wins over config; otherwise dev mode selects
    /// [`MockBackend`] and production wraps a [`ClaudeCliRuntime`].
    pub fn init(
        config: &CoreConfig,
        backend_override: Option<SharedBackend>,
    ) -> Result<SharedBackend, ServicesError> {
        let mut slot = slot();
        if let Some(existing) = slot.as_ref() {
            if let Some(ignored) = backend_override {
                log::warn!(
                    "Services already initialized with {} backend; ignoring {} override",
                    existing.backend_name(),
                    ignored.backend_name()
                );
            } else {
                log::debug!(
                    "Services already initialized with {} backend",
                    existing.backend_name()
                );
            }
            return Ok(Arc::clone(existing));
        }

        let backend: SharedBackend = match backend_override {
            Some(backend) => backend,
            None if config.dev_mode => Arc::new(MockBackend::new()),
            None => {
                let runtime = Arc::new(ClaudeCliRuntime::new(config.runtime.clone()));
                Arc::new(ProductionBackend::new(runtime))
            }
        };

        log::info!("Services initialized with {} backend", backend.backend_name());
        *slot = Some(Arc::clone(&backend));
        Ok(backend)
    }

    pub fn get() -> Result<SharedBackend, ServicesError> {
        slot().clone().ok_or(ServicesError::NotInitialized)
    }

    pub fn is_initialized() -> bool {
        slot().is_some()
    }

    /// Drop the reference so the next `init` builds a fresh backend.
    pub fn reset() {
        if slot().take().is_some() {
            log::debug!("Services reset");
        }
    }

    /// Gracefully stop the installed backend. A no-op before `init`.
    ///
    /// The reference stays installed; call [`Services::reset`] to drop it.
    pub async fn stop() {
        let backend = slot().clone();
        if let Some(backend) = backend {
            log::info!("Stopping {} backend", backend.backend_name());
            backend.stop().await;
        }
    }
}

fn slot() -> MutexGuard<'static, Option<SharedBackend>> {
    BACKEND.lock().unwrap_or_else(|e| e.into_inner())
}
