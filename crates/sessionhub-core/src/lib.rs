//! # sessionhub-core
//!
//! Shared agent session plumbing for SessionHub surfaces.
//!
//! Every surface (web chat, chat bridge, scheduled routines, voice, the
//! console daemon) creates and drives agent sessions through one shared
//! backend and keeps its own routing-key bookkeeping in a registry.
//!
//! ## Key Concepts
//!
//! - **SessionBackend**: Capability interface over agent sessions (mock or production)
//! - **Services**: Process-wide holder of the one shared backend
//! - **SurfaceSessionRegistry**: Per-surface routing key -> session mapping, persisted as JSON
//! - **AgentRuntime**: The component that actually runs agent turns

pub mod backend;
pub mod config;
pub mod logging;
pub mod paths;
pub mod persistence;
pub mod registry;
pub mod runtime;
pub mod services;
pub mod session;
pub mod shell;

// Re-export commonly used types
pub use backend::{BackendError, MockBackend, ProductionBackend, SessionBackend};
pub use config::CoreConfig;
pub use registry::{RegisterOptions, RegistryError, SessionMapping, SurfaceSessionRegistry};
pub use services::{Services, ServicesError};
pub use session::{SessionConfig, SessionInfo};
