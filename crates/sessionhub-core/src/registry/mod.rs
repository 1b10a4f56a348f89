//! Per-surface routing-key -> session bookkeeping.
//!
//! Each surface (web chat, chat bridge, scheduled routines, voice) owns one
//! [`SurfaceSessionRegistry`] and delegates to it; nothing inherits from a
//! shared base. The registry maps a surface routing key (a thread id, a
//! channel, a routine name) to a [`SessionMapping`], persists the mappings to
//! a JSON file, and enforces a per-user cap on active sessions.
//!
//! The registry never owns backend sessions. A mapping only stores the
//! session id; ending the session is the surface's job.
//!
//! # Concurrency
//!
//! Mutations take one registry-wide async lock across
//! mutate -> snapshot -> save, so mutations on one key apply in call order
//! and two saves never interleave. Reads take a short synchronous lock and
//! never wait on file I/O.

mod mapping;

pub use mapping::{format_timestamp, now_timestamp, Extra, SessionMapping};

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{Duration, Utc};
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;

use crate::persistence::atomic_write;

pub const DEFAULT_MAX_PER_USER: usize = 10;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("User {user_id} already has {limit} active sessions")]
    SessionLimitReached { user_id: String, limit: usize },

    #[error("Registry persistence failed: {0}")]
    Persistence(String),
}

/// Optional fields for [`SurfaceSessionRegistry::register`].
#[derive(Debug, Clone, Default)]
pub struct RegisterOptions {
    pub project_id: Option<String>,
    pub description: Option<String>,
    pub extra: Extra,
}

impl RegisterOptions {
    pub fn project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

type MappingTable = HashMap<String, SessionMapping>;

pub struct SurfaceSessionRegistry {
    surface_name: String,
    persistence_path: Option<PathBuf>,
    max_per_user: usize,
    mappings: Mutex<MappingTable>,
    /// Held across mutate + save.
    write_lock: AsyncMutex<()>,
}

impl SurfaceSessionRegistry {
    /// Create a registry, loading existing mappings from `persistence_path`.
    ///
    /// `None` keeps everything in memory. A missing file is an empty
    /// registry; an unreadable one is logged and also starts empty.
    pub fn new(
        surface_name: impl Into<String>,
        persistence_path: Option<PathBuf>,
        max_per_user: usize,
    ) -> Self {
        let surface_name = surface_name.into();
        let mappings = match persistence_path.as_deref() {
            Some(path) => match load_mappings(path, &surface_name) {
                Ok(loaded) => loaded,
                Err(e) => {
                    log::warn!("[{}] starting with empty registry: {}", surface_name, e);
                    HashMap::new()
                }
            },
            None => HashMap::new(),
        };

        log::info!(
            "[{}] session registry ready ({} mappings, persistence {})",
            surface_name,
            mappings.len(),
            persistence_path
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "disabled".to_string())
        );

        Self {
            surface_name,
            persistence_path,
            max_per_user,
            mappings: Mutex::new(mappings),
            write_lock: AsyncMutex::new(()),
        }
    }

    /// A registry with no persistence and the default per-user limit.
    pub fn in_memory(surface_name: impl Into<String>) -> Self {
        Self::new(surface_name, None, DEFAULT_MAX_PER_USER)
    }

    pub fn surface_name(&self) -> &str {
        &self.surface_name
    }

    pub fn persistence_path(&self) -> Option<&Path> {
        self.persistence_path.as_deref()
    }

    pub fn max_per_user(&self) -> usize {
        self.max_per_user
    }

    /// Map `routing_key` to `session_id`, replacing any previous mapping.
    ///
    /// Does not enforce the per-user limit; call [`Self::check_limit`] before
    /// creating the backend session.
    pub async fn register(
        &self,
        routing_key: &str,
        session_id: &str,
        user_id: &str,
        options: RegisterOptions,
    ) -> SessionMapping {
        let now = now_timestamp();
        let mapping = SessionMapping {
            routing_key: routing_key.to_string(),
            session_id: session_id.to_string(),
            surface: self.surface_name.clone(),
            project_id: options.project_id.unwrap_or_default(),
            description: options.description.unwrap_or_default(),
            created_by: user_id.to_string(),
            created_at: now.clone(),
            last_active: now,
            is_active: true,
            extra: options.extra,
        };

        let stored = mapping.clone();
        let replaced = self
            .mutate(move |table| {
                let previous = table.insert(stored.routing_key.clone(), stored);
                (previous, true)
            })
            .await;

        match replaced {
            Some(old) if old.session_id != session_id => log::info!(
                "[{}] {} remapped from session {} to {}",
                self.surface_name,
                routing_key,
                old.session_id,
                session_id
            ),
            _ => log::info!(
                "[{}] registered {} -> {} for {}",
                self.surface_name,
                routing_key,
                session_id,
                user_id
            ),
        }

        mapping
    }

    pub fn lookup(&self, routing_key: &str) -> Option<SessionMapping> {
        self.table().get(routing_key).cloned()
    }

    /// Linear scan; registries only hold one surface's sessions.
    pub fn lookup_by_session_id(&self, session_id: &str) -> Option<SessionMapping> {
        self.table()
            .values()
            .find(|m| m.session_id == session_id)
            .cloned()
    }

    /// Bump `last_active` to now. No-op for unknown keys.
    pub async fn update_activity(&self, routing_key: &str) {
        let now = now_timestamp();
        self.mutate(|table| match table.get_mut(routing_key) {
            Some(mapping) => {
                // Never move behind created_at, even if the clock stepped back.
                mapping.last_active = if now < mapping.created_at {
                    mapping.created_at.clone()
                } else {
                    now
                };
                ((), true)
            }
            None => ((), false),
        })
        .await
    }

    /// Mark a mapping retired. No-op for unknown keys.
    pub async fn deactivate(&self, routing_key: &str) {
        let changed = self
            .mutate(|table| match table.get_mut(routing_key) {
                Some(mapping) if mapping.is_active => {
                    mapping.is_active = false;
                    (true, true)
                }
                _ => (false, false),
            })
            .await;
        if changed {
            log::info!("[{}] deactivated {}", self.surface_name, routing_key);
        }
    }

    pub async fn remove(&self, routing_key: &str) -> Option<SessionMapping> {
        let removed = self
            .mutate(|table| {
                let removed = table.remove(routing_key);
                let changed = removed.is_some();
                (removed, changed)
            })
            .await;
        if removed.is_some() {
            log::info!("[{}] removed {}", self.surface_name, routing_key);
        }
        removed
    }

    /// Remove retired mappings whose last activity is older than `older_than`.
    ///
    /// Returns how many were removed. Active mappings are never touched.
    pub async fn prune_inactive(&self, older_than: Duration) -> usize {
        let cutoff = format_timestamp(Utc::now() - older_than);
        let pruned = self
            .mutate(|table| {
                let before = table.len();
                table.retain(|_, m| m.is_active || m.last_active >= cutoff);
                let pruned = before - table.len();
                (pruned, pruned > 0)
            })
            .await;
        if pruned > 0 {
            log::info!("[{}] pruned {} retired mappings", self.surface_name, pruned);
        }
        pruned
    }

    pub fn list_active(&self) -> Vec<SessionMapping> {
        self.collect(|m| m.is_active)
    }

    /// Active mappings created by `user_id`.
    pub fn list_for_user(&self, user_id: &str) -> Vec<SessionMapping> {
        self.collect(|m| m.is_active && m.created_by == user_id)
    }

    pub fn list_all(&self) -> Vec<SessionMapping> {
        self.collect(|_| true)
    }

    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table().is_empty()
    }

    /// Fail if `user_id` is already at the active-session cap.
    pub fn check_limit(&self, user_id: &str) -> Result<(), RegistryError> {
        let active = self
            .table()
            .values()
            .filter(|m| m.is_active && m.created_by == user_id)
            .count();
        if active >= self.max_per_user {
            return Err(RegistryError::SessionLimitReached {
                user_id: user_id.to_string(),
                limit: self.max_per_user,
            });
        }
        Ok(())
    }

    fn table(&self) -> MutexGuard<'_, MappingTable> {
        self.mappings.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn collect<F>(&self, keep: F) -> Vec<SessionMapping>
    where
        F: Fn(&SessionMapping) -> bool,
    {
        let mut out: Vec<SessionMapping> = self
            .table()
            .values()
            .filter(|m| keep(*m))
            .cloned()
            .collect();
        sort_mappings(&mut out);
        out
    }

    /// Apply `change` and, if it reports a change, save before returning.
    async fn mutate<T, F>(&self, change: F) -> T
    where
        F: FnOnce(&mut MappingTable) -> (T, bool),
    {
        let _write = self.write_lock.lock().await;

        let (out, snapshot) = {
            let mut table = self.table();
            let (out, changed) = change(&mut *table);
            let snapshot = (changed && self.persistence_path.is_some()).then(|| {
                let mut all: Vec<SessionMapping> = table.values().cloned().collect();
                sort_mappings(&mut all);
                all
            });
            (out, snapshot)
        };

        if let Some(snapshot) = snapshot {
            if let Err(e) = self.save(snapshot).await {
                // In-memory state stays authoritative for this process.
                log::warn!("[{}] {}", self.surface_name, e);
            }
        }

        out
    }

    async fn save(&self, snapshot: Vec<SessionMapping>) -> Result<(), RegistryError> {
        let Some(path) = self.persistence_path.clone() else {
            return Ok(());
        };
        let json = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| RegistryError::Persistence(e.to_string()))?;

        tokio::task::spawn_blocking(move || atomic_write(&path, &json))
            .await
            .map_err(|e| RegistryError::Persistence(e.to_string()))?
            .map_err(|e| RegistryError::Persistence(e.to_string()))
    }
}

fn sort_mappings(mappings: &mut [SessionMapping]) {
    mappings.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.routing_key.cmp(&b.routing_key))
    });
}

fn load_mappings(path: &Path, surface: &str) -> Result<MappingTable, RegistryError> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let contents = fs::read_to_string(path)
        .map_err(|e| RegistryError::Persistence(format!("read {}: {}", path.display(), e)))?;
    let records = mapping::decode_records(&contents, surface)
        .map_err(|e| RegistryError::Persistence(format!("parse {}: {}", path.display(), e)))?;

    // Later records win, matching register's overwrite semantics.
    Ok(records
        .into_iter()
        .map(|m| (m.routing_key.clone(), m))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn persisted(dir: &Path) -> SurfaceSessionRegistry {
        SurfaceSessionRegistry::new("slack", Some(dir.join("slack.json")), 3)
    }

    fn keys(mappings: &[SessionMapping]) -> HashSet<String> {
        mappings.iter().map(|m| m.routing_key.clone()).collect()
    }

    mod register {
        use super::*;

        #[tokio::test]
        async fn sets_fields_and_timestamps() {
            let registry = SurfaceSessionRegistry::in_memory("web");
            let mapping = registry
                .register(
                    "tab-1",
                    "S1",
                    "alice",
                    RegisterOptions::default()
                        .project("webapp")
                        .description("landing page")
                        .extra("tab", "1"),
                )
                .await;

            assert_eq!(mapping.routing_key, "tab-1");
            assert_eq!(mapping.session_id, "S1");
            assert_eq!(mapping.surface, "web");
            assert_eq!(mapping.project_id, "webapp");
            assert_eq!(mapping.description, "landing page");
            assert_eq!(mapping.created_by, "alice");
            assert_eq!(mapping.created_at, mapping.last_active);
            assert!(mapping.is_active);
            assert_eq!(mapping.extra["tab"], "1");
            assert_eq!(registry.lookup("tab-1"), Some(mapping));
        }

        #[tokio::test]
        async fn same_key_overwrites_instead_of_merging() {
            let registry = SurfaceSessionRegistry::in_memory("web");
            registry
                .register("k", "S1", "alice", RegisterOptions::default().extra("a", "1"))
                .await;
            registry
                .register("k", "S2", "bob", RegisterOptions::default())
                .await;

            assert_eq!(registry.len(), 1);
            let mapping = registry.lookup("k").unwrap();
            assert_eq!(mapping.session_id, "S2");
            assert_eq!(mapping.created_by, "bob");
            assert!(mapping.extra.is_empty());
        }

        #[tokio::test]
        async fn does_not_enforce_limit() {
            let registry = SurfaceSessionRegistry::new("web", None, 1);
            registry.register("a", "S1", "u", RegisterOptions::default()).await;
            registry.register("b", "S2", "u", RegisterOptions::default()).await;

            assert_eq!(registry.list_for_user("u").len(), 2);
        }
    }

    mod lookups {
        use super::*;

        #[tokio::test]
        async fn by_session_id() {
            let registry = SurfaceSessionRegistry::in_memory("web");
            registry.register("a", "S1", "u", RegisterOptions::default()).await;
            registry.register("b", "S2", "u", RegisterOptions::default()).await;

            assert_eq!(registry.lookup_by_session_id("S2").unwrap().routing_key, "b");
            assert!(registry.lookup_by_session_id("S3").is_none());
        }

        #[tokio::test]
        async fn unknown_key_is_none() {
            let registry = SurfaceSessionRegistry::in_memory("web");
            assert!(registry.lookup("missing").is_none());
            assert!(registry.is_empty());
        }
    }

    mod lifecycle {
        use super::*;

        #[tokio::test]
        async fn list_active_excludes_deactivated_and_removed() {
            let registry = SurfaceSessionRegistry::in_memory("web");
            for (i, key) in ["a", "b", "c", "d"].iter().enumerate() {
                registry
                    .register(key, &format!("S{i}"), "u", RegisterOptions::default())
                    .await;
            }

            registry.deactivate("b").await;
            let removed = registry.remove("c").await;

            assert_eq!(removed.unwrap().session_id, "S2");
            assert_eq!(
                keys(&registry.list_active()),
                ["a", "d"].iter().map(|s| s.to_string()).collect()
            );
            assert_eq!(registry.list_all().len(), 3);
            assert!(!registry.lookup("b").unwrap().is_active);
        }

        #[tokio::test]
        async fn update_activity_moves_last_active_forward() {
            let registry = SurfaceSessionRegistry::in_memory("web");
            let created = registry.register("k", "S", "u", RegisterOptions::default()).await;

            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            registry.update_activity("k").await;

            let updated = registry.lookup("k").unwrap();
            assert_eq!(updated.created_at, created.created_at);
            assert!(updated.last_active > created.last_active);
        }

        #[tokio::test]
        async fn missing_keys_are_noops() {
            let registry = SurfaceSessionRegistry::in_memory("web");
            registry.update_activity("ghost").await;
            registry.deactivate("ghost").await;

            assert!(registry.remove("ghost").await.is_none());
            assert!(registry.is_empty());
        }

        #[tokio::test]
        async fn prune_removes_only_old_retired_mappings() {
            let registry = SurfaceSessionRegistry::in_memory("web");
            registry.register("old", "S1", "u", RegisterOptions::default()).await;
            registry.register("live", "S2", "u", RegisterOptions::default()).await;
            registry.deactivate("old").await;

            assert_eq!(registry.prune_inactive(Duration::hours(1)).await, 0);
            assert_eq!(registry.prune_inactive(Duration::seconds(-60)).await, 1);

            assert!(registry.lookup("old").is_none());
            assert!(registry.lookup("live").is_some());
        }

        #[tokio::test]
        async fn listings_are_ordered_by_creation() {
            let registry = SurfaceSessionRegistry::in_memory("web");
            for key in ["z", "y", "x"] {
                registry.register(key, key, "u", RegisterOptions::default()).await;
                tokio::time::sleep(std::time::Duration::from_millis(2)).await;
            }

            let order: Vec<String> = registry
                .list_active()
                .into_iter()
                .map(|m| m.routing_key)
                .collect();
            assert_eq!(order, vec!["z", "y", "x"]);
        }
    }

    mod limits {
        use super::*;

        #[tokio::test]
        async fn fails_exactly_at_the_cap() {
            let registry = SurfaceSessionRegistry::new("web", None, 2);

            assert!(registry.check_limit("alice").is_ok());
            registry.register("a", "S1", "alice", RegisterOptions::default()).await;
            assert!(registry.check_limit("alice").is_ok());
            registry.register("b", "S2", "alice", RegisterOptions::default()).await;

            assert_eq!(registry.list_for_user("alice").len(), 2);
            assert_eq!(
                registry.check_limit("alice"),
                Err(RegistryError::SessionLimitReached {
                    user_id: "alice".to_string(),
                    limit: 2,
                })
            );
        }

        #[tokio::test]
        async fn other_users_are_independent() {
            let registry = SurfaceSessionRegistry::new("web", None, 1);
            registry.register("a", "S1", "alice", RegisterOptions::default()).await;
            registry.register("b", "S2", "bob", RegisterOptions::default()).await;

            assert!(registry.check_limit("alice").is_err());
            assert!(registry.check_limit("bob").is_err());
            assert!(registry.check_limit("carol").is_ok());
        }

        #[tokio::test]
        async fn retired_mappings_free_a_slot() {
            let registry = SurfaceSessionRegistry::new("web", None, 1);
            registry.register("a", "S1", "alice", RegisterOptions::default()).await;
            registry.deactivate("a").await;

            assert!(registry.check_limit("alice").is_ok());
            assert!(registry.list_for_user("alice").is_empty());
        }

        #[test]
        fn default_limit_is_ten() {
            assert_eq!(SurfaceSessionRegistry::in_memory("web").max_per_user(), 10);
        }
    }

    mod persistence {
        use super::*;

        #[tokio::test]
        async fn fresh_instance_reproduces_mappings() {
            let dir = tempdir().unwrap();
            let registry = persisted(dir.path());
            registry
                .register(
                    "C1:T1",
                    "S1",
                    "alice",
                    RegisterOptions::default()
                        .project("proj")
                        .extra("channel_id", "C1")
                        .extra("thread_ts", "T1"),
                )
                .await;
            registry.register("C2", "S2", "bob", RegisterOptions::default()).await;
            registry.register("C3", "S3", "bob", RegisterOptions::default()).await;
            registry.update_activity("C1:T1").await;
            registry.deactivate("C2").await;

            let reloaded = persisted(dir.path());

            assert_eq!(reloaded.list_all(), registry.list_all());
            assert_eq!(reloaded.surface_name(), "slack");
        }

        #[tokio::test]
        async fn removal_is_persisted() {
            let dir = tempdir().unwrap();
            let registry = persisted(dir.path());
            registry.register("a", "S1", "u", RegisterOptions::default()).await;
            registry.register("b", "S2", "u", RegisterOptions::default()).await;
            registry.remove("a").await;

            let reloaded = persisted(dir.path());
            assert!(reloaded.lookup("a").is_none());
            assert!(reloaded.lookup("b").is_some());
        }

        #[tokio::test]
        async fn file_is_a_json_array_in_current_shape() {
            let dir = tempdir().unwrap();
            let registry = persisted(dir.path());
            registry.register("k", "S", "u", RegisterOptions::default()).await;

            let raw = fs::read_to_string(dir.path().join("slack.json")).unwrap();
            let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
            let record = &value.as_array().unwrap()[0];
            for field in [
                "routing_key",
                "session_id",
                "surface",
                "project_id",
                "description",
                "created_by",
                "created_at",
                "last_active",
                "is_active",
                "extra",
            ] {
                assert!(record.get(field).is_some(), "missing {field}");
            }
        }

        #[tokio::test]
        async fn legacy_file_is_upgraded_and_rewritten_on_save() {
            let dir = tempdir().unwrap();
            let path = dir.path().join("slack.json");
            fs::write(
                &path,
                r#"[{"channel_id": "C1", "thread_ts": "T1", "session_id": "S1"}]"#,
            )
            .unwrap();

            let registry = persisted(dir.path());
            let mapping = registry.lookup("C1:T1").unwrap();
            assert_eq!(mapping.extra["channel_id"], "C1");
            assert_eq!(mapping.extra["thread_ts"], "T1");
            assert_eq!(mapping.surface, "slack");

            // Untouched until the next save.
            assert!(!fs::read_to_string(&path).unwrap().contains("routing_key"));

            registry.update_activity("C1:T1").await;
            let raw = fs::read_to_string(&path).unwrap();
            assert!(raw.contains("\"routing_key\": \"C1:T1\""));
        }

        #[tokio::test]
        async fn corrupt_file_starts_empty() {
            let dir = tempdir().unwrap();
            fs::write(dir.path().join("slack.json"), "not json").unwrap();

            let registry = persisted(dir.path());
            assert!(registry.is_empty());
        }

        #[tokio::test]
        async fn save_failure_keeps_in_memory_state() {
            let dir = tempdir().unwrap();
            let blocker = dir.path().join("blocker");
            fs::write(&blocker, "file, not dir").unwrap();
            let registry =
                SurfaceSessionRegistry::new("web", Some(blocker.join("web.json")), 10);

            let mapping = registry.register("k", "S", "u", RegisterOptions::default()).await;

            assert_eq!(registry.lookup("k"), Some(mapping));
            registry.deactivate("k").await;
            assert!(!registry.lookup("k").unwrap().is_active);
        }

        #[tokio::test]
        async fn in_memory_registry_writes_nothing() {
            let registry = SurfaceSessionRegistry::in_memory("web");
            registry.register("k", "S", "u", RegisterOptions::default()).await;
            assert!(registry.persistence_path().is_none());
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
        async fn concurrent_registers_never_corrupt_the_file() {
            let dir = tempdir().unwrap();
            let path = dir.path().join("web.json");
            let registry = Arc::new(SurfaceSessionRegistry::new(
                "web",
                Some(path.clone()),
                100,
            ));

            let tasks: Vec<_> = (0..32)
                .map(|i| {
                    let registry = Arc::clone(&registry);
                    tokio::spawn(async move {
                        registry
                            .register(
                                &format!("key-{i}"),
                                &format!("S{i}"),
                                &format!("user-{}", i % 4),
                                RegisterOptions::default(),
                            )
                            .await
                    })
                })
                .collect();
            for result in futures::future::join_all(tasks).await {
                result.unwrap();
            }

            let raw = fs::read_to_string(&path).unwrap();
            let records: Vec<SessionMapping> = serde_json::from_str(&raw).unwrap();
            let on_disk = keys(&records);
            assert_eq!(records.len(), 32);
            assert_eq!(on_disk, (0..32).map(|i| format!("key-{i}")).collect());
        }
    }
}
