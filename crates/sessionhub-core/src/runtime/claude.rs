//! Claude Code CLI as an agent runtime.
//!
//! Every turn is one `claude -p --output-format json` process in the
//! session's working directory. The first turn pins the conversation id with
//! `--session-id`, later turns continue it with `--resume`. Claude keeps the
//! transcript itself, so resuming after a restart only needs the session id
//! and the directory it was started in; both are kept in a small index file
//! (`<state_dir>/sessions.json`).

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use super::{AgentRuntime, RuntimeError, RuntimeHandle};
use crate::config::{BundleConfig, ClaudeRuntimeConfig};
use crate::logging::{log_line, open_log_file, LogHandle};
use crate::persistence::atomic_write;
use crate::session::project_id_for;
use crate::shell::{login_shell_command, resolve_binary};

const INDEX_FILE: &str = "sessions.json";

/// Final object printed by `claude -p --output-format json`.
///
/// ```json
/// {"type":"result","subtype":"success","is_error":false,"result":"Done.","session_id":"..."}
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct ClaudeResult {
    #[serde(rename = "type")]
    pub event_type: String,

    #[serde(default)]
    pub subtype: Option<String>,

    #[serde(default)]
    pub is_error: bool,

    #[serde(default)]
    pub result: Option<String>,

    #[serde(default)]
    pub session_id: Option<String>,
}

impl ClaudeResult {
    /// Find the result object in CLI stdout.
    ///
    /// Accepts a single JSON document, or line-delimited output where the
    /// result is the last `"type":"result"` line.
    pub fn parse(stdout: &str) -> Result<Self, RuntimeError> {
        let trimmed = stdout.trim();
        if let Ok(result) = serde_json::from_str::<ClaudeResult>(trimmed) {
            if result.event_type == "result" {
                return Ok(result);
            }
        }

        trimmed
            .lines()
            .rev()
            .filter_map(|line| serde_json::from_str::<ClaudeResult>(line.trim()).ok())
            .find(|r| r.event_type == "result")
            .ok_or_else(|| RuntimeError::Protocol("no result object in agent output".to_string()))
    }
}

/// What the runtime remembers about a session across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct IndexEntry {
    working_dir: String,
    project_id: String,
    #[serde(default)]
    bundle_name: Option<String>,
    #[serde(default)]
    turns: u64,
}

/// Session index, optionally mirrored to disk.
struct SessionIndex {
    path: Option<PathBuf>,
    entries: AsyncMutex<BTreeMap<String, IndexEntry>>,
}

impl SessionIndex {
    fn open(state_dir: Option<&Path>) -> Self {
        let path = state_dir.map(|dir| dir.join(INDEX_FILE));
        let entries = path.as_deref().map(load_index).unwrap_or_default();
        Self {
            path,
            entries: AsyncMutex::new(entries),
        }
    }

    async fn get(&self, session_id: &str) -> Option<IndexEntry> {
        self.entries.lock().await.get(session_id).cloned()
    }

    /// Apply `change` and save while still holding the lock, so saves never
    /// land out of order.
    async fn update<F>(&self, change: F)
    where
        F: FnOnce(&mut BTreeMap<String, IndexEntry>),
    {
        let mut entries = self.entries.lock().await;
        change(&mut entries);

        let Some(path) = self.path.clone() else {
            return;
        };
        let json = match serde_json::to_vec_pretty(&*entries) {
            Ok(json) => json,
            Err(e) => {
                log::warn!("Failed to serialize runtime session index: {}", e);
                return;
            }
        };
        let written = tokio::task::spawn_blocking(move || atomic_write(&path, &json)).await;
        match written {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::warn!("Failed to save runtime session index: {}", e),
            Err(e) => log::warn!("Runtime session index save task failed: {}", e),
        }
    }
}

fn load_index(path: &Path) -> BTreeMap<String, IndexEntry> {
    if !path.exists() {
        return BTreeMap::new();
    }
    match fs::read_to_string(path).map(|s| serde_json::from_str(&s)) {
        Ok(Ok(entries)) => entries,
        Ok(Err(e)) => {
            log::warn!("Ignoring corrupt session index {}: {}", path.display(), e);
            BTreeMap::new()
        }
        Err(e) => {
            log::warn!("Cannot read session index {}: {}", path.display(), e);
            BTreeMap::new()
        }
    }
}

/// Arguments for one print-mode turn.
fn build_args(session_id: &str, resume: bool, bundle: Option<&BundleConfig>) -> Vec<String> {
    let mut args = vec![
        "-p".to_string(),
        "--output-format".to_string(),
        "json".to_string(),
    ];

    if resume {
        args.push("--resume".to_string());
    } else {
        args.push("--session-id".to_string());
    }
    args.push(session_id.to_string());

    if let Some(bundle) = bundle {
        if let Some(model) = bundle.model.as_deref().filter(|m| !m.is_empty()) {
            args.push("--model".to_string());
            args.push(model.to_string());
        }
        if let Some(mode) = bundle.permission_mode.as_deref().filter(|m| !m.is_empty()) {
            args.push("--permission-mode".to_string());
            args.push(mode.to_string());
        }
        if let Some(prompt) = bundle.system_prompt.as_deref().filter(|p| !p.is_empty()) {
            args.push("--append-system-prompt".to_string());
            args.push(prompt.to_string());
        }
        args.extend(bundle.extra_args.iter().cloned());
    }

    args
}

/// Live handle on one Claude conversation.
pub struct ClaudeHandle {
    session_id: String,
    project_id: String,
    working_dir: String,
    bundle: Option<BundleConfig>,
    binary_path: String,
    shell_prefix: Option<String>,
    turns: AtomicU64,
    log_file: LogHandle,
    index: Arc<SessionIndex>,
}

impl ClaudeHandle {
    /// Number of turns the CLI has answered, including error results.
    pub fn turns(&self) -> u64 {
        self.turns.load(Ordering::SeqCst)
    }

    fn args(&self) -> Vec<String> {
        build_args(&self.session_id, self.turns() > 0, self.bundle.as_ref())
    }

    async fn record_turn(&self) {
        let turns = self.turns.fetch_add(1, Ordering::SeqCst) + 1;
        let session_id = self.session_id.clone();
        self.index
            .update(move |entries| {
                if let Some(entry) = entries.get_mut(&session_id) {
                    entry.turns = turns;
                }
            })
            .await;
    }
}

#[async_trait]
impl RuntimeHandle for ClaudeHandle {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn project_id(&self) -> &str {
        &self.project_id
    }

    fn working_dir(&self) -> &str {
        &self.working_dir
    }

    async fn run(&self, message: &str) -> Result<String, RuntimeError> {
        let mut cmd = login_shell_command(
            &self.binary_path,
            &self.args(),
            Some(&self.working_dir),
            self.shell_prefix.as_deref(),
        )
        .map_err(RuntimeError::InvalidState)?;
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        log_line(&self.log_file, "STDIN", message);
        let mut child = cmd
            .spawn()
            .map_err(|e| RuntimeError::Unreachable(format!("failed to spawn agent: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(message.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        for line in stdout.lines() {
            log_line(&self.log_file, "STDOUT", line);
        }
        for line in stderr.lines() {
            log::debug!("agent stderr [{}]: {}", self.session_id, line);
            log_line(&self.log_file, "STDERR", line);
        }

        // A printed result means the CLI has stored the conversation, even
        // for error results, so the next turn must resume it.
        let parsed = ClaudeResult::parse(&stdout);
        if parsed.is_ok() {
            self.record_turn().await;
        }

        if !output.status.success() {
            if stderr.contains("No conversation found") {
                return Err(RuntimeError::NotFound(self.session_id.clone()));
            }
            return Err(RuntimeError::Protocol(format!(
                "agent exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let result = parsed?;
        if result.is_error {
            return Err(RuntimeError::Protocol(format!(
                "agent reported {}: {}",
                result.subtype.as_deref().unwrap_or("error"),
                result.result.as_deref().unwrap_or("")
            )));
        }

        Ok(result.result.unwrap_or_default())
    }
}

/// [`AgentRuntime`] driving the Claude Code CLI.
pub struct ClaudeCliRuntime {
    config: ClaudeRuntimeConfig,
    index: Arc<SessionIndex>,
}

impl ClaudeCliRuntime {
    /// Create the runtime, loading the session index from `state_dir`.
    pub fn new(config: ClaudeRuntimeConfig) -> Self {
        let index = Arc::new(SessionIndex::open(config.state_dir.as_deref()));
        Self { config, index }
    }

    fn bundle(&self, name: Option<&str>) -> Option<BundleConfig> {
        let name = name?;
        match self.config.bundles.get(name) {
            Some(bundle) => Some(bundle.clone()),
            None => {
                log::warn!("Unknown bundle '{}', using runtime defaults", name);
                None
            }
        }
    }

    fn handle(&self, session_id: &str, entry: &IndexEntry) -> Arc<ClaudeHandle> {
        Arc::new(ClaudeHandle {
            session_id: session_id.to_string(),
            project_id: entry.project_id.clone(),
            working_dir: entry.working_dir.clone(),
            bundle: self.bundle(entry.bundle_name.as_deref()),
            binary_path: self.config.binary_path.clone(),
            shell_prefix: self.config.shell_prefix.clone(),
            turns: AtomicU64::new(entry.turns),
            log_file: open_log_file(self.config.log_dir.as_deref(), session_id),
            index: Arc::clone(&self.index),
        })
    }
}

#[async_trait]
impl AgentRuntime for ClaudeCliRuntime {
    async fn create_session(
        &self,
        working_dir: &str,
        bundle_name: Option<&str>,
    ) -> Result<Arc<dyn RuntimeHandle>, RuntimeError> {
        if resolve_binary(&self.config.binary_path).is_none() {
            return Err(RuntimeError::Unreachable(format!(
                "agent binary not found: {}",
                self.config.binary_path
            )));
        }
        if !Path::new(working_dir).is_dir() {
            return Err(RuntimeError::InvalidState(format!(
                "working directory does not exist: {working_dir}"
            )));
        }

        let session_id = Uuid::new_v4().to_string();
        let entry = IndexEntry {
            working_dir: working_dir.to_string(),
            project_id: project_id_for(working_dir),
            bundle_name: bundle_name.map(str::to_string),
            turns: 0,
        };

        let handle: Arc<dyn RuntimeHandle> = self.handle(&session_id, &entry);
        let key = session_id.clone();
        self.index
            .update(move |entries| {
                entries.insert(key, entry);
            })
            .await;

        log::debug!("Claude runtime created session {}", session_id);
        Ok(handle)
    }

    async fn resume_session(
        &self,
        session_id: &str,
    ) -> Result<Arc<dyn RuntimeHandle>, RuntimeError> {
        let entry = self
            .index
            .get(session_id)
            .await
            .ok_or_else(|| RuntimeError::NotFound(session_id.to_string()))?;

        if !Path::new(&entry.working_dir).is_dir() {
            return Err(RuntimeError::InvalidState(format!(
                "working directory for {} is gone: {}",
                session_id, entry.working_dir
            )));
        }

        log::debug!(
            "Claude runtime resumed session {} after {} turns",
            session_id,
            entry.turns
        );
        let handle: Arc<dyn RuntimeHandle> = self.handle(session_id, &entry);
        Ok(handle)
    }

    async fn end_session(&self, handle: Arc<dyn RuntimeHandle>) -> Result<(), RuntimeError> {
        let session_id = handle.session_id().to_string();
        self.index
            .update(move |entries| {
                entries.remove(&session_id);
            })
            .await;
        Ok(())
    }
}
