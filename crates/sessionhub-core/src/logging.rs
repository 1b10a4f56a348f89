//! Per-session transcript logs.
//!
//! Application logging goes through the `log` facade. This module is only
//! for the raw runtime traffic of one session (what was sent on stdin, what
//! came back), appended to `<log_dir>/<session_id>.log`.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};

/// Shared handle to an append-only transcript file. `None` disables logging.
pub type LogHandle = Arc<Mutex<Option<File>>>;

/// A handle that discards everything.
pub fn disabled_log() -> LogHandle {
    Arc::new(Mutex::new(None))
}

/// Append `[timestamp] DIRECTION: data` to the transcript, if enabled.
pub fn log_line(handle: &LogHandle, direction: &str, data: &str) {
    if let Ok(mut guard) = handle.lock() {
        if let Some(file) = guard.as_mut() {
            let ts = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
            let _ = writeln!(file, "[{ts}] {direction}: {data}");
            let _ = file.flush();
        }
    }
}

/// Open (or create) `<log_dir>/<log_id>.log`.
///
/// Any failure yields a disabled handle; transcripts are best-effort.
pub fn open_log_file(log_dir: Option<&Path>, log_id: &str) -> LogHandle {
    let file = log_dir.and_then(|dir| {
        if let Err(e) = std::fs::create_dir_all(dir) {
            log::warn!("Cannot create transcript dir {}: {}", dir.display(), e);
            return None;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(format!("{log_id}.log")))
            .map_err(|e| log::warn!("Cannot open transcript for {}: {}", log_id, e))
            .ok()
    });
    Arc::new(Mutex::new(file))
}
