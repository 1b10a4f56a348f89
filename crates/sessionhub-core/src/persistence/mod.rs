//! Persistence helpers.
//!
//! # File Locations
//!
//! Everything SessionHub writes lives under the data directory:
//!
//! ```text
//! ~/.sessionhub/                  (or --data-dir)
//! ├── config.json                 # CoreConfig
//! ├── registries/
//! │   └── <surface>.json          # SurfaceSessionRegistry mappings
//! ├── runtime/
//! │   └── sessions.json           # ClaudeCliRuntime session index
//! └── logs/
//!     └── <session_id>.log        # Per-session runtime transcripts
//! ```
//!
//! # Atomic Writes
//!
//! Every save goes through [`atomic_write`]: write to a temp file in the
//! target directory, fsync, then rename over the target. Readers see either
//! the old file or the new one, never a partial write.

mod atomic;

pub use atomic::atomic_write;
