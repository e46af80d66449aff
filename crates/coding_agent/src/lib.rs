//! Streaming coding-agent runtime.
//!
//! A model response arrives as text chunks. [`parser`] turns the growing
//! buffer into narration and action segments, [`task`] presents them in order
//! and gates each action behind approval, and [`executor`] runs at most one
//! action per model turn against the [`workspace`]. File edits expressed as
//! search/replace blocks are applied by the `reconcile_engine` crate.
//!
//! ## Provider bootstrap
//!
//! - `CODING_AGENT_PROVIDER=mock` (default) replays a turn file given with
//!   `--script`. Turns are separated by `=== turn ===` lines; a turn starting
//!   with `!fail <kind>: <message>` fails instead of replying.
//!
//! ## Configuration
//!
//! Set `CODING_AGENT_CONFIG_PATH` to a UTF-8 JSON file with this shape (every
//! field optional):
//!
//! ```json
//! {
//!   "max_consecutive_mistakes": 3,
//!   "auto_approval": {
//!     "read_files": true,
//!     "edit_files": false,
//!     "execute_safe_commands": true,
//!     "execute_all_commands": false,
//!     "max_consecutive_auto_approvals": 20
//!   },
//!   "command_timeout_sec": 30,
//!   "read_max_bytes": 204800,
//!   "checkpoint_dir": ".agent/checkpoints"
//! }
//! ```
//!
//! Contract notes:
//! - Numeric limits must be > 0.
//! - A relative `checkpoint_dir` is resolved against the workspace root.
//! - Unknown JSON fields are rejected.
//!
//! ## System instructions
//!
//! Set `CODING_AGENT_SYSTEM_INSTRUCTIONS` to override the built-in base block.
//! The action protocol is always appended before each model request.
//!
//! ## Logging
//!
//! `CODING_AGENT_LOG` takes a `tracing_subscriber::EnvFilter` directive
//! (default `info`). Logs go to stderr.

pub mod actions;
pub mod checkpoint;
pub mod config;
pub mod console;
pub mod error;
pub mod executor;
pub mod logging;
pub mod parser;
pub mod providers;
pub mod runtime;
pub mod state;
pub mod surface;
pub mod task;
pub mod workspace;
