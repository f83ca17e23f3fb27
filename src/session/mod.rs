//! Shell Session Module
//!
//! Shell and exec channels are relayed through the relay helper's
//! stdin/stdout. This module owns the helper process contract and the
//! shell task built on it.

pub mod helper;
mod attach;
mod shell;

pub use attach::run_interactive;
pub use helper::{HelperInvocation, RelayHelper, DEFAULT_HELPER};
pub use shell::{exec_snippet, spawn_shell, ShellMode, ShellTask, EOF_MARKER};
