//! Child process launching.
//!
//! This module provides:
//! - `ProcessLauncher` - fork/exec with descriptor remapping and a clean
//!   descriptor table in the child
//! - `LaunchOptions` - environment, working directory, remaps and sandbox
//!   parameters for one launch
//! - `LaunchHook` - plain and sandboxed fork strategies
//! - `LaunchEventLog` - optional record of every launched child
//!
//! Everything the child needs is built before the fork; the child itself only
//! runs async-signal-safe calls until `execve`.

mod handle;
mod hook;
mod launcher;
mod log;
mod options;
mod plan;
mod shuffle;

pub use handle::ChildProcess;
pub use hook::{LaunchHook, LauncherKind, PlainFork, SandboxLaunch};
pub use launcher::ProcessLauncher;
pub use log::{EnvironmentLog, LaunchEventLog, NullLog};
pub use options::{LaunchOptions, NamespaceFlags, SandboxOptions};
pub use shuffle::FileDescriptorShuffle;
