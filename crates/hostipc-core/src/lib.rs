//! hostipc core - child process launching and buffer transport for
//! multi-process hosts.
//!
//! This crate provides the two pieces a host process needs to run helper
//! processes and talk to them:
//!
//! - `process` launches children with a controlled environment, working
//!   directory and descriptor table, optionally through a sandbox hook.
//! - `ipc` frames messages over a Unix socket and moves large byte buffers
//!   through shared memory instead of the socket.
//!
//! # Example
//!
//! ```rust,ignore
//! use hostipc_core::{Channel, LaunchOptions, ProcessLauncher};
//! use std::os::fd::AsRawFd;
//!
//! fn main() -> hostipc_core::Result<()> {
//!     let (parent_end, child_end) = Channel::pair()?;
//!
//!     let launcher = ProcessLauncher::new();
//!     let options = LaunchOptions::new().remap_fd(child_end.as_raw_fd(), 3);
//!     let mut child = launcher.launch(&["/usr/bin/helper".to_string()], options)?;
//!     drop(child_end);
//!
//!     // ... exchange messages over `parent_end` ...
//!
//!     child.wait()?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod environment;
pub mod error;
pub mod ipc;
pub mod platform;
pub mod process;

// Re-export commonly used types
pub use config::{ChannelConfig, ProcessConfig};
pub use environment::{build_environment_array, EnvironmentArray, EnvironmentMap};
pub use error::{HostIpcError, LaunchError, LaunchStage, ProtocolError, Result};
pub use ipc::{
    read_bytes_or_shmem, write_bytes_or_shmem, Channel, Message, MessageBufferReader,
    MessageBufferWriter, MessageBuilder, MessageCursor, MessageReader, MessageWriter,
    SharedMemory,
};
pub use process::{
    ChildProcess, EnvironmentLog, LaunchEventLog, LaunchOptions, LauncherKind, NullLog,
    ProcessLauncher, SandboxOptions,
};
