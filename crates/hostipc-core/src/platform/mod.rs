//! Platform abstraction layer.
//!
//! All raw syscalls and `#[cfg]` branches for OS-specific behavior live here
//! rather than scattered through the launcher and channel code.
//!
//! - `fds` - descriptor queries, close-on-exec pipes, and the descriptor sweep
//!   run in a forked child
//! - `fork` - plain `fork(2)` and the Linux `clone(2)` namespace variant
//!
//! # Supported Platforms
//!
//! - **Linux**: Full support, including namespace flags for sandboxed launches
//! - **Other Unix**: Plain fork only

pub mod fds;
pub mod fork;

pub use fds::{cloexec_pipe, descriptor_limit, is_open, set_cloexec};
pub use fork::{fork_process, fork_with_flags};

/// Returns the current platform name.
pub fn current_platform() -> &'static str {
    #[cfg(target_os = "linux")]
    {
        "linux"
    }
    #[cfg(target_os = "macos")]
    {
        "macos"
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        "unix"
    }
}

/// Whether `clone(2)` namespace flags are available for sandboxed launches.
pub fn supports_namespaces() -> bool {
    cfg!(target_os = "linux")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_platform() {
        let platform = current_platform();
        assert!(["linux", "macos", "unix"].contains(&platform));
    }

    #[test]
    fn test_namespaces_only_on_linux() {
        #[cfg(target_os = "linux")]
        assert!(supports_namespaces());
        #[cfg(not(target_os = "linux"))]
        assert!(!supports_namespaces());
    }
}
