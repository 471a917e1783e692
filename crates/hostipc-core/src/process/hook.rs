//! Launch hooks: the pluggable pieces of a launch that differ between plain
//! and sandboxed children.

#![allow(unsafe_code)]

use super::options::LaunchOptions;
use crate::config::ProcessConfig;
use crate::platform;
use nix::errno::Errno;
use nix::unistd::ForkResult;
use serde::{Deserialize, Serialize};
use std::io;
use tracing::{debug, warn};

/// Adjusts options before a launch and performs the fork.
pub trait LaunchHook: Send {
    /// Short name for log output.
    fn name(&self) -> &'static str;

    /// Validate and rewrite `options` before any descriptor work happens.
    fn prepare(&mut self, options: &mut LaunchOptions) -> io::Result<()>;

    /// Create the child process.
    ///
    /// # Safety
    ///
    /// In the child, the caller may only run async-signal-safe code until it
    /// execs or exits.
    unsafe fn fork(&self) -> nix::Result<ForkResult>;
}

/// No preparation; plain `fork(2)`.
#[derive(Debug, Default)]
pub struct PlainFork;

impl LaunchHook for PlainFork {
    fn name(&self) -> &'static str {
        "plain"
    }

    fn prepare(&mut self, _options: &mut LaunchOptions) -> io::Result<()> {
        Ok(())
    }

    unsafe fn fork(&self) -> nix::Result<ForkResult> {
        // SAFETY: forwarded to the caller.
        unsafe { platform::fork_process() }
    }
}

/// Installs the sandbox broker descriptor and forks into new namespaces.
#[derive(Debug, Default)]
pub struct SandboxLaunch {
    clone_flags: libc::c_int,
}

impl SandboxLaunch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flags chosen by the last successful `prepare`.
    pub fn clone_flags(&self) -> libc::c_int {
        self.clone_flags
    }
}

impl LaunchHook for SandboxLaunch {
    fn name(&self) -> &'static str {
        "sandbox"
    }

    fn prepare(&mut self, options: &mut LaunchOptions) -> io::Result<()> {
        let target = ProcessConfig::SANDBOX_BROKER_FD;

        if let Some(broker) = options.sandbox.broker_fd {
            if !platform::is_open(broker) {
                warn!("Sandbox broker descriptor {} is not open", broker);
                return Err(Errno::EBADF.into());
            }
            if options.fds_to_remap.iter().any(|&(_, dst)| dst == target) {
                warn!("Descriptor {} is reserved for the sandbox broker", target);
                return Err(Errno::EINVAL.into());
            }
            if options.fds_to_remap.iter().any(|&(src, _)| src == broker) {
                warn!("Sandbox broker {} is already remapped", broker);
                return Err(Errno::EINVAL.into());
            }
            options.fds_to_remap.push((broker, target));
            export_broker_fd(options, target);
            debug!("Sandbox broker {} will appear as fd {}", broker, target);
        }

        let namespaces = options.sandbox.namespaces;
        if !namespaces.is_empty() && !platform::supports_namespaces() {
            warn!(
                "Namespace isolation requested on {}, which does not support it",
                platform::current_platform()
            );
            return Err(Errno::ENOSYS.into());
        }
        self.clone_flags = namespaces.clone_flags();
        Ok(())
    }

    unsafe fn fork(&self) -> nix::Result<ForkResult> {
        // SAFETY: forwarded to the caller.
        unsafe { platform::fork_with_flags(self.clone_flags) }
    }
}

fn export_broker_fd(options: &mut LaunchOptions, target: i32) {
    let key = ProcessConfig::SANDBOX_BROKER_FD_ENV;
    match options.full_env.as_mut() {
        Some(entries) => {
            let prefix = format!("{}=", key);
            entries.retain(|entry| !entry.starts_with(&prefix));
            entries.push(format!("{}{}", prefix, target));
        }
        None => {
            options.env_map.insert(key.to_string(), target.to_string());
        }
    }
}

/// Which launch hook a [`ProcessLauncher`](super::ProcessLauncher) uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LauncherKind {
    #[default]
    Plain,
    Sandboxed,
}

impl LauncherKind {
    /// A fresh hook for one launch attempt.
    pub fn new_hook(&self) -> Box<dyn LaunchHook> {
        match self {
            LauncherKind::Plain => Box::new(PlainFork),
            LauncherKind::Sandboxed => Box::new(SandboxLaunch::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::cloexec_pipe;
    use crate::process::options::SandboxOptions;
    use std::os::fd::AsRawFd;

    #[test]
    fn test_plain_prepare_leaves_options_alone() {
        let mut options = LaunchOptions::new().remap_fd(5, 3);
        PlainFork.prepare(&mut options).unwrap();
        assert_eq!(options.fds_to_remap, vec![(5, 3)]);
        assert!(options.env_map.is_empty());
    }

    #[test]
    fn test_sandbox_injects_broker() {
        let (broker, _w) = cloexec_pipe().unwrap();
        let mut options = LaunchOptions::new()
            .with_sandbox(SandboxOptions::default().with_broker_fd(broker.as_raw_fd()));

        SandboxLaunch::new().prepare(&mut options).unwrap();
        assert_eq!(
            options.fds_to_remap,
            vec![(broker.as_raw_fd(), ProcessConfig::SANDBOX_BROKER_FD)]
        );
        assert_eq!(
            options.env_map.get(ProcessConfig::SANDBOX_BROKER_FD_ENV),
            Some(&"10".to_string())
        );
    }

    #[test]
    fn test_sandbox_replaces_broker_entry_in_full_env() {
        let (broker, _w) = cloexec_pipe().unwrap();
        let stale = format!("{}=99", ProcessConfig::SANDBOX_BROKER_FD_ENV);
        let mut options = LaunchOptions::new()
            .with_full_env(["A=1".to_string(), stale])
            .with_sandbox(SandboxOptions::default().with_broker_fd(broker.as_raw_fd()));

        SandboxLaunch::new().prepare(&mut options).unwrap();
        let entries = options.full_env.unwrap();
        assert_eq!(
            entries,
            vec![
                "A=1".to_string(),
                format!("{}=10", ProcessConfig::SANDBOX_BROKER_FD_ENV)
            ]
        );
    }

    #[test]
    fn test_sandbox_rejects_closed_broker() {
        let mut options = LaunchOptions::new()
            .with_sandbox(SandboxOptions::default().with_broker_fd(1_000_000));
        let err = SandboxLaunch::new().prepare(&mut options).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EBADF));
    }

    #[test]
    fn test_sandbox_rejects_reserved_target() {
        let (broker, other) = cloexec_pipe().unwrap();
        let mut options = LaunchOptions::new()
            .remap_fd(other.as_raw_fd(), ProcessConfig::SANDBOX_BROKER_FD)
            .with_sandbox(SandboxOptions::default().with_broker_fd(broker.as_raw_fd()));
        let err = SandboxLaunch::new().prepare(&mut options).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
    }

    #[test]
    fn test_sandbox_rejects_broker_that_is_already_remapped() {
        let (broker, _w) = cloexec_pipe().unwrap();
        let mut options = LaunchOptions::new()
            .remap_fd(broker.as_raw_fd(), 3)
            .with_sandbox(SandboxOptions::default().with_broker_fd(broker.as_raw_fd()));
        let err = SandboxLaunch::new().prepare(&mut options).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
        assert_eq!(options.fds_to_remap, vec![(broker.as_raw_fd(), 3)]);
    }

    #[test]
    fn test_sandbox_without_broker_or_namespaces_is_plain() {
        let mut options = LaunchOptions::new();
        let mut hook = SandboxLaunch::new();
        hook.prepare(&mut options).unwrap();
        assert_eq!(hook.clone_flags(), 0);
        assert!(options.fds_to_remap.is_empty());
    }

    #[test]
    fn test_launcher_kind_hooks() {
        assert_eq!(LauncherKind::default(), LauncherKind::Plain);
        assert_eq!(LauncherKind::Plain.new_hook().name(), "plain");
        assert_eq!(LauncherKind::Sandboxed.new_hook().name(), "sandbox");
    }

    #[test]
    fn test_launcher_kind_names() {
        assert_eq!(
            serde_json::to_string(&LauncherKind::Sandboxed).unwrap(),
            "\"sandboxed\""
        );
        assert_eq!(
            serde_json::from_str::<LauncherKind>("\"plain\"").unwrap(),
            LauncherKind::Plain
        );
    }
}
