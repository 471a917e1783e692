//! Launch options.

use crate::environment::EnvironmentMap;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};

/// Everything that describes one launch besides argv.
///
/// Consumed by exactly one call to [`ProcessLauncher::launch`](super::ProcessLauncher::launch).
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    /// Complete `KEY=VALUE` environment. When set, `env_map` is ignored.
    pub full_env: Option<Vec<String>>,
    /// Changes applied on top of the parent's environment.
    pub env_map: EnvironmentMap,
    /// Working directory for the child; `None` inherits the parent's.
    pub workdir: Option<PathBuf>,
    /// `(source, target)` pairs: the child sees `source` at `target`.
    pub fds_to_remap: Vec<(RawFd, RawFd)>,
    /// Block until the child terminates before returning.
    pub wait: bool,
    /// Parameters consumed by the sandboxed launch hook.
    pub sandbox: SandboxOptions,
    /// Report chdir/dup2/exec failures back to the parent through a pipe.
    pub report_child_errors: bool,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            full_env: None,
            env_map: EnvironmentMap::new(),
            workdir: None,
            fds_to_remap: Vec::new(),
            wait: false,
            sandbox: SandboxOptions::default(),
            report_child_errors: true,
        }
    }
}

impl LaunchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an environment change. An empty value removes the variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_map.insert(key.into(), value.into());
        self
    }

    /// Replace the whole environment with these `KEY=VALUE` entries.
    pub fn with_full_env<I, S>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.full_env = Some(entries.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_workdir(mut self, dir: impl AsRef<Path>) -> Self {
        self.workdir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Make the parent's `source` descriptor appear as `target` in the child.
    pub fn remap_fd(mut self, source: RawFd, target: RawFd) -> Self {
        self.fds_to_remap.push((source, target));
        self
    }

    pub fn with_wait(mut self, wait: bool) -> Self {
        self.wait = wait;
        self
    }

    pub fn with_sandbox(mut self, sandbox: SandboxOptions) -> Self {
        self.sandbox = sandbox;
        self
    }

    pub fn with_child_error_reporting(mut self, enabled: bool) -> Self {
        self.report_child_errors = enabled;
        self
    }
}

/// Namespaces a sandboxed child is created in (Linux `clone(2)` flags).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NamespaceFlags {
    pub user: bool,
    pub pid: bool,
    pub net: bool,
    pub ipc: bool,
    pub uts: bool,
}

impl NamespaceFlags {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// The `CLONE_NEW*` bits for these namespaces; 0 on non-Linux targets.
    pub fn clone_flags(&self) -> libc::c_int {
        #[cfg(target_os = "linux")]
        {
            let mut flags = 0;
            if self.user {
                flags |= libc::CLONE_NEWUSER;
            }
            if self.pid {
                flags |= libc::CLONE_NEWPID;
            }
            if self.net {
                flags |= libc::CLONE_NEWNET;
            }
            if self.ipc {
                flags |= libc::CLONE_NEWIPC;
            }
            if self.uts {
                flags |= libc::CLONE_NEWUTS;
            }
            flags
        }

        #[cfg(not(target_os = "linux"))]
        {
            0
        }
    }
}

/// Sandbox parameters read by [`SandboxLaunch`](super::SandboxLaunch).
#[derive(Debug, Clone, Default)]
pub struct SandboxOptions {
    /// Broker socket installed at `ProcessConfig::SANDBOX_BROKER_FD` in the child.
    pub broker_fd: Option<RawFd>,
    pub namespaces: NamespaceFlags,
}

impl SandboxOptions {
    pub fn with_broker_fd(mut self, fd: RawFd) -> Self {
        self.broker_fd = Some(fd);
        self
    }

    pub fn with_namespaces(mut self, namespaces: NamespaceFlags) -> Self {
        self.namespaces = namespaces;
        self
    }
}
