//! Handle to a launched child process.

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::io;
use tracing::debug;

/// A child started by [`ProcessLauncher`](super::ProcessLauncher).
///
/// The handle does not reap the child on drop; call [`wait`](Self::wait) or
/// [`try_wait`](Self::try_wait) to avoid leaving a zombie.
#[derive(Debug)]
pub struct ChildProcess {
    pid: Pid,
    status: Option<WaitStatus>,
}

impl ChildProcess {
    pub(crate) fn new(pid: Pid) -> Self {
        Self { pid, status: None }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// The pid as a plain integer.
    pub fn id(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    /// Block until the child terminates. The status is cached, so repeated
    /// calls return the same value.
    pub fn wait(&mut self) -> io::Result<WaitStatus> {
        if let Some(status) = self.status {
            return Ok(status);
        }

        loop {
            match waitpid(self.pid, None) {
                Ok(status) => {
                    debug!("Child process {} finished: {:?}", self.pid, status);
                    self.status = Some(status);
                    return Ok(status);
                }
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(errno.into()),
            }
        }
    }

    /// Reap the child if it has terminated, without blocking.
    pub fn try_wait(&mut self) -> io::Result<Option<WaitStatus>> {
        if let Some(status) = self.status {
            return Ok(Some(status));
        }

        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => Ok(None),
            Ok(status) => {
                self.status = Some(status);
                Ok(Some(status))
            }
            Err(Errno::EINTR) => Ok(None),
            Err(errno) => Err(errno.into()),
        }
    }

    pub fn has_exited(&self) -> bool {
        self.status.is_some()
    }

    /// Cached termination status, if the child has been reaped.
    pub fn exit_status(&self) -> Option<WaitStatus> {
        self.status
    }

    /// Exit code of a child that exited normally.
    pub fn exit_code(&self) -> Option<i32> {
        match self.status {
            Some(WaitStatus::Exited(_, code)) => Some(code),
            _ => None,
        }
    }

    /// Signal that killed the child, if any.
    pub fn signal(&self) -> Option<Signal> {
        match self.status {
            Some(WaitStatus::Signaled(_, sig, _)) => Some(sig),
            _ => None,
        }
    }

    /// Send `sig` to a child that has not been reaped yet.
    pub fn kill(&self, sig: Signal) -> io::Result<()> {
        if self.has_exited() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "child process has already been reaped",
            ));
        }
        signal::kill(self.pid, sig)?;
        Ok(())
    }
}
