//! Process creation primitives.

#![allow(unsafe_code)]

use nix::errno::Errno;
use nix::unistd::{ForkResult, Pid};

/// Plain `fork(2)`.
///
/// # Safety
///
/// In the child, only async-signal-safe operations are permitted until the
/// process execs or exits.
pub unsafe fn fork_process() -> nix::Result<ForkResult> {
    // SAFETY: forwarded to the caller.
    unsafe { nix::unistd::fork() }
}

/// Fork with extra `clone(2)` flags (namespace creation).
///
/// With no flags this is plain `fork`. Unlike `fork`, the raw `clone` syscall
/// does not run `pthread_atfork` handlers, so the child must not touch the
/// allocator at all.
///
/// # Safety
///
/// Same contract as [`fork_process`].
pub unsafe fn fork_with_flags(flags: libc::c_int) -> nix::Result<ForkResult> {
    if flags == 0 {
        // SAFETY: forwarded to the caller.
        return unsafe { fork_process() };
    }

    #[cfg(target_os = "linux")]
    {
        // A null stack makes the child continue on a copy of the parent's
        // stack, like fork. The tid/tls arguments are unused without the
        // matching CLONE_* flags.
        // SAFETY: forwarded to the caller.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_clone,
                (flags | libc::SIGCHLD) as libc::c_ulong,
                0usize,
                0usize,
                0usize,
                0usize,
            )
        };
        match rc {
            -1 => Err(Errno::last()),
            0 => Ok(ForkResult::Child),
            pid => Ok(ForkResult::Parent {
                child: Pid::from_raw(pid as libc::pid_t),
            }),
        }
    }

    #[cfg(not(target_os = "linux"))]
    {
        Err(Errno::ENOSYS)
    }
}
