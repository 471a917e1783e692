//! File descriptor helpers.
//!
//! The parent-side helpers go through `nix`. `close_superfluous` is called in
//! a forked child and therefore sticks to raw `libc` calls: no allocation, no
//! locks, no logging.

#![allow(unsafe_code)]

use crate::config::ProcessConfig;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::resource::{getrlimit, Resource};
use std::io;
use std::os::fd::{OwnedFd, RawFd};

/// Whether `fd` refers to an open descriptor in this process.
pub fn is_open(fd: RawFd) -> bool {
    fd >= 0 && fcntl(fd, FcntlArg::F_GETFD).is_ok()
}

/// Set or clear `FD_CLOEXEC` on `fd`.
pub fn set_cloexec(fd: RawFd, cloexec: bool) -> io::Result<()> {
    let bits = fcntl(fd, FcntlArg::F_GETFD)?;
    let mut flags = FdFlag::from_bits_truncate(bits);
    flags.set(FdFlag::FD_CLOEXEC, cloexec);
    fcntl(fd, FcntlArg::F_SETFD(flags))?;
    Ok(())
}

/// Create a pipe whose two ends are close-on-exec.
///
/// Returns `(read_end, write_end)`.
pub fn cloexec_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        use nix::fcntl::OFlag;
        Ok(nix::unistd::pipe2(OFlag::O_CLOEXEC)?)
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        use std::os::fd::AsRawFd;
        let (read_end, write_end) = nix::unistd::pipe()?;
        set_cloexec(read_end.as_raw_fd(), true)?;
        set_cloexec(write_end.as_raw_fd(), true)?;
        Ok((read_end, write_end))
    }
}

/// One past the highest descriptor number this process may hold.
///
/// Queried before forking so the child's descriptor sweep has a bound even
/// when `close_range` is unavailable.
pub fn descriptor_limit() -> RawFd {
    match getrlimit(Resource::RLIMIT_NOFILE) {
        Ok((soft, _)) if soft != libc::RLIM_INFINITY => {
            RawFd::try_from(soft).unwrap_or(ProcessConfig::FALLBACK_FD_LIMIT)
        }
        _ => ProcessConfig::FALLBACK_FD_LIMIT,
    }
}

/// Close every descriptor above stderr that is not listed in `keep`.
///
/// `keep` must be sorted ascending. Async-signal-safe.
pub fn close_superfluous(keep: &[RawFd], limit: RawFd) {
    let mut next = libc::STDERR_FILENO + 1;
    for &fd in keep {
        if fd < next {
            continue;
        }
        if fd > next {
            close_fd_range(next, fd - 1, limit);
        }
        next = fd + 1;
    }
    close_fd_range(next, RawFd::MAX, limit);
}

/// Close `first..=last`. Async-signal-safe.
fn close_fd_range(first: RawFd, last: RawFd, limit: RawFd) {
    #[cfg(target_os = "linux")]
    {
        // SAFETY: close_range only touches this process's descriptor table.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_close_range,
                first as libc::c_uint,
                last as libc::c_uint,
                0 as libc::c_uint,
            )
        };
        if rc == 0 {
            return;
        }
    }

    let end = last.min(limit.saturating_sub(1));
    let mut fd = first;
    while fd <= end {
        // SAFETY: closing a descriptor number we do not own is harmless in a
        // child that is about to exec; EBADF is ignored.
        unsafe {
            libc::close(fd);
        }
        fd += 1;
    }
}
