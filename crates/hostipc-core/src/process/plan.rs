//! Pre-fork preparation and post-fork commit of a child launch.
//!
//! Everything the child touches is built by [`ChildPlan::new`] in the parent.
//! [`ChildPlan::commit`] then runs in the forked child using only
//! async-signal-safe calls: `chdir`, `dup2`, `close_range`/`close`, `execve`,
//! `write` and `_exit`. It never allocates, locks or logs.

#![allow(unsafe_code)]

use super::shuffle::FileDescriptorShuffle;
use crate::config::ProcessConfig;
use crate::environment::EnvironmentArray;
use crate::error::{LaunchError, LaunchStage};
use crate::platform::fds::close_superfluous;
use nix::errno::Errno;
use std::ffi::CString;
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{OwnedFd, RawFd};
use std::os::raw::c_char;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

/// Size of a child failure record: stage code then errno, both little-endian.
pub(crate) const FAILURE_RECORD_LEN: usize = 8;

/// Buffers and descriptor bookkeeping for one forked child.
pub(crate) struct ChildPlan {
    // Owns the strings `argv_ptrs` points into.
    _argv: Vec<CString>,
    argv_ptrs: Vec<*const c_char>,
    program: *const c_char,
    env: EnvironmentArray,
    workdir: Option<CString>,
    dup2_sequence: Vec<(RawFd, RawFd)>,
    keep: Vec<RawFd>,
    fd_limit: RawFd,
    error_fd: Option<RawFd>,
}

impl ChildPlan {
    pub(crate) fn new(
        argv: &[String],
        env: EnvironmentArray,
        workdir: Option<&Path>,
        shuffle: &FileDescriptorShuffle,
        error_fd: Option<RawFd>,
        fd_limit: RawFd,
    ) -> Result<Self, LaunchError> {
        if argv.is_empty() {
            return Err(LaunchError::invalid("argv is empty"));
        }

        let owned = argv
            .iter()
            .map(|arg| CString::new(arg.as_bytes()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| LaunchError::invalid("argument contains a NUL byte"))?;

        let mut argv_ptrs: Vec<*const c_char> = owned.iter().map(|arg| arg.as_ptr()).collect();
        argv_ptrs.push(std::ptr::null());
        let program = argv_ptrs[0];

        let workdir = workdir
            .map(|dir| CString::new(dir.as_os_str().as_bytes()))
            .transpose()
            .map_err(|_| LaunchError::invalid("working directory contains a NUL byte"))?;

        let mut keep = shuffle.targets_sorted().to_vec();
        if let Some(fd) = error_fd {
            keep.push(fd);
            keep.sort_unstable();
        }

        Ok(Self {
            _argv: owned,
            argv_ptrs,
            program,
            env,
            workdir,
            dup2_sequence: shuffle.dup2_sequence().to_vec(),
            keep,
            fd_limit,
            error_fd,
        })
    }

    /// Descriptors that survive the sweep in the child, ascending.
    #[cfg(test)]
    pub(crate) fn kept_descriptors(&self) -> &[RawFd] {
        &self.keep
    }

    /// Turn the forked child into the target program.
    ///
    /// # Safety
    ///
    /// Must only be called in a freshly forked child, exactly once. Any
    /// failure terminates the process with exit code 127.
    pub(crate) unsafe fn commit(&self) -> ! {
        if let Some(dir) = &self.workdir {
            // SAFETY: `dir` is a valid C string owned by the plan.
            if unsafe { libc::chdir(dir.as_ptr()) } != 0 {
                self.fail(LaunchStage::Chdir);
            }
        }

        for &(from, to) in &self.dup2_sequence {
            loop {
                // SAFETY: plain descriptor table manipulation.
                if unsafe { libc::dup2(from, to) } >= 0 {
                    break;
                }
                if Errno::last() != Errno::EINTR {
                    self.fail(LaunchStage::Dup2);
                }
            }
        }

        close_superfluous(&self.keep, self.fd_limit);

        // SAFETY: both arrays are NULL-terminated and outlive the call.
        unsafe {
            libc::execve(self.program, self.argv_ptrs.as_ptr(), self.env.as_ptr());
        }
        self.fail(LaunchStage::Exec)
    }

    fn fail(&self, stage: LaunchStage) -> ! {
        let errno = Errno::last() as i32;
        if let Some(fd) = self.error_fd {
            let record = encode_failure(stage, errno);
            let mut written = 0;
            while written < record.len() {
                // SAFETY: writes from a stack buffer to a descriptor we hold.
                let n = unsafe {
                    libc::write(
                        fd,
                        record[written..].as_ptr().cast(),
                        record.len() - written,
                    )
                };
                if n > 0 {
                    written += n as usize;
                } else if n < 0 && Errno::last() == Errno::EINTR {
                    continue;
                } else {
                    break;
                }
            }
        }
        // SAFETY: terminates the child without running parent-owned cleanup.
        unsafe { libc::_exit(ProcessConfig::CHILD_SETUP_FAILURE_EXIT_CODE) }
    }
}

fn encode_failure(stage: LaunchStage, errno: i32) -> [u8; FAILURE_RECORD_LEN] {
    let mut record = [0u8; FAILURE_RECORD_LEN];
    record[..4].copy_from_slice(&stage.to_code().to_le_bytes());
    record[4..].copy_from_slice(&errno.to_le_bytes());
    record
}

fn decode_failure(record: &[u8; FAILURE_RECORD_LEN]) -> io::Result<(LaunchStage, Errno)> {
    let code = u32::from_le_bytes([record[0], record[1], record[2], record[3]]);
    let errno = i32::from_le_bytes([record[4], record[5], record[6], record[7]]);
    let stage = LaunchStage::from_code(code).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unknown child failure stage {}", code),
        )
    })?;
    Ok((stage, Errno::from_raw(errno)))
}

/// Wait for the child to exec or report a failure.
///
/// Returns `None` once the child has exec'd (the close-on-exec write end is
/// gone and the pipe reads EOF with no data). The parent's own write end must
/// already be closed.
pub(crate) fn read_child_failure(read_end: OwnedFd) -> io::Result<Option<(LaunchStage, Errno)>> {
    let mut pipe = File::from(read_end);
    let mut record = [0u8; FAILURE_RECORD_LEN];
    let mut filled = 0;

    while filled < record.len() {
        match pipe.read(&mut record[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    match filled {
        0 => Ok(None),
        FAILURE_RECORD_LEN => decode_failure(&record).map(Some),
        partial => Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("truncated child failure record ({} bytes)", partial),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::cloexec_pipe;
    use std::io::Write;
    use std::os::fd::AsRawFd;

    fn empty_env() -> EnvironmentArray {
        EnvironmentArray::from_entries(Vec::<String>::new()).unwrap()
    }

    #[test]
    fn test_rejects_nul_in_argv() {
        let shuffle = FileDescriptorShuffle::init(&[]).unwrap();
        let argv = vec!["/bin/true".to_string(), "a\0b".to_string()];
        let err = ChildPlan::new(&argv, empty_env(), None, &shuffle, None, 1024)
            .err()
            .unwrap();
        assert_eq!(err.stage(), LaunchStage::InvalidArguments);
        assert_eq!(err.errno(), Errno::EINVAL);
    }

    #[test]
    fn test_rejects_empty_argv() {
        let shuffle = FileDescriptorShuffle::init(&[]).unwrap();
        let err = ChildPlan::new(&[], empty_env(), None, &shuffle, None, 1024)
            .err()
            .unwrap();
        assert_eq!(err.stage(), LaunchStage::InvalidArguments);
    }

    #[test]
    fn test_keep_list_includes_error_fd() {
        let (source, _w) = cloexec_pipe().unwrap();
        let shuffle = FileDescriptorShuffle::init(&[(source.as_raw_fd(), 4)]).unwrap();
        let argv = vec!["/bin/true".to_string()];
        let plan = ChildPlan::new(&argv, empty_env(), None, &shuffle, Some(40), 1024).unwrap();
        assert_eq!(plan.kept_descriptors(), &[4, 40]);
    }

    #[test]
    fn test_failure_record_roundtrip() {
        let (read_end, write_end) = cloexec_pipe().unwrap();
        let mut writer = File::from(write_end);
        writer
            .write_all(&encode_failure(LaunchStage::Chdir, libc::ENOENT))
            .unwrap();
        drop(writer);

        let failure = read_child_failure(read_end).unwrap();
        assert_eq!(failure, Some((LaunchStage::Chdir, Errno::ENOENT)));
    }

    #[test]
    fn test_eof_means_exec_succeeded() {
        let (read_end, write_end) = cloexec_pipe().unwrap();
        drop(write_end);
        assert_eq!(read_child_failure(read_end).unwrap(), None);
    }

    #[test]
    fn test_truncated_record_is_an_error() {
        let (read_end, write_end) = cloexec_pipe().unwrap();
        let mut writer = File::from(write_end);
        writer.write_all(&[7, 0, 0]).unwrap();
        drop(writer);

        let err = read_child_failure(read_end).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
