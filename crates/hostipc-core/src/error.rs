//! Error types for hostipc.
//!
//! Launch failures and channel protocol violations each get their own type so
//! callers can match on the failing stage or the violated invariant.
//! `HostIpcError` wraps both for code that only wants a single error type.

use nix::errno::Errno;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use thiserror::Error;

/// Stage of a launch attempt at which a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LaunchStage {
    /// argv or options were rejected before any OS resource was touched.
    InvalidArguments,
    /// The sandbox launch hook refused or failed to adjust the options.
    SandboxPrepare,
    /// Descriptor remapping could not be set up in the parent.
    #[serde(rename = "descriptor-shuffle-init")]
    ShuffleInit,
    Fork,
    Dup2,
    Chdir,
    Exec,
}

impl LaunchStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            LaunchStage::InvalidArguments => "invalid-arguments",
            LaunchStage::SandboxPrepare => "sandbox-prepare",
            LaunchStage::ShuffleInit => "descriptor-shuffle-init",
            LaunchStage::Fork => "fork",
            LaunchStage::Dup2 => "dup2",
            LaunchStage::Chdir => "chdir",
            LaunchStage::Exec => "exec",
        }
    }

    /// Whether this stage runs in the forked child, after `fork` returned.
    pub fn is_child_side(&self) -> bool {
        matches!(
            self,
            LaunchStage::Dup2 | LaunchStage::Chdir | LaunchStage::Exec
        )
    }

    /// Numeric code used on the child error pipe.
    pub(crate) fn to_code(self) -> u32 {
        match self {
            LaunchStage::InvalidArguments => 1,
            LaunchStage::SandboxPrepare => 2,
            LaunchStage::ShuffleInit => 3,
            LaunchStage::Fork => 4,
            LaunchStage::Dup2 => 5,
            LaunchStage::Chdir => 6,
            LaunchStage::Exec => 7,
        }
    }

    pub(crate) fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(LaunchStage::InvalidArguments),
            2 => Some(LaunchStage::SandboxPrepare),
            3 => Some(LaunchStage::ShuffleInit),
            4 => Some(LaunchStage::Fork),
            5 => Some(LaunchStage::Dup2),
            6 => Some(LaunchStage::Chdir),
            7 => Some(LaunchStage::Exec),
            _ => None,
        }
    }
}

impl fmt::Display for LaunchStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed launch: the stage that failed plus the OS error it saw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("launch failed during {stage}: {errno}")]
pub struct LaunchError {
    stage: LaunchStage,
    errno: Errno,
}

impl LaunchError {
    pub fn new(stage: LaunchStage, errno: Errno) -> Self {
        Self { stage, errno }
    }

    /// Capture `errno` as left by the last failed libc call.
    pub fn last_os_error(stage: LaunchStage) -> Self {
        Self::new(stage, Errno::last())
    }

    /// Build from an `io::Error`, keeping its OS code when it has one.
    pub fn from_io(stage: LaunchStage, err: &io::Error) -> Self {
        let errno = err
            .raw_os_error()
            .map(Errno::from_raw)
            .unwrap_or(Errno::EIO);
        Self::new(stage, errno)
    }

    pub(crate) fn invalid(reason: &str) -> Self {
        tracing::warn!("Rejecting launch request: {}", reason);
        Self::new(LaunchStage::InvalidArguments, Errno::EINVAL)
    }

    pub fn stage(&self) -> LaunchStage {
        self.stage
    }

    pub fn errno(&self) -> Errno {
        self.errno
    }

    pub fn raw_os_error(&self) -> i32 {
        self.errno as i32
    }
}

impl From<LaunchError> for io::Error {
    fn from(err: LaunchError) -> Self {
        io::Error::from_raw_os_error(err.raw_os_error())
    }
}

/// Framing violations and stream failures on a message buffer transfer.
///
/// All of these mean sender and receiver disagree about what is on the wire,
/// so none of them are retried; the owning connection should be dropped.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error(
        "all writes except for the final write must be a multiple of 4 bytes \
         in length due to padding (len {len}, remaining {remaining})"
    )]
    MisalignedWrite { len: usize, remaining: u32 },

    #[error(
        "all reads except for the final read must be a multiple of 4 bytes \
         in length due to padding (len {len}, remaining {remaining})"
    )]
    MisalignedRead { len: usize, remaining: u32 },

    #[error("MessageBufferWriter overrun: {len} bytes written with {remaining} remaining")]
    WriteOverrun { len: usize, remaining: u32 },

    #[error("MessageBufferReader overrun: {len} bytes requested with {remaining} remaining")]
    ReadOverrun { len: usize, remaining: u32 },

    #[error("didn't fully write message buffer ({remaining} bytes remaining)")]
    IncompleteWrite { remaining: u32 },

    #[error("didn't fully read message buffer ({remaining} bytes remaining)")]
    IncompleteRead { remaining: u32 },

    #[error("failed to read shared memory flag")]
    ReadShmemFlag,

    #[error("failed to write shared memory handle")]
    WriteShmemHandle,

    #[error("failed to read shared memory handle")]
    ReadShmemHandle,

    #[error("failed to map shared memory region of {len} bytes")]
    MapShmem {
        len: usize,
        #[source]
        source: io::Error,
    },

    #[error("shared memory region is not mapped writable")]
    ShmemNotWritable,

    #[error("message truncated: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("invalid bool encoding {0}")]
    InvalidBool(u32),

    #[error("invalid or already consumed handle index {0}")]
    InvalidHandle(u32),

    #[error("message carries {count} handles, maximum is {max}")]
    TooManyHandles { count: usize, max: usize },

    #[error("message payload of {len} bytes exceeds maximum {max}")]
    MessageTooLarge { len: usize, max: usize },

    #[error("buffer of {len} bytes exceeds maximum {max}")]
    BufferTooLarge { len: usize, max: usize },

    #[error("message handle count mismatch: header declares {declared}, received {received}")]
    HandleCountMismatch { declared: usize, received: usize },

    #[error("ancillary data truncated while receiving message handles")]
    ControlTruncated,

    #[error("message was poisoned by a fatal error: {0}")]
    Poisoned(String),

    #[error("channel I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Main error type for hostipc.
#[derive(Debug, Error)]
pub enum HostIpcError {
    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Result type alias for hostipc operations.
pub type Result<T> = std::result::Result<T, HostIpcError>;

impl HostIpcError {
    /// Whether the connection that produced this error must be torn down.
    pub fn aborts_connection(&self) -> bool {
        matches!(self, HostIpcError::Protocol(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launch_error_display() {
        let err = LaunchError::new(LaunchStage::Fork, Errno::EAGAIN);
        let text = err.to_string();
        assert!(text.starts_with("launch failed during fork"));
        assert!(text.contains("EAGAIN"));
    }

    #[test]
    fn test_launch_error_from_io_keeps_code() {
        let io_err = io::Error::from_raw_os_error(libc::EMFILE);
        let err = LaunchError::from_io(LaunchStage::ShuffleInit, &io_err);
        assert_eq!(err.stage(), LaunchStage::ShuffleInit);
        assert_eq!(err.errno(), Errno::EMFILE);

        let synthetic = io::Error::new(io::ErrorKind::Other, "no os code");
        let err = LaunchError::from_io(LaunchStage::SandboxPrepare, &synthetic);
        assert_eq!(err.errno(), Errno::EIO);
    }

    #[test]
    fn test_stage_codes_roundtrip() {
        for stage in [
            LaunchStage::InvalidArguments,
            LaunchStage::SandboxPrepare,
            LaunchStage::ShuffleInit,
            LaunchStage::Fork,
            LaunchStage::Dup2,
            LaunchStage::Chdir,
            LaunchStage::Exec,
        ] {
            assert_eq!(LaunchStage::from_code(stage.to_code()), Some(stage));
        }
        assert_eq!(LaunchStage::from_code(0), None);
    }

    #[test]
    fn test_child_side_stages() {
        assert!(LaunchStage::Exec.is_child_side());
        assert!(LaunchStage::Chdir.is_child_side());
        assert!(!LaunchStage::Fork.is_child_side());
        assert!(!LaunchStage::SandboxPrepare.is_child_side());
    }

    #[test]
    fn test_stage_serializes_as_displayed() {
        for stage in [
            LaunchStage::InvalidArguments,
            LaunchStage::SandboxPrepare,
            LaunchStage::ShuffleInit,
            LaunchStage::Exec,
        ] {
            let json = serde_json::to_string(&stage).unwrap();
            assert_eq!(json, format!("\"{}\"", stage));
            assert_eq!(serde_json::from_str::<LaunchStage>(&json).unwrap(), stage);
        }
    }

    #[test]
    fn test_protocol_errors_abort_connection() {
        let err: HostIpcError = ProtocolError::IncompleteWrite { remaining: 4 }.into();
        assert!(err.aborts_connection());
        let err: HostIpcError = LaunchError::new(LaunchStage::Exec, Errno::ENOENT).into();
        assert!(!err.aborts_connection());
        let err: HostIpcError = io::Error::from_raw_os_error(libc::EPIPE).into();
        assert!(!err.aborts_connection());
        assert!(err.to_string().starts_with("IO error: "));
    }
}
