//! Centralized configuration for hostipc.
//!
//! Both ends of a channel must agree on the channel constants, so they are
//! compile-time values rather than runtime settings.

use std::os::fd::RawFd;

/// Message and buffer transport limits.
pub struct ChannelConfig;

impl ChannelConfig {
    /// Buffers strictly larger than this are offered a shared memory region.
    pub const SHMEM_THRESHOLD: u32 = 64 * 1024;
    /// Every chunk of a buffer transfer except the last is a multiple of this.
    pub const BUFFER_ALIGNMENT: usize = 4;
    pub const MAX_MESSAGE_SIZE: usize = 256 * 1024 * 1024; // 256MB
    pub const MAX_HANDLES_PER_MESSAGE: usize = 32;
    /// Upper bound on a length-prefixed buffer. An inline fallback of this
    /// size plus its length and flag words still fits in one message.
    pub const MAX_BUFFER_LEN: u32 = 128 * 1024 * 1024; // 128MB
    /// `payload_len`, `msg_type`, `handle_count`, each a little-endian u32.
    pub const HEADER_LEN: usize = 12;
    pub const SHMEM_NAME: &'static str = "hostipc-shmem";
}

/// Child process launch settings.
pub struct ProcessConfig;

impl ProcessConfig {
    /// Exit status of a child that failed between `fork` and `exec`.
    pub const CHILD_SETUP_FAILURE_EXIT_CODE: i32 = 127;
    /// Environment variable naming the launch event log destination.
    pub const PROCESS_LOG_ENV: &'static str = "HOSTIPC_PROCESS_LOG";
    /// Descriptor number the sandbox broker socket is installed at in the child.
    pub const SANDBOX_BROKER_FD: RawFd = 10;
    pub const SANDBOX_BROKER_FD_ENV: &'static str = "HOSTIPC_SANDBOX_BROKER_FD";
    /// Upper bound on descriptors swept when `close_range` is unavailable.
    pub const FALLBACK_FD_LIMIT: RawFd = 65_536;
}
