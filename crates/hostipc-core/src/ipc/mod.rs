//! Message transport between processes.
//!
//! This module provides:
//! - `Message` plus the `MessageWriter`/`MessageReader` stream traits
//! - `MessageBufferWriter`/`MessageBufferReader` for large byte buffers,
//!   moved through shared memory above `ChannelConfig::SHMEM_THRESHOLD`
//! - `SharedMemory` regions passed by descriptor
//! - `Channel` framing over a Unix stream socket with `SCM_RIGHTS`

mod buffer;
mod channel;
mod message;
mod shmem;

pub use buffer::{
    read_bytes_or_shmem, write_bytes_or_shmem, write_bytes_or_shmem_with, DefaultAllocator,
    DisabledAllocator, MessageBufferReader, MessageBufferWriter, SharedMemoryAllocator,
};
pub use channel::Channel;
pub use message::{Message, MessageBuilder, MessageCursor, MessageReader, MessageWriter};
pub use shmem::SharedMemory;
