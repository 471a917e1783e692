//! Chunked transfer of large byte buffers inside a message.
//!
//! A buffer is written in one or more chunks. Buffers up to
//! `ChannelConfig::SHMEM_THRESHOLD` bytes always travel inline in the message
//! payload. Larger buffers are preceded by a `shmem_ok` word: when it is true
//! the message carries a shared memory handle and the bytes go into that
//! region instead; when false the bytes follow inline.
//!
//! Every chunk except the last must be a multiple of 4 bytes, so inline
//! padding only ever appears once, after the final chunk. Writing or reading
//! fewer bytes than announced is a fatal protocol error.

use super::message::{MessageReader, MessageWriter};
use super::shmem::SharedMemory;
use crate::config::ChannelConfig;
use crate::error::ProtocolError;
use std::io;
use tracing::debug;

/// Source of shared memory regions for large buffers.
pub trait SharedMemoryAllocator {
    /// A new region of at least `len` bytes, mapped read-write.
    fn allocate(&self, len: usize) -> io::Result<SharedMemory>;
}

/// Creates a fresh [`SharedMemory`] region per buffer.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultAllocator;

impl SharedMemoryAllocator for DefaultAllocator {
    fn allocate(&self, len: usize) -> io::Result<SharedMemory> {
        let mut region = SharedMemory::create(len)?;
        region.map(len)?;
        Ok(region)
    }
}

/// Never provides a region, forcing inline transfer.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledAllocator;

impl SharedMemoryAllocator for DisabledAllocator {
    fn allocate(&self, _len: usize) -> io::Result<SharedMemory> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "shared memory disabled",
        ))
    }
}

fn check_chunk(len: usize, remaining: u32, reading: bool) -> Result<(), ProtocolError> {
    if len != remaining as usize && len % ChannelConfig::BUFFER_ALIGNMENT != 0 {
        return Err(if reading {
            ProtocolError::MisalignedRead { len, remaining }
        } else {
            ProtocolError::MisalignedWrite { len, remaining }
        });
    }
    if len > remaining as usize {
        return Err(if reading {
            ProtocolError::ReadOverrun { len, remaining }
        } else {
            ProtocolError::WriteOverrun { len, remaining }
        });
    }
    Ok(())
}

enum WriteBacking {
    Inline,
    Shared { region: SharedMemory, offset: usize },
}

/// Writes a buffer of known length into a message, in chunks.
pub struct MessageBufferWriter<'a, W: MessageWriter + ?Sized> {
    writer: &'a mut W,
    remaining: u32,
    backing: WriteBacking,
}

impl<'a, W: MessageWriter + ?Sized> MessageBufferWriter<'a, W> {
    /// Start a buffer of `full_len` bytes using fresh shared memory regions.
    pub fn new(writer: &'a mut W, full_len: u32) -> Result<Self, ProtocolError> {
        Self::with_allocator(writer, full_len, &DefaultAllocator)
    }

    /// Start a buffer of `full_len` bytes with regions from `allocator`.
    ///
    /// Failing to obtain a region is not an error: the buffer is sent inline
    /// and the writer is told through `note_large_buffer_shmem_failure`.
    pub fn with_allocator(
        writer: &'a mut W,
        full_len: u32,
        allocator: &dyn SharedMemoryAllocator,
    ) -> Result<Self, ProtocolError> {
        let mut backing = WriteBacking::Inline;

        if full_len > ChannelConfig::SHMEM_THRESHOLD {
            let allocated = allocator.allocate(full_len as usize).and_then(|region| {
                if region.is_writable() && region.len() >= full_len as usize {
                    Ok(region)
                } else {
                    Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!(
                            "allocator returned a {} byte {} mapping",
                            region.len(),
                            if region.is_writable() { "writable" } else { "read-only" }
                        ),
                    ))
                }
            });
            match allocated {
                Ok(region) => {
                    writer.write_bool(true);
                    let handle = match region.clone_handle() {
                        Ok(handle) => handle,
                        Err(e) => {
                            debug!("Failed to duplicate shared memory handle: {}", e);
                            writer.fatal_error("failed to write shared memory handle");
                            return Err(ProtocolError::WriteShmemHandle);
                        }
                    };
                    if let Err(e) = writer.write_handle(handle) {
                        debug!("Failed to attach shared memory handle: {}", e);
                        writer.fatal_error("failed to write shared memory handle");
                        return Err(ProtocolError::WriteShmemHandle);
                    }
                    backing = WriteBacking::Shared { region, offset: 0 };
                }
                Err(e) => {
                    debug!("No shared memory for {} byte buffer: {}", full_len, e);
                    writer.write_bool(false);
                    writer.note_large_buffer_shmem_failure(full_len);
                }
            }
        }

        Ok(Self {
            writer,
            remaining: full_len,
            backing,
        })
    }

    /// Write the next chunk.
    pub fn write_bytes(&mut self, data: &[u8]) -> Result<(), ProtocolError> {
        if let Err(e) = check_chunk(data.len(), self.remaining, false) {
            self.writer.fatal_error(&e.to_string());
            return Err(e);
        }

        match &mut self.backing {
            WriteBacking::Inline => self.writer.write_bytes(data),
            WriteBacking::Shared { region, offset } => {
                let Some(dst) = region.as_mut_slice() else {
                    self.writer.fatal_error("shared memory region is not mapped writable");
                    return Err(ProtocolError::ShmemNotWritable);
                };
                dst[*offset..*offset + data.len()].copy_from_slice(data);
                *offset += data.len();
            }
        }

        self.remaining -= data.len() as u32;
        Ok(())
    }

    /// Bytes still to be written.
    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    pub fn is_shared(&self) -> bool {
        matches!(self.backing, WriteBacking::Shared { .. })
    }

    /// Check that the whole buffer was written.
    pub fn finish(mut self) -> Result<(), ProtocolError> {
        let remaining = std::mem::take(&mut self.remaining);
        if remaining != 0 {
            self.writer.fatal_error("didn't fully write message buffer");
            return Err(ProtocolError::IncompleteWrite { remaining });
        }
        Ok(())
    }
}

impl<W: MessageWriter + ?Sized> Drop for MessageBufferWriter<'_, W> {
    fn drop(&mut self) {
        if self.remaining != 0 {
            self.writer.fatal_error("didn't fully write message buffer");
        }
    }
}

enum ReadBacking {
    Inline,
    Shared { region: SharedMemory, offset: usize },
}

/// Reads a buffer of known length out of a message, in chunks.
pub struct MessageBufferReader<'a, R: MessageReader + ?Sized> {
    reader: &'a mut R,
    remaining: u32,
    backing: ReadBacking,
}

impl<'a, R: MessageReader + ?Sized> MessageBufferReader<'a, R> {
    /// Start reading a buffer of `full_len` bytes.
    ///
    /// Unlike the writer there is no fallback: a missing flag, a missing
    /// handle or a region that cannot be mapped are all fatal.
    pub fn new(reader: &'a mut R, full_len: u32) -> Result<Self, ProtocolError> {
        let mut backing = ReadBacking::Inline;

        if full_len > ChannelConfig::SHMEM_THRESHOLD {
            let shmem_ok = match reader.read_bool() {
                Ok(flag) => flag,
                Err(e) => {
                    debug!("Shared memory flag unreadable: {}", e);
                    reader.fatal_error("failed to read shared memory flag");
                    return Err(ProtocolError::ReadShmemFlag);
                }
            };

            if shmem_ok {
                let handle = match reader.read_handle() {
                    Ok(handle) => handle,
                    Err(e) => {
                        debug!("Shared memory handle unreadable: {}", e);
                        reader.fatal_error("failed to read shared memory handle");
                        return Err(ProtocolError::ReadShmemHandle);
                    }
                };
                let mut region = SharedMemory::from_handle(handle);
                if let Err(source) = region.map_readonly(full_len as usize) {
                    reader.fatal_error("failed to map shared memory region");
                    return Err(ProtocolError::MapShmem {
                        len: full_len as usize,
                        source,
                    });
                }
                backing = ReadBacking::Shared { region, offset: 0 };
            }
        }

        Ok(Self {
            reader,
            remaining: full_len,
            backing,
        })
    }

    /// Read the next chunk into `buf`.
    pub fn read_bytes_into(&mut self, buf: &mut [u8]) -> Result<(), ProtocolError> {
        if let Err(e) = check_chunk(buf.len(), self.remaining, true) {
            self.reader.fatal_error(&e.to_string());
            return Err(e);
        }

        match &mut self.backing {
            ReadBacking::Inline => {
                if let Err(e) = self.reader.read_bytes_into(buf) {
                    self.reader.fatal_error(&e.to_string());
                    return Err(e);
                }
            }
            ReadBacking::Shared { region, offset } => {
                buf.copy_from_slice(&region.as_slice()[*offset..*offset + buf.len()]);
                *offset += buf.len();
            }
        }

        self.remaining -= buf.len() as u32;
        Ok(())
    }

    /// Bytes still to be read.
    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    pub fn is_shared(&self) -> bool {
        matches!(self.backing, ReadBacking::Shared { .. })
    }

    /// Check that the whole buffer was read.
    pub fn finish(mut self) -> Result<(), ProtocolError> {
        let remaining = std::mem::take(&mut self.remaining);
        if remaining != 0 {
            self.reader.fatal_error("didn't fully read message buffer");
            return Err(ProtocolError::IncompleteRead { remaining });
        }
        Ok(())
    }
}

impl<R: MessageReader + ?Sized> Drop for MessageBufferReader<'_, R> {
    fn drop(&mut self) {
        if self.remaining != 0 {
            self.reader.fatal_error("didn't fully read message buffer");
        }
    }
}

/// Write a length word followed by `data` as a buffer.
pub fn write_bytes_or_shmem<W: MessageWriter + ?Sized>(
    writer: &mut W,
    data: &[u8],
) -> Result<(), ProtocolError> {
    write_bytes_or_shmem_with(writer, data, &DefaultAllocator)
}

/// [`write_bytes_or_shmem`] with an explicit region allocator.
pub fn write_bytes_or_shmem_with<W: MessageWriter + ?Sized>(
    writer: &mut W,
    data: &[u8],
    allocator: &dyn SharedMemoryAllocator,
) -> Result<(), ProtocolError> {
    let len = match u32::try_from(data.len()) {
        Ok(len) if len <= ChannelConfig::MAX_BUFFER_LEN => len,
        _ => {
            let err = ProtocolError::BufferTooLarge {
                len: data.len(),
                max: ChannelConfig::MAX_BUFFER_LEN as usize,
            };
            writer.fatal_error(&err.to_string());
            return Err(err);
        }
    };

    writer.write_u32(len);
    let mut buffer = MessageBufferWriter::with_allocator(writer, len, allocator)?;
    buffer.write_bytes(data)?;
    buffer.finish()
}

/// Read a buffer written by [`write_bytes_or_shmem`].
pub fn read_bytes_or_shmem<R: MessageReader + ?Sized>(
    reader: &mut R,
) -> Result<Vec<u8>, ProtocolError> {
    let len = reader.read_u32()?;
    if len > ChannelConfig::MAX_BUFFER_LEN {
        let err = ProtocolError::BufferTooLarge {
            len: len as usize,
            max: ChannelConfig::MAX_BUFFER_LEN as usize,
        };
        reader.fatal_error(&err.to_string());
        return Err(err);
    }

    let mut data = vec![0u8; len as usize];
    let mut buffer = MessageBufferReader::new(reader, len)?;
    buffer.read_bytes_into(&mut data)?;
    buffer.finish()?;
    Ok(data)
}
