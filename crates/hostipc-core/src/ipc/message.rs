//! Messages and the stream traits buffers are written through.
//!
//! A message is a type tag, a 4-byte aligned payload and a table of
//! descriptors. `bool` and `u32` occupy one little-endian word, raw bytes are
//! zero-padded to the next word boundary, and a descriptor is written as its
//! index in the handle table.

use crate::config::ChannelConfig;
use crate::error::ProtocolError;
use std::os::fd::OwnedFd;
use tracing::{error, warn};

/// Serialization side of a message stream.
pub trait MessageWriter {
    fn write_u32(&mut self, value: u32);

    fn write_bool(&mut self, value: bool) {
        self.write_u32(u32::from(value));
    }

    /// Append `data` followed by zero padding to a 4-byte boundary.
    fn write_bytes(&mut self, data: &[u8]);

    /// Move `handle` into the message's handle table and write its index.
    fn write_handle(&mut self, handle: OwnedFd) -> Result<(), ProtocolError>;

    /// Record an unrecoverable framing error. The message can no longer be sent.
    fn fatal_error(&mut self, reason: &str);

    /// A buffer above the shared memory threshold is being sent inline
    /// because no shared memory region could be set up.
    fn note_large_buffer_shmem_failure(&mut self, len: u32) {
        warn!(
            "Sending {} byte buffer inline: shared memory unavailable",
            len
        );
    }
}

/// Deserialization side of a message stream.
pub trait MessageReader {
    fn read_u32(&mut self) -> Result<u32, ProtocolError>;

    fn read_bool(&mut self) -> Result<bool, ProtocolError> {
        match self.read_u32()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(ProtocolError::InvalidBool(other)),
        }
    }

    /// Fill `buf` and skip the padding that follows it.
    fn read_bytes_into(&mut self, buf: &mut [u8]) -> Result<(), ProtocolError>;

    /// Read a handle index and take that descriptor out of the handle table.
    fn read_handle(&mut self) -> Result<OwnedFd, ProtocolError>;

    /// Record an unrecoverable framing error.
    fn fatal_error(&mut self, reason: &str);
}

/// Bytes of padding after `len` bytes of data.
pub(crate) fn padding_for(len: usize) -> usize {
    let align = ChannelConfig::BUFFER_ALIGNMENT;
    (align - len % align) % align
}

/// A typed payload plus the descriptors travelling with it.
#[derive(Debug, Default)]
pub struct Message {
    msg_type: u32,
    payload: Vec<u8>,
    handles: Vec<Option<OwnedFd>>,
    poisoned: Option<String>,
}

impl Message {
    pub fn new(msg_type: u32) -> Self {
        Self {
            msg_type,
            ..Default::default()
        }
    }

    pub(crate) fn from_parts(msg_type: u32, payload: Vec<u8>, handles: Vec<OwnedFd>) -> Self {
        Self {
            msg_type,
            payload,
            handles: handles.into_iter().map(Some).collect(),
            poisoned: None,
        }
    }

    pub fn msg_type(&self) -> u32 {
        self.msg_type
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Number of handle slots, including ones already taken by a reader.
    pub fn handle_count(&self) -> usize {
        self.handles.len()
    }

    pub(crate) fn handles(&self) -> &[Option<OwnedFd>] {
        &self.handles
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.is_some()
    }

    /// Reason of the first fatal error recorded on this message.
    pub fn poison_reason(&self) -> Option<&str> {
        self.poisoned.as_deref()
    }

    fn poison(&mut self, reason: &str) {
        error!("Fatal message error (type {}): {}", self.msg_type, reason);
        if self.poisoned.is_none() {
            self.poisoned = Some(reason.to_string());
        }
    }
}

/// Builds a [`Message`] for sending.
#[derive(Debug)]
pub struct MessageBuilder {
    message: Message,
    shmem_fallbacks: u32,
}

impl MessageBuilder {
    pub fn new(msg_type: u32) -> Self {
        Self {
            message: Message::new(msg_type),
            shmem_fallbacks: 0,
        }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    /// How many large buffers fell back to inline transfer.
    pub fn shmem_fallbacks(&self) -> u32 {
        self.shmem_fallbacks
    }

    pub fn is_poisoned(&self) -> bool {
        self.message.is_poisoned()
    }

    pub fn finish(self) -> Message {
        self.message
    }
}

impl MessageWriter for MessageBuilder {
    fn write_u32(&mut self, value: u32) {
        self.message.payload.extend_from_slice(&value.to_le_bytes());
    }

    fn write_bytes(&mut self, data: &[u8]) {
        let payload = &mut self.message.payload;
        payload.extend_from_slice(data);
        payload.resize(payload.len() + padding_for(data.len()), 0);
    }

    fn write_handle(&mut self, handle: OwnedFd) -> Result<(), ProtocolError> {
        let count = self.message.handles.len();
        if count >= ChannelConfig::MAX_HANDLES_PER_MESSAGE {
            return Err(ProtocolError::TooManyHandles {
                count: count + 1,
                max: ChannelConfig::MAX_HANDLES_PER_MESSAGE,
            });
        }
        self.message.handles.push(Some(handle));
        self.write_u32(count as u32);
        Ok(())
    }

    fn fatal_error(&mut self, reason: &str) {
        self.message.poison(reason);
    }

    fn note_large_buffer_shmem_failure(&mut self, len: u32) {
        self.shmem_fallbacks += 1;
        warn!(
            "Sending {} byte buffer inline in message type {}: shared memory unavailable",
            len, self.message.msg_type
        );
    }
}

/// Reads values back out of a received [`Message`].
#[derive(Debug)]
pub struct MessageCursor {
    message: Message,
    pos: usize,
}

impl MessageCursor {
    pub fn new(message: Message) -> Self {
        Self { message, pos: 0 }
    }

    pub fn msg_type(&self) -> u32 {
        self.message.msg_type
    }

    /// Payload bytes not consumed yet.
    pub fn remaining(&self) -> usize {
        self.message.payload.len() - self.pos
    }

    pub fn is_poisoned(&self) -> bool {
        self.message.is_poisoned()
    }

    pub fn poison_reason(&self) -> Option<&str> {
        self.message.poison_reason()
    }

    pub fn into_message(self) -> Message {
        self.message
    }

    fn take(&mut self, len: usize) -> Result<&[u8], ProtocolError> {
        let available = self.remaining();
        if len > available {
            return Err(ProtocolError::Truncated {
                needed: len,
                available,
            });
        }
        let start = self.pos;
        self.pos += len;
        Ok(&self.message.payload[start..start + len])
    }
}

impl MessageReader for MessageCursor {
    fn read_u32(&mut self) -> Result<u32, ProtocolError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_bytes_into(&mut self, buf: &mut [u8]) -> Result<(), ProtocolError> {
        let padded = buf.len() + padding_for(buf.len());
        let available = self.remaining();
        if padded > available {
            return Err(ProtocolError::Truncated {
                needed: padded,
                available,
            });
        }
        let bytes = self.take(padded)?;
        buf.copy_from_slice(&bytes[..buf.len()]);
        Ok(())
    }

    fn read_handle(&mut self) -> Result<OwnedFd, ProtocolError> {
        let index = self.read_u32()?;
        self.message
            .handles
            .get_mut(index as usize)
            .and_then(Option::take)
            .ok_or(ProtocolError::InvalidHandle(index))
    }

    fn fatal_error(&mut self, reason: &str) {
        self.message.poison(reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::cloexec_pipe;

    #[test]
    fn test_words_are_little_endian() {
        let mut builder = MessageBuilder::new(1);
        builder.write_u32(0x0403_0201);
        builder.write_bool(true);
        assert_eq!(builder.message().payload(), &[1, 2, 3, 4, 1, 0, 0, 0]);
    }

    #[test]
    fn test_bytes_are_padded() {
        let mut builder = MessageBuilder::new(1);
        builder.write_bytes(b"abcde");
        assert_eq!(builder.message().payload(), b"abcde\0\0\0");

        let mut cursor = MessageCursor::new(builder.finish());
        let mut out = [0u8; 5];
        cursor.read_bytes_into(&mut out).unwrap();
        assert_eq!(&out, b"abcde");
        assert_eq!(cursor.remaining(), 0);
    }

    #[test]
    fn test_read_past_end_is_truncated() {
        let mut cursor = MessageCursor::new(Message::new(1));
        assert!(matches!(
            cursor.read_u32(),
            Err(ProtocolError::Truncated {
                needed: 4,
                available: 0
            })
        ));
    }

    #[test]
    fn test_invalid_bool() {
        let mut builder = MessageBuilder::new(1);
        builder.write_u32(2);
        let mut cursor = MessageCursor::new(builder.finish());
        assert!(matches!(cursor.read_bool(), Err(ProtocolError::InvalidBool(2))));
    }

    #[test]
    fn test_handles_are_indexed_and_taken_once() {
        let (read_end, write_end) = cloexec_pipe().unwrap();
        let mut builder = MessageBuilder::new(1);
        builder.write_handle(read_end).unwrap();
        builder.write_handle(write_end).unwrap();
        assert_eq!(builder.message().payload(), &[0, 0, 0, 0, 1, 0, 0, 0]);

        let mut message = builder.finish();
        assert_eq!(message.handle_count(), 2);
        message.payload = vec![1, 0, 0, 0, 1, 0, 0, 0];

        let mut cursor = MessageCursor::new(message);
        cursor.read_handle().unwrap();
        assert!(matches!(
            cursor.read_handle(),
            Err(ProtocolError::InvalidHandle(1))
        ));
    }

    #[test]
    fn test_handle_limit() {
        let mut builder = MessageBuilder::new(1);
        for _ in 0..ChannelConfig::MAX_HANDLES_PER_MESSAGE {
            let (read_end, _) = cloexec_pipe().unwrap();
            builder.write_handle(read_end).unwrap();
        }
        let (read_end, _) = cloexec_pipe().unwrap();
        assert!(matches!(
            builder.write_handle(read_end),
            Err(ProtocolError::TooManyHandles { .. })
        ));
    }

    #[test]
    fn test_fatal_error_keeps_first_reason() {
        let mut builder = MessageBuilder::new(1);
        builder.fatal_error("first");
        builder.fatal_error("second");
        assert_eq!(builder.message().poison_reason(), Some("first"));
    }
}
