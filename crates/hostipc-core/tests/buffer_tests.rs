//! Integration tests for buffer transfer over a real channel.

use hostipc_core::ipc::{write_bytes_or_shmem_with, DisabledAllocator};
use hostipc_core::{
    read_bytes_or_shmem, write_bytes_or_shmem, Channel, ChannelConfig, HostIpcError,
    MessageBufferReader, MessageBufferWriter, MessageBuilder, MessageCursor, MessageReader,
    MessageWriter, ProtocolError,
};
use std::thread;

const THRESHOLD: usize = ChannelConfig::SHMEM_THRESHOLD as usize;

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(7).wrapping_add(seed))
        .collect()
}

#[test]
fn test_shared_memory_buffer_crosses_channel() {
    let (a, b) = Channel::pair().unwrap();
    let data = pattern(THRESHOLD * 4, 3);

    let mut builder = MessageBuilder::new(5);
    write_bytes_or_shmem(&mut builder, &data).unwrap();
    let message = builder.finish();
    // Length word, flag word, handle index word.
    assert_eq!(message.payload().len(), 12);
    assert_eq!(message.handle_count(), 1);

    a.send(&message).unwrap();
    drop(message);

    let received = b.recv().unwrap().unwrap();
    assert_eq!(received.handle_count(), 1);
    let mut cursor = MessageCursor::new(received);
    assert_eq!(read_bytes_or_shmem(&mut cursor).unwrap(), data);
    assert!(!cursor.is_poisoned());
}

#[test]
fn test_inline_fallback_crosses_channel() {
    let (a, b) = Channel::pair().unwrap();
    let data = pattern(THRESHOLD + 1, 9);
    let expected = data.clone();

    let sender = thread::spawn(move || {
        let mut builder = MessageBuilder::new(6);
        write_bytes_or_shmem_with(&mut builder, &data, &DisabledAllocator).unwrap();
        assert_eq!(builder.shmem_fallbacks(), 1);
        a.send(&builder.finish()).unwrap();
    });

    let received = b.recv().unwrap().unwrap();
    sender.join().unwrap();
    assert_eq!(received.handle_count(), 0);

    let mut cursor = MessageCursor::new(received);
    assert_eq!(read_bytes_or_shmem(&mut cursor).unwrap(), expected);
}

#[test]
fn test_chunked_writes_and_reads_disagree_on_chunking() {
    let (a, b) = Channel::pair().unwrap();
    let len = THRESHOLD * 2 + 6;
    let data = pattern(len, 1);

    let mut builder = MessageBuilder::new(7);
    builder.write_u32(len as u32);
    {
        let mut writer = MessageBufferWriter::new(&mut builder, len as u32).unwrap();
        assert!(writer.is_shared());
        for piece in data.chunks(12_000) {
            writer.write_bytes(piece).unwrap();
        }
        writer.finish().unwrap();
    }
    a.send(&builder.finish()).unwrap();

    let mut cursor = MessageCursor::new(b.recv().unwrap().unwrap());
    let announced = cursor.read_u32().unwrap();
    let mut out = vec![0u8; announced as usize];
    {
        let mut reader = MessageBufferReader::new(&mut cursor, announced).unwrap();
        assert!(reader.is_shared());
        for piece in out.chunks_mut(4096) {
            reader.read_bytes_into(piece).unwrap();
        }
        reader.finish().unwrap();
    }
    assert_eq!(out, data);
}

#[test]
fn test_several_buffers_in_one_message() {
    let (a, b) = Channel::pair().unwrap();
    let buffers = [
        pattern(3, 0),
        pattern(THRESHOLD + 100, 1),
        pattern(64, 2),
        pattern(THRESHOLD * 3, 3),
    ];

    let mut builder = MessageBuilder::new(8);
    builder.write_u32(buffers.len() as u32);
    for buffer in &buffers {
        write_bytes_or_shmem(&mut builder, buffer).unwrap();
    }
    let message = builder.finish();
    assert_eq!(message.handle_count(), 2);
    a.send(&message).unwrap();

    let mut cursor = MessageCursor::new(b.recv().unwrap().unwrap());
    let count = cursor.read_u32().unwrap() as usize;
    assert_eq!(count, buffers.len());
    for buffer in &buffers {
        assert_eq!(&read_bytes_or_shmem(&mut cursor).unwrap(), buffer);
    }
    assert_eq!(cursor.remaining(), 0);
}

#[test]
fn test_incomplete_buffer_blocks_sending() {
    let (a, _b) = Channel::pair().unwrap();

    let mut builder = MessageBuilder::new(9);
    {
        let mut writer = MessageBufferWriter::new(&mut builder, 16).unwrap();
        writer.write_bytes(&[0u8; 8]).unwrap();
    }

    let err = a.send(&builder.finish()).unwrap_err();
    assert!(matches!(err, ProtocolError::Poisoned(_)));

    let err: HostIpcError = err.into();
    assert!(err.aborts_connection());
}
