//! Subcommand implementations.

use crate::{EchoArgs, LaunchArgs, RoundtripArgs};
use anyhow::{bail, Context, Result};
use hostipc_core::ipc::{
    write_bytes_or_shmem_with, DefaultAllocator, DisabledAllocator, SharedMemoryAllocator,
};
use hostipc_core::{
    read_bytes_or_shmem, Channel, ChannelConfig, ChildProcess, EnvironmentLog, LaunchOptions,
    LauncherKind, MessageBufferReader, MessageBufferWriter, MessageBuilder, MessageCursor,
    MessageReader, MessageWriter, ProcessLauncher, SandboxOptions,
};
use serde::Serialize;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Buffer sent by buffer-roundtrip.
const BUFFER_MSG: u32 = 1;
/// Buffer echoed back by buffer-echo.
const ECHO_MSG: u32 = 2;

/// Descriptor number the echo child finds its channel end at.
const ECHO_CHANNEL_FD: i32 = 3;

#[derive(Debug, Serialize)]
struct LaunchReport {
    pid: u32,
    launcher: LauncherKind,
    exited: bool,
    exit_code: Option<i32>,
    signal: Option<String>,
}

impl LaunchReport {
    fn from_child(child: &ChildProcess, launcher: LauncherKind) -> Self {
        Self {
            pid: child.id(),
            launcher,
            exited: child.has_exited(),
            exit_code: child.exit_code(),
            signal: child.signal().map(|sig| sig.as_str().to_string()),
        }
    }
}

fn launcher(kind: LauncherKind) -> ProcessLauncher {
    ProcessLauncher::new()
        .with_kind(kind)
        .with_event_log(Arc::new(EnvironmentLog::from_default_env()))
}

fn allocator(inline: bool) -> &'static dyn SharedMemoryAllocator {
    if inline {
        &DisabledAllocator
    } else {
        &DefaultAllocator
    }
}

fn check_chunk(chunk: usize) -> Result<()> {
    if chunk == 0 || chunk % ChannelConfig::BUFFER_ALIGNMENT != 0 {
        bail!(
            "chunk size must be a positive multiple of {}",
            ChannelConfig::BUFFER_ALIGNMENT
        );
    }
    Ok(())
}

pub fn launch(args: LaunchArgs) -> Result<()> {
    let mut options = LaunchOptions::new()
        .with_wait(args.wait)
        .with_child_error_reporting(!args.no_error_report);

    if args.full_env {
        options = options.with_full_env(args.env.iter().map(|(k, v)| format!("{}={}", k, v)));
    } else {
        for (key, value) in args.env {
            options = options.with_env(key, value);
        }
    }
    if let Some(dir) = &args.cwd {
        options = options.with_workdir(dir);
    }
    for (src, dst) in args.remap {
        options = options.remap_fd(src, dst);
    }

    let kind = match args.sandbox_broker_fd {
        Some(fd) => {
            options = options.with_sandbox(SandboxOptions::default().with_broker_fd(fd));
            LauncherKind::Sandboxed
        }
        None => LauncherKind::Plain,
    };

    let child = launcher(kind)
        .launch(&args.program, options)
        .with_context(|| format!("Failed to launch {}", args.program[0]))?;

    let report = LaunchReport::from_child(&child, kind);
    if args.json {
        println!("{}", serde_json::to_string(&report)?);
    } else {
        println!("pid: {}", report.pid);
        if let Some(code) = report.exit_code {
            println!("exit code: {}", code);
        }
        if let Some(signal) = &report.signal {
            println!("killed by: {}", signal);
        }
    }

    Ok(())
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i.wrapping_mul(31) % 251) as u8).collect()
}

pub fn buffer_roundtrip(args: RoundtripArgs, debug_logging: bool) -> Result<()> {
    check_chunk(args.chunk)?;
    if args.size > ChannelConfig::MAX_BUFFER_LEN {
        bail!(
            "buffer size {} exceeds maximum {}",
            args.size,
            ChannelConfig::MAX_BUFFER_LEN
        );
    }

    let (channel, child_end) = Channel::pair().context("Failed to create channel")?;
    let child_end = child_end.into_owned_fd();

    let exe = std::env::current_exe().context("Failed to locate own executable")?;
    let mut argv = vec![
        exe.to_string_lossy().into_owned(),
        "buffer-echo".to_string(),
        "--fd".to_string(),
        ECHO_CHANNEL_FD.to_string(),
        "--chunk".to_string(),
        args.chunk.to_string(),
    ];
    if args.inline {
        argv.push("--inline".to_string());
    }
    if debug_logging {
        argv.push("--debug".to_string());
    }

    let mut child = launcher(LauncherKind::Plain)
        .launch(
            &argv,
            LaunchOptions::new().remap_fd(child_end.as_raw_fd(), ECHO_CHANNEL_FD),
        )
        .context("Failed to launch echo child")?;
    drop(child_end);

    let data = pattern(args.size as usize);
    let started = Instant::now();

    let mut builder = MessageBuilder::new(BUFFER_MSG);
    builder.write_u32(args.size);
    let sent_shared = {
        let mut writer =
            MessageBufferWriter::with_allocator(&mut builder, args.size, allocator(args.inline))?;
        for piece in data.chunks(args.chunk) {
            writer.write_bytes(piece)?;
        }
        let shared = writer.is_shared();
        writer.finish()?;
        shared
    };
    channel.send(&builder.finish())?;

    let reply = channel
        .recv()?
        .context("Echo child closed the channel without replying")?;
    if reply.msg_type() != ECHO_MSG {
        bail!("unexpected reply message type {}", reply.msg_type());
    }
    let mut cursor = MessageCursor::new(reply);
    let echoed = read_bytes_or_shmem(&mut cursor)?;
    let elapsed = started.elapsed();

    if echoed != data {
        bail!("echoed buffer does not match what was sent");
    }

    drop(channel);
    let status = child.wait().context("Failed to wait for echo child")?;
    debug!("Echo child finished: {:?}", status);
    if child.exit_code() != Some(0) {
        warn!("Echo child exited abnormally: {:?}", status);
    }

    info!(
        "Round trip of {} bytes in {:?} ({})",
        args.size,
        elapsed,
        if sent_shared { "shared memory" } else { "inline" }
    );
    println!(
        "ok: {} bytes, sent {}, {:?}",
        args.size,
        if sent_shared { "via shared memory" } else { "inline" },
        elapsed
    );
    Ok(())
}

pub fn buffer_echo(args: EchoArgs) -> Result<()> {
    check_chunk(args.chunk)?;
    let channel = Channel::from_inherited_fd(args.fd)
        .with_context(|| format!("No channel on descriptor {}", args.fd))?;

    while let Some(message) = channel.recv()? {
        if message.msg_type() != BUFFER_MSG {
            bail!("unexpected message type {}", message.msg_type());
        }
        let mut cursor = MessageCursor::new(message);
        let len = cursor.read_u32()?;
        if len > ChannelConfig::MAX_BUFFER_LEN {
            bail!("announced buffer of {} bytes is too large", len);
        }

        let mut data = vec![0u8; len as usize];
        {
            let mut reader = MessageBufferReader::new(&mut cursor, len)?;
            for piece in data.chunks_mut(args.chunk) {
                reader.read_bytes_into(piece)?;
            }
            debug!(
                "Received {} byte buffer ({})",
                len,
                if reader.is_shared() { "shared memory" } else { "inline" }
            );
            reader.finish()?;
        }

        let mut reply = MessageBuilder::new(ECHO_MSG);
        write_bytes_or_shmem_with(&mut reply, &data, allocator(args.inline))?;
        channel.send(&reply.finish())?;
    }

    debug!("Parent closed the channel, exiting");
    Ok(())
}
