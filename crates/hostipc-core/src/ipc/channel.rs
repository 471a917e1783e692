//! Message channel over a connected Unix stream socket.
//!
//! Each frame is a 12-byte header (`payload_len`, `msg_type`, `handle_count`,
//! little-endian u32s) followed by the payload. Descriptors travel as
//! `SCM_RIGHTS` ancillary data attached to the first byte of the frame.

#![allow(unsafe_code)]

use super::message::Message;
use crate::config::ChannelConfig;
use crate::error::ProtocolError;
use crate::platform;
use nix::errno::Errno;
use std::io::{self, Read, Write};
use std::mem;
use std::net::Shutdown;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use tracing::{debug, trace};

const FD_SIZE: usize = mem::size_of::<RawFd>();

/// One end of a bidirectional message channel.
#[derive(Debug)]
pub struct Channel {
    stream: UnixStream,
}

impl Channel {
    /// Two connected ends, both close-on-exec.
    pub fn pair() -> io::Result<(Channel, Channel)> {
        let (a, b) = UnixStream::pair()?;
        Ok((Self::from_stream(a), Self::from_stream(b)))
    }

    pub fn from_stream(stream: UnixStream) -> Self {
        Self { stream }
    }

    pub fn from_owned_fd(fd: OwnedFd) -> Self {
        Self::from_stream(UnixStream::from(fd))
    }

    /// Adopt a descriptor this process inherited at launch, e.g. a channel end
    /// remapped to a fixed number by the parent.
    pub fn from_inherited_fd(fd: RawFd) -> io::Result<Self> {
        if !platform::is_open(fd) {
            return Err(Errno::EBADF.into());
        }
        platform::set_cloexec(fd, true)?;
        // SAFETY: the descriptor is open and nothing else in this process
        // claims ownership of an inherited descriptor.
        let owned = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Self::from_owned_fd(owned))
    }

    /// Give up the channel, e.g. to hand its descriptor to a child process.
    pub fn into_owned_fd(self) -> OwnedFd {
        OwnedFd::from(self.stream)
    }

    pub fn shutdown(&self) -> io::Result<()> {
        self.stream.shutdown(Shutdown::Both)
    }

    /// Send `message` and its handles. The handles stay open in this process.
    pub fn send(&self, message: &Message) -> Result<(), ProtocolError> {
        if let Some(reason) = message.poison_reason() {
            return Err(ProtocolError::Poisoned(reason.to_string()));
        }

        let payload = message.payload();
        if payload.len() > ChannelConfig::MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                len: payload.len(),
                max: ChannelConfig::MAX_MESSAGE_SIZE,
            });
        }

        let handles = message.handles();
        if handles.len() > ChannelConfig::MAX_HANDLES_PER_MESSAGE {
            return Err(ProtocolError::TooManyHandles {
                count: handles.len(),
                max: ChannelConfig::MAX_HANDLES_PER_MESSAGE,
            });
        }
        let fds = handles
            .iter()
            .enumerate()
            .map(|(index, handle)| {
                handle
                    .as_ref()
                    .map(AsRawFd::as_raw_fd)
                    .ok_or(ProtocolError::InvalidHandle(index as u32))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut frame = Vec::with_capacity(ChannelConfig::HEADER_LEN + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&message.msg_type().to_le_bytes());
        frame.extend_from_slice(&(fds.len() as u32).to_le_bytes());
        frame.extend_from_slice(payload);

        let sent = self.send_with_fds(&frame, &fds)?;
        if sent < frame.len() {
            (&self.stream).write_all(&frame[sent..])?;
        }

        trace!(
            "Sent message type {} ({} bytes, {} handles)",
            message.msg_type(),
            payload.len(),
            fds.len()
        );
        Ok(())
    }

    /// Receive the next message, or `None` if the peer closed the channel
    /// cleanly between messages.
    pub fn recv(&self) -> Result<Option<Message>, ProtocolError> {
        let mut header = [0u8; ChannelConfig::HEADER_LEN];
        let (received, handles) = self.recv_with_fds(&mut header)?;
        if received == 0 {
            debug!("Channel closed by peer");
            return Ok(None);
        }
        if received < header.len() {
            (&self.stream).read_exact(&mut header[received..])?;
        }

        let word = |i: usize| {
            u32::from_le_bytes([header[i], header[i + 1], header[i + 2], header[i + 3]])
        };
        let payload_len = word(0) as usize;
        let msg_type = word(4);
        let handle_count = word(8) as usize;

        if payload_len > ChannelConfig::MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                len: payload_len,
                max: ChannelConfig::MAX_MESSAGE_SIZE,
            });
        }
        if handle_count > ChannelConfig::MAX_HANDLES_PER_MESSAGE {
            return Err(ProtocolError::TooManyHandles {
                count: handle_count,
                max: ChannelConfig::MAX_HANDLES_PER_MESSAGE,
            });
        }
        if handle_count != handles.len() {
            return Err(ProtocolError::HandleCountMismatch {
                declared: handle_count,
                received: handles.len(),
            });
        }

        let mut payload = vec![0u8; payload_len];
        (&self.stream).read_exact(&mut payload)?;

        trace!(
            "Received message type {} ({} bytes, {} handles)",
            msg_type,
            payload_len,
            handles.len()
        );
        Ok(Some(Message::from_parts(msg_type, payload, handles)))
    }

    fn send_with_fds(&self, data: &[u8], fds: &[RawFd]) -> io::Result<usize> {
        let fd_bytes = fds.len() * FD_SIZE;
        // SAFETY: CMSG_SPACE is a pure size computation.
        let space = unsafe { libc::CMSG_SPACE(fd_bytes as libc::c_uint) } as usize;
        // u64 storage keeps the control buffer aligned for cmsghdr.
        let mut control = vec![0u64; space.div_ceil(mem::size_of::<u64>())];

        let mut iov = libc::iovec {
            iov_base: data.as_ptr() as *mut libc::c_void,
            iov_len: data.len(),
        };
        // SAFETY: msghdr is plain data; all-zero is a valid empty header.
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;

        if !fds.is_empty() {
            msg.msg_control = control.as_mut_ptr().cast();
            msg.msg_controllen = space as _;
            // SAFETY: the control buffer is large enough for one header with
            // `fd_bytes` of data, as computed by CMSG_SPACE above.
            unsafe {
                let cmsg = libc::CMSG_FIRSTHDR(&msg);
                (*cmsg).cmsg_level = libc::SOL_SOCKET;
                (*cmsg).cmsg_type = libc::SCM_RIGHTS;
                (*cmsg).cmsg_len = libc::CMSG_LEN(fd_bytes as libc::c_uint) as _;
                std::ptr::copy_nonoverlapping(
                    fds.as_ptr().cast::<u8>(),
                    libc::CMSG_DATA(cmsg),
                    fd_bytes,
                );
            }
        }

        loop {
            // SAFETY: `msg` points at buffers that outlive the call.
            let n = unsafe { libc::sendmsg(self.stream.as_raw_fd(), &msg, send_flags()) };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    fn recv_with_fds(&self, buf: &mut [u8]) -> Result<(usize, Vec<OwnedFd>), ProtocolError> {
        let max_bytes = ChannelConfig::MAX_HANDLES_PER_MESSAGE * FD_SIZE;
        // SAFETY: CMSG_SPACE is a pure size computation.
        let space = unsafe { libc::CMSG_SPACE(max_bytes as libc::c_uint) } as usize;
        let mut control = vec![0u64; space.div_ceil(mem::size_of::<u64>())];

        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr().cast(),
            iov_len: buf.len(),
        };
        // SAFETY: msghdr is plain data; all-zero is a valid empty header.
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr().cast();
        msg.msg_controllen = space as _;

        let received = loop {
            // SAFETY: `msg` points at buffers that outlive the call.
            let n = unsafe { libc::recvmsg(self.stream.as_raw_fd(), &mut msg, recv_flags()) };
            if n >= 0 {
                break n as usize;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err.into());
            }
        };

        let mut handles = Vec::new();
        // SAFETY: walks the control messages the kernel just wrote, within
        // `msg_controllen`.
        unsafe {
            let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
            while !cmsg.is_null() {
                if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS
                {
                    let data = libc::CMSG_DATA(cmsg);
                    let data_len = (*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize;
                    for i in 0..data_len / FD_SIZE {
                        let fd = std::ptr::read_unaligned(data.add(i * FD_SIZE).cast::<RawFd>());
                        handles.push(OwnedFd::from_raw_fd(fd));
                    }
                }
                cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
            }
        }

        if msg.msg_flags & libc::MSG_CTRUNC != 0 {
            return Err(ProtocolError::ControlTruncated);
        }

        #[cfg(not(target_os = "linux"))]
        for handle in &handles {
            platform::set_cloexec(handle.as_raw_fd(), true)?;
        }

        Ok((received, handles))
    }
}

#[cfg(target_os = "linux")]
fn send_flags() -> libc::c_int {
    libc::MSG_NOSIGNAL
}

#[cfg(not(target_os = "linux"))]
fn send_flags() -> libc::c_int {
    0
}

#[cfg(target_os = "linux")]
fn recv_flags() -> libc::c_int {
    libc::MSG_CMSG_CLOEXEC
}

#[cfg(not(target_os = "linux"))]
fn recv_flags() -> libc::c_int {
    0
}

impl AsRawFd for Channel {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

impl AsFd for Channel {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }
}
