//! Anonymous shared memory regions passed between processes by descriptor.
//!
//! Linux uses `memfd_create`; other Unix targets use an already-unlinked
//! temporary file. Either way the region lives as long as some process holds
//! its descriptor or a mapping of it.

#![allow(unsafe_code)]

use std::fs::File;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::ptr::NonNull;

struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
    writable: bool,
}

/// A shared memory object and, optionally, this process's view of it.
pub struct SharedMemory {
    file: File,
    mapping: Option<Mapping>,
}

impl SharedMemory {
    /// Create a new region of `len` bytes. It is not mapped yet.
    pub fn create(len: usize) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "shared memory size must be > 0",
            ));
        }
        let file = create_backing()?;
        file.set_len(len as u64)?;
        Ok(Self {
            file,
            mapping: None,
        })
    }

    /// Wrap a region received from another process.
    pub fn from_handle(fd: OwnedFd) -> Self {
        Self {
            file: File::from(fd),
            mapping: None,
        }
    }

    /// Map the first `len` bytes read-write.
    pub fn map(&mut self, len: usize) -> io::Result<()> {
        self.map_with(len, true)
    }

    /// Map the first `len` bytes read-only.
    pub fn map_readonly(&mut self, len: usize) -> io::Result<()> {
        self.map_with(len, false)
    }

    fn map_with(&mut self, len: usize, writable: bool) -> io::Result<()> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot map an empty region",
            ));
        }
        let size = self.file.metadata()?.len();
        if size < len as u64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("shared memory object is {} bytes, {} requested", size, len),
            ));
        }

        self.unmap();

        let prot = if writable {
            libc::PROT_READ | libc::PROT_WRITE
        } else {
            libc::PROT_READ
        };
        // SAFETY: a fresh shared mapping of a descriptor we own; the kernel
        // picks the address.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                prot,
                libc::MAP_SHARED,
                self.file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned null"))?;

        self.mapping = Some(Mapping { ptr, len, writable });
        Ok(())
    }

    /// Drop this process's view. The object itself stays alive while any
    /// descriptor refers to it.
    pub fn unmap(&mut self) {
        if let Some(mapping) = self.mapping.take() {
            // SAFETY: the mapping came from mmap with exactly this length and
            // no slice borrowed from it outlives `&mut self`.
            unsafe {
                libc::munmap(mapping.ptr.as_ptr().cast(), mapping.len);
            }
        }
    }

    pub fn is_mapped(&self) -> bool {
        self.mapping.is_some()
    }

    pub fn is_writable(&self) -> bool {
        self.mapping.as_ref().is_some_and(|m| m.writable)
    }

    /// Length of the current mapping, 0 when unmapped.
    pub fn len(&self) -> usize {
        self.mapping.as_ref().map_or(0, |m| m.len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A new close-on-exec descriptor for the same object, for sending.
    pub fn clone_handle(&self) -> io::Result<OwnedFd> {
        self.file.as_fd().try_clone_to_owned()
    }

    pub fn as_slice(&self) -> &[u8] {
        match &self.mapping {
            // SAFETY: the mapping is valid for `len` bytes until unmapped,
            // which requires `&mut self`.
            Some(m) => unsafe { std::slice::from_raw_parts(m.ptr.as_ptr(), m.len) },
            None => &[],
        }
    }

    /// The mapped bytes, if mapped read-write.
    pub fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        match &self.mapping {
            // SAFETY: as for `as_slice`, and the mapping is writable.
            Some(m) if m.writable => {
                Some(unsafe { std::slice::from_raw_parts_mut(m.ptr.as_ptr(), m.len) })
            }
            _ => None,
        }
    }
}

impl AsFd for SharedMemory {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl Drop for SharedMemory {
    fn drop(&mut self) {
        self.unmap();
    }
}

impl std::fmt::Debug for SharedMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMemory")
            .field("fd", &self.file.as_raw_fd())
            .field("mapped_len", &self.len())
            .field("writable", &self.is_writable())
            .finish()
    }
}

// SAFETY: the mapping is owned exclusively by this value; access goes through
// `&self`/`&mut self` borrows.
unsafe impl Send for SharedMemory {}

#[cfg(target_os = "linux")]
fn create_backing() -> io::Result<File> {
    use crate::config::ChannelConfig;
    use std::ffi::CString;
    use std::os::fd::FromRawFd;

    let name = CString::new(ChannelConfig::SHMEM_NAME)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    // SAFETY: `name` is a valid C string.
    let fd = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: memfd_create returned a fresh descriptor nobody else owns.
    Ok(File::from(unsafe { OwnedFd::from_raw_fd(fd) }))
}

#[cfg(not(target_os = "linux"))]
fn create_backing() -> io::Result<File> {
    tempfile::tempfile()
}
