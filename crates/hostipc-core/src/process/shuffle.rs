//! Descriptor remapping for launched children.
//!
//! The child must see each `source` descriptor at its `target` number. Applying
//! `dup2(source, target)` naively breaks when one mapping's target is another
//! mapping's source (`5 -> 6, 6 -> 5`), and an identity mapping (`3 -> 3`) is a
//! no-op that leaves close-on-exec set. Both are avoided by first moving every
//! source that could collide above the highest target, in the parent, so the
//! child only ever copies from descriptors no `dup2` will overwrite.

#![allow(unsafe_code)]

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg};
use std::collections::HashSet;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use tracing::debug;

/// Resolved remap table for one launch attempt.
#[derive(Debug)]
pub struct FileDescriptorShuffle {
    sequence: Vec<(RawFd, RawFd)>,
    targets: Vec<RawFd>,
    max_target: RawFd,
    // Owned copies of low sources; closed when the shuffle is dropped.
    temporaries: Vec<OwnedFd>,
}

impl FileDescriptorShuffle {
    /// Validate `mapping` and build a `dup2` sequence that is safe to apply in
    /// order.
    pub fn init(mapping: &[(RawFd, RawFd)]) -> io::Result<Self> {
        let mut sources = HashSet::with_capacity(mapping.len());
        let mut targets = HashSet::with_capacity(mapping.len());

        for &(source, target) in mapping {
            if source < 0 || target < 0 {
                return Err(Errno::EBADF.into());
            }
            if !sources.insert(source) || !targets.insert(target) {
                return Err(Errno::EINVAL.into());
            }
            if !crate::platform::is_open(source) {
                return Err(Errno::EBADF.into());
            }
        }

        let max_target = mapping
            .iter()
            .map(|&(_, target)| target)
            .fold(libc::STDERR_FILENO, RawFd::max);

        let mut sequence = Vec::with_capacity(mapping.len());
        let mut temporaries = Vec::new();

        for &(source, target) in mapping {
            if source > max_target {
                sequence.push((source, target));
                continue;
            }
            let moved = dup_above(source, max_target)?;
            sequence.push((moved.as_raw_fd(), target));
            temporaries.push(moved);
        }

        let mut targets: Vec<RawFd> = targets.into_iter().collect();
        targets.sort_unstable();

        debug!(
            "Resolved {} descriptor remaps ({} moved above fd {})",
            sequence.len(),
            temporaries.len(),
            max_target
        );

        Ok(Self {
            sequence,
            targets,
            max_target,
            temporaries,
        })
    }

    /// `(from, to)` pairs to `dup2` in the child, in order.
    pub fn dup2_sequence(&self) -> &[(RawFd, RawFd)] {
        &self.sequence
    }

    /// Whether `fd` is a remap target and must survive into the child.
    pub fn maps_to(&self, fd: RawFd) -> bool {
        self.targets.binary_search(&fd).is_ok()
    }

    /// Highest target, or stderr when there are no remaps.
    pub fn max_target(&self) -> RawFd {
        self.max_target
    }

    /// Remap targets in ascending order.
    pub fn targets_sorted(&self) -> &[RawFd] {
        &self.targets
    }

    /// Number of descriptors moved above `max_target` in the parent.
    pub fn temporary_count(&self) -> usize {
        self.temporaries.len()
    }

    /// Move an extra parent descriptor above every target so no `dup2` in the
    /// child can overwrite it. The returned descriptor is close-on-exec.
    pub fn reserve_above(&self, fd: OwnedFd) -> io::Result<OwnedFd> {
        if fd.as_raw_fd() > self.max_target {
            return Ok(fd);
        }
        dup_above(fd.as_raw_fd(), self.max_target)
    }
}

/// Duplicate `fd` to the lowest free number above `floor`, close-on-exec.
fn dup_above(fd: RawFd, floor: RawFd) -> io::Result<OwnedFd> {
    let duplicate = fcntl(fd, FcntlArg::F_DUPFD_CLOEXEC(floor + 1))?;
    // SAFETY: F_DUPFD_CLOEXEC returned a fresh descriptor nobody else owns.
    Ok(unsafe { OwnedFd::from_raw_fd(duplicate) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::cloexec_pipe;
    use nix::sys::stat::fstat;
    use std::collections::HashMap;

    fn identity(fd: RawFd) -> (u64, u64) {
        let stat = fstat(fd).unwrap();
        (stat.st_dev as u64, stat.st_ino as u64)
    }

    /// Apply the sequence to a model descriptor table keyed by open file
    /// identity, failing if any step reads a slot an earlier step overwrote.
    fn simulate(shuffle: &FileDescriptorShuffle) -> HashMap<RawFd, (u64, u64)> {
        let mut table = HashMap::new();
        let mut written = HashSet::new();
        for &(from, to) in shuffle.dup2_sequence() {
            assert!(!written.contains(&from), "fd {} read after being overwritten", from);
            table.insert(to, identity(from));
            written.insert(to);
        }
        table
    }

    #[test]
    fn test_empty_mapping() {
        let shuffle = FileDescriptorShuffle::init(&[]).unwrap();
        assert!(shuffle.dup2_sequence().is_empty());
        assert_eq!(shuffle.max_target(), libc::STDERR_FILENO);
        assert!(!shuffle.maps_to(0));
    }

    #[test]
    fn test_swap_is_cycle_safe() {
        let (a, _a_w) = cloexec_pipe().unwrap();
        let (b, _b_w) = cloexec_pipe().unwrap();
        let (a_fd, b_fd) = (a.as_raw_fd(), b.as_raw_fd());

        let shuffle = FileDescriptorShuffle::init(&[(a_fd, b_fd), (b_fd, a_fd)]).unwrap();
        assert_eq!(shuffle.temporary_count(), 2);

        let table = simulate(&shuffle);
        assert_eq!(table[&b_fd], identity(a_fd));
        assert_eq!(table[&a_fd], identity(b_fd));
        for &(from, _) in shuffle.dup2_sequence() {
            assert!(from > shuffle.max_target());
        }
    }

    #[test]
    fn test_chain_is_safe() {
        let (a, _a_w) = cloexec_pipe().unwrap();
        let (b, _b_w) = cloexec_pipe().unwrap();
        let (c, _c_w) = cloexec_pipe().unwrap();
        let (a_fd, b_fd, c_fd) = (a.as_raw_fd(), b.as_raw_fd(), c.as_raw_fd());

        let mapping = [(a_fd, b_fd), (b_fd, c_fd), (c_fd, a_fd)];
        let shuffle = FileDescriptorShuffle::init(&mapping).unwrap();
        let table = simulate(&shuffle);
        for (source, target) in mapping {
            assert_eq!(table[&target], identity(source));
        }
    }

    #[test]
    fn test_identity_mapping_goes_through_a_copy() {
        let (a, _a_w) = cloexec_pipe().unwrap();
        let fd = a.as_raw_fd();
        let shuffle = FileDescriptorShuffle::init(&[(fd, fd)]).unwrap();

        let (from, to) = shuffle.dup2_sequence()[0];
        assert_eq!(to, fd);
        assert_ne!(from, fd);
        assert!(shuffle.maps_to(fd));
    }

    #[test]
    fn test_high_source_is_used_directly() {
        let (a, _a_w) = cloexec_pipe().unwrap();
        let fd = a.as_raw_fd();

        let shuffle = FileDescriptorShuffle::init(&[(fd, 0)]).unwrap();
        assert_eq!(shuffle.dup2_sequence(), &[(fd, 0)]);
        assert_eq!(shuffle.temporary_count(), 0);
        assert_eq!(shuffle.targets_sorted(), &[0]);
    }

    #[test]
    fn test_rejects_duplicates() {
        let (a, b) = cloexec_pipe().unwrap();
        let (a_fd, b_fd) = (a.as_raw_fd(), b.as_raw_fd());

        let err = FileDescriptorShuffle::init(&[(a_fd, 3), (a_fd, 4)]).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EINVAL));

        let err = FileDescriptorShuffle::init(&[(a_fd, 3), (b_fd, 3)]).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
    }

    #[test]
    fn test_rejects_closed_source() {
        let err = FileDescriptorShuffle::init(&[(1_000_000, 3)]).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EBADF));

        let err = FileDescriptorShuffle::init(&[(-1, 3)]).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EBADF));
    }

    #[test]
    fn test_reserve_above_moves_low_descriptor() {
        let (a, _a_w) = cloexec_pipe().unwrap();
        let (extra, _extra_w) = cloexec_pipe().unwrap();
        let target = a.as_raw_fd() + 20;

        let shuffle = FileDescriptorShuffle::init(&[(a.as_raw_fd(), target)]).unwrap();
        let reserved = shuffle.reserve_above(extra).unwrap();
        assert!(reserved.as_raw_fd() > target);
    }
}
