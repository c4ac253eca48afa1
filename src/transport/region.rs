//! Registered memory regions.
//!
//! A region is a byte buffer the fabric can reach. Peers address it through a
//! [`RegionHandle`], which only carries what a remote key would: the owner, an
//! id, the length and the permitted access.

use std::fmt;
use std::ops::BitOr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::ring::Arena;

/// Access rights granted when registering a region.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Access(u8);

impl Access {
    pub const LOCAL: Access = Access(0b001);
    pub const REMOTE_READ: Access = Access(0b010);
    pub const REMOTE_WRITE: Access = Access(0b100);

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Access) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Access {
    type Output = Access;

    fn bitor(self, rhs: Access) -> Access {
        Access(self.0 | rhs.0)
    }
}

impl fmt::Debug for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(Access::LOCAL) {
            names.push("LOCAL");
        }
        if self.contains(Access::REMOTE_READ) {
            names.push("REMOTE_READ");
        }
        if self.contains(Access::REMOTE_WRITE) {
            names.push("REMOTE_WRITE");
        }
        write!(f, "Access({})", names.join(" | "))
    }
}

/// What a peer needs to address a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionHandle {
    pub rank: usize,
    pub id: u64,
    pub len: usize,
    pub access: Access,
}

impl RegionHandle {
    /// Whether `[offset, offset + len)` lies inside the region.
    pub fn covers(&self, offset: usize, len: usize) -> bool {
        offset.checked_add(len).is_some_and(|end| end <= self.len)
    }
}

struct RegionInner {
    handle: RegionHandle,
    bytes: Mutex<Box<[u8]>>,
    registered: AtomicBool,
}

/// A registered byte region. Clones share the same bytes.
#[derive(Clone)]
pub struct MemoryRegion {
    inner: Arc<RegionInner>,
}

impl MemoryRegion {
    pub(crate) fn new(rank: usize, id: u64, len: usize, access: Access) -> Self {
        Self {
            inner: Arc::new(RegionInner {
                handle: RegionHandle {
                    rank,
                    id,
                    len,
                    access,
                },
                bytes: Mutex::new(vec![0u8; len].into_boxed_slice()),
                registered: AtomicBool::new(true),
            }),
        }
    }

    pub fn handle(&self) -> RegionHandle {
        self.inner.handle
    }

    pub fn id(&self) -> u64 {
        self.inner.handle.id
    }

    pub fn len(&self) -> usize {
        self.inner.handle.len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn access(&self) -> Access {
        self.inner.handle.access
    }

    pub fn is_registered(&self) -> bool {
        self.inner.registered.load(Ordering::Acquire)
    }

    /// Revoke remote access. Local reads and writes keep working so a
    /// consumer can still drain what it already received.
    pub fn deregister(&self) {
        if self.inner.registered.swap(false, Ordering::AcqRel) {
            tracing::trace!(
                rank = self.inner.handle.rank,
                region = self.inner.handle.id,
                "region deregistered"
            );
        }
    }

    /// Whether a remote peer may perform `access` on `[offset, offset + len)`.
    pub(crate) fn check_remote(&self, access: Access, offset: usize, len: usize) -> Result<(), String> {
        let handle = self.inner.handle;
        if !self.is_registered() {
            return Err(format!("region {} of rank {} is deregistered", handle.id, handle.rank));
        }
        if !handle.access.contains(access) {
            return Err(format!(
                "region {} of rank {} does not allow {:?}",
                handle.id, handle.rank, access
            ));
        }
        if !handle.covers(offset, len) {
            return Err(format!(
                "access [{}, {}) outside region {} of {} bytes",
                offset,
                offset + len,
                handle.id,
                handle.len
            ));
        }
        Ok(())
    }

    pub fn read(&self, offset: usize, dst: &mut [u8]) {
        let bytes = self.inner.bytes.lock();
        dst.copy_from_slice(&bytes[offset..offset + dst.len()]);
    }

    pub fn write(&self, offset: usize, src: &[u8]) {
        let mut bytes = self.inner.bytes.lock();
        bytes[offset..offset + src.len()].copy_from_slice(src);
    }

    /// Copy of `[offset, offset + len)`.
    pub fn to_vec(&self, offset: usize, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        self.read(offset, &mut out);
        out
    }
}

impl fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("handle", &self.inner.handle)
            .field("registered", &self.is_registered())
            .finish()
    }
}

impl Arena for MemoryRegion {
    fn len(&self) -> usize {
        MemoryRegion::len(self)
    }

    fn write_at(&mut self, offset: usize, src: &[u8]) {
        self.write(offset, src);
    }

    fn read_at(&self, offset: usize, dst: &mut [u8]) {
        self.read(offset, dst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::RingBuffer;

    #[test]
    fn test_access_flags() {
        let access = Access::LOCAL | Access::REMOTE_READ;
        assert!(access.contains(Access::REMOTE_READ));
        assert!(!access.contains(Access::REMOTE_WRITE));
        assert!(!access.contains(Access::REMOTE_READ | Access::REMOTE_WRITE));
    }

    #[test]
    fn test_remote_checks() {
        let region = MemoryRegion::new(0, 1, 64, Access::LOCAL | Access::REMOTE_READ);
        assert!(region.check_remote(Access::REMOTE_READ, 0, 64).is_ok());
        assert!(region.check_remote(Access::REMOTE_READ, 60, 8).is_err());
        assert!(region.check_remote(Access::REMOTE_WRITE, 0, 8).is_err());

        region.deregister();
        assert!(region.check_remote(Access::REMOTE_READ, 0, 8).is_err());
    }

    #[test]
    fn test_ring_over_region() {
        let region = MemoryRegion::new(0, 1, 32, Access::LOCAL);
        let mut ring = RingBuffer::new(region.clone());
        ring.pack(b"hello");

        // The ring writes through to the shared bytes.
        assert_eq!(region.to_vec(0, 5), b"hello");
        assert_eq!(ring.unpack(5), b"hello");
    }
}
