//! Transport contracts: remote pointers and the node/thread objects a fabric provides.
//!
//! The RDMA transport itself lives outside this crate. Everything the
//! bootstrap and publication protocols need from it is expressed by the
//! [`Fabric`], [`MemoryNode`], [`ComputeNode`] and [`RemoteAccess`] traits.
//! [`crate::loopback`] implements them inside one process.

use std::fmt;
use std::sync::Arc;

use crate::config::ExperimentConfig;
use crate::error::Result;
use crate::machine::MachineInfo;

/// Size of one remotely addressable element in bytes.
pub const WORD_SIZE: u64 = 8;

const NODE_SHIFT: u32 = 48;
const OFFSET_MASK: u64 = (1 << NODE_SHIFT) - 1;

/// Largest memory-node id that fits in a [`RemotePtr`].
pub const MAX_NODE_ID: u64 = (1 << (64 - NODE_SHIFT)) - 1;

/// Opaque handle to a word in some memory node's pool.
///
/// Layout: node id in the high 16 bits, word offset in the low 48 bits.
/// The handle is a plain `u64` so it can itself be stored in remote memory.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct RemotePtr(u64);

impl RemotePtr {
    pub const NULL: RemotePtr = RemotePtr(0);

    #[inline]
    pub fn new(node: u64, offset: u64) -> Self {
        debug_assert!(node <= MAX_NODE_ID);
        debug_assert!(offset <= OFFSET_MASK);
        Self((node << NODE_SHIFT) | (offset & OFFSET_MASK))
    }

    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn node(self) -> u64 {
        self.0 >> NODE_SHIFT
    }

    #[inline]
    pub const fn offset(self) -> u64 {
        self.0 & OFFSET_MASK
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Pointer `count` elements past `self`.
    #[inline]
    pub fn add(self, count: u64) -> Self {
        Self::new(self.node(), self.offset() + count)
    }
}

impl fmt::Debug for RemotePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RemotePtr({}:{:#x})", self.node(), self.offset())
    }
}

impl fmt::Display for RemotePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:#x}", self.node(), self.offset())
    }
}

/// A contiguous span of remote memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteRegion {
    pub base: RemotePtr,
    /// Element stride in bytes.
    pub stride: u64,
    /// Number of elements.
    pub len: u64,
}

impl RemoteRegion {
    #[inline]
    pub fn new(base: RemotePtr, len: u64) -> Self {
        Self {
            base,
            stride: WORD_SIZE,
            len,
        }
    }

    /// Pointer to element `index`, or `None` past the end.
    #[inline]
    pub fn get(&self, index: u64) -> Option<RemotePtr> {
        (index < self.len).then(|| self.base.add(index))
    }

    #[inline]
    pub fn size_bytes(&self) -> u64 {
        self.len * self.stride
    }
}

/// A machine's memory-node half: owns pools and accepts connections.
pub trait MemoryNode: Send + Sync {
    type Keys: Clone + Send;

    /// Remote-access keys for a compute node running on this same machine.
    fn local_keys(&self) -> Self::Keys;

    /// Block until every expected compute node has connected and signalled ready.
    ///
    /// This is only the machine-local half of readiness.
    fn block_until_ready(&self) -> Result<()>;
}

/// A machine's compute-node half: owns connections to every memory node.
pub trait ComputeNode: Send + Sync {
    type Keys: Clone + Send;

    /// Wire the memory node running on this machine using its keys, without a network round trip.
    fn connect_local(&self, peers: &[MachineInfo], keys: Self::Keys) -> Result<()>;

    /// Connect to every memory node in `peers` that is not already connected.
    fn connect_remote(&self, peers: &[MachineInfo]) -> Result<()>;
}

/// Per-thread handle for remote memory and the control barrier.
pub trait RemoteAccess: Send {
    /// Allocate `count` contiguous elements on the memory node assigned to this thread.
    fn allocate(&mut self, count: u64) -> Result<RemotePtr>;

    fn read(&mut self, ptr: RemotePtr) -> Result<u64>;

    fn write(&mut self, ptr: RemotePtr, value: u64) -> Result<()>;

    /// The system-wide root pointer.
    fn root(&mut self) -> Result<RemotePtr>;

    fn set_root(&mut self, ptr: RemotePtr) -> Result<()>;

    fn local_index(&self) -> u32;

    /// Announce arrival and block until `target` arrivals for the current phase are observed.
    fn arrive_control_barrier(&mut self, target: u64) -> Result<()>;

    fn write_words(&mut self, ptr: RemotePtr, words: &[u64]) -> Result<()> {
        for (i, &w) in words.iter().enumerate() {
            self.write(ptr.add(i as u64), w)?;
        }
        Ok(())
    }

    fn read_words(&mut self, ptr: RemotePtr, out: &mut [u64]) -> Result<()> {
        for (i, w) in out.iter_mut().enumerate() {
            *w = self.read(ptr.add(i as u64))?;
        }
        Ok(())
    }
}

/// Factory for the transport objects of one machine.
pub trait Fabric: Send + Sync {
    type Keys: Clone + Send;
    type Memory: MemoryNode<Keys = Self::Keys>;
    type Compute: ComputeNode<Keys = Self::Keys>;
    type Thread: RemoteAccess;

    /// Create the memory node of `me`; it starts accepting connections before returning.
    fn memory_node(&self, me: &MachineInfo, config: &ExperimentConfig) -> Result<Self::Memory>;

    fn compute_node(&self, me: &MachineInfo, config: &ExperimentConfig) -> Result<Self::Compute>;

    fn compute_thread(
        &self,
        node: &Arc<Self::Compute>,
        config: &ExperimentConfig,
        local_index: u32,
    ) -> Result<Self::Thread>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_ptr_fields() {
        let p = RemotePtr::new(3, 0x1234);
        assert_eq!(p.node(), 3);
        assert_eq!(p.offset(), 0x1234);
        assert_eq!(p.add(4).offset(), 0x1238);
        assert_eq!(p.add(4).node(), 3);
        assert_eq!(RemotePtr::from_raw(p.raw()), p);
        assert!(RemotePtr::NULL.is_null());
        assert!(!p.is_null());
    }

    #[test]
    fn test_remote_ptr_max_node() {
        let p = RemotePtr::new(MAX_NODE_ID, 1);
        assert_eq!(p.node(), MAX_NODE_ID);
        assert_eq!(p.offset(), 1);
    }

    #[test]
    fn test_region_get() {
        let r = RemoteRegion::new(RemotePtr::new(1, 100), 4);
        assert_eq!(r.get(0), Some(RemotePtr::new(1, 100)));
        assert_eq!(r.get(3), Some(RemotePtr::new(1, 103)));
        assert_eq!(r.get(4), None);
        assert_eq!(r.size_bytes(), 32);
    }
}
