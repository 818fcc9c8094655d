//! Region layout planning.
//!
//! Every participant computes the same offsets from configuration alone.
//! There is no negotiation channel, so these functions must stay pure.
//!
//! Per-thread allocation (`2 * capacity + payload_size` words):
//!
//! ```text
//! +-----------------------------------+ 0
//! |   Proposed   -- capacity          |
//! +-----------------------------------+ capacity
//! |   Log        -- capacity          |
//! +-----------------------------------+ 2 * capacity
//! |   Buf        -- payload size      |
//! +-----------------------------------+ 2 * capacity + payload_size
//! ```
//!
//! Shared allocation made once by slot 0 and published as the root:
//!
//! ```text
//! +-----------------------------------+ 0
//! |   RootTable  -- total threads     |
//! +-----------------------------------+ T
//! |   Scratch    -- system size       |
//! +-----------------------------------+ T + S
//! |   Reports    -- T * METRICS_WORDS |
//! +-----------------------------------+
//! ```

use std::ops::Range;

use crate::metrics::METRICS_WORDS;
use crate::remote::{RemotePtr, RemoteRegion};

/// Offsets of the three regions inside one thread's allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionLayout {
    pub capacity: u64,
    pub payload_size: u64,
}

/// A thread's regions resolved against its allocated base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadRegions {
    pub proposed: RemoteRegion,
    pub log: RemoteRegion,
    pub buf: RemoteRegion,
}

impl RegionLayout {
    #[inline]
    pub const fn plan(capacity: u64, payload_size: u64) -> Self {
        Self {
            capacity,
            payload_size,
        }
    }

    /// Elements requested in the single contiguous allocation.
    #[inline]
    pub const fn allocation_size(&self) -> u64 {
        2 * self.capacity + self.payload_size
    }

    /// [`Self::allocation_size`], or `None` if it does not fit in a `u64`.
    pub const fn checked_allocation_size(&self) -> Option<u64> {
        match self.capacity.checked_mul(2) {
            Some(both) => both.checked_add(self.payload_size),
            None => None,
        }
    }

    #[inline]
    pub const fn proposed(&self) -> Range<u64> {
        0..self.capacity
    }

    #[inline]
    pub const fn log(&self) -> Range<u64> {
        self.capacity..2 * self.capacity
    }

    #[inline]
    pub const fn buf(&self) -> Range<u64> {
        2 * self.capacity..self.allocation_size()
    }

    pub fn regions(&self, base: RemotePtr) -> ThreadRegions {
        let region = |r: Range<u64>| RemoteRegion::new(base.add(r.start), r.end - r.start);
        ThreadRegions {
            proposed: region(self.proposed()),
            log: region(self.log()),
            buf: region(self.buf()),
        }
    }
}

/// Offsets inside the shared chunk that the root pointer addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharedLayout {
    pub total_threads: u64,
    pub system_size: u64,
}

impl SharedLayout {
    #[inline]
    pub const fn plan(total_threads: u64, system_size: u64) -> Self {
        Self {
            total_threads,
            system_size,
        }
    }

    #[inline]
    pub const fn allocation_size(&self) -> u64 {
        self.total_threads + self.system_size + self.total_threads * METRICS_WORDS
    }

    /// [`Self::allocation_size`], or `None` if it does not fit in a `u64`.
    pub fn checked_allocation_size(&self) -> Option<u64> {
        self.total_threads
            .checked_mul(METRICS_WORDS)?
            .checked_add(self.total_threads)?
            .checked_add(self.system_size)
    }

    #[inline]
    pub const fn root_table(&self) -> Range<u64> {
        0..self.total_threads
    }

    #[inline]
    pub const fn scratch(&self) -> Range<u64> {
        self.total_threads..self.total_threads + self.system_size
    }

    #[inline]
    pub const fn reports(&self) -> Range<u64> {
        self.total_threads + self.system_size..self.allocation_size()
    }

    /// Report slot of root-table slot `slot`, relative to the root.
    #[inline]
    pub const fn report_offset(&self, slot: u64) -> u64 {
        self.reports().start + slot * METRICS_WORDS
    }

    pub fn scratch_region(&self, root: RemotePtr) -> RemoteRegion {
        let r = self.scratch();
        RemoteRegion::new(root.add(r.start), r.end - r.start)
    }
}
