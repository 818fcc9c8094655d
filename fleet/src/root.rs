//! Root publication protocol.
//!
//! 1. Slot 0 allocates the shared chunk ([`SharedLayout`]) and makes it the
//!    system-wide root ([`install_root`]).
//! 2. Every thread allocates its own region, locates the root table and
//!    writes its region base into its own slot ([`RootTable::publish`]).
//! 3. Every thread arrives at the post-allocation barrier. Only then may any
//!    slot be read, which is why reads live on [`Published`], the value
//!    returned by [`RootTable::publish_and_wait`].

use crate::error::Result;
use crate::layout::SharedLayout;
use crate::metrics::{METRICS_WORDS, Metrics};
use crate::remote::{RemoteAccess, RemotePtr, RemoteRegion};

/// Allocate the shared chunk and publish it as the root. Called once, by slot 0.
pub fn install_root<A: RemoteAccess>(thread: &mut A, layout: &SharedLayout) -> Result<RemotePtr> {
    let root = thread.allocate(layout.allocation_size())?;
    thread.set_root(root)?;
    tracing::debug!(%root, slots = layout.total_threads, "root table installed");
    Ok(root)
}

/// The root table before the post-allocation barrier: writable, not readable.
#[derive(Debug, Clone, Copy)]
pub struct RootTable {
    base: RemotePtr,
    layout: SharedLayout,
}

impl RootTable {
    /// Find the root table through the system-wide root pointer.
    pub fn locate<A: RemoteAccess>(thread: &mut A, layout: SharedLayout) -> Result<Self> {
        Ok(Self {
            base: thread.root()?,
            layout,
        })
    }

    #[inline]
    pub fn base(&self) -> RemotePtr {
        self.base
    }

    #[inline]
    fn slot_ptr(&self, slot: u64) -> RemotePtr {
        debug_assert!(slot < self.layout.total_threads);
        self.base.add(slot)
    }

    /// Write this thread's region base into its own slot.
    pub fn publish<A: RemoteAccess>(
        &self,
        thread: &mut A,
        slot: u64,
        region: RemotePtr,
    ) -> Result<()> {
        thread.write(self.slot_ptr(slot), region.raw())
    }

    /// Publish, then wait at the barrier that makes every slot readable.
    pub fn publish_and_wait<A: RemoteAccess>(
        self,
        thread: &mut A,
        slot: u64,
        region: RemotePtr,
    ) -> Result<Published> {
        self.publish(thread, slot, region)?;
        thread.arrive_control_barrier(self.layout.total_threads)?;
        Ok(Published { table: self })
    }
}

/// The root table after the post-allocation barrier: every slot is populated.
#[derive(Debug, Clone, Copy)]
pub struct Published {
    table: RootTable,
}

impl Published {
    #[inline]
    pub fn total_threads(&self) -> u64 {
        self.table.layout.total_threads
    }

    /// Region base published by the thread in `slot`.
    pub fn read<A: RemoteAccess>(&self, thread: &mut A, slot: u64) -> Result<RemotePtr> {
        thread
            .read(self.table.slot_ptr(slot))
            .map(RemotePtr::from_raw)
    }

    pub fn read_all<A: RemoteAccess>(&self, thread: &mut A) -> Result<Vec<RemotePtr>> {
        (0..self.total_threads())
            .map(|slot| self.read(thread, slot))
            .collect()
    }

    /// The system-wide scratch region, one word per compute machine.
    pub fn scratch(&self) -> RemoteRegion {
        self.table.layout.scratch_region(self.table.base)
    }

    fn report_ptr(&self, slot: u64) -> RemotePtr {
        self.table.base.add(self.table.layout.report_offset(slot))
    }

    /// Write this thread's metrics into its report slot.
    pub fn report<A: RemoteAccess>(
        &self,
        thread: &mut A,
        slot: u64,
        metrics: &Metrics,
    ) -> Result<()> {
        thread.write_words(self.report_ptr(slot), &metrics.to_words())
    }

    /// Read and merge every report. Valid only after the post-report barrier.
    pub fn collect_reports<A: RemoteAccess>(&self, thread: &mut A) -> Result<Metrics> {
        let mut total = Metrics::default();
        let mut words = [0u64; METRICS_WORDS as usize];
        for slot in 0..self.total_threads() {
            thread.read_words(self.report_ptr(slot), &mut words)?;
            total += &Metrics::from_words(&words);
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::ExperimentConfig;
    use crate::loopback::LoopbackFabric;
    use crate::remote::{ComputeNode, Fabric, MemoryNode};

    #[test]
    fn test_publish_then_read_round_trip() {
        let cfg = ExperimentConfig {
            cn_threads: 3,
            cn_ops_per_thread: 3,
            mn_pool_words: 4096,
            ..Default::default()
        };
        let fabric = LoopbackFabric::new();
        let me = cfg.this_machine();
        let mem = fabric.memory_node(&me, &cfg).unwrap();
        let compute = Arc::new(fabric.compute_node(&me, &cfg).unwrap());
        compute
            .connect_local(&cfg.memory_nodes(), mem.local_keys())
            .unwrap();
        compute.connect_remote(&cfg.memory_nodes()).unwrap();
        mem.block_until_ready().unwrap();

        let mut threads: Vec<_> = (0..3)
            .map(|i| fabric.compute_thread(&compute, &cfg, i).unwrap())
            .collect();
        let root = install_root(&mut threads[0], &cfg.shared_layout()).unwrap();
        assert_eq!(threads[1].root().unwrap(), root);

        let handles: Vec<_> = threads
            .into_iter()
            .map(|mut t| {
                let cfg = cfg.clone();
                std::thread::spawn(move || {
                    let slot = cfg.slot_of(t.local_index());
                    let base = t.allocate(cfg.region_layout().allocation_size()).unwrap();
                    let table = RootTable::locate(&mut t, cfg.shared_layout()).unwrap();
                    let published = table.publish_and_wait(&mut t, slot, base).unwrap();
                    (base, published.read_all(&mut t).unwrap())
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let bases: Vec<RemotePtr> = results.iter().map(|(b, _)| *b).collect();
        for (_, seen) in &results {
            assert_eq!(seen, &bases);
        }
    }
}
