//! Experiment configuration.
//!
//! Every machine must run with the same values: the region layout is
//! computed locally from these fields and never negotiated. Drift between
//! machines is not detected; [`ExperimentConfig::layout_fingerprint`] is
//! logged at startup so runs can be compared out of band.

use std::time::Duration;

use crate::barrier::BarrierWait;
use crate::error::ConfigError;
use crate::layout::{RegionLayout, SharedLayout};
use crate::machine::{GlobalThreadId, MachineInfo, Role};
use crate::remote::MAX_NODE_ID;

/// The only queue-pair scheduling policy supported.
pub const ONE_TO_ONE: &str = "ONE_TO_ONE";

#[derive(Debug, Clone)]
pub struct ExperimentConfig {
    /// Identifier of this machine.
    pub node_id: u64,
    pub first_mn_id: u64,
    pub last_mn_id: u64,
    pub first_cn_id: u64,
    pub last_cn_id: u64,
    /// Worker threads per compute node.
    pub cn_threads: u64,
    /// Operations per batch issued by each worker.
    pub cn_ops_per_thread: u64,
    /// Queue-pair scheduling policy name.
    pub qp_sched_pol: String,
    /// Words in each thread's Buf region.
    pub payload_size: u64,
    /// Words in each thread's Proposed and Log regions.
    pub capacity: u64,
    /// Address template; `{}` is replaced by the machine id.
    pub host_template: String,
    /// Words in each memory node's pool.
    pub mn_pool_words: u64,
    pub barrier_wait: BarrierWait,
    /// How long a compute node waits for a memory node to start listening.
    pub connect_timeout: Duration,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            node_id: 0,
            first_mn_id: 0,
            last_mn_id: 0,
            first_cn_id: 0,
            last_cn_id: 0,
            cn_threads: 1,
            cn_ops_per_thread: 1,
            qp_sched_pol: ONE_TO_ONE.to_string(),
            payload_size: 8,
            capacity: 4,
            host_template: "node{}".to_string(),
            mn_pool_words: 1 << 20,
            barrier_wait: BarrierWait::Forever,
            connect_timeout: Duration::from_secs(30),
        }
    }
}

impl ExperimentConfig {
    #[inline]
    pub fn role(&self) -> Role {
        Role::resolve(
            self.node_id,
            self.first_mn_id,
            self.last_mn_id,
            self.first_cn_id,
            self.last_cn_id,
        )
    }

    /// Number of compute machines participating in consensus.
    #[inline]
    pub fn system_size(&self) -> u64 {
        self.last_cn_id - self.first_cn_id + 1
    }

    #[inline]
    pub fn total_threads(&self) -> u64 {
        self.system_size() * self.cn_threads
    }

    #[inline]
    pub fn memory_node_count(&self) -> u64 {
        self.last_mn_id - self.first_mn_id + 1
    }

    pub fn this_machine(&self) -> MachineInfo {
        MachineInfo::from_template(self.node_id, &self.host_template)
    }

    pub fn memory_nodes(&self) -> Vec<MachineInfo> {
        (self.first_mn_id..=self.last_mn_id)
            .map(|id| MachineInfo::from_template(id, &self.host_template))
            .collect()
    }

    /// Memory node that holds the root table, scratch and report area.
    #[inline]
    pub fn root_node(&self) -> u64 {
        self.first_mn_id
    }

    /// Memory node on which the thread in root-table slot `slot` allocates.
    #[inline]
    pub fn home_node(&self, slot: u64) -> u64 {
        self.first_mn_id + slot % self.memory_node_count()
    }

    #[inline]
    pub fn global_thread_id(&self, local_index: u32) -> GlobalThreadId {
        GlobalThreadId::new(self.node_id, self.cn_threads, local_index)
    }

    /// Root-table slot of local thread `local_index` on this machine.
    #[inline]
    pub fn slot_of(&self, local_index: u32) -> u64 {
        self.global_thread_id(local_index)
            .slot(self.first_cn_id, self.cn_threads)
    }

    /// The leader is the first compute node; it reduces and exports results.
    #[inline]
    pub fn is_leader_node(&self) -> bool {
        self.node_id == self.first_cn_id
    }

    #[inline]
    pub fn region_layout(&self) -> RegionLayout {
        RegionLayout::plan(self.capacity, self.payload_size)
    }

    #[inline]
    pub fn shared_layout(&self) -> SharedLayout {
        SharedLayout::plan(self.total_threads(), self.system_size())
    }

    /// Check every parameter that must hold before any connection is made.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.first_mn_id > self.last_mn_id {
            return Err(ConfigError::EmptyRange {
                role: "memory node",
                first: self.first_mn_id,
                last: self.last_mn_id,
            });
        }
        if self.first_cn_id > self.last_cn_id {
            return Err(ConfigError::EmptyRange {
                role: "compute node",
                first: self.first_cn_id,
                last: self.last_cn_id,
            });
        }
        let max_id = self.last_mn_id.max(self.last_cn_id).max(self.node_id);
        if max_id > MAX_NODE_ID {
            return Err(ConfigError::NodeIdTooLarge(max_id));
        }
        if self.cn_threads == 0 {
            return Err(ConfigError::NoThreads);
        }
        if self.capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        let total_threads = self
            .system_size()
            .checked_mul(self.cn_threads)
            .ok_or(ConfigError::LayoutOverflow("total thread count"))?;
        if self.cn_ops_per_thread != total_threads {
            return Err(ConfigError::BatchSizeMismatch {
                ops_per_thread: self.cn_ops_per_thread,
                total_threads,
            });
        }
        if self.qp_sched_pol != ONE_TO_ONE {
            return Err(ConfigError::UnsupportedPolicy(self.qp_sched_pol.clone()));
        }

        // Worst case for the root node: the shared chunk plus every region homed there.
        let region = self
            .region_layout()
            .checked_allocation_size()
            .ok_or(ConfigError::LayoutOverflow("thread allocation size"))?;
        let shared = self
            .shared_layout()
            .checked_allocation_size()
            .ok_or(ConfigError::LayoutOverflow("shared chunk size"))?;
        let homed = total_threads.div_ceil(self.memory_node_count());
        let required = homed
            .checked_mul(region)
            .and_then(|r| r.checked_add(shared))
            .ok_or(ConfigError::LayoutOverflow("memory node pool requirement"))?;
        if required > self.mn_pool_words {
            return Err(ConfigError::PoolTooSmall {
                pool_words: self.mn_pool_words,
                required,
            });
        }
        Ok(())
    }

    /// FNV-1a hash of every field that feeds the memory layout.
    ///
    /// Stable across builds, so fingerprints from different machines compare.
    pub fn layout_fingerprint(&self) -> u64 {
        const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
        const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
        [
            self.first_mn_id,
            self.last_mn_id,
            self.first_cn_id,
            self.last_cn_id,
            self.cn_threads,
            self.capacity,
            self.payload_size,
        ]
        .iter()
        .flat_map(|v| v.to_le_bytes())
        .fold(FNV_OFFSET, |h, b| (h ^ b as u64).wrapping_mul(FNV_PRIME))
    }

    /// Copy of this configuration as seen from machine `node_id`.
    pub fn for_node(&self, node_id: u64) -> Self {
        Self {
            node_id,
            ..self.clone()
        }
    }
}
