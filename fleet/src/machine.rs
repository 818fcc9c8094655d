//! Machine identity, role resolution and global thread ids.

use std::fmt;

/// Network identity of one machine in the fleet.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MachineInfo {
    pub id: u64,
    pub address: String,
}

impl MachineInfo {
    pub fn new(id: u64, address: impl Into<String>) -> Self {
        Self {
            id,
            address: address.into(),
        }
    }

    /// Build a `MachineInfo` whose address is `template` with `{}` replaced by the id.
    ///
    /// `node{}` yields `node0`, `node1`, ...
    pub fn from_template(id: u64, template: &str) -> Self {
        Self::new(id, template.replace("{}", &id.to_string()))
    }
}

impl fmt::Display for MachineInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.id, self.address)
    }
}

/// What a machine does in the experiment, derived once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    MemoryOnly,
    ComputeOnly,
    Both,
    Neither,
}

impl Role {
    /// Resolve the role of `id` from the inclusive memory-node and compute-node id ranges.
    ///
    /// Overlapping ranges are allowed and yield [`Role::Both`].
    pub fn resolve(
        id: u64,
        first_mn_id: u64,
        last_mn_id: u64,
        first_cn_id: u64,
        last_cn_id: u64,
    ) -> Self {
        let memory = (first_mn_id..=last_mn_id).contains(&id);
        let compute = (first_cn_id..=last_cn_id).contains(&id);
        match (memory, compute) {
            (true, true) => Role::Both,
            (true, false) => Role::MemoryOnly,
            (false, true) => Role::ComputeOnly,
            (false, false) => Role::Neither,
        }
    }

    #[inline]
    pub fn is_memory(self) -> bool {
        matches!(self, Role::MemoryOnly | Role::Both)
    }

    #[inline]
    pub fn is_compute(self) -> bool {
        matches!(self, Role::ComputeOnly | Role::Both)
    }
}

/// System-wide unique thread index: `node_id * threads_per_node + local_index`.
///
/// Indexes the root table and the report area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GlobalThreadId(pub u64);

impl GlobalThreadId {
    #[inline]
    pub fn new(node_id: u64, threads_per_node: u64, local_index: u32) -> Self {
        debug_assert!((local_index as u64) < threads_per_node);
        Self(node_id * threads_per_node + local_index as u64)
    }

    /// Slot index into per-thread shared tables, relative to the first compute node.
    #[inline]
    pub fn slot(self, first_cn_id: u64, threads_per_node: u64) -> u64 {
        self.0 - first_cn_id * threads_per_node
    }
}

impl fmt::Display for GlobalThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}
