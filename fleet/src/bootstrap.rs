//! Node bootstrap: turn a role into connected memory/compute node objects.

use std::sync::Arc;

use crate::config::ExperimentConfig;
use crate::error::Result;
use crate::machine::{MachineInfo, Role};
use crate::remote::{ComputeNode, Fabric, MemoryNode};

/// The transport objects this machine runs, kept alive for the whole experiment.
pub struct Node<F: Fabric> {
    pub me: MachineInfo,
    pub role: Role,
    pub memory: Option<F::Memory>,
    pub compute: Option<Arc<F::Compute>>,
}

/// Construct and wire this machine's nodes.
///
/// The memory node must exist before the compute node: a machine that is
/// both hands its memory node's keys to its compute node for the local
/// connection. Any connection failure is returned as-is and is fatal.
pub fn bootstrap<F: Fabric>(fabric: &F, config: &ExperimentConfig) -> Result<Node<F>> {
    let me = config.this_machine();
    let role = config.role();
    let memnodes = config.memory_nodes();

    // Memory node configuration must come first.
    let memory = if role.is_memory() {
        Some(fabric.memory_node(&me, config)?)
    } else {
        None
    };

    let compute = if role.is_compute() {
        let compute = fabric.compute_node(&me, config)?;
        if let Some(memory) = &memory {
            compute.connect_local(&memnodes, memory.local_keys())?;
        }
        compute.connect_remote(&memnodes)?;
        Some(Arc::new(compute))
    } else {
        None
    };

    // Wait for every expected compute node, then for each of them to signal ready.
    if let Some(memory) = &memory {
        memory.block_until_ready()?;
    }

    tracing::info!(machine = %me, ?role, "bootstrap complete");
    Ok(Node {
        me,
        role,
        memory,
        compute,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::error::Error;
    use crate::remote::{RemoteAccess, RemotePtr};

    /// Records the order of bootstrap calls.
    #[derive(Default)]
    struct Script {
        log: Arc<Mutex<Vec<String>>>,
        fail_remote: bool,
    }

    impl Script {
        fn push(&self, s: impl Into<String>) {
            self.log.lock().unwrap().push(s.into());
        }
    }

    struct Mem(Arc<Mutex<Vec<String>>>);
    struct Cn(Arc<Mutex<Vec<String>>>, bool);
    struct Th;

    impl MemoryNode for Mem {
        type Keys = u32;
        fn local_keys(&self) -> u32 {
            self.0.lock().unwrap().push("keys".into());
            7
        }
        fn block_until_ready(&self) -> Result<()> {
            self.0.lock().unwrap().push("ready".into());
            Ok(())
        }
    }

    impl ComputeNode for Cn {
        type Keys = u32;
        fn connect_local(&self, peers: &[MachineInfo], keys: u32) -> Result<()> {
            self.0
                .lock()
                .unwrap()
                .push(format!("local {} {}", peers.len(), keys));
            Ok(())
        }
        fn connect_remote(&self, peers: &[MachineInfo]) -> Result<()> {
            if self.1 {
                return Err(Error::Connect {
                    node: peers[0].id,
                    reason: "refused".into(),
                });
            }
            self.0.lock().unwrap().push(format!("remote {}", peers.len()));
            Ok(())
        }
    }

    impl RemoteAccess for Th {
        fn allocate(&mut self, _: u64) -> Result<RemotePtr> {
            unreachable!()
        }
        fn read(&mut self, _: RemotePtr) -> Result<u64> {
            unreachable!()
        }
        fn write(&mut self, _: RemotePtr, _: u64) -> Result<()> {
            unreachable!()
        }
        fn root(&mut self) -> Result<RemotePtr> {
            unreachable!()
        }
        fn set_root(&mut self, _: RemotePtr) -> Result<()> {
            unreachable!()
        }
        fn local_index(&self) -> u32 {
            0
        }
        fn arrive_control_barrier(&mut self, _: u64) -> Result<()> {
            unreachable!()
        }
    }

    impl Fabric for Script {
        type Keys = u32;
        type Memory = Mem;
        type Compute = Cn;
        type Thread = Th;

        fn memory_node(&self, me: &MachineInfo, _: &ExperimentConfig) -> Result<Mem> {
            self.push(format!("memory {}", me.id));
            Ok(Mem(self.log.clone()))
        }
        fn compute_node(&self, me: &MachineInfo, _: &ExperimentConfig) -> Result<Cn> {
            self.push(format!("compute {}", me.id));
            Ok(Cn(self.log.clone(), self.fail_remote))
        }
        fn compute_thread(&self, _: &Arc<Cn>, _: &ExperimentConfig, _: u32) -> Result<Th> {
            Ok(Th)
        }
    }

    fn cfg(node_id: u64) -> ExperimentConfig {
        ExperimentConfig {
            node_id,
            first_mn_id: 0,
            last_mn_id: 1,
            first_cn_id: 1,
            last_cn_id: 2,
            cn_ops_per_thread: 2,
            ..Default::default()
        }
    }

    #[test]
    fn test_both_roles_memory_first_then_local_then_remote() {
        let fabric = Script::default();
        let node = bootstrap(&fabric, &cfg(1)).unwrap();
        assert_eq!(node.role, Role::Both);
        assert!(node.memory.is_some() && node.compute.is_some());
        assert_eq!(
            *fabric.log.lock().unwrap(),
            ["memory 1", "compute 1", "keys", "local 2 7", "remote 2", "ready"]
        );
    }

    #[test]
    fn test_memory_only() {
        let fabric = Script::default();
        let node = bootstrap(&fabric, &cfg(0)).unwrap();
        assert_eq!(node.role, Role::MemoryOnly);
        assert!(node.compute.is_none());
        assert_eq!(*fabric.log.lock().unwrap(), ["memory 0", "ready"]);
    }

    #[test]
    fn test_compute_only_skips_local_connection() {
        let fabric = Script::default();
        let node = bootstrap(&fabric, &cfg(2)).unwrap();
        assert_eq!(node.role, Role::ComputeOnly);
        assert_eq!(*fabric.log.lock().unwrap(), ["compute 2", "remote 2"]);
    }

    #[test]
    fn test_neither_does_nothing() {
        let fabric = Script::default();
        let node = bootstrap(&fabric, &cfg(5)).unwrap();
        assert_eq!(node.role, Role::Neither);
        assert!(fabric.log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_remote_failure_is_fatal() {
        let fabric = Script {
            fail_remote: true,
            ..Default::default()
        };
        assert!(matches!(
            bootstrap(&fabric, &cfg(1)),
            Err(Error::Connect { node: 0, .. })
        ));
        // Never reached readiness.
        assert!(!fabric.log.lock().unwrap().iter().any(|s| s == "ready"));
    }
}
