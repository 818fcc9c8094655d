//! In-process fabric.
//!
//! Memory nodes are word pools registered in a shared directory; compute
//! nodes "connect" by looking a pool up and taking one of its connection
//! slots. Remote reads and writes are atomic loads and stores on pool words,
//! so every protocol built on [`RemoteAccess`] runs unchanged when all
//! machines share one process (tests, `--local-cluster`).
//!
//! Words `0..RESERVED_WORDS` of every pool are never handed out by
//! `allocate`. On the root memory node, word 0 holds the root pointer and
//! word 1 the control-barrier arrival counter.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use crate::barrier::{BarrierCounter, BarrierWait, ControlBarrier};
use crate::config::ExperimentConfig;
use crate::error::{Error, Result};
use crate::machine::MachineInfo;
use crate::remote::{ComputeNode, Fabric, MemoryNode, RemoteAccess, RemotePtr};

pub const RESERVED_WORDS: u64 = 8;
const ROOT_CELL: u64 = 0;
const BARRIER_CELL: u64 = 1;

const POLL_INTERVAL: Duration = Duration::from_micros(200);

/// Remote-access keys of a loopback memory node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopbackKeys {
    pub node: u64,
    pub rkey: u32,
}

struct Pool {
    node: u64,
    rkey: u32,
    words: Box<[AtomicU64]>,
    next: AtomicU64,
    /// One control flag per expected compute-node connection.
    ready: Box<[AtomicBool]>,
    accepted: AtomicU64,
}

impl Pool {
    fn new(node: u64, pool_words: u64, expected_connections: u64) -> Self {
        Self {
            node,
            rkey: rand::random(),
            words: (0..pool_words + RESERVED_WORDS)
                .map(|_| AtomicU64::new(0))
                .collect(),
            next: AtomicU64::new(RESERVED_WORDS),
            ready: (0..expected_connections)
                .map(|_| AtomicBool::new(false))
                .collect(),
            accepted: AtomicU64::new(0),
        }
    }

    fn keys(&self) -> LoopbackKeys {
        LoopbackKeys {
            node: self.node,
            rkey: self.rkey,
        }
    }

    fn capacity(&self) -> u64 {
        self.words.len() as u64
    }

    /// Take a connection slot; returns its control-flag index.
    fn accept(&self) -> Result<usize> {
        let idx = self.accepted.fetch_add(1, Ordering::AcqRel);
        if idx >= self.ready.len() as u64 {
            return Err(Error::Connect {
                node: self.node,
                reason: format!(
                    "unexpected connection {} of {}",
                    idx + 1,
                    self.ready.len()
                ),
            });
        }
        Ok(idx as usize)
    }

    fn allocate(&self, count: u64) -> Result<RemotePtr> {
        let capacity = self.capacity();
        self.next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |next| {
                next.checked_add(count).filter(|&end| end <= capacity)
            })
            .map(|start| RemotePtr::new(self.node, start))
            .map_err(|next| Error::PoolExhausted {
                node: self.node,
                requested: count,
                available: capacity - next,
            })
    }

    fn word(&self, ptr: RemotePtr) -> Result<&AtomicU64> {
        if ptr.node() != self.node {
            return Err(Error::OutOfBounds {
                node: self.node,
                ptr,
            });
        }
        self.words
            .get(ptr.offset() as usize)
            .ok_or(Error::OutOfBounds {
                node: self.node,
                ptr,
            })
    }
}

#[derive(Default)]
struct Directory {
    pools: RwLock<HashMap<u64, Arc<Pool>>>,
}

impl Directory {
    fn get(&self, node: u64) -> Option<Arc<Pool>> {
        self.pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&node)
            .cloned()
    }

    fn listen(&self, pool: Arc<Pool>) -> Result<()> {
        let mut pools = self.pools.write().unwrap_or_else(PoisonError::into_inner);
        if pools.contains_key(&pool.node) {
            return Err(Error::Connect {
                node: pool.node,
                reason: "a memory node with this id is already listening".to_string(),
            });
        }
        pools.insert(pool.node, pool);
        Ok(())
    }

    /// Wait for `peer` to start listening.
    fn wait_for(&self, peer: &MachineInfo, timeout: Duration) -> Result<Arc<Pool>> {
        let begin = Instant::now();
        loop {
            if let Some(pool) = self.get(peer.id) {
                return Ok(pool);
            }
            if begin.elapsed() >= timeout {
                return Err(Error::Connect {
                    node: peer.id,
                    reason: format!(
                        "no memory node listening at {} after {:?}",
                        peer.address, timeout
                    ),
                });
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

/// Process-local fabric shared by every machine in the process.
#[derive(Clone, Default)]
pub struct LoopbackFabric {
    directory: Arc<Directory>,
}

impl LoopbackFabric {
    pub fn new() -> Self {
        Self::default()
    }
}

pub struct LoopbackMemoryNode {
    pool: Arc<Pool>,
    wait: BarrierWait,
}

impl MemoryNode for LoopbackMemoryNode {
    type Keys = LoopbackKeys;

    fn local_keys(&self) -> LoopbackKeys {
        self.pool.keys()
    }

    fn block_until_ready(&self) -> Result<()> {
        let expected = self.pool.ready.len() as u64;
        let begin = Instant::now();
        let timed_out = |what: &str| -> Result<()> {
            if let BarrierWait::Timeout(limit) = self.wait
                && begin.elapsed() >= limit
            {
                return Err(Error::Connect {
                    node: self.pool.node,
                    reason: format!("timed out waiting for {what}"),
                });
            }
            Ok(())
        };

        while self.pool.accepted.load(Ordering::Acquire) < expected {
            timed_out(&format!("{expected} connections"))?;
            std::thread::sleep(POLL_INTERVAL);
        }
        for (i, flag) in self.pool.ready.iter().enumerate() {
            while !flag.load(Ordering::Acquire) {
                timed_out(&format!("connection {i} to become ready"))?;
                std::thread::sleep(POLL_INTERVAL);
            }
        }
        tracing::debug!(
            node = self.pool.node,
            connections = expected,
            "memory node ready"
        );
        Ok(())
    }
}

struct Link {
    pool: Arc<Pool>,
    slot: usize,
}

pub struct LoopbackComputeNode {
    me: MachineInfo,
    directory: Arc<Directory>,
    links: RwLock<HashMap<u64, Link>>,
    connect_timeout: Duration,
}

impl LoopbackComputeNode {
    fn pool(&self, node: u64) -> Result<Arc<Pool>> {
        self.links
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&node)
            .map(|link| link.pool.clone())
            .ok_or(Error::NotConnected(node))
    }

    fn link(&self, pool: Arc<Pool>) -> Result<()> {
        let slot = pool.accept()?;
        self.links
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pool.node, Link { pool, slot });
        Ok(())
    }
}

impl ComputeNode for LoopbackComputeNode {
    type Keys = LoopbackKeys;

    fn connect_local(&self, peers: &[MachineInfo], keys: LoopbackKeys) -> Result<()> {
        let me = self.me.id;
        if !peers.iter().any(|p| p.id == me) {
            return Err(Error::Connect {
                node: me,
                reason: "this machine is not in the memory node list".to_string(),
            });
        }
        let pool = self.directory.get(me).ok_or_else(|| Error::Connect {
            node: me,
            reason: "local memory node is not listening".to_string(),
        })?;
        if pool.keys() != keys {
            return Err(Error::Connect {
                node: me,
                reason: "remote key mismatch".to_string(),
            });
        }
        self.link(pool)?;
        tracing::debug!(node = me, "connected to local memory node");
        Ok(())
    }

    fn connect_remote(&self, peers: &[MachineInfo]) -> Result<()> {
        for peer in peers {
            let linked = self
                .links
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .contains_key(&peer.id);
            if linked {
                continue;
            }
            let pool = self.directory.wait_for(peer, self.connect_timeout)?;
            self.link(pool)?;
            tracing::debug!(from = self.me.id, to = %peer, "connected to memory node");
        }

        // Signal every memory node that this compute node is fully wired.
        let links = self.links.read().unwrap_or_else(PoisonError::into_inner);
        for link in links.values() {
            link.pool.ready[link.slot].store(true, Ordering::Release);
        }
        Ok(())
    }
}

/// The control-barrier counter word on the root memory node.
pub struct CounterCell {
    pool: Arc<Pool>,
}

impl BarrierCounter for CounterCell {
    #[inline]
    fn fetch_add(&self, delta: u64) -> Result<u64> {
        Ok(self.pool.words[BARRIER_CELL as usize].fetch_add(delta, Ordering::AcqRel))
    }

    #[inline]
    fn load(&self) -> Result<u64> {
        Ok(self.pool.words[BARRIER_CELL as usize].load(Ordering::Acquire))
    }
}

pub struct LoopbackThread {
    node: Arc<LoopbackComputeNode>,
    local_index: u32,
    home: u64,
    root: Arc<Pool>,
    barrier: ControlBarrier<CounterCell>,
}

impl RemoteAccess for LoopbackThread {
    fn allocate(&mut self, count: u64) -> Result<RemotePtr> {
        self.node.pool(self.home)?.allocate(count)
    }

    fn read(&mut self, ptr: RemotePtr) -> Result<u64> {
        Ok(self.node.pool(ptr.node())?.word(ptr)?.load(Ordering::Acquire))
    }

    fn write(&mut self, ptr: RemotePtr, value: u64) -> Result<()> {
        self.node
            .pool(ptr.node())?
            .word(ptr)?
            .store(value, Ordering::Release);
        Ok(())
    }

    fn root(&mut self) -> Result<RemotePtr> {
        let raw = self.root.words[ROOT_CELL as usize].load(Ordering::Acquire);
        if raw == 0 {
            return Err(Error::RootUnset);
        }
        Ok(RemotePtr::from_raw(raw))
    }

    fn set_root(&mut self, ptr: RemotePtr) -> Result<()> {
        self.root.words[ROOT_CELL as usize].store(ptr.raw(), Ordering::Release);
        Ok(())
    }

    fn local_index(&self) -> u32 {
        self.local_index
    }

    fn arrive_control_barrier(&mut self, target: u64) -> Result<()> {
        let phase = self.barrier.arrive(target)?;
        tracing::trace!(
            node = self.node.me.id,
            local = self.local_index,
            %phase,
            "barrier released"
        );
        Ok(())
    }
}

impl Fabric for LoopbackFabric {
    type Keys = LoopbackKeys;
    type Memory = LoopbackMemoryNode;
    type Compute = LoopbackComputeNode;
    type Thread = LoopbackThread;

    fn memory_node(
        &self,
        me: &MachineInfo,
        config: &ExperimentConfig,
    ) -> Result<LoopbackMemoryNode> {
        let pool = Arc::new(Pool::new(me.id, config.mn_pool_words, config.system_size()));
        self.directory.listen(pool.clone())?;
        tracing::debug!(node = me.id, words = pool.capacity(), "memory node listening");
        Ok(LoopbackMemoryNode {
            pool,
            wait: config.barrier_wait,
        })
    }

    fn compute_node(
        &self,
        me: &MachineInfo,
        config: &ExperimentConfig,
    ) -> Result<LoopbackComputeNode> {
        Ok(LoopbackComputeNode {
            me: me.clone(),
            directory: self.directory.clone(),
            links: RwLock::new(HashMap::new()),
            connect_timeout: config.connect_timeout,
        })
    }

    fn compute_thread(
        &self,
        node: &Arc<LoopbackComputeNode>,
        config: &ExperimentConfig,
        local_index: u32,
    ) -> Result<LoopbackThread> {
        let root = node.pool(config.root_node())?;
        Ok(LoopbackThread {
            node: node.clone(),
            local_index,
            home: config.home_node(config.slot_of(local_index)),
            barrier: ControlBarrier::new(
                CounterCell { pool: root.clone() },
                config.barrier_wait,
            ),
            root,
        })
    }
}
