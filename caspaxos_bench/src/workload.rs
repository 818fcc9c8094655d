use std::time::Instant;

use rand::{Rng, SeedableRng};

use fleet::{Driver, Metrics, RemoteAccess, WorkerContext};

use crate::affinity;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeEntry {
    /// Root-table slot of the peer thread.
    pub peer: u64,
    /// Word index into the peer's Log region.
    pub cell: u64,
    pub is_read: bool,
}

pub fn generate_pattern(
    total_threads: u64,
    capacity: u64,
    read_ratio: f64,
    pattern_len: usize,
    seed: u64,
) -> Vec<ProbeEntry> {
    let mut rng = rand::rngs::SmallRng::seed_from_u64(seed);
    (0..pattern_len)
        .map(|_| ProbeEntry {
            peer: rng.random_range(0..total_threads),
            cell: rng.random_range(0..capacity),
            is_read: rng.random::<f64>() < read_ratio,
        })
        .collect()
}

/// Touches peers' Log regions through the root table and records per-op latency.
///
/// Each round issues one batch of `cn_ops_per_thread` operations.
pub struct ProbeDriver {
    pattern: Vec<ProbeEntry>,
    rounds: u32,
    pin_core: Option<usize>,
}

impl ProbeDriver {
    pub fn new(pattern: Vec<ProbeEntry>, rounds: u32, pin_core: Option<usize>) -> Self {
        Self {
            pattern,
            rounds,
            pin_core,
        }
    }
}

impl<A: RemoteAccess> Driver<A> for ProbeDriver {
    fn run(&mut self, ctx: &mut WorkerContext<'_, A>, metrics: &mut Metrics) -> fleet::Result<()> {
        if let Some(core) = self.pin_core {
            affinity::pin_current_thread(ctx.slot, core);
        }
        if self.pattern.is_empty() {
            return Ok(());
        }

        let peers = ctx.published.total_threads();
        if let Some(bad) = self.pattern.iter().find(|e| e.peer >= peers) {
            return Err(fleet::Error::Driver(format!(
                "pattern targets slot {} but the root table has {} slots",
                bad.peer, peers
            )));
        }

        let layout = ctx.config.region_layout();
        let batch = ctx.config.cn_ops_per_thread as usize;
        let mut idx = 0;
        for round in 0..self.rounds {
            for _ in 0..batch {
                let entry = self.pattern[idx % self.pattern.len()];
                idx += 1;

                let start = Instant::now();
                let base = ctx.published.read(&mut *ctx.thread, entry.peer)?;
                let cell = base.add(layout.log().start + entry.cell % layout.capacity);
                if entry.is_read {
                    ctx.thread.read(cell)?;
                } else {
                    ctx.thread.write(cell, ctx.slot + 1)?;
                }
                metrics.record(start.elapsed());
            }
            tracing::trace!(slot = ctx.slot, round, "batch done");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet::{ExperimentConfig, LoopbackFabric, run_machine};

    #[test]
    fn test_pattern_is_seeded_and_in_range() {
        let a = generate_pattern(6, 4, 0.5, 256, 42);
        let b = generate_pattern(6, 4, 0.5, 256, 42);
        assert_eq!(a, b);
        assert!(a.iter().all(|e| e.peer < 6 && e.cell < 4));
        assert!(a.iter().any(|e| e.is_read) && a.iter().any(|e| !e.is_read));
        assert_ne!(a, generate_pattern(6, 4, 0.5, 256, 43));
    }

    #[test]
    fn test_read_ratio_extremes() {
        assert!(generate_pattern(2, 2, 1.0, 64, 1).iter().all(|e| e.is_read));
        assert!(generate_pattern(2, 2, 0.0, 64, 1).iter().all(|e| !e.is_read));
    }

    #[test]
    fn test_probe_driver_records_every_op() {
        let cfg = ExperimentConfig {
            cn_threads: 2,
            cn_ops_per_thread: 2,
            mn_pool_words: 4096,
            ..Default::default()
        };
        let report = run_machine(&LoopbackFabric::new(), &cfg, |i| {
            let pattern = generate_pattern(2, cfg.capacity, 0.5, 16, i as u64);
            ProbeDriver::new(pattern, 3, None)
        })
        .unwrap();
        let global = report.global.unwrap();
        // 2 threads x 3 rounds x batch of 2
        assert_eq!(global.count, 12);
        assert_eq!(global.count, report.local.total().count);
    }

    #[test]
    fn test_pattern_beyond_root_table_is_rejected() {
        let cfg = ExperimentConfig {
            mn_pool_words: 1024,
            ..Default::default()
        };
        let result = run_machine(&LoopbackFabric::new(), &cfg, |_| {
            ProbeDriver::new(generate_pattern(4, cfg.capacity, 0.5, 16, 7), 1, None)
        });
        assert!(matches!(result, Err(fleet::Error::Driver(_))));
    }
}
