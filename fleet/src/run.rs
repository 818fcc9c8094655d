//! Barrier-synchronized execution of one machine's part of an experiment.
//!
//! Every compute thread on every machine walks the same four phases:
//!
//! ```text
//! arrive (post-connect)
//! allocate region, publish base in root table
//! arrive (post-allocation)        -- root table readable from here on
//! driver.run()
//! arrive (post-run)
//! write metrics report
//! arrive (post-report)            -- slot 0 reads every report
//! ```

use std::time::Instant;

use crate::bootstrap::bootstrap;
use crate::config::ExperimentConfig;
use crate::error::{Error, Result};
use crate::layout::ThreadRegions;
use crate::machine::Role;
use crate::metrics::{MachineMetrics, Metrics};
use crate::remote::{Fabric, RemoteAccess};
use crate::root::{Published, RootTable, install_root};

/// Everything a driver may touch while the experiment runs.
pub struct WorkerContext<'a, A> {
    pub thread: &'a mut A,
    pub config: &'a ExperimentConfig,
    /// This thread's root-table slot.
    pub slot: u64,
    pub regions: ThreadRegions,
    pub published: Published,
}

/// The experiment workload, run once per compute thread between phases 2 and 3.
pub trait Driver<A: RemoteAccess>: Send {
    fn run(&mut self, ctx: &mut WorkerContext<'_, A>, metrics: &mut Metrics) -> Result<()>;
}

/// Outcome of [`run_machine`].
#[derive(Debug)]
pub struct MachineReport {
    pub role: Role,
    /// This machine's workers' metrics, indexed by local thread id.
    pub local: MachineMetrics,
    /// Merged metrics of every thread in the system; only on the leader.
    pub global: Option<Metrics>,
}

/// Validate, bootstrap and run this machine's workers to completion.
///
/// `make_driver` is called once per local thread, with its local index.
pub fn run_machine<F, D, M>(
    fabric: &F,
    config: &ExperimentConfig,
    mut make_driver: M,
) -> Result<MachineReport>
where
    F: Fabric,
    D: Driver<F::Thread>,
    M: FnMut(u32) -> D,
{
    config.validate()?;
    tracing::info!(
        node = config.node_id,
        fingerprint = format_args!("{:016x}", config.layout_fingerprint()),
        "layout fingerprint"
    );

    let node = bootstrap(fabric, config)?;
    let Some(compute) = &node.compute else {
        return Ok(MachineReport {
            role: node.role,
            local: MachineMetrics::default(),
            global: None,
        });
    };

    let mut threads = (0..config.cn_threads as u32)
        .map(|i| fabric.compute_thread(compute, config, i))
        .collect::<Result<Vec<_>>>()?;

    tracing::info!(
        "Starting Cas-Paxos experiment with {} threads",
        config.total_threads()
    );
    if config.is_leader_node() {
        // Visible to every thread once the post-connect barrier releases.
        install_root(&mut threads[0], &config.shared_layout())?;
    }

    let mut local = MachineMetrics::new(threads.len());
    let mut global = None;
    let mut first_error = None;

    std::thread::scope(|s| {
        let handles: Vec<_> = threads
            .into_iter()
            .zip(local.slots_mut())
            .map(|(thread, out)| {
                let driver = make_driver(thread.local_index());
                s.spawn(move || worker(thread, config, driver, out))
            })
            .collect();

        for (i, handle) in handles.into_iter().enumerate() {
            let outcome = handle
                .join()
                .unwrap_or(Err(Error::WorkerPanicked(i as u32)));
            match outcome {
                Ok(Some(total)) => global = Some(total),
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(local = i, error = %e, "worker failed");
                    first_error.get_or_insert(e);
                }
            }
        }
    });

    if let Some(e) = first_error {
        return Err(e);
    }
    tracing::info!(
        node = config.node_id,
        ops = local.total().count,
        "Cas-Paxos experiment completed successfully."
    );
    Ok(MachineReport {
        role: node.role,
        local,
        global,
    })
}

/// One compute thread's walk through the four phases.
///
/// Returns the global total when this thread holds slot 0.
fn worker<A, D>(
    mut thread: A,
    config: &ExperimentConfig,
    mut driver: D,
    out: &mut Option<Metrics>,
) -> Result<Option<Metrics>>
where
    A: RemoteAccess,
    D: Driver<A>,
{
    let total_threads = config.total_threads();
    let slot = config.slot_of(thread.local_index());

    thread.arrive_control_barrier(total_threads)?;
    tracing::debug!(node = config.node_id, slot, "[MAIN BARRIER] Start init...");

    let layout = config.region_layout();
    let base = thread.allocate(layout.allocation_size())?;
    let table = RootTable::locate(&mut thread, config.shared_layout())?;
    let published = table.publish_and_wait(&mut thread, slot, base)?;
    tracing::debug!(
        node = config.node_id,
        slot,
        %base,
        "[MAIN BARRIER] Init end. Starting experiment..."
    );

    let mut metrics = Metrics::new();
    let started = Instant::now();
    driver.run(
        &mut WorkerContext {
            thread: &mut thread,
            config,
            slot,
            regions: layout.regions(base),
            published,
        },
        &mut metrics,
    )?;
    metrics.set_elapsed(started.elapsed());
    thread.arrive_control_barrier(total_threads)?;

    published.report(&mut thread, slot, &metrics)?;
    thread.arrive_control_barrier(total_threads)?;

    let global = if slot == 0 {
        Some(published.collect_reports(&mut thread)?)
    } else {
        None
    };
    *out = Some(metrics);
    tracing::debug!(node = config.node_id, slot, "[MAIN BARRIER] Done.");
    Ok(global)
}
