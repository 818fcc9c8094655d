mod affinity;
mod parquet_out;
mod workload;

use std::thread;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use fleet::{BarrierWait, ExperimentConfig, LoopbackFabric, MachineReport, Results, run_machine};

use workload::ProbeDriver;

#[derive(Parser, Debug)]
#[command(name = "caspaxos_bench")]
#[command(about = "Cas-Paxos RDMA latency benchmark over remote memory nodes")]
struct Cli {
    /// Identifier of this machine
    #[arg(long, default_value = "0")]
    node_id: u64,

    #[arg(long, default_value = "0")]
    first_mn_id: u64,

    #[arg(long, default_value = "0")]
    last_mn_id: u64,

    #[arg(long, default_value = "0")]
    first_cn_id: u64,

    #[arg(long, default_value = "0")]
    last_cn_id: u64,

    /// Worker threads per compute node
    #[arg(long, default_value = "1")]
    cn_threads: u64,

    /// Operations per batch; must equal the total worker count
    #[arg(long, default_value = "1")]
    cn_ops_per_thread: u64,

    /// Queue-pair scheduling policy
    #[arg(long, default_value = fleet::config::ONE_TO_ONE)]
    qp_sched_pol: String,

    /// Words in each thread's Buf region
    #[arg(long, default_value = "8")]
    payload_size: u64,

    /// Words in each thread's Proposed and Log regions
    #[arg(long, default_value = "4")]
    capacity: u64,

    /// Machine address template; `{}` is replaced by the machine id
    #[arg(long, default_value = "node{}")]
    host_template: String,

    /// Words in each memory node's pool
    #[arg(long, default_value = "1048576")]
    mn_pool_words: u64,

    /// Give up on a control barrier after this many milliseconds (default: wait forever)
    #[arg(long)]
    barrier_timeout_ms: Option<u64>,

    /// How long to wait for a memory node to start listening
    #[arg(long, default_value = "30000")]
    connect_timeout_ms: u64,

    /// Batches issued by each worker
    #[arg(short = 'r', long, default_value = "1000")]
    rounds: u32,

    /// Read ratio (0.0 = all writes, 1.0 = all reads)
    #[arg(long, default_value = "0.5")]
    read_ratio: f64,

    /// Access pattern seed
    #[arg(long, default_value = "0")]
    seed: u64,

    /// Pin worker threads to cores assigned downward from affinity-start
    #[arg(long)]
    pin: bool,

    /// Starting core ID for pinning (default: num_online_cores - 1)
    #[arg(long)]
    affinity_start: Option<usize>,

    /// Run every configured machine as a thread of this process
    #[arg(long)]
    local_cluster: bool,

    /// Output parquet file, written by the leader
    #[arg(short = 'o', long, default_value = "results.parquet")]
    output: String,
}

impl Cli {
    fn config(&self) -> ExperimentConfig {
        ExperimentConfig {
            node_id: self.node_id,
            first_mn_id: self.first_mn_id,
            last_mn_id: self.last_mn_id,
            first_cn_id: self.first_cn_id,
            last_cn_id: self.last_cn_id,
            cn_threads: self.cn_threads,
            cn_ops_per_thread: self.cn_ops_per_thread,
            qp_sched_pol: self.qp_sched_pol.clone(),
            payload_size: self.payload_size,
            capacity: self.capacity,
            host_template: self.host_template.clone(),
            mn_pool_words: self.mn_pool_words,
            barrier_wait: match self.barrier_timeout_ms {
                Some(ms) => BarrierWait::Timeout(Duration::from_millis(ms)),
                None => BarrierWait::Forever,
            },
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
        }
    }
}

const PATTERN_LEN: usize = 10000;

fn run_node(
    cli: &Cli,
    fabric: &LoopbackFabric,
    config: &ExperimentConfig,
) -> fleet::Result<MachineReport> {
    let start_core = cli.pin.then(|| affinity::start_core(cli.affinity_start));
    run_machine(fabric, config, |i| {
        let slot = config.slot_of(i);
        let pattern = workload::generate_pattern(
            config.total_threads(),
            config.capacity,
            cli.read_ratio,
            PATTERN_LEN,
            cli.seed.wrapping_mul(1000).wrapping_add(slot),
        );
        let pin_core = start_core.and_then(|start| {
            let core = affinity::core_for_thread(start, i as usize);
            if core.is_none() {
                tracing::warn!(
                    start,
                    local = i,
                    "not enough cores below start core; not pinning"
                );
            }
            core
        });
        ProbeDriver::new(pattern, cli.rounds, pin_core)
    })
}

/// Print and export the global results. Only the leader's report carries them.
fn report_results(
    cli: &Cli,
    config: &ExperimentConfig,
    report: &MachineReport,
) -> Result<(), Box<dyn std::error::Error>> {
    let Some(global) = &report.global else {
        return Ok(());
    };
    let results = Results::calc(global);
    tracing::info!("Results:\n{results}");

    let rows = [parquet_out::ResultRow::new(config, &results)];
    parquet_out::write_parquet(&cli.output, &rows)?;
    tracing::info!(path = %cli.output, "results written");
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.config();
    if let Err(e) = config.validate() {
        tracing::error!(error = %e, "invalid configuration");
        std::process::exit(1);
    }
    let fabric = LoopbackFabric::new();

    let ids: Vec<u64> = if cli.local_cluster {
        let first = config.first_mn_id.min(config.first_cn_id);
        let last = config.last_mn_id.max(config.last_cn_id);
        (first..=last).collect()
    } else {
        vec![config.node_id]
    };
    tracing::info!(
        machines = ids.len(),
        threads = config.total_threads(),
        policy = %config.qp_sched_pol,
        "starting"
    );

    let outcomes: Vec<(ExperimentConfig, fleet::Result<MachineReport>)> = thread::scope(|s| {
        let handles: Vec<_> = ids
            .iter()
            .map(|&id| {
                let config = config.for_node(id);
                let (cli, fabric) = (&cli, &fabric);
                s.spawn(move || {
                    let outcome = run_node(cli, fabric, &config);
                    (config, outcome)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
            .collect()
    });

    let mut failed = false;
    for (config, outcome) in &outcomes {
        match outcome {
            Ok(report) => {
                if let Err(e) = report_results(&cli, config, report) {
                    tracing::error!(path = %cli.output, error = %e, "failed to export results");
                    failed = true;
                }
            }
            Err(e) => {
                tracing::error!(node = config.node_id, error = %e, "experiment failed");
                failed = true;
            }
        }
    }
    if failed {
        std::process::exit(1);
    }
}
