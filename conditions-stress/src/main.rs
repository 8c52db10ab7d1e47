use std::{sync::Arc, time::Instant};

use clap::Parser;
use conditions_config::CONFIG;
use conditions_core::prelude::*;
use rand::Rng;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::{
    setup::Layout,
    stats::Statistics,
};

pub mod setup;
pub mod stats;

#[derive(Debug, Parser)]
#[command(name = "conditions-stress", version, about, long_about = None)]
struct Cli {
    #[arg(long, default_value_t = 10, help = "Number of validity ranges per condition")]
    iovs: i64,

    #[arg(long, default_value_t = 10, help = "Length of each validity range")]
    runs: i64,

    #[arg(long, default_value_t = 100, help = "Number of detector elements")]
    detectors: usize,

    #[arg(long, default_value_t = 5, help = "Conditions per detector element")]
    items: u32,

    #[arg(long, default_value_t = 1000, help = "Random accesses per worker")]
    accesses: usize,

    #[arg(long, help = "Number of workers [default: CONDITIONS_STRESS_THREADS]")]
    threads: Option<usize>,

    #[arg(long, default_value_t = 0, help = "Age threshold of the cleanup policy, 0 disables it")]
    max_age: u32,

    #[arg(long, default_value = "false", help = "Print the summary as JSON")]
    json: bool,
}

#[derive(Debug, Default, serde::Serialize)]
struct WorkerReport {
    fill: Statistics,
    access: Statistics,
    #[serde(skip)]
    result: PrepareResult,
}

impl WorkerReport {
    fn merge(&mut self, other: &WorkerReport) {
        self.fill.merge(&other.fill);
        self.access.merge(&other.access);
        self.result += other.result;
    }
}

fn setup_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&CONFIG.log_level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// One worker: prepare every validity range once, then hit random points.
fn run_worker(
    worker: usize,
    manager: Arc<ConditionsManager>,
    content: Arc<ConditionsContent>,
    run: Arc<IovType>,
    layout: Layout,
    accesses: usize,
) -> anyhow::Result<WorkerReport> {
    let mut report = WorkerReport::default();
    let mut slice = ConditionsSlice::new(manager, content);

    for iov in 0..layout.iovs {
        let point = iov * layout.runs + 1;
        let start = Instant::now();
        let result = slice.prepare(&Iov::discrete(run.clone(), point))?;
        report.fill.add_duration(start.elapsed());
        report.result += result;
    }

    let mut rng = rand::rng();
    for _ in 0..accesses {
        let point = rng.random_range(1..=layout.last_point());
        let start = Instant::now();
        let result = slice.prepare(&Iov::discrete(run.clone(), point))?;
        report.access.add_duration(start.elapsed());
        report.result += result;
    }

    tracing::debug!(
        "Worker {} done: {} fill, {} accesses",
        worker,
        report.fill.n,
        report.access.n
    );
    Ok(report)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_tracing();
    let cli = Cli::parse();
    let threads = cli.threads.unwrap_or(CONFIG.stress_threads).max(1);
    let layout = Layout {
        iovs: cli.iovs,
        runs: cli.runs,
        detectors: cli.detectors,
        items: cli.items,
    };
    anyhow::ensure!(
        layout.iovs > 0 && layout.runs > 0,
        "iovs and runs must be positive"
    );

    let loader = setup::populate(&layout);
    let cleanup: Option<Arc<dyn CleanupPolicy>> = if cli.max_age > 0 {
        Some(Arc::new(AgeCleanup::new(cli.max_age)))
    } else {
        None
    };
    let manager = ConditionsManager::builder()
        .loader(loader.clone())
        .derivation(Arc::new(setup::engine()))
        .cleanup(cleanup)
        .build();
    let run = manager.register_iov_type(0, "run")?;
    let content = Arc::new(setup::content(&layout));

    tracing::info!(
        "Stressing {} conditions over {} validity ranges with {} workers",
        content.len(),
        layout.iovs,
        threads
    );

    let start = Instant::now();
    let mut handles = Vec::with_capacity(threads);
    for worker in 0..threads {
        let manager = manager.clone();
        let content = content.clone();
        let run = run.clone();
        let accesses = cli.accesses;
        handles.push(tokio::task::spawn_blocking(move || {
            run_worker(worker, manager, content, run, layout, accesses)
        }));
    }

    let mut total = WorkerReport::default();
    for handle in handles {
        total.merge(&handle.await??);
    }
    let elapsed = start.elapsed();
    let statistics = manager.statistics();

    if cli.json {
        let summary = serde_json::json!({
            "workers": threads,
            "elapsed_ms": elapsed.as_secs_f64() * 1e3,
            "loader_calls": loader.load_count(),
            "pools": statistics.pools(),
            "conditions": statistics.conditions(),
            "selected": total.result.selected,
            "loaded": total.result.loaded,
            "computed": total.result.computed,
            "missing": total.result.missing,
            "report": total,
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("+{:-<78}", "");
    println!("|  Conditions stress test: {} workers, {:.3} s", threads, elapsed.as_secs_f64());
    println!("+{:-<78}", "");
    println!("|  Fill:    {}", total.fill);
    println!("|  Access:  {}", total.access);
    println!(
        "|  Keys:    {} selected, {} loaded, {} computed, {} missing",
        total.result.selected, total.result.loaded, total.result.computed, total.result.missing
    );
    println!(
        "|  Manager: {} pools, {} conditions, {} loader calls",
        statistics.pools(),
        statistics.conditions(),
        loader.load_count()
    );
    println!("+{:-<78}", "");
    Ok(())
}
