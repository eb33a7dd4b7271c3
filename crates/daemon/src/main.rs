//! `stockwise`: runs the inventory service in-process and takes commands on
//! stdin, one per line.

mod console;

use std::io::{self, BufRead, Write};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};

use stockwise_events::{BusMessage, InMemoryEventBus};
use stockwise_infra::{InventoryConfig, InventoryRuntime};

#[derive(Parser, Debug)]
#[command(name = "stockwise")]
#[command(version, about = "Inventory stock ledger and order saga runtime", long_about = None)]
struct Args {
    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Override STOCKWISE_WORKERS
    #[arg(long)]
    workers: Option<usize>,

    /// Replenish a product as soon as an order runs short of it
    #[arg(long)]
    auto_replenish: bool,

    /// Also consume the compensation channel (saga running elsewhere)
    #[arg(long)]
    consume_compensation: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    stockwise_observability::init_with_default(&args.log_level);

    let mut config = InventoryConfig::from_env().context("invalid STOCKWISE_* configuration")?;
    if let Some(workers) = args.workers {
        anyhow::ensure!(workers > 0, "--workers must be at least 1");
        config.worker_count = workers;
    }
    config.auto_replenish_on_shortage |= args.auto_replenish;
    config.consume_compensation_channel |= args.consume_compensation;

    let bus = Arc::new(InMemoryEventBus::<BusMessage>::new());
    let mut runtime = InventoryRuntime::start(config, Arc::clone(&bus), None)?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    for line in io::stdin().lock().lines() {
        let line = line.context("failed to read stdin")?;
        let command = match console::parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(err) => {
                writeln!(out, "error: {err}")?;
                continue;
            }
        };
        match console::execute(&runtime, &bus, command) {
            Ok(result) => writeln!(out, "{result}")?,
            Err(console::CommandError::Inventory(err)) => {
                let kind = err.kind();
                writeln!(out, "error [{kind:?} {}]: {err}", kind.status_code())?;
            }
            Err(err) => writeln!(out, "error: {err}")?,
        }
    }

    info!("input closed; running final maintenance");
    match runtime.run_maintenance() {
        Ok(report) if report.outbox.pending > 0 => {
            warn!(pending = report.outbox.pending, "outbox not fully drained at shutdown");
        }
        Ok(_) => {}
        Err(err) => error!(error = %err, "final maintenance failed"),
    }
    runtime.shutdown();
    Ok(())
}
