use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use hwmgr::{Cluster, Config, Event, TimerMode};

/// Hardware manager: cluster membership and liveness notification.
#[derive(Debug, Parser)]
#[command(name = "hwmgr", version, about)]
struct Cli {
    /// Configuration file (TOML). Built-in defaults apply when absent.
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,
}

fn main() -> ExitCode {
    hwmgr::init_tracing();
    let cli = Cli::parse();

    let cfg = match &cli.config {
        Some(path) => Config::load(path),
        None => Config::default(),
    };

    let runtime = match compio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(err) => {
            error!(%err, "runtime initialization failed");
            return ExitCode::FAILURE;
        }
    };

    runtime.block_on(async move {
        let (tx, rx) = flume::unbounded::<Event>();

        let mut cluster = Cluster::new(cfg, tx.clone(), TimerMode::Runtime);
        if let Err(err) = cluster.start_io().await {
            error!(%err, "transport initialization failed");
            return ExitCode::FAILURE;
        }

        // SIGINT drives a clean shutdown through the event channel.
        let signal_tx = tx.clone();
        compio::runtime::spawn(async move {
            if compio::signal::ctrl_c().await.is_ok() {
                let _ = signal_tx.send(Event::Shutdown);
            }
        })
        .detach();

        info!(location = %cluster.local_index(), "hardware manager running");
        cluster.run(rx).await;
        ExitCode::SUCCESS
    })
}
