//! Standalone sweep/household client (component C8): a CLI smoke-test tool
//! for a running supervisor+userproc fleet, and the harness this crate's
//! own integration tests drive.

use std::time::Duration;

use clap::{Parser, Subcommand};
use netprobe_client::{CurrentMeasurement, HouseholdOrchestrator, SingleUserSweep, SweepConfig};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Drive a virtual-household or single-user sweep against a live server.
#[derive(Parser, Debug)]
#[command(name = "netprobe-client")]
struct Cli {
    /// Base URL of the supervisor, e.g. `https://probe.example.com`.
    #[arg(long, default_value = "http://127.0.0.1:8000")]
    server: String,
    /// Enable verbose development-friendly logging.
    #[arg(long)]
    debug: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Open the four virtual-household archetype connections and print
    /// rolling throughput until interrupted or `--duration` elapses.
    Household {
        /// How long to run before disconnecting, e.g. "30s". Runs until
        /// interrupted (Ctrl-C) if omitted.
        #[arg(long, value_parser = humantime::parse_duration)]
        duration: Option<Duration>,
    },
    /// Run the single-user speed/bufferbloat sweep and print a summary.
    Sweep,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(filter))
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Command::Household { duration } => run_household(&cli.server, duration).await,
        Command::Sweep => run_sweep(&cli.server).await,
    }
}

async fn run_household(server: &str, duration: Option<Duration>) {
    info!(server, ?duration, "starting virtual-household run");
    let orchestrator = HouseholdOrchestrator::new(server);
    let mut events = orchestrator.run(duration).await;
    let mut measurement = CurrentMeasurement::new();

    while let Some(event) = events.recv().await {
        measurement.apply(&event);
        println!(
            "household total: {:.1} Mbps down",
            measurement.total_household_down_mbps()
        );
    }
}

async fn run_sweep(server: &str) {
    info!(server, "starting single-user sweep");
    let sweep = SingleUserSweep::new(server, SweepConfig::default());
    let (tx, mut events) = tokio::sync::mpsc::unbounded_channel();
    let mut measurement = CurrentMeasurement::new();

    let run_handle = tokio::spawn(async move {
        if let Err(err) = sweep.run(tx).await {
            eprintln!("sweep failed: {err}");
        }
    });

    while let Some(event) = events.recv().await {
        measurement.apply(&event);
    }
    let _ = run_handle.await;

    for phase in [
        netprobe_client::SweepPhase::Download,
        netprobe_client::SweepPhase::Upload,
        netprobe_client::SweepPhase::Bidirectional,
    ] {
        let mbps = measurement.sweep_mbps.get(&phase).copied().unwrap_or(0.0);
        let bufferbloat = measurement.bufferbloat_ms(phase).unwrap_or(0.0);
        println!("{phase:?}: {mbps:.1} Mbps, +{bufferbloat:.0} ms over baseline");
    }
}
