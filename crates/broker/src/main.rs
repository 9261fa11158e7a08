use broker::{Broker, Config, JsonlStore};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Coordinates a federation of simulation models: forwards their messages,
/// advances them through increments under a barrier, and logs the traffic.
#[derive(Debug, Parser)]
#[command(about, version)]
struct Cli {
    /// Path to the federation config declaring the participating models.
    #[arg(long, default_value = "/opt/config.json", env = "BROKER_CONFIG")]
    config: PathBuf,
    /// Bind address of the ingress port, where every publisher sends.
    #[arg(long, default_value = "0.0.0.0:5555", env = "BROKER_INGRESS")]
    ingress: String,
    /// Bind address of the egress port, where every subscriber reads.
    #[arg(long, default_value = "0.0.0.0:5556", env = "BROKER_EGRESS")]
    egress: String,
    /// Last increment of the run.
    #[arg(long, default_value = "50", env = "MAX_INCSTEP")]
    max_incstep: u32,
    /// Calendar year of increment zero.
    #[arg(long, default_value = "2016", env = "INITIAL_YEAR")]
    initial_year: i32,
    /// How long models may take to boot.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "60s", env = "BOOT_TIMER")]
    boot_timer: Duration,
    /// Liveness window once booted.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "60s", env = "WATCHDOG_TIMER")]
    watchdog_timer: Duration,
    /// Cadence of status heartbeats and pacemaker checks.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "1s", env = "TICK_INTERVAL")]
    tick_interval: Duration,
    /// Directory receiving the message log's collections.
    #[arg(long, default_value = "/opt/data", env = "DATA_DIR")]
    data_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    ops::tracing::install();
    let cli = Cli::parse();

    let models = broker::load_models(&cli.config)?;
    let config = Config {
        models,
        ingress: cli.ingress,
        egress: cli.egress,
        max_incstep: cli.max_incstep,
        initial_year: cli.initial_year,
        boot_timer: cli.boot_timer,
        watchdog_timer: cli.watchdog_timer,
        heartbeat_interval: cli.tick_interval,
        pace_interval: cli.tick_interval,
        data_dir: cli.data_dir.clone(),
    };
    let store = JsonlStore::new(&cli.data_dir)?;
    let broker = Broker::bind(config).await?;

    let cancel = CancellationToken::new();
    let ctrl_c_token = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for CTRL-C");
        tracing::info!("received Ctrl+C, initiating shutdown");
        ctrl_c_token.cancel();
    });

    if let Err(err) = broker.run(store, cancel).await {
        tracing::error!(error = format!("{err:#}"), "broker failed");
        std::process::exit(1);
    }
    Ok(())
}
