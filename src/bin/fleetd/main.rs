//! Run the fleet daemon: one worker per registered printer, driven from a
//! TOML config.

use std::{path::PathBuf, str::FromStr, sync::Arc};

use anyhow::Result;
use clap::{Parser, Subcommand};
use fleet_api::{
    store::{JobStore, MemoryStore},
    Config, Events, Fleet,
};
use tracing_subscriber::{fmt::format::FmtSpan, FmtSubscriber};

/// Serve the printer fleet.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(name = "fleetd")]
struct Cli {
    /// verbosity of logging output [trace, debug, info, warn, error]
    #[arg(long, short, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Drive every registered printer's queue until shut down.
    Serve {
        /// Config file to use
        #[arg(long, short, default_value = "fleet-api.toml")]
        config: PathBuf,
    },
}

async fn main_serve(config: &PathBuf) -> Result<()> {
    let cfg = Config::from_file(config)?;
    let settings = cfg.settings();

    let store: Arc<dyn JobStore> = Arc::new(MemoryStore::new());
    let events = Events::default();

    // register configured printers; a hwid seen before is already persisted
    for printer in &cfg.printers {
        match store
            .register_printer(&printer.device, &printer.description, &printer.hwid, &printer.name)
            .await
        {
            Ok(id) => tracing::info!(name = %printer.name, id, "registered printer"),
            Err(e) => tracing::debug!(name = %printer.name, error = %e, "skipping registration"),
        }
    }

    let connector = Arc::new(fleet_api::device::SerialConnector::new(settings.read_timeout));
    let fleet = Fleet::new(store, events, connector, settings);
    fleet.spawn_registered().await?;
    fleet.restore_queues().await?;

    handle_signals().await?;
    fleet.shutdown();
    Ok(())
}

async fn handle_signals() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigint.recv() => {
                tracing::info!("received SIGINT");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM");
            }
        }
    }

    #[cfg(windows)]
    {
        tokio::signal::ctrl_c().await?;
        tracing::info!("received Ctrl+C (SIGINT)");
    }

    tracing::info!("shutting the fleet down");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let subscriber = FmtSubscriber::builder()
        .with_writer(std::io::stderr)
        .with_max_level(tracing::Level::from_str(&cli.log_level)?)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    match cli.command {
        Commands::Serve { ref config } => main_serve(config).await,
    }
}
