use clap::{Parser, Subcommand};
use collector::app::App;
use collector_core::{telemetry, Config};
use std::process;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Parser)]
#[clap(name = "collector", about = "éCO2mix open-data collector", version)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the configured collections and indexes
    Init,

    /// Run one synchronization pass
    Update {
        /// Restrict the pass to a single dataset id
        #[clap(long)]
        dataset: Option<String>,
    },

    /// Synchronize on an interval until interrupted
    Run {
        /// Seconds between synchronization passes
        #[clap(long, default_value_t = 900, env = "COLLECTOR_RUN_INTERVAL_SECS")]
        interval_secs: u64,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!(error = %e, "Fatal error");
        process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let config = Config::load().map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;

    telemetry::init(&config.telemetry)?;

    let cli = Cli::parse();
    let app = App::new(config).await?;

    match cli.command {
        Commands::Init => {
            app.init().await?;
            info!("Collections and indexes ready");
        }

        Commands::Update { dataset } => match dataset {
            Some(id) => {
                let report = app.update_dataset(&id).await?;
                log_report(&report);
            }
            None => {
                for report in app.perform_update().await? {
                    log_report(&report);
                }
            }
        },

        Commands::Run { interval_secs } => {
            info!(interval_secs, "Starting scheduled synchronization");
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("Shutdown signal received");
                        break;
                    }
                    _ = ticker.tick() => {
                        match app.perform_update().await {
                            Ok(reports) => {
                                for report in reports {
                                    log_report(&report);
                                }
                            }
                            Err(e) if e.is_fatal() => return Err(e.into()),
                            Err(e) => {
                                warn!(error = %e, "Pass failed, retrying at next interval");
                            }
                        }
                    }
                }
            }
        }
    }

    telemetry::shutdown();
    Ok(())
}

fn log_report(report: &collector::sync::SyncReport) {
    match report.span {
        Some((from, to)) => info!(
            dataset = %report.dataset,
            collection = %report.collection,
            from = %from,
            to = %to,
            batches = report.batches_inserted,
            records = report.records_ingested,
            "Dataset synchronized"
        ),
        None => info!(
            dataset = %report.dataset,
            collection = %report.collection,
            "Nothing to synchronize"
        ),
    }
}
