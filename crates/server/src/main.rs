use clap::Parser;
use hangar_engine::DataFusionEngine;
use hangar_server::{FlightServer, ServerError, Settings};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Serve named datasets over Arrow Flight", long_about = None)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

fn init_logging(json: bool) {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter())
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter()).init();
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.log_json);

    if let Err(e) = run(args).await {
        error!("hangar-server failed: {}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), ServerError> {
    let settings = Settings::load(args.config.as_deref())?;

    let engine = Arc::new(DataFusionEngine::with_options(settings.engine_options()));
    for dataset in &settings.datasets {
        engine.register_source(&dataset.name, &dataset.source).await?;
    }

    let mut server = FlightServer::bind(settings, engine).await?;
    server.serve()?;
    if let Some(addr) = server.local_addr() {
        info!("Hangar listening on {}", addr);
    }

    let requested = server.shutdown_requested();
    tokio::select! {
        ctrl_c = signal::ctrl_c() => {
            if let Err(e) = ctrl_c {
                warn!("Failed to listen for Ctrl-C: {}", e);
            }
            info!("Received Ctrl-C");
        }
        _ = requested => info!("Received shutdown action"),
    }

    server.shutdown().await
}
