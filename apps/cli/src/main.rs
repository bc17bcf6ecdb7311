mod status_server;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use prov_core::{
    BroadcastObserver, DfuUtil, HttpAssets, NusbBackend, Observers, Orchestrator, ParticleCloud, ProvisionConfig,
    TracingObserver,
};
use tracing::{error, info};

/// Status events buffered per live stream subscriber.
const STATUS_STREAM_CAPACITY: usize = 256;

#[derive(Parser, Debug)]
#[command(author, version, about = "USB provisioning station for cloud-managed devices", long_about = None)]
struct Args {
    /// Path to the TOML configuration
    #[arg(short, long, default_value = "prov.toml")]
    config: PathBuf,

    /// Cloud access token, overrides auth_token from the configuration
    #[arg(long, env = "PROV_AUTH_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Write a default configuration for this product id and exit
    #[arg(long, value_name = "PRODUCT_ID")]
    init: Option<u32>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = run(args).await {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    if let Some(product_id) = args.init {
        let config = ProvisionConfig {
            product_id,
            ..Default::default()
        };
        config.save_to_file(&args.config)?;
        info!(path = %args.config.display(), "Wrote default configuration");
        return Ok(());
    }

    let mut config = ProvisionConfig::load_from_file(&args.config)?;
    if let Some(token) = args.token {
        config.auth_token = Some(token);
    }
    config.validate()?;
    let token = config.auth_token.clone().unwrap_or_default();

    info!("Starting provisioning station (nusb backend)...");

    let events = Arc::new(BroadcastObserver::new(STATUS_STREAM_CAPACITY));
    let observer = Observers::new()
        .with(Arc::new(TracingObserver))
        .with(events.clone());

    let station = Arc::new(Orchestrator::new(
        config.clone(),
        Arc::new(ParticleCloud::new(&config.api_base_url, token, config.product_id)),
        Arc::new(HttpAssets::new(&config.assets_base_url)),
        Arc::new(NusbBackend::new()),
        Arc::new(DfuUtil::new(&config.dfu_util_path)),
        Arc::new(observer),
    ));

    let server = tokio::spawn(status_server::serve(config.server_port, events, station.clone()));

    station.initialize().await.context("failed initialization")?;

    tokio::select! {
        res = station.run() => res,
        res = server => res?.context("status server stopped"),
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, exiting");
            Ok(())
        }
    }
}
