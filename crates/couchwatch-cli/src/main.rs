use anyhow::{Context, Result};
use clap::Parser;
use couchwatch_adapters::{CraigslistAdapter, FacebookAdapter, HttpSurface};
use couchwatch_core::MonitorConfig;
use couchwatch_monitor::{Monitor, MonitoredPlatform};
use couchwatch_notify::{Dispatcher, DispatcherConfig, ReqwestTransport};
use couchwatch_storage::SeenStore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "couchwatch")]
#[command(about = "Marketplace furniture listing monitor")]
struct Cli {
    /// Monitor Craigslist only.
    #[arg(long)]
    skip_facebook: bool,

    /// Run a single check cycle and exit.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = MonitorConfig::from_env();

    let store = SeenStore::connect(&config.database_url)
        .await
        .context("opening listing database")?;
    store.ensure_schema().await.context("preparing schema")?;

    let transport = ReqwestTransport::new().context("building webhook client")?;
    let dispatcher = Dispatcher::new(transport, DispatcherConfig::new(config.webhooks.clone()));

    let mut platforms = vec![MonitoredPlatform {
        adapter: Box::new(CraigslistAdapter::new(&config)?),
        surface: Box::new(HttpSurface::new(&config.user_agent)?),
    }];
    if cli.skip_facebook {
        info!("facebook monitoring disabled");
    } else {
        platforms.push(MonitoredPlatform {
            adapter: Box::new(FacebookAdapter::new(&config)?),
            surface: Box::new(HttpSurface::new(&config.user_agent)?),
        });
    }

    let mut monitor = Monitor::new(store, dispatcher, platforms, config);
    let cancel = CancellationToken::new();

    if cli.once {
        let new = monitor.cycle(&cancel).await?;
        info!(new, "single cycle complete");
        return Ok(());
    }

    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing current cycle");
            signal_token.cancel();
        }
        // A second interrupt skips graceful teardown.
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("second interrupt; exiting immediately");
            std::process::exit(130);
        }
    });

    monitor.run(cancel).await
}
