use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mtf_trader::api::{self, AppState};
use mtf_trader::broker::{BrokerClient, MarketData, OrderGateway};
use mtf_trader::engine::{EngineConfig, Monitor, PositionManager};
use mtf_trader::notify::{Notifier, NullNotifier, WhatsAppNotifier};
use mtf_trader::scanner::Scanner;
use mtf_trader::store::{PositionStore, SupabaseStore};

#[derive(Parser, Debug)]
#[command(author, version, about = "MTF trading assistant")]
struct Args {
    /// Symbol universe (comma-separated)
    #[arg(short, long, env = "MTF_SYMBOLS", default_value = "")]
    symbols: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scan the universe once and print the report
    Scan {
        /// Classify only; place no orders
        #[arg(long)]
        dry_run: bool,
    },
    /// Run one exit-monitoring cycle over open positions
    Monitor,
    /// Serve the HTTP API for cron-triggered cycles
    Serve {
        #[arg(short, long, env = "PORT", default_value = "3000")]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let symbols: Vec<String> = args
        .symbols
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    let config = EngineConfig::from_env()?;
    let broker = Arc::new(BrokerClient::from_env()?);
    let store: Arc<dyn PositionStore> = Arc::new(SupabaseStore::from_env()?);
    let notifier: Arc<dyn Notifier> = match WhatsAppNotifier::from_env() {
        Ok(notifier) => Arc::new(notifier),
        Err(e) => {
            warn!("WhatsApp not configured ({:#}), notifications disabled", e);
            Arc::new(NullNotifier)
        }
    };

    let gateway: Arc<dyn OrderGateway> = broker.clone();
    let market: Arc<dyn MarketData> = broker.clone();
    let manager = Arc::new(PositionManager::new(
        gateway,
        store,
        notifier,
        config.clone(),
    ));
    let scanner = Scanner::new(market.clone(), config.clone());
    let monitor = Monitor::new(market, manager.clone(), config);

    match args.command {
        Command::Scan { dry_run } => {
            if symbols.is_empty() {
                anyhow::bail!("No symbols given; set --symbols or MTF_SYMBOLS");
            }
            let report = if dry_run {
                scanner.scan(&symbols).await
            } else {
                scanner.scan_and_enter(&symbols, &manager).await?
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Monitor => {
            let report = monitor.run_cycle().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Serve { port } => {
            let state = Arc::new(AppState {
                scanner,
                monitor,
                manager,
                symbols,
            });
            let app = api::router(state);
            let addr = SocketAddr::from(([0, 0, 0, 0], port));
            info!("Listening on {}", addr);
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .with_context(|| format!("Failed to bind {}", addr))?;
            axum::serve(listener, app).await.context("Server error")?;
        }
    }

    Ok(())
}
