mod config;
mod serve;

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use corral_core::tasks::TaskRegistry;
use corral_core::transport::AgentTransport;
use corral_core::transport::sim::SimTransport;
use corral_core::waitlist::Waitlist;
use corral_store::memory::MemoryStore;
use corral_store::postgres::PgStore;
use corral_store::{ObjectStore, StoreConfig};

use config::{MEMORY_STORE_URL, Settings};
use serve::AppState;

#[derive(Parser)]
#[command(name = "corrald", about = "Control-plane API for a fleet of compute nodes")]
struct Cli {
    /// Store backend: "memory" or a postgresql:// URL
    /// (overrides CORRAL_DATABASE_URL and the config file)
    #[arg(long, global = true)]
    store_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a corrald config file
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    /// Run the control-plane API server
    Serve {
        /// Address to bind (overrides CORRAL_BIND and the config file)
        #[arg(long)]
        bind: Option<String>,
        /// Port to listen on (overrides CORRAL_PORT and the config file)
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Init { force } => config::init(cli.store_url, force),
        Commands::Serve { bind, port } => run_server(cli.store_url, bind, port).await,
    }
}

async fn run_server(
    store_flag: Option<String>,
    bind_flag: Option<String>,
    port_flag: Option<u16>,
) -> Result<()> {
    let settings = Settings::resolve(store_flag, bind_flag, port_flag)?;
    let cancel = CancellationToken::new();

    let store: Arc<dyn ObjectStore> = if settings.store_url == MEMORY_STORE_URL {
        tracing::warn!("using the in-memory store: tickets will not survive a restart");
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(PgStore::connect(&StoreConfig::new(&settings.store_url)).await?)
    };

    let (events_tx, events_rx) = mpsc::channel(1024);
    let transport: Arc<dyn AgentTransport> = Arc::new(SimTransport::new(events_tx));
    let registry = TaskRegistry::new(transport, settings.task_config());
    Arc::clone(&registry).spawn_event_pump(events_rx, cancel.child_token());
    Arc::clone(&registry).spawn_sweeper(cancel.child_token());

    let waitlist = Waitlist::new(store, settings.waitlist_config(), cancel.child_token());
    // Every queue with non-terminal tickets is reconciled exactly once
    // before the listener accepts requests.
    waitlist.recover().await?;
    Arc::clone(&waitlist).start();

    let state = AppState {
        registry,
        waitlist,
        started_at: Utc::now(),
    };
    serve::run_serve(state, &settings.bind, settings.port, cancel).await
}
