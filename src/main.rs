use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};

use hush::config::{Cli, Config};
use hush::relay::{app, RelayConfig, RelayState};
use hush::storage::Storage;
use hush::{logging, notify, tlog};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = Config::from_cli_and_env(cli);

    logging::init();

    tlog!("hush starting");
    tlog!("  bind address: {}", config.bind_addr);
    tlog!("  database: {}", config.db_path.display());
    tlog!("  migrations: {}", config.migrations_dir.display());

    if let Err(e) = config.ensure_db_dir() {
        tlog!("failed to create database directory: {e}");
        std::process::exit(1);
    }

    let mut storage = match Storage::open(&config.db_path) {
        Ok(storage) => storage,
        Err(e) => {
            tlog!("failed to open database: {e}");
            std::process::exit(1);
        }
    };

    match storage.migrate(&config.migrations_dir) {
        Ok(0) => tlog!("  schema: up to date"),
        Ok(n) => tlog!("  schema: applied {n} migration(s)"),
        Err(e) => {
            tlog!("migration failed: {e}");
            std::process::exit(1);
        }
    }

    match storage.normalize_room_timestamps() {
        Ok(0) => {}
        Ok(n) => tlog!("  normalized {n} legacy room timestamp(s)"),
        Err(e) => {
            tlog!("timestamp normalization failed: {e}");
            std::process::exit(1);
        }
    }

    notify::emit("system.start", "-", "hush online");

    let state = RelayState::new(
        Arc::new(Mutex::new(storage)),
        RelayConfig {
            max_room_peers: config.max_room_peers,
            ..RelayConfig::default()
        },
    );

    // The sender half lives until main returns, which keeps the sweeper
    // running for the life of the process.
    let (_sweeper_shutdown, sweeper_rx) = oneshot::channel::<()>();
    state.start_sweeper(sweeper_rx);

    let listener = match TcpListener::bind(&config.bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tlog!("failed to bind {}: {e}", config.bind_addr);
            std::process::exit(1);
        }
    };
    tlog!("hush listening on http://{}", config.bind_addr);

    if let Err(e) = axum::serve(listener, app(state)).await {
        tlog!("server error: {e}");
        std::process::exit(1);
    }
}
