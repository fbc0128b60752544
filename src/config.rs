//! Configuration types and constants for the hush relay server.

use std::path::PathBuf;

use clap::Parser;

/// TTL applied when a create request carries no recognized duration.
pub(crate) const DEFAULT_TTL_SECS: u64 = 3600;
/// Cadence of the expired-room sweeper.
pub(crate) const SWEEP_INTERVAL_SECS: u64 = 30;
/// Delay between history rows during replay, so a slow client socket is not
/// flooded with the whole backlog in one burst.
pub(crate) const REPLAY_PACE_MS: u64 = 5;
/// Outbound queue depth per connection.  Deliberately small: a stalled peer
/// sheds live traffic instead of growing an unbounded buffer.
pub(crate) const OUTBOUND_QUEUE_DEPTH: usize = 8;
/// Maximum WebSocket message size.  Encrypted image chunks arrive base64-coded
/// inside a JSON envelope, so the limit leaves generous headroom over 1 MiB.
pub(crate) const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;
/// Default cap on concurrent members per room.
pub(crate) const DEFAULT_MAX_ROOM_PEERS: usize = 2;

/// Ephemeral end-to-end-encrypted room chat relay.
///
/// Persists opaque ciphertext per room so reconnecting clients can replay
/// history; never holds key material.
///
/// Configuration can be set via CLI arguments or environment variables.
/// CLI arguments take precedence over environment variables.
#[derive(Parser, Debug)]
#[command(name = "hush", version, about)]
pub struct Cli {
    /// HTTP server bind address [env: HUSH_BIND] [default: 127.0.0.1:4000]
    #[arg(long, short = 'b')]
    pub bind: Option<String>,

    /// Path to the SQLite database [env: HUSH_DB_PATH] [default: ./data/hush.db]
    #[arg(long)]
    pub db: Option<PathBuf>,

    /// Directory containing NNN_name.sql migration files
    /// [env: HUSH_MIGRATIONS_DIR] [default: ./migrations]
    #[arg(long)]
    pub migrations: Option<PathBuf>,

    /// Maximum concurrent members per room [env: HUSH_MAX_ROOM_PEERS] [default: 2]
    #[arg(long)]
    pub max_room_peers: Option<usize>,
}

pub struct Config {
    pub bind_addr: String,
    pub db_path: PathBuf,
    pub migrations_dir: PathBuf,
    pub max_room_peers: usize,
}

impl Config {
    pub fn from_cli_and_env(cli: Cli) -> Self {
        let bind_addr = cli
            .bind
            .or_else(|| std::env::var("HUSH_BIND").ok())
            .unwrap_or_else(|| "127.0.0.1:4000".to_string());

        let db_path = cli
            .db
            .or_else(|| std::env::var("HUSH_DB_PATH").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("./data/hush.db"));

        let migrations_dir = cli
            .migrations
            .or_else(|| std::env::var("HUSH_MIGRATIONS_DIR").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("./migrations"));

        let max_room_peers = cli
            .max_room_peers
            .or_else(|| {
                std::env::var("HUSH_MAX_ROOM_PEERS")
                    .ok()
                    .and_then(|v| v.parse().ok())
            })
            .unwrap_or(DEFAULT_MAX_ROOM_PEERS);

        Self {
            bind_addr,
            db_path,
            migrations_dir,
            max_room_peers,
        }
    }

    /// Create the database directory if it doesn't exist.
    pub fn ensure_db_dir(&self) -> std::io::Result<()> {
        match self.db_path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => std::fs::create_dir_all(dir),
            _ => Ok(()),
        }
    }
}
