//! Outbox discovery sweep utility.
//!
//! Runs one discovery sweep for the given pubkeys against a routing database
//! and prints the resulting routes.
//!
//! # Usage
//!
//! ```bash
//! # Discover two users with the default bootstrap relays
//! discover npub1... npub1...
//!
//! # Custom database and relays
//! discover --db ./data/routes.db \
//!     --relays wss://purplepag.es,wss://relay.damus.io \
//!     3bf0c63fcb93463407af97a5e5ee64fa883d107ef9e558472c4eb9aaaefa459d
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use nostr::PublicKey;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use wayfinder_router::{ClientConfig, OutboxClient};

/// Outbox discovery sweep utility.
#[derive(Parser, Debug)]
#[command(name = "discover")]
#[command(about = "Run one outbox discovery sweep and print the resulting routes")]
#[command(version)]
struct Args {
    /// Pubkeys to discover (hex or npub)
    #[arg(required = true)]
    pubkeys: Vec<String>,

    /// Path to the routing SQLite database
    #[arg(long, short, default_value = "./data/routes.db")]
    db: PathBuf,

    /// Bootstrap relay URLs (comma-separated, overrides defaults)
    #[arg(long, value_delimiter = ',')]
    relays: Option<Vec<String>>,

    /// Users per discovery request
    #[arg(long, default_value = "25")]
    batch_size: usize,

    /// Skip document ID/signature verification
    #[arg(long)]
    no_verify: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("info".parse().unwrap())
                .add_directive("wayfinder_router=debug".parse().unwrap()),
        )
        .init();

    let args = Args::parse();

    let users: Vec<PublicKey> = args
        .pubkeys
        .iter()
        .map(|s| PublicKey::parse(s).with_context(|| format!("invalid pubkey '{}'", s)))
        .collect::<Result<_>>()?;

    let mut config = ClientConfig {
        db_path: args.db,
        ..Default::default()
    };
    config.outbox.batch_size = args.batch_size;
    config.outbox.verify_documents = !args.no_verify;
    if let Some(relays) = args.relays {
        config.scheduler.bootstrap_relays = relays;
    }

    tracing::info!("Configuration:");
    tracing::info!("  Database: {}", config.db_path.display());
    tracing::info!(
        "  Bootstrap relays: {}",
        config.scheduler.bootstrap_relays.join(", ")
    );
    tracing::info!("  Users: {}", users.len());

    let client = OutboxClient::open(config).context("failed to open routing database")?;

    let result = client.scheduler().run_discovery(users.clone()).await;
    tracing::info!(
        "Sweep finished: {} documents, {} users discovered",
        result.events_found,
        result.users_discovered
    );

    for user in &users {
        let routes = client.get_routes(user)?;
        println!("{} ({} routes)", user.to_hex(), routes.len());
        for route in routes {
            let direction = match (route.can_read, route.can_write) {
                (true, true) => "read+write",
                (true, false) => "read",
                (false, true) => "write",
                (false, false) => "none",
            };
            println!("  {} [{}]", route.relay_url, direction);
        }
    }

    client.shutdown();
    Ok(())
}
