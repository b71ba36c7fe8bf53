//! CLI fetching verified randomness from a beacon node.

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

use beacon_client::{BeaconClient, HttpSource};
use beacon_types::{ChainHash, Metadata, PublicRandResponse, DEFAULT_BEACON_ID};

#[derive(Parser)]
#[command(name = "beacon-client")]
#[command(about = "Fetch and verify beacon randomness")]
struct Cli {
    /// Public API of a node
    #[arg(long, default_value = "http://127.0.0.1:4444")]
    url: String,

    /// Beacon to query
    #[arg(long, default_value = DEFAULT_BEACON_ID)]
    id: String,

    /// Chain hash (hex) the chain must have; also selects the chain
    #[arg(long)]
    chain_hash: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the chain information
    Info,

    /// Print a verified entry
    Get {
        /// Round number; the latest entry when 0
        #[arg(long, default_value = "0")]
        round: u64,
    },

    /// Print every new entry as it is produced
    Watch,
}

fn parse_chain_hash(hex_str: &str) -> Result<ChainHash> {
    let bytes: [u8; 32] = hex::decode(hex_str)?
        .try_into()
        .map_err(|_| anyhow!("Chain hash must be 32 bytes"))?;
    Ok(ChainHash(bytes))
}

fn unix_now() -> Result<u64> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs())
}

fn print_entry(entry: &PublicRandResponse) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "round": entry.round,
            "randomness": hex::encode(&entry.randomness),
            "signature": hex::encode(&entry.signature),
            "previous_signature": hex::encode(&entry.previous_signature),
        }))?
    );
    Ok(())
}

async fn watch(client: &BeaconClient<HttpSource>) -> Result<()> {
    let mut next = client.round_at(unix_now()?) + 1;
    loop {
        let at = client.round_time(next);
        let now = unix_now()?;
        if at > now {
            tokio::time::sleep(Duration::from_secs(at - now)).await;
        }
        match client.get(next).await {
            Ok(entry) => {
                print_entry(&entry)?;
                next += 1;
            }
            // The node may not have aggregated the round yet
            Err(e) => {
                warn!("Round {} not available yet: {}", next, e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("beacon_client=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    let expected = cli.chain_hash.as_deref().map(parse_chain_hash).transpose()?;
    let metadata = match &expected {
        Some(hash) => Metadata::for_chain_hash(hash.as_bytes()),
        None => Metadata::for_beacon(&cli.id),
    };
    let source = HttpSource::new(&cli.url, metadata, Duration::from_secs(10))?;
    let client = BeaconClient::connect(source, expected).await?;
    info!("Connected to chain {}", client.chain_hash());

    match cli.command {
        Commands::Info => {
            let info = client.info();
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "hash": client.chain_hash().to_hex(),
                    "public_key": info.public_key.to_hex(),
                    "period": info.period,
                    "genesis_time": info.genesis_time,
                    "genesis_seed": hex::encode(info.genesis_seed),
                    "scheme_id": info.scheme_id,
                    "beacon_id": info.beacon_id,
                }))?
            );
        }

        Commands::Get { round } => {
            print_entry(&client.get(round).await?)?;
        }

        Commands::Watch => watch(&client).await?,
    }

    Ok(())
}
