//! Randomness beacon daemon.
//!
//! `start` runs a node hosting every beacon found in its data folder. The
//! other subcommands talk to a running node over its control address.

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use jsonrpsee::http_client::{HttpClient, HttpClientBuilder};
use jsonrpsee::server::{Server, ServerHandle};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use beacon_node::{
    Daemon, FileKeyStore, Identity, InitDkgFollowerRequest, InitDkgLeaderRequest,
    InitReshareLeaderRequest, NodeConfig, PeerClient,
};
use beacon_types::{Group, Metadata, DEFAULT_BEACON_ID};

mod peer_client;
mod rpc;

use peer_client::RpcPeerClient;
use rpc::{ControlApiClient, ControlApiServer, DaemonRpc, PeerApiServer, PublicApiServer};

/// DKG and resharing requests block until the protocol ends.
const CONTROL_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Parser)]
#[command(name = "beacon-daemon")]
#[command(about = "Multi-beacon threshold randomness node")]
struct Cli {
    /// Control address of the node to operate on
    #[arg(long, default_value = "127.0.0.1:8888")]
    control: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node
    Start {
        /// JSON configuration file; flags override its values
        #[arg(long)]
        config: Option<PathBuf>,

        /// Peer plane address, announced to other nodes
        #[arg(long)]
        private_listen: Option<String>,

        /// Public API address
        #[arg(long)]
        public_listen: Option<String>,

        /// Data folder holding keys, groups and chains
        #[arg(long)]
        folder: Option<PathBuf>,
    },

    /// Check that the node answers
    Ping,

    /// List the beacons hosted by the node
    List,

    /// Print the node's identity for a beacon
    Identity {
        #[arg(long, default_value = DEFAULT_BEACON_ID)]
        id: String,
    },

    /// Lead a DKG creating a new chain
    DkgLeader {
        #[arg(long, default_value = DEFAULT_BEACON_ID)]
        id: String,

        /// Peer addresses of the other participants
        #[arg(long, value_delimiter = ',')]
        nodes: Vec<String>,

        #[arg(short = 't', long)]
        threshold: u32,

        /// Seconds between rounds
        #[arg(long)]
        period: u64,

        /// Seconds the protocol may run
        #[arg(long)]
        timeout: Option<u64>,

        /// Seconds between the end of the DKG and the genesis
        #[arg(long)]
        genesis_delay: Option<u64>,
    },

    /// Accept a DKG led by another node
    DkgFollower {
        #[arg(long, default_value = DEFAULT_BEACON_ID)]
        id: String,

        /// Peer address of the leader
        #[arg(long)]
        leader: String,
    },

    /// Lead a resharing of a running chain
    ReshareLeader {
        #[arg(long, default_value = DEFAULT_BEACON_ID)]
        id: String,

        /// Peer addresses of the other members of the new group
        #[arg(long, value_delimiter = ',')]
        nodes: Vec<String>,

        #[arg(short = 't', long)]
        threshold: u32,

        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Take part in a resharing led by another node
    ReshareFollower {
        #[arg(long, default_value = DEFAULT_BEACON_ID)]
        id: String,

        #[arg(long)]
        leader: String,

        /// Current group file, required when joining the chain
        #[arg(long)]
        group: Option<PathBuf>,
    },

    /// Abort the running DKG of a beacon
    Abort {
        #[arg(long, default_value = DEFAULT_BEACON_ID)]
        id: String,
    },

    /// Load a beacon from the node's data folder without starting it
    Load {
        #[arg(long, default_value = DEFAULT_BEACON_ID)]
        id: String,
    },

    /// Start a keyed beacon that is not running
    Resume {
        #[arg(long, default_value = DEFAULT_BEACON_ID)]
        id: String,

        /// Skip syncing with peers before resuming
        #[arg(long)]
        no_catchup: bool,
    },

    /// Show the status of a beacon
    Status {
        #[arg(long, default_value = DEFAULT_BEACON_ID)]
        id: String,
    },

    /// Print the chain information of a beacon
    ChainInfo {
        #[arg(long, default_value = DEFAULT_BEACON_ID)]
        id: String,
    },

    /// Print the group file of a beacon
    Show {
        #[arg(long, default_value = DEFAULT_BEACON_ID)]
        id: String,
    },

    /// Stop one beacon, or the whole node when no id is given
    Stop {
        #[arg(long)]
        id: Option<String>,
    },
}

fn load_config(path: Option<&Path>) -> Result<NodeConfig> {
    match path {
        Some(path) => {
            let data = std::fs::read_to_string(path)?;
            Ok(serde_json::from_str(&data)?)
        }
        None => Ok(NodeConfig::default()),
    }
}

fn load_group(path: &Path) -> Result<Group> {
    let data = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&data)?)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn serve(config: NodeConfig) -> Result<()> {
    let key_store = Arc::new(FileKeyStore::new(&config.data_folder)?);
    let client = Arc::new(RpcPeerClient::new(config.peer_timeout()));
    let daemon = Daemon::new(config.clone(), key_store, client);

    let beacons = daemon.load_beacons()?;
    info!(beacons = ?beacons, folder = ?config.data_folder, "Beacons loaded");

    let rpc = DaemonRpc::new(daemon.clone());
    let mut handles: Vec<ServerHandle> = Vec::new();

    let control = Server::builder().build(&config.control_listen).await?;
    handles.push(control.start(ControlApiServer::into_rpc(rpc.clone())));
    info!("Control plane listening on {}", config.control_listen);

    let mut peer_module = PeerApiServer::into_rpc(rpc.clone());
    peer_module.merge(PublicApiServer::into_rpc(rpc.clone()))?;
    let peer = Server::builder().build(&config.private_listen).await?;
    handles.push(peer.start(peer_module));
    info!("Peer plane listening on {}", config.private_listen);

    if let Some(public_listen) = &config.public_listen {
        let public = Server::builder().build(public_listen).await?;
        handles.push(public.start(PublicApiServer::into_rpc(rpc)));
        info!("Public API listening on {}", public_listen);
    }

    let mut shutdown = daemon.shutdown_signal();
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            daemon.shutdown(None)?;
        }
        _ = shutdown.changed() => {}
    }

    info!("Shutting down...");
    for handle in handles {
        handle.stop()?;
        handle.stopped().await;
    }
    Ok(())
}

fn control_client(address: &str) -> Result<HttpClient> {
    Ok(HttpClientBuilder::default()
        .request_timeout(CONTROL_TIMEOUT)
        .build(format!("http://{}", address))?)
}

/// Own identity first, then the identities announced by `nodes`.
async fn collect_identities(control: &HttpClient, beacon_id: &str, nodes: &[String]) -> Result<Vec<Identity>> {
    let peers = RpcPeerClient::new(Duration::from_secs(10));
    let mut identities = vec![control.identity(beacon_id.to_string()).await?];
    for node in nodes {
        let identity = peers
            .identity(node, Metadata::for_beacon(beacon_id))
            .await
            .map_err(|e| anyhow!("Cannot fetch identity of {}: {}", node, e))?;
        if identities.iter().any(|known| known.address == identity.address) {
            return Err(anyhow!("Node {} listed twice", identity.address));
        }
        identities.push(identity);
    }
    Ok(identities)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("beacon_daemon=info".parse()?)
                .add_directive("beacon_node=info".parse()?)
                .add_directive("jsonrpsee=warn".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start {
            config,
            private_listen,
            public_listen,
            folder,
        } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(addr) = private_listen {
                config.private_listen = addr;
            }
            if let Some(addr) = public_listen {
                config.public_listen = Some(addr);
            }
            if let Some(folder) = folder {
                config.data_folder = folder;
            }
            config.control_listen = cli.control;
            serve(config).await
        }
        command => run_control(&cli.control, command).await,
    }
}

async fn run_control(address: &str, command: Commands) -> Result<()> {
    let control = control_client(address)?;

    match command {
        Commands::Start { .. } => return Err(anyhow!("start runs a node, not a control request")),

        Commands::Ping => {
            control.ping().await?;
            println!("pong");
        }

        Commands::List => {
            for id in control.list_beacon_ids().await? {
                println!("{}", id);
            }
        }

        Commands::Identity { id } => {
            print_json(&control.identity(id).await?)?;
        }

        Commands::DkgLeader {
            id,
            nodes,
            threshold,
            period,
            timeout,
            genesis_delay,
        } => {
            let participants = collect_identities(&control, &id, &nodes).await?;
            info!(
                "Leading DKG for {} with {} participants (threshold {})",
                id,
                participants.len(),
                threshold
            );
            let group = control
                .init_dkg_leader(InitDkgLeaderRequest {
                    beacon_id: id,
                    participants,
                    threshold,
                    period,
                    timeout_secs: timeout,
                    genesis_delay_secs: genesis_delay,
                })
                .await?;
            print_json(&group)?;
        }

        Commands::DkgFollower { id, leader } => {
            info!("Waiting for DKG of {} led by {}", id, leader);
            let group = control
                .init_dkg_follower(InitDkgFollowerRequest {
                    beacon_id: id,
                    leader_address: leader,
                    old_group: None,
                })
                .await?;
            print_json(&group)?;
        }

        Commands::ReshareLeader {
            id,
            nodes,
            threshold,
            timeout,
        } => {
            let participants = collect_identities(&control, &id, &nodes).await?;
            let group = control
                .init_reshare_leader(InitReshareLeaderRequest {
                    beacon_id: id,
                    participants,
                    threshold,
                    timeout_secs: timeout,
                })
                .await?;
            print_json(&group)?;
        }

        Commands::ReshareFollower { id, leader, group } => {
            let old_group = group.as_deref().map(load_group).transpose()?;
            let group = control
                .init_reshare_follower(InitDkgFollowerRequest {
                    beacon_id: id,
                    leader_address: leader,
                    old_group,
                })
                .await?;
            print_json(&group)?;
        }

        Commands::Abort { id } => {
            control.abort_dkg(id.clone()).await?;
            info!("DKG of {} aborted", id);
        }

        Commands::Load { id } => {
            print_json(&control.load_beacon(id).await?)?;
        }

        Commands::Resume { id, no_catchup } => {
            control.start_beacon(id.clone(), !no_catchup).await?;
            info!("Beacon {} started", id);
        }

        Commands::Status { id } => {
            print_json(&control.status(id).await?)?;
        }

        Commands::ChainInfo { id } => {
            print_json(&control.chain_info(id).await?)?;
        }

        Commands::Show { id } => {
            print_json(&control.group_file(id).await?)?;
        }

        Commands::Stop { id } => {
            control.shutdown(id).await?;
        }
    }

    Ok(())
}
