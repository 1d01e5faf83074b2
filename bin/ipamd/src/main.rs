//! IPAM command-line interface and API server.

mod api;

use anyhow::{bail, Context, Result};
use api::ApiState;
use clap::{Parser, Subcommand};
use ipam_common::{AllocationRequest, ClusterConfig, NetworkId, RaftConfig};
use ipam_engine::Ipam;
use ipam_store::{LocalStore, RaftStore, SingleNodeHost, Store};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "ipamd")]
#[command(about = "IP address management across IPv4 and IPv6 networks")]
#[command(version)]
struct Cli {
    /// Path to the database directory
    #[arg(long, default_value = "ipam-data", global = true)]
    db: PathBuf,

    /// Log level
    #[arg(long, default_value = "warn", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Manage networks
    Network {
        #[command(subcommand)]
        command: NetworkCommand,
    },
    /// Allocate IP addresses
    Allocate {
        /// Network ID to allocate from
        #[arg(short = 'n', long)]
        network_id: Option<NetworkId>,
        /// Network CIDR to allocate from
        #[arg(short, long)]
        cidr: Option<String>,
        /// Number of contiguous IPs to allocate
        #[arg(short = 'k', long, default_value_t = 1)]
        count: u64,
        /// Description for the allocation
        #[arg(short, long, default_value = "")]
        description: String,
        /// Hostname for the allocation
        #[arg(short = 'H', long, default_value = "")]
        hostname: String,
        /// Comma-separated tags
        #[arg(short, long, default_value = "")]
        tags: String,
        /// Time to live in seconds
        #[arg(short = 'T', long, default_value_t = 0)]
        ttl: u64,
    },
    /// Release an allocated IP address
    Release {
        /// Start address of the allocation
        ip: IpAddr,
        /// Network ID (auto-detected when omitted)
        #[arg(short = 'n', long)]
        network_id: Option<NetworkId>,
    },
    /// List allocations
    List {
        /// Filter by network ID
        #[arg(short = 'n', long)]
        network_id: Option<NetworkId>,
        /// Show released allocations too
        #[arg(short, long)]
        all: bool,
    },
    /// Show network statistics
    Stats {
        /// Show stats for a specific network
        #[arg(short = 'n', long)]
        network_id: Option<NetworkId>,
    },
    /// Show recent audit entries
    Audit {
        /// Number of entries to show
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// Start the REST API server
    Server {
        /// Listen address
        #[arg(short, long, default_value = "127.0.0.1:8080")]
        listen: String,
        /// Cluster configuration file (enables cluster mode)
        #[arg(long)]
        cluster_config: Option<PathBuf>,
    },
    /// Cluster management
    Cluster {
        #[command(subcommand)]
        command: ClusterCommand,
    },
}

#[derive(Subcommand, Debug)]
enum NetworkCommand {
    /// Add a new network CIDR
    Add {
        cidr: String,
        /// Network description
        #[arg(short, long, default_value = "")]
        description: String,
        /// Comma-separated tags
        #[arg(short, long, default_value = "")]
        tags: String,
    },
    /// List all networks
    List,
    /// Delete a network
    Delete {
        id: NetworkId,
        /// Delete even when active allocations exist (cascades)
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand, Debug)]
enum ClusterCommand {
    /// Write the configuration for a new cluster
    Init {
        /// Node ID for this node
        #[arg(long, default_value_t = 1)]
        node_id: u64,
        /// Cluster ID
        #[arg(long, default_value_t = 1)]
        cluster_id: u64,
        /// Raft listen address
        #[arg(long, default_value = "localhost:5000")]
        raft_addr: String,
        /// API listen address
        #[arg(long, default_value = "localhost:8080")]
        api_addr: String,
        /// Data directory for Raft state
        #[arg(long, default_value = "ipam-cluster-data")]
        data_dir: PathBuf,
        /// Comma-separated nodeID:address pairs
        #[arg(long, default_value = "")]
        initial_members: String,
        /// Allow a single-node cluster
        #[arg(long)]
        single_node: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Command::Network { command } => run_network(&cli.db, command),
        Command::Allocate {
            network_id,
            cidr,
            count,
            description,
            hostname,
            tags,
            ttl,
        } => run_allocate(
            &cli.db,
            AllocationRequest {
                network_id,
                cidr,
                count,
                hostname,
                description,
                tags: split_tags(&tags),
                ttl_seconds: ttl,
            },
        ),
        Command::Release { ip, network_id } => run_release(&cli.db, ip, network_id),
        Command::List { network_id, all } => run_list(&cli.db, network_id, all),
        Command::Stats { network_id } => run_stats(&cli.db, network_id),
        Command::Audit { limit } => run_audit(&cli.db, limit),
        Command::Server {
            listen,
            cluster_config,
        } => run_server(&cli.db, &listen, cluster_config).await,
        Command::Cluster { command } => run_cluster(command),
    }
}

fn open_engine(db: &PathBuf) -> Result<Ipam> {
    let store = Arc::new(LocalStore::open(db).context("failed to open store")?);
    Ok(Ipam::new(store))
}

fn split_tags(tags: &str) -> Vec<String> {
    tags.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(String::from)
        .collect()
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        format!("{}...", &s[..max - 3])
    }
}

fn run_network(db: &PathBuf, command: NetworkCommand) -> Result<()> {
    let ipam = open_engine(db)?;
    match command {
        NetworkCommand::Add {
            cidr,
            description,
            tags,
        } => {
            let network = ipam
                .add_network(&cidr, &description, split_tags(&tags))
                .context("failed to add network")?;
            println!("Network added successfully:");
            println!("  ID:          {}", network.id);
            println!("  CIDR:        {}", network.cidr);
            println!("  Description: {}", network.description);
            if !network.tags.is_empty() {
                println!("  Tags:        {}", network.tags.join(", "));
            }
        }
        NetworkCommand::List => {
            let networks = ipam.networks()?;
            if networks.is_empty() {
                println!("No networks found.");
                return Ok(());
            }
            println!(
                "{:<38} {:<20} {:<30} Tags",
                "ID", "CIDR", "Description"
            );
            println!("{}", "-".repeat(100));
            for network in networks {
                println!(
                    "{:<38} {:<20} {:<30} {}",
                    network.id.to_string(),
                    network.cidr,
                    truncate(&network.description, 30),
                    network.tags.join(", ")
                );
            }
        }
        NetworkCommand::Delete { id, force } => {
            let active = ipam
                .allocations(id)?
                .iter()
                .filter(|a| a.is_active())
                .count();
            if active > 0 && !force {
                bail!("cannot delete network with {active} active allocations (use --force)");
            }
            ipam.delete_network(id)
                .context("failed to delete network")?;
            println!("Network {id} deleted successfully.");
        }
    }
    Ok(())
}

fn run_allocate(db: &PathBuf, request: AllocationRequest) -> Result<()> {
    let ipam = open_engine(db)?;
    let allocation = ipam.allocate(&request).context("failed to allocate IP")?;

    if allocation.end_ip.is_some() {
        println!("IP range allocated successfully:");
    } else {
        println!("IP allocated successfully:");
    }
    println!("  ID:          {}", allocation.id);
    println!("  Network ID:  {}", allocation.network_id);
    match allocation.end_ip {
        Some(end) => println!("  IP Range:    {} - {}", allocation.ip, end),
        None => println!("  IP:          {}", allocation.ip),
    }
    if !allocation.description.is_empty() {
        println!("  Description: {}", allocation.description);
    }
    if !allocation.hostname.is_empty() {
        println!("  Hostname:    {}", allocation.hostname);
    }
    if !allocation.tags.is_empty() {
        println!("  Tags:        {}", allocation.tags.join(", "));
    }
    if let Some(expires) = allocation.expires_at {
        println!("  Expires:     {}", expires.format("%Y-%m-%d %H:%M:%S"));
    }
    Ok(())
}

fn run_release(db: &PathBuf, ip: IpAddr, network_id: Option<NetworkId>) -> Result<()> {
    let ipam = open_engine(db)?;
    let network_id = match network_id {
        Some(id) => id,
        None => {
            ipam.find_network_for_ip(ip)
                .with_context(|| format!("IP {ip} not found in any network"))?
                .id
        }
    };
    ipam.release(network_id, ip).context("failed to release IP")?;
    println!("IP {ip} released successfully.");
    Ok(())
}

fn run_list(db: &PathBuf, network_id: Option<NetworkId>, all: bool) -> Result<()> {
    let ipam = open_engine(db)?;
    let networks = match network_id {
        Some(id) => vec![ipam.network(id)?],
        None => ipam.networks()?,
    };

    let now = chrono::Utc::now();
    let mut rows = Vec::new();
    for network in &networks {
        for allocation in ipam.allocations(network.id)? {
            if !all && !allocation.is_active() {
                continue;
            }
            rows.push((network.cidr.clone(), allocation));
        }
    }

    if rows.is_empty() {
        println!("No allocations found.");
        return Ok(());
    }

    println!(
        "{:<28} {:<20} {:<10} {:<20} {:<20} Allocated",
        "IP", "Network", "Status", "Hostname", "Description"
    );
    println!("{}", "-".repeat(120));
    for (cidr, allocation) in rows {
        let ip = match allocation.end_ip {
            Some(end) => format!("{}-{}", allocation.ip, end),
            None => allocation.ip.to_string(),
        };
        println!(
            "{:<28} {:<20} {:<10} {:<20} {:<20} {}",
            truncate(&ip, 28),
            cidr,
            allocation.status_at(now).to_string(),
            truncate(&allocation.hostname, 20),
            truncate(&allocation.description, 20),
            allocation.allocated_at.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}

fn run_stats(db: &PathBuf, network_id: Option<NetworkId>) -> Result<()> {
    let ipam = open_engine(db)?;
    let networks = match network_id {
        Some(id) => vec![ipam.network(id)?],
        None => ipam.networks()?,
    };
    if networks.is_empty() {
        println!("No networks found.");
        return Ok(());
    }

    println!(
        "{:<24} {:<15} {:<15} {:<15} {:<15} Utilization",
        "Network", "Total IPs", "Allocated", "Available", "Reserved"
    );
    println!("{}", "-".repeat(100));
    for network in networks {
        match ipam.get_network_stats(network.id) {
            Ok(stats) => println!(
                "{:<24} {:<15} {:<15} {:<15} {:<15} {:.1}%",
                network.cidr,
                stats.total_ips,
                stats.allocated_ips,
                stats.available_ips,
                stats.reserved_ips,
                stats.utilization_percent
            ),
            Err(e) => println!("{:<24} Error: {e}", network.cidr),
        }
    }
    Ok(())
}

fn run_audit(db: &PathBuf, limit: usize) -> Result<()> {
    let ipam = open_engine(db)?;
    let entries = ipam.audit_entries(limit)?;
    if entries.is_empty() {
        println!("No audit entries found.");
        return Ok(());
    }

    println!(
        "{:<20} {:<16} {:<38} Details",
        "Timestamp", "Action", "Resource"
    );
    println!("{}", "-".repeat(110));
    for entry in entries {
        println!(
            "{:<20} {:<16} {:<38} {}",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
            entry.action.to_string(),
            entry.resource_id,
            entry.details
        );
    }
    Ok(())
}

async fn run_server(db: &PathBuf, listen: &str, cluster_config: Option<PathBuf>) -> Result<()> {
    let (state, listen, snapshot) = match cluster_config {
        Some(path) => {
            let config = ClusterConfig::from_file(&path)
                .with_context(|| format!("failed to load {}", path.display()))?;
            config.validate().context("invalid cluster configuration")?;
            if !config.enable_single_node {
                bail!(
                    "multi-node clusters require an external raft transport; \
                     set enable_single_node for the in-process replica"
                );
            }

            let host = Arc::new(SingleNodeHost::new(&config)?);
            let state_machine = host.state_machine();

            // Recover replicated state from the last snapshot, if any
            let node_dir = config.node_dir();
            std::fs::create_dir_all(&node_dir)?;
            let snapshot_path = node_dir.join("snapshot.json");
            if snapshot_path.exists() {
                let file = std::fs::File::open(&snapshot_path)?;
                state_machine.recover_from_snapshot(file)?;
                info!(path = %snapshot_path.display(), "recovered from snapshot");
            }

            let raft = Arc::new(RaftStore::new(&config, &RaftConfig::default(), host)?);
            let state = ApiState {
                ipam: Ipam::new(raft.clone()),
                raft: Some(raft),
            };
            let listen = config.api_addr.clone();
            (state, listen, Some((state_machine, snapshot_path)))
        }
        None => {
            let store: Arc<dyn Store> = Arc::new(LocalStore::open(db)?);
            let state = ApiState {
                ipam: Ipam::new(store),
                raft: None,
            };
            (state, listen.to_string(), None)
        }
    };

    let mode = if state.raft.is_some() {
        "cluster"
    } else {
        "standalone"
    };
    let app = api::router(Arc::new(state));
    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("failed to bind {listen}"))?;
    info!(%listen, mode, "IPAM server listening");
    println!("Starting IPAM server ({mode} mode) on {listen}");
    println!("API available at: http://{listen}/api/v1");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    // Persist replicated state across restarts of the single-node replica
    if let Some((state_machine, snapshot_path)) = snapshot {
        let mut file = std::fs::File::create(&snapshot_path)?;
        state_machine.save_snapshot(&mut file)?;
        info!(path = %snapshot_path.display(), "saved snapshot");
    }
    Ok(())
}

fn run_cluster(command: ClusterCommand) -> Result<()> {
    match command {
        ClusterCommand::Init {
            node_id,
            cluster_id,
            raft_addr,
            api_addr,
            data_dir,
            initial_members,
            single_node,
        } => {
            let mut members = ClusterConfig::parse_initial_members(&initial_members)?;
            if single_node && members.is_empty() {
                members.insert(node_id, raft_addr.clone());
            }

            let config = ClusterConfig {
                node_id,
                cluster_id,
                raft_addr,
                api_addr,
                data_dir: data_dir.clone(),
                join: false,
                initial_members: members,
                enable_single_node: single_node,
            };
            config.validate().context("invalid configuration")?;

            std::fs::create_dir_all(&data_dir)?;
            let config_path = data_dir.join("cluster.json");
            std::fs::write(&config_path, serde_json::to_vec_pretty(&config)?)?;

            println!("Cluster initialized successfully:");
            println!("  Cluster ID:  {}", config.cluster_id);
            println!("  Node ID:     {}", config.node_id);
            println!("  Raft Addr:   {}", config.raft_addr);
            println!("  Data Dir:    {}", config.data_dir.display());
            println!("  Config File: {}", config_path.display());
            if !config.initial_members.is_empty() {
                println!("  Initial Members:");
                for (id, addr) in &config.initial_members {
                    println!("    Node {id}: {addr}");
                }
            }
            println!("\nTo start this node, run:");
            println!("  ipamd server --cluster-config {}", config_path.display());
            Ok(())
        }
    }
}
