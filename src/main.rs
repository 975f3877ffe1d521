use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use raft_lite::codec::{self, ClientRequest, Frame};
use raft_lite::config::{parse_members, NodeConfig, NodeIdentity, TimingConfig};
use raft_lite::console::run_console;
use raft_lite::error::RaftError;
use raft_lite::machine::ActionTally;
use raft_lite::raft::RaftNode;
use raft_lite::shutdown::install_shutdown_handler;
use raft_lite::transport::{Transport, UdpTransport};

#[derive(Parser, Debug)]
#[command(name = "raft-lite")]
#[command(version)]
#[command(about = "A single-leader replicated log over UDP")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a server node
    Server(ServerArgs),

    /// Send one client command to the cluster and wait for its outcome
    Submit(SubmitArgs),
}

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Node ID (unique across the group)
    #[arg(long, default_value = "0")]
    node_id: u64,

    /// Host to bind
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// UDP port to bind
    #[arg(long, default_value = "7000")]
    port: u16,

    /// Other group members (comma-separated, format: "id:kind:host:port")
    /// Example: "1:server:127.0.0.1:7001,2:server:127.0.0.1:7002,9:client:127.0.0.1:7009"
    #[arg(long, default_value = "")]
    peers: String,

    /// Where to persist the log (defaults to raft-node-<id>.log.json)
    #[arg(long)]
    log_path: Option<PathBuf>,

    /// Tick length in milliseconds
    #[arg(long, default_value = "1000")]
    tick_ms: u64,

    /// Minimum election timeout, in ticks
    #[arg(long, default_value = "5")]
    election_min_ticks: i64,

    /// Maximum election timeout, in ticks
    #[arg(long, default_value = "15")]
    election_max_ticks: i64,

    /// Heartbeat interval, in ticks
    #[arg(long, default_value = "3")]
    heartbeat_ticks: i64,

    /// Stay idle until a start signal arrives
    #[arg(long)]
    wait_for_start: bool,

    /// Do not read fault-injection commands from stdin
    #[arg(long)]
    no_console: bool,
}

#[derive(Parser, Debug)]
struct SubmitArgs {
    /// Submitter ID, as known to the servers
    #[arg(long, default_value = "9")]
    client_id: u64,

    /// Address to bind; must match the client entry in the servers' peer list
    #[arg(long, default_value = "127.0.0.1:7009")]
    bind: SocketAddr,

    /// Server addresses (comma-separated host:port)
    #[arg(long)]
    servers: String,

    /// Seconds to wait for the outcome
    #[arg(long, default_value = "10")]
    timeout_secs: u64,

    /// The action to submit (e.g. "Q")
    action: String,
}

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let identity = NodeIdentity::server(args.node_id, args.host, args.port);
    let bind_addr = identity.resolve()?;

    let mut config = NodeConfig::new(identity).with_timing(TimingConfig {
        tick: Duration::from_millis(args.tick_ms),
        election_timeout_min_ticks: args.election_min_ticks,
        election_timeout_max_ticks: args.election_max_ticks,
        heartbeat_interval_ticks: args.heartbeat_ticks,
    });
    for member in parse_members(&args.peers)? {
        config = config.with_member(member);
    }
    if let Some(path) = args.log_path {
        config = config.with_log_path(path);
    }
    config.wait_for_start = args.wait_for_start;

    tracing::info!(
        node_id = config.identity.id,
        addr = %bind_addr,
        cluster_size = config.cluster_size(),
        log_path = %config.log_path.display(),
        "Starting server"
    );

    let transport = Arc::new(UdpTransport::bind(bind_addr).await?);
    let node = Arc::new(RaftNode::new(config, transport, ActionTally::new())?);
    let shutdown = install_shutdown_handler();

    if !args.no_console {
        tokio::spawn(run_console(node.clone(), shutdown.clone()));
    }

    node.run(shutdown).await;
    Ok(())
}

async fn run_submit(args: SubmitArgs) -> Result<(), Box<dyn std::error::Error>> {
    let servers: Vec<SocketAddr> = args
        .servers
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::parse)
        .collect::<Result<_, _>>()?;
    if servers.is_empty() {
        return Err("no servers given".into());
    }

    let transport = UdpTransport::bind(args.bind).await?;
    let frame: Frame<serde_json::Value> = Frame::ClientCommand(ClientRequest {
        submitter: args.client_id,
        action: args.action,
    });
    let bytes = codec::encode(&frame)?;
    for server in &servers {
        transport.send(*server, bytes.clone()).await?;
    }

    let wait = async {
        loop {
            let (from, bytes) = transport.recv().await?;
            match codec::decode::<serde_json::Value>(&bytes) {
                Ok(Frame::Outcome(outcome)) => return Ok::<_, RaftError>(outcome),
                Ok(other) => {
                    tracing::debug!(from = %from, tag = %other.tag(), "Ignoring frame");
                }
                Err(e) => {
                    tracing::warn!(from = %from, error = %e, "Dropping malformed frame");
                }
            }
        }
    };

    let outcome = tokio::time::timeout(Duration::from_secs(args.timeout_secs), wait)
        .await
        .map_err(|_| "timed out waiting for the outcome")??;

    println!("{}", outcome.outcome);
    println!("{}", outcome.rendering);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => run_server(server_args).await?,
        Commands::Submit(submit_args) => run_submit(submit_args).await?,
    }

    Ok(())
}
