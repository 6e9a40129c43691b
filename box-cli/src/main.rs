#![forbid(unsafe_code)]

//! `boxc` — Box client and admin CLI.
//!
//! Network operations (hello/put/get/locate) speak the wire protocol over
//! the secure transport; admin operations talk newline-JSON to the local
//! daemon socket.

mod client;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use uuid::Uuid;

use box_core::config::BoxConfig;
use box_core::paths::BoxPaths;
use box_core::{NodeId, UserId};
use box_crypto::Identity;
use box_transport::TransportMode;

use client::BrokerClient;

#[derive(Debug, Parser)]
#[command(name = "boxc", about = "Box client and admin tool", version)]
struct Cli {
    /// Home directory holding the .box tree (defaults to $HOME).
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    /// Reply timeout in seconds for network operations.
    #[arg(long, global = true, default_value_t = 5)]
    timeout: u64,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Debug, Args)]
struct ServerArgs {
    /// Broker address, `ip:port`. No DNS: literals only.
    #[arg(long)]
    server: SocketAddr,

    /// Pre-shared key; omit for a cleartext session.
    #[arg(long)]
    psk: Option<String>,
}

#[derive(Debug, Subcommand)]
enum CliCommand {
    /// Negotiate protocol versions with a broker.
    Hello {
        #[command(flatten)]
        server: ServerArgs,
    },
    /// Deposit an object into a queue.
    Put {
        #[command(flatten)]
        server: ServerArgs,
        /// Queue path, e.g. /INBOX.
        queue: String,
        /// Payload bytes, taken literally.
        #[arg(long)]
        data: String,
        #[arg(long, default_value = "text/plain")]
        content_type: String,
    },
    /// Fetch (and on ephemeral queues consume) the next object.
    Get {
        #[command(flatten)]
        server: ServerArgs,
        queue: String,
    },
    /// Look up a node or user by UUID.
    Locate {
        #[command(flatten)]
        server: ServerArgs,
        target: Uuid,
    },
    /// Talk to the local daemon's admin socket.
    Admin {
        #[command(subcommand)]
        command: AdminCommand,
    },
}

#[derive(Debug, Subcommand)]
enum AdminCommand {
    /// Daemon status summary.
    Status,
    /// Counters and throughput.
    Stats,
    /// Re-read the configuration file.
    Reload { path: Option<PathBuf> },
    /// Node record or user aggregate from the location index.
    Locate { target: Uuid },
    /// Probe all NAT backends once.
    NatProbe {
        #[arg(long)]
        gateway: Option<std::net::Ipv4Addr>,
    },
    /// Staleness summary of the location index.
    LocationSummary,
    /// Switch the daemon log target: stderr | stdout | file:<path>.
    SetLogTarget { spec: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let paths = match &cli.home {
        Some(home) => BoxPaths::new(home),
        None => BoxPaths::from_env()?,
    };
    let timeout = Duration::from_secs(cli.timeout);

    match cli.command {
        CliCommand::Hello { server } => {
            let mut client = connect(&paths, &server, timeout).await?;
            let versions = client.hello().await?;
            println!(
                "negotiated versions: {}",
                versions
                    .iter()
                    .map(u16::to_string)
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
        CliCommand::Put {
            server,
            queue,
            data,
            content_type,
        } => {
            let mut client = connect(&paths, &server, timeout).await?;
            let status = client.put(&queue, &content_type, data.as_bytes()).await?;
            report_status(&status)?;
        }
        CliCommand::Get { server, queue } => {
            let mut client = connect(&paths, &server, timeout).await?;
            match client.get(&queue).await? {
                client::GetOutcome::Object {
                    content_type,
                    data,
                } => {
                    eprintln!("content-type: {content_type}");
                    match String::from_utf8(data) {
                        Ok(text) => println!("{text}"),
                        Err(raw) => println!("{}", hex::encode(raw.as_bytes())),
                    }
                }
                client::GetOutcome::Status(status) => report_status(&status)?,
            }
        }
        CliCommand::Locate { server, target } => {
            let mut client = connect(&paths, &server, timeout).await?;
            match client.locate(target).await? {
                client::LocateOutcome::Found(value) => {
                    println!("{}", serde_json::to_string_pretty(&value)?)
                }
                client::LocateOutcome::Status(status) => report_status(&status)?,
            }
        }
        CliCommand::Admin { command } => run_admin(&paths, command, timeout).await?,
    }
    Ok(())
}

/// Build the network client: client identity, ids, transport mode.
async fn connect(paths: &BoxPaths, server: &ServerArgs, timeout: Duration) -> Result<BrokerClient> {
    paths.ensure()?;
    let config = BoxConfig::load_or_default(paths.config_file())?;
    let identity = Identity::load_or_generate(&paths.client_identity_file())?;
    let node_id = NodeId(identity.derived_uuid());
    let user_id = config
        .user_id
        .map(UserId)
        .unwrap_or_else(|| UserId(identity.derived_uuid()));

    let psk = server
        .psk
        .clone()
        .or_else(|| config.network.psk.clone());
    let mode = match psk {
        Some(psk) => TransportMode::psk(psk.as_bytes()),
        None => TransportMode::Clear,
    };
    BrokerClient::connect(server.server, mode, node_id, user_id, timeout)
}

fn report_status(status: &box_proto::StatusPayload) -> Result<()> {
    if status.status == box_proto::Status::Ok {
        println!("{}", status.message);
        Ok(())
    } else {
        bail!("{:?}: {}", status.status, status.message)
    }
}

async fn run_admin(paths: &BoxPaths, command: AdminCommand, timeout: Duration) -> Result<()> {
    let line = match command {
        AdminCommand::Status => "status".to_string(),
        AdminCommand::Stats => "stats".to_string(),
        AdminCommand::Reload { path: None } => "reload".to_string(),
        AdminCommand::Reload { path: Some(path) } => format!("reload {}", path.display()),
        AdminCommand::Locate { target } => format!("locate {target}"),
        AdminCommand::NatProbe { gateway: None } => "nat-probe".to_string(),
        AdminCommand::NatProbe {
            gateway: Some(gateway),
        } => format!("nat-probe --gateway {gateway}"),
        AdminCommand::LocationSummary => "location-summary".to_string(),
        AdminCommand::SetLogTarget { spec } => format!("set-log-target {spec}"),
    };
    let response = admin_roundtrip(&paths.admin_socket(), &line, timeout).await?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    if response.get("status").and_then(|s| s.as_str()) == Some("error") {
        bail!(
            "{}",
            response
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("admin command failed")
        );
    }
    Ok(())
}

#[cfg(unix)]
async fn admin_roundtrip(
    socket: &std::path::Path,
    line: &str,
    timeout: Duration,
) -> Result<serde_json::Value> {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixStream;

    let stream = UnixStream::connect(socket)
        .await
        .with_context(|| format!("is boxd running? (socket {})", socket.display()))?;
    let (read_half, mut write_half) = stream.into_split();
    write_half.write_all(line.as_bytes()).await?;
    write_half.write_all(b"\n").await?;
    write_half.flush().await?;

    let mut lines = BufReader::new(read_half).lines();
    let reply = tokio::time::timeout(timeout, lines.next_line())
        .await
        .context("admin reply timed out")??
        .context("daemon closed the connection")?;
    Ok(serde_json::from_str(&reply)?)
}

#[cfg(not(unix))]
async fn admin_roundtrip(
    _socket: &std::path::Path,
    _line: &str,
    _timeout: Duration,
) -> Result<serde_json::Value> {
    bail!("the admin channel requires unix domain sockets on this platform")
}
