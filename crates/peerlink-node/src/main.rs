//! PeerLink - serverless LAN chat, file transfer and groups

use anyhow::Result;
use clap::{Parser, Subcommand};
use peerlink_core::format_file_size;
use peerlink_node::config::{default_config_path, expand_path};
use peerlink_node::{Config, EventReceiver, Node, NodeEvent};
use std::path::Path;
use std::time::Duration;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "peerlink")]
#[command(about = "Serverless peer-to-peer chat and file sharing on the local network", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long)]
    config: Option<String>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Username announced to peers (overrides config)
    #[arg(short, long)]
    username: Option<String>,

    /// First service port to try (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize configuration
    Init,

    /// Run a node until interrupted
    Serve {
        /// Accept every offered file
        #[arg(long)]
        accept_files: bool,

        /// Accept every group invitation
        #[arg(long)]
        accept_invites: bool,

        /// Seconds between background rescans (0 disables)
        #[arg(long, default_value = "60")]
        rescan_secs: u64,
    },

    /// Scan the network and list peers
    Discover,

    /// Send a chat message
    Chat {
        /// Recipient username
        #[arg(required = true)]
        peer: String,

        /// Message text
        #[arg(required = true)]
        message: String,
    },

    /// Offer a file to a peer and wait for the outcome
    Send {
        /// Recipient username
        #[arg(required = true)]
        peer: String,

        /// Path to the file
        #[arg(required = true)]
        file: String,

        /// Seconds to wait for the peer to accept
        #[arg(long, default_value = "120")]
        wait_secs: u64,
    },

    /// Show node settings
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let config_path = cli
        .config
        .as_deref()
        .map(expand_path)
        .unwrap_or_else(default_config_path);

    let mut config = Config::load_or_default(&config_path)?;
    if let Some(username) = cli.username {
        config.username = username;
    }
    if let Some(port) = cli.port {
        config.network.base_port = port;
    }

    match cli.command {
        Commands::Init => init_config(&config_path)?,
        Commands::Serve {
            accept_files,
            accept_invites,
            rescan_secs,
        } => serve(&config, accept_files, accept_invites, rescan_secs).await?,
        Commands::Discover => discover(&config).await?,
        Commands::Chat { peer, message } => chat(&config, &peer, &message).await?,
        Commands::Send {
            peer,
            file,
            wait_secs,
        } => send(&config, &peer, &file, wait_secs).await?,
        Commands::Status => show_status(&config, &config_path),
    }

    Ok(())
}

fn init_config(path: &Path) -> Result<()> {
    if path.exists() {
        println!("Config already exists at: {}", path.display());
        return Ok(());
    }
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }

    let config = Config::default();
    std::fs::write(path, toml::to_string_pretty(&config)?)?;
    std::fs::create_dir_all(config.download_dir())?;

    println!("Initialized PeerLink at: {}", path.display());
    println!("Downloads go to: {}", config.download_dir().display());
    Ok(())
}

async fn serve(config: &Config, accept_files: bool, accept_invites: bool, rescan_secs: u64) -> Result<()> {
    let (node, mut events) = Node::start(config).await?;
    println!(
        "{} online at {} (discovery {})",
        node.username(),
        node.service_addr(),
        node.discovery_addr()
    );

    let peers = node.discover().await;
    println!("{} peer(s) known", peers.len());

    let mut rescan = tokio::time::interval(Duration::from_secs(rescan_secs.max(1)));
    rescan.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = rescan.tick(), if rescan_secs > 0 => {
                let peers = node.discover().await;
                tracing::debug!("Rescan done, {} peer(s) known", peers.len());
            }
            Some(event) = events.recv() => {
                handle_event(&node, event, accept_files, accept_invites).await;
            }
        }
    }

    tracing::info!("Shutting down");
    node.shutdown().await;
    Ok(())
}

async fn handle_event(node: &Node, event: NodeEvent, accept_files: bool, accept_invites: bool) {
    match event {
        NodeEvent::PeerDiscovered(peer) => {
            println!("Peer {} at {}", peer.username, peer.addr());
        }
        NodeEvent::ChatReceived {
            sender, message, ..
        } => {
            println!("[{}] {}", sender, message);
        }
        NodeEvent::FileRequested {
            request_id,
            sender,
            file_name,
            file_size,
        } => {
            println!(
                "{} offers {} ({})",
                sender,
                file_name,
                format_file_size(file_size)
            );
            if accept_files {
                if let Err(e) = node.respond_to_file_request(&request_id, true).await {
                    tracing::warn!("Could not accept {}: {}", file_name, e);
                }
            }
        }
        NodeEvent::FileReceived {
            sender,
            path,
            bytes,
        } => {
            println!(
                "Received {} from {} ({})",
                path.display(),
                sender,
                format_file_size(bytes)
            );
        }
        NodeEvent::InvitationReceived(invitation) => {
            println!(
                "{} invited us to {} ({})",
                invitation.inviter,
                invitation.group,
                invitation.members.join(", ")
            );
            if accept_invites {
                if let Err(e) = node.respond_to_invitation(&invitation.group, true).await {
                    tracing::warn!("Could not join {}: {}", invitation.group, e);
                }
            }
        }
        NodeEvent::MemberJoined {
            group, members, ..
        } => {
            println!("Group {}: {}", group, members.join(", "));
        }
        NodeEvent::DirectoryShared {
            group,
            sharer,
            directory,
        } => {
            println!("{} shared {} in {}", sharer, directory, group);
        }
        NodeEvent::TransferFailed {
            peer, reason, ..
        } => {
            println!("Transfer with {} failed: {}", peer, reason);
        }
        other => tracing::debug!("{:?}", other),
    }
}

async fn discover(config: &Config) -> Result<()> {
    let (node, _events) = Node::start(config).await?;
    let peers = node.discover().await;

    if peers.is_empty() {
        println!("No peers found");
    } else {
        println!("Found {} peer(s):", peers.len());
        for peer in &peers {
            println!(
                "  {} at {} ({})",
                peer.username,
                peer.addr(),
                if peer.online { "online" } else { "offline" }
            );
        }
    }

    node.shutdown().await;
    Ok(())
}

async fn chat(config: &Config, peer: &str, message: &str) -> Result<()> {
    let (node, _events) = Node::start(config).await?;
    if !node.registry().contains(peer).await {
        node.discover().await;
    }
    node.send_chat(peer, message).await?;
    println!("Delivered to {}", peer);
    node.shutdown().await;
    Ok(())
}

async fn send(config: &Config, peer: &str, file: &str, wait_secs: u64) -> Result<()> {
    let path = expand_path(file);
    if !path.is_file() {
        anyhow::bail!("File not found: {}", path.display());
    }

    let (node, mut events) = Node::start(config).await?;
    if !node.registry().contains(peer).await {
        node.discover().await;
    }
    let request_id = node.send_file(peer, &path).await?;
    println!("Offered {} to {}, waiting for an answer...", path.display(), peer);

    let outcome = wait_for_transfer(&mut events, &request_id, Duration::from_secs(wait_secs)).await;
    node.shutdown().await;
    outcome
}

async fn wait_for_transfer(events: &mut EventReceiver, request_id: &str, wait: Duration) -> Result<()> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let event = match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Some(event)) => event,
            Ok(None) => anyhow::bail!("Node stopped before the transfer finished"),
            Err(_) => anyhow::bail!("No answer within {}s", wait.as_secs()),
        };
        match event {
            NodeEvent::FileSent {
                request_id: id,
                bytes,
                ..
            } if id == request_id => {
                println!("Sent {}", format_file_size(bytes));
                return Ok(());
            }
            NodeEvent::FileRejected { request_id: id, peer } if id == request_id => {
                anyhow::bail!("{} declined the file", peer);
            }
            NodeEvent::TransferFailed {
                request_id: id,
                reason,
                ..
            } if id == request_id => {
                anyhow::bail!("Transfer failed: {}", reason);
            }
            _ => {}
        }
    }
}

fn show_status(config: &Config, config_path: &Path) {
    println!("PeerLink Status");
    println!("===============");
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!("Config: {}", config_path.display());
    println!("Username: {}", config.username);
    println!("Bind host: {}", config.network.bind_host);
    println!(
        "Service ports: {}..{} (fallback {})",
        config.network.base_port,
        config.network.base_port.saturating_add(config.network.port_range),
        config.network.fallback_port
    );
    println!("Discovery offset: {}", config.network.discovery_offset);
    println!("Downloads: {}", config.download_dir().display());
    println!("Chunk size: {}", format_file_size(config.transfer.chunk_size as u64));
}
