//! LANBEAM CLI
//!
//! Peer-to-peer file transfer on the local network

mod config;
mod progress;

use anyhow::Context;
use clap::{Parser, Subcommand};
use console::{Term, style};
use lanbeam_core::{
    IncomingStatus, IncomingTransfer, Node, NodeEvent, Peer, PeerId, TaskKey, TaskStatus,
};
use lanbeam_files::DirectorySink;
use lanbeam_signal::SignalServer;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

use config::Config;
use progress::{ProgressBoard, TransferProgress, format_bytes};

/// LANBEAM - send files to devices on your network
#[derive(Parser)]
#[command(name = "lanbeam")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path [default: ~/.config/lanbeam/config.toml]
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Signaling server URL
    #[arg(long, global = true)]
    server: Option<String>,

    /// Device name shown to other peers
    #[arg(long, global = true)]
    name: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the signaling server
    Serve {
        /// Listen address
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Send files to peers
    Send {
        /// Files to send
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Recipient peer id or name (repeatable)
        #[arg(short, long = "to", required = true)]
        to: Vec<String>,

        /// Seconds to wait for recipients to appear
        #[arg(long, default_value_t = 10)]
        wait: u64,
    },

    /// Receive files from peers
    Receive {
        /// Output directory
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Accept every offer without asking
        #[arg(short, long)]
        yes: bool,
    },

    /// List peers on the signaling server
    Peers {
        /// Seconds to wait for the roster
        #[arg(long, default_value_t = 3)]
        wait: u64,
    },

    /// Show configuration and connection status
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => Config::load_or_default()?,
    };
    if let Some(server) = &cli.server {
        config.signaling.server_url = server.clone();
    }
    if let Some(name) = &cli.name {
        config.signaling.device_name = Some(name.clone());
    }

    config.validate()?;

    // Initialize logging
    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.logging.level.to_lowercase()
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .init();

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind_addr = bind;
            }
            serve(&config).await?;
        }
        Commands::Send { files, to, wait } => {
            send_files(files, to, Duration::from_secs(wait), &config).await?;
        }
        Commands::Receive { output, yes } => {
            receive_files(output, yes, &config).await?;
        }
        Commands::Peers { wait } => {
            list_peers(Duration::from_secs(wait), &config).await?;
        }
        Commands::Status => {
            show_status(&config).await?;
        }
    }

    Ok(())
}

/// Run the signaling server until Ctrl+C
async fn serve(config: &Config) -> anyhow::Result<()> {
    let server = SignalServer::bind(config.server_config()?).await?;
    println!("LANBEAM signaling server");
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!("Listen: {}", server.local_addr()?);
    println!("Press Ctrl+C to stop");

    server
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    println!("\nShutting down...");
    Ok(())
}

/// Start a node writing received files into `dir`
fn start_node(
    config: &Config,
    dir: PathBuf,
) -> anyhow::Result<(Node, broadcast::Receiver<NodeEvent>)> {
    let node_config = config.node_config()?;
    let sink = Arc::new(DirectorySink::new(dir));
    Ok(Node::connect(node_config, sink)?)
}

/// Find the peer named by `wanted` (id, or display name ignoring case)
fn resolve<'a>(peers: &'a [Peer], wanted: &str) -> Option<&'a Peer> {
    peers
        .iter()
        .find(|p| p.id.as_str() == wanted)
        .or_else(|| {
            peers
                .iter()
                .find(|p| p.display_name.eq_ignore_ascii_case(wanted))
        })
}

/// Wait until every name in `wanted` resolves to a peer
async fn wait_for_peers(
    node: &Node,
    events: &mut broadcast::Receiver<NodeEvent>,
    wanted: &[String],
    wait: Duration,
) -> anyhow::Result<Vec<PeerId>> {
    let deadline = tokio::time::Instant::now() + wait;

    loop {
        let peers = node.peers().await;
        let resolved: Vec<Option<PeerId>> = wanted
            .iter()
            .map(|w| resolve(&peers, w).map(|p| p.id.clone()))
            .collect();
        if resolved.iter().all(Option::is_some) {
            return Ok(resolved.into_iter().flatten().collect());
        }

        match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Ok(_)) | Ok(Err(RecvError::Lagged(_))) => {}
            Ok(Err(RecvError::Closed)) => anyhow::bail!("Node stopped"),
            Err(_) => {
                let missing: Vec<&str> = wanted
                    .iter()
                    .zip(&resolved)
                    .filter(|(_, r)| r.is_none())
                    .map(|(w, _)| w.as_str())
                    .collect();
                anyhow::bail!("Peers not found: {}", missing.join(", "));
            }
        }
    }
}

/// Send files to recipients and follow the transfers to the end
async fn send_files(
    files: Vec<PathBuf>,
    to: Vec<String>,
    wait: Duration,
    config: &Config,
) -> anyhow::Result<()> {
    for file in &files {
        if !file.is_file() {
            anyhow::bail!("File not found: {}", file.display());
        }
    }

    let (node, mut events) = start_node(config, config.transfer.download_dir.clone())?;
    let targets = match wait_for_peers(&node, &mut events, &to, wait).await {
        Ok(targets) => targets,
        Err(e) => {
            node.shutdown().await;
            return Err(e);
        }
    };

    let tasks = node.send_files(&files, &targets).await?;
    let total: u64 = tasks.iter().map(|t| t.file.size).sum();
    println!(
        "Offered {} files ({}) to {} peers, waiting for answers...",
        files.len(),
        format_bytes(total),
        targets.len()
    );

    let board = ProgressBoard::new();
    let mut bars: HashMap<TaskKey, TransferProgress> = HashMap::new();
    let mut status: HashMap<TaskKey, TaskStatus> =
        tasks.iter().map(|t| (t.key(), t.status)).collect();

    while !status.values().all(|s| s.is_terminal()) {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => event,
        };
        let task = match event {
            Ok(NodeEvent::TaskUpdated(task)) => task,
            Ok(NodeEvent::SignalingDisconnected) => {
                board.println(format!("{}", style("Signaling connection lost, retrying").yellow()));
                continue;
            }
            Ok(_) | Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => break,
        };

        let key = task.key();
        let Some(known) = status.get_mut(&key) else {
            continue;
        };
        *known = task.status;

        let label = format!("{} -> {}", task.file.name, task.target);
        match task.status {
            TaskStatus::Pending => {}
            TaskStatus::Transferring => {
                bars.entry(key)
                    .or_insert_with(|| board.add(task.file.size, &label))
                    .update_percent(task.progress);
            }
            TaskStatus::Completed => {
                bars.entry(key)
                    .or_insert_with(|| board.add(task.file.size, &label))
                    .finish_with_message(format!("{label}: done"));
            }
            TaskStatus::Error => match bars.remove(&key) {
                Some(bar) => bar.abandon_with_message(format!("{label}: failed")),
                None => board.println(format!("{}", style(format!("{label}: failed")).red())),
            },
            TaskStatus::Rejected => {
                board.println(format!("{}", style(format!("{label}: declined")).yellow()));
            }
        }
    }

    let done = status.values().filter(|s| **s == TaskStatus::Completed).count();
    println!("{done}/{} transfers completed", status.len());
    node.shutdown().await;
    Ok(())
}

/// Ask a yes/no question on the terminal
async fn confirm(question: String) -> bool {
    let answer = tokio::task::spawn_blocking(move || {
        let term = Term::stderr();
        term.write_str(&format!("{question} [y/N] ")).ok()?;
        term.read_line().ok()
    })
    .await
    .ok()
    .flatten();

    answer.is_some_and(|a| matches!(a.trim().to_lowercase().as_str(), "y" | "yes"))
}

/// Wait for offers and receive files until Ctrl+C
async fn receive_files(output: Option<PathBuf>, yes: bool, config: &Config) -> anyhow::Result<()> {
    let dir = output.unwrap_or_else(|| config.transfer.download_dir.clone());
    std::fs::create_dir_all(&dir)?;

    let (node, mut events) = start_node(config, dir.clone())?;
    println!("Output directory: {}", dir.display());
    println!("Press Ctrl+C to stop");

    let board = ProgressBoard::new();
    let mut bars: HashMap<String, TransferProgress> = HashMap::new();

    loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(NodeEvent::LocalPeer(me)) => {
                board.println(format!(
                    "Visible as {} ({})",
                    style(&me.display_name).bold(),
                    me.device_label
                ));
            }
            Ok(NodeEvent::SignalingDisconnected) => {
                board.println(format!("{}", style("Signaling connection lost, retrying").yellow()));
            }
            Ok(NodeEvent::IncomingUpdated(transfer)) => {
                on_incoming(&node, &board, &mut bars, transfer, yes).await;
            }
            Ok(NodeEvent::IncomingRemoved(id)) => {
                if let Some(bar) = bars.remove(&id) {
                    bar.abandon_with_message("cancelled".to_string());
                }
            }
            Ok(_) | Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => break,
        }
    }

    println!("\nShutting down...");
    node.shutdown().await;
    Ok(())
}

async fn on_incoming(
    node: &Node,
    board: &ProgressBoard,
    bars: &mut HashMap<String, TransferProgress>,
    transfer: IncomingTransfer,
    yes: bool,
) {
    let sender = node
        .peers()
        .await
        .into_iter()
        .find(|p| p.id == transfer.sender)
        .map(|p| p.display_name)
        .unwrap_or_else(|| transfer.sender.to_string());

    match transfer.status {
        IncomingStatus::Pending => {
            board.println(format!(
                "{} offers {} files ({}):",
                style(&sender).bold(),
                transfer.files.len(),
                format_bytes(transfer.total_size)
            ));
            for file in &transfer.files {
                board.println(format!("  {} ({})", file.name, format_bytes(file.size)));
            }

            let accepted = yes || confirm("Accept?".to_string()).await;
            let result = if accepted {
                node.accept(&transfer.id).await
            } else {
                node.decline(&transfer.id).await
            };
            if let Err(e) = result {
                tracing::warn!("Could not answer offer from {}: {}", sender, e);
            }
        }
        IncomingStatus::Receiving => {
            let label = format!("from {sender}");
            bars.entry(transfer.id.clone())
                .or_insert_with(|| board.add(transfer.total_size, &label))
                .update_percent(transfer.progress());
        }
        IncomingStatus::Completed => {
            let bar = bars
                .remove(&transfer.id)
                .unwrap_or_else(|| board.add(transfer.total_size, &sender));
            bar.finish_with_message(format!("{} files from {sender}: done", transfer.files.len()));
        }
        IncomingStatus::Declined => {
            if let Some(bar) = bars.remove(&transfer.id) {
                bar.abandon_with_message(format!("from {sender}: failed"));
            }
        }
    }
}

/// Wait for the first roster after connecting
async fn first_roster(
    events: &mut broadcast::Receiver<NodeEvent>,
    wait: Duration,
) -> Option<Vec<Peer>> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Ok(NodeEvent::PeersChanged(peers))) => return Some(peers),
            Ok(Ok(_)) | Ok(Err(RecvError::Lagged(_))) => {}
            Ok(Err(RecvError::Closed)) | Err(_) => return None,
        }
    }
}

/// List peers
async fn list_peers(wait: Duration, config: &Config) -> anyhow::Result<()> {
    let (node, mut events) = start_node(config, config.transfer.download_dir.clone())?;
    let roster = first_roster(&mut events, wait).await;
    node.shutdown().await;

    let Some(peers) = roster else {
        anyhow::bail!(
            "No roster from {} within {}s",
            config.signaling.server_url,
            wait.as_secs()
        );
    };

    println!("Peers:");
    println!();
    if peers.is_empty() {
        println!("No other peers connected");
    }
    for peer in peers {
        println!(
            "  {:<24} {:<10} {}",
            style(&peer.display_name).bold(),
            peer.device_label,
            style(peer.id.as_str()).dim()
        );
    }
    Ok(())
}

/// Show node status
async fn show_status(config: &Config) -> anyhow::Result<()> {
    println!("LANBEAM Status");
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!();

    println!("Configuration:");
    println!("  Server: {}", config.signaling.server_url);
    println!(
        "  Device: {}",
        config
            .signaling
            .device_name
            .as_deref()
            .unwrap_or(lanbeam_core::device::device_label())
    );
    println!(
        "  Chunk size: {}",
        format_bytes(config.transfer.chunk_size as u64)
    );
    println!(
        "  Scheduler: {} transfers across {} peers",
        config.transfer.max_concurrent, config.transfer.max_active_peers
    );
    println!("  Downloads: {}", config.transfer.download_dir.display());
    println!();

    let (node, mut events) = start_node(config, config.transfer.download_dir.clone())?;
    let roster = first_roster(&mut events, Duration::from_secs(3)).await;

    println!("Connection:");
    match (node.local_peer().await, roster) {
        (Some(me), Some(peers)) => {
            println!("  {}", style("connected").green());
            println!("  Visible as: {} ({})", me.display_name, me.id);
            println!("  Other peers: {}", peers.len());
        }
        _ => println!("  {}", style("unreachable").red()),
    }

    node.shutdown().await;
    Ok(())
}
