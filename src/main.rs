//! Reference CLI consumer of the `torrent` engine crate. Thin by design:
//! no TUI, no daemon — it prints the engine's event stream as plain lines
//! and exits when the download/seed session ends or the user hits ctrl-c.

mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use torrent::callbacks::{ChannelSink, EngineEvent};
use torrent::metainfo::Metadata;
use torrent::Engine;

#[derive(Parser)]
#[clap(version, about = "A BitTorrent client engine reference CLI")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Prints a `.torrent` file's metadata without downloading anything.
    Info {
        /// Path to the `.torrent` file.
        path: PathBuf,
    },
    /// Downloads (and then seeds) a `.torrent` file's contents.
    Download {
        /// Path to the `.torrent` file.
        torrent: PathBuf,

        /// Directory to write downloaded data into. Defaults to the
        /// current directory.
        #[clap(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Engine(#[from] torrent::error::Error),
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Info { path } => print_info(&path),
        Command::Download { torrent, output } => run_download(&torrent, output).await,
    }
}

fn print_info(path: &PathBuf) -> Result<(), CliError> {
    let bytes = std::fs::read(path)?;
    let metadata = Metadata::parse(&bytes)?;
    println!("name: {}", metadata.name);
    println!("info hash: {}", metadata.info_hash_hex());
    println!("total length: {} bytes", metadata.total_length);
    println!("piece count: {}", metadata.piece_count());
    println!("trackers:");
    for tracker in &metadata.trackers {
        println!("  {tracker}");
    }
    println!("files:");
    for file in &metadata.files {
        println!("  {} ({} bytes)", file.path.display(), file.length);
    }
    Ok(())
}

async fn run_download(torrent_path: &PathBuf, output: Option<PathBuf>) -> Result<(), CliError> {
    let engine_config = config::load()?;
    let bytes = std::fs::read(torrent_path)?;
    let output_dir = output.unwrap_or_else(|| PathBuf::from("."));

    let (sink, mut events) = ChannelSink::new();
    let engine = Engine::new(engine_config, Arc::new(sink));
    let info_hash = engine.add_torrent(&bytes, &output_dir).await?;

    println!("downloading {} into {}", hex::encode(info_hash), output_dir.display());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("shutting down");
                engine.shutdown(Duration::from_secs(5)).await;
                break;
            }
            event = events.recv() => {
                match event {
                    Some(event) => print_event(event),
                    None => break,
                }
            }
        }
    }
    Ok(())
}

fn print_event(event: EngineEvent) {
    match event {
        EngineEvent::StateChanged { info_hash, state } => {
            println!("[{}] state -> {state:?}", hex::encode(info_hash));
        }
        EngineEvent::PieceVerified { info_hash, index } => {
            println!("[{}] piece {index} verified", hex::encode(info_hash));
        }
        EngineEvent::PieceFailed { info_hash, index } => {
            println!("[{}] piece {index} failed verification", hex::encode(info_hash));
        }
        EngineEvent::PeerConnected { info_hash, addr } => {
            println!("[{}] peer connected: {addr}", hex::encode(info_hash));
        }
        EngineEvent::PeerDisconnected { info_hash, addr } => {
            println!("[{}] peer disconnected: {addr}", hex::encode(info_hash));
        }
        EngineEvent::Progress { info_hash, bytes_downloaded, bytes_uploaded, download_rate, upload_rate } => {
            println!(
                "[{}] {bytes_downloaded} down / {bytes_uploaded} up ({download_rate} B/s down, {upload_rate} B/s up)",
                hex::encode(info_hash)
            );
        }
        EngineEvent::DownloadComplete { info_hash } => {
            println!("[{}] download complete, seeding", hex::encode(info_hash));
        }
        EngineEvent::Error { info_hash, message } => {
            eprintln!("[{}] error: {message}", hex::encode(info_hash));
        }
    }
}
