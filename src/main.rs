use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use tracing::info;

use torrent::metainfo::Metainfo;
use torrent::peer::PeerId;
use torrent::tracker::{AnnounceRequest, Event as TrackerEvent, TrackerClient};

pub mod bencode;
pub mod cli;
pub mod config;
pub mod torrent;
pub mod utils;

pub const PROTOCOL: &str = "BitTorrent protocol";
pub static PEER_ID: Lazy<PeerId> = Lazy::new(utils::generate_peer_id);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = cli::Args::parse();

    match args.command {
        cli::Command::Info { path } => {
            info!(path = %path.display(), "reading torrent metainfo");
            let bytes = std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
            let meta = Metainfo::from_bytes(&bytes)?;
            println!("Tracker URL: {}", meta.announce);
            println!("Length: {}", meta.total_length());
            println!("Info Hash: {}", hex::encode(meta.info_hash));
            println!("Piece Length: {}", meta.piece_length);
            println!("Piece Hashes:");
            for i in 0..meta.piece_count() {
                println!("{}", hex::encode(meta.piece_hash(i).unwrap()));
            }
        }
        cli::Command::Peers { path } => {
            let bytes = std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
            let meta = Metainfo::from_bytes(&bytes)?;
            let mut tracker = TrackerClient::new(meta.tracker_tiers());
            let req = AnnounceRequest {
                info_hash: &meta.info_hash,
                peer_id: &PEER_ID,
                port: 6881,
                uploaded: 0,
                downloaded: 0,
                left: meta.total_length(),
                event: TrackerEvent::Started,
            };
            let response = tracker.announce(&req).await?;
            for peer in response.peers {
                println!("{}", peer);
            }
        }
        cli::Command::Download { path, output, config } => {
            let client = torrent::client::Client::new(config);
            let handle = client.download(&path, &output).await?;
            handle.join().await?;
            info!("download finished");
        }
    }

    Ok(())
}
