use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::ClientConfig;

#[derive(Parser, Debug)]
#[command(author, version, about = "A BitTorrent download client")]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands for the bittorrent client implementation
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print a torrent file's metainfo: announce URL(s), info hash, piece
    /// length, and file layout.
    Info {
        /// Path to the .torrent file
        path: PathBuf,
    },
    /// Announce to the tracker and print the peers it returns.
    Peers {
        /// Path to the .torrent file
        path: PathBuf,
    },
    /// Download a torrent's content to a destination directory.
    Download {
        /// Path to the .torrent file
        path: PathBuf,
        /// Directory to write the downloaded file(s) into
        #[arg(short, long)]
        output: PathBuf,
        #[command(flatten)]
        config: ClientConfig,
    },
}

impl Args {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }
}
