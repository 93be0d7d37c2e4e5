//! Client configuration: pipeline depth, peer connection cap, and listen
//! port, with `clap`-derived CLI defaults. Embedders of the engine as a
//! library can construct `ClientConfig` directly instead of going through
//! the CLI.

use clap::Args;

use crate::torrent::scheduler::{DEFAULT_PIPELINE_DEPTH, MAX_PEERS};

#[derive(Debug, Clone, Copy, Args)]
pub struct ClientConfig {
    /// Outstanding block requests allowed per peer at once (1-50).
    #[arg(long, default_value_t = DEFAULT_PIPELINE_DEPTH)]
    pub pipeline_depth: usize,

    /// Maximum number of simultaneous peer connections.
    #[arg(long, default_value_t = MAX_PEERS)]
    pub max_peers: usize,

    /// TCP port advertised to trackers and peers.
    #[arg(long, default_value_t = 6881)]
    pub listen_port: u16,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            pipeline_depth: DEFAULT_PIPELINE_DEPTH,
            max_peers: MAX_PEERS,
            listen_port: 6881,
        }
    }
}
