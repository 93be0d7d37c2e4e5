//! The top-level download orchestrator: loads a metainfo file, spins up a
//! `Scheduler` as a background task, and exposes progress/stop controls to
//! the CLI (or any embedder).

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::ClientConfig;
use crate::PEER_ID;

use super::metainfo::Metainfo;
use super::scheduler::{Scheduler, SchedulerConfig, SwarmStatus};
use super::writer::PieceWriter;

#[derive(Debug, Clone, Copy, Default)]
pub struct ProgressSnapshot {
    pub completed_pieces: usize,
    pub total_pieces: usize,
    pub bytes_complete: u64,
    pub bytes_total: u64,
    pub connected_peers: usize,
    pub download_rate_bps: u64,
    pub next_reannounce_in: Duration,
}

/// A running download. `progress()` is cheap and lock-free (backed by a
/// `watch` channel the scheduler task publishes to); `stop()` requests
/// graceful shutdown and waits for the scheduler's final `stopped` announce.
pub struct DownloadHandle {
    task: JoinHandle<anyhow::Result<()>>,
    status_rx: watch::Receiver<SwarmStatus>,
    progress_rx: watch::Receiver<super::inventory::Progress>,
    shutdown: watch::Sender<bool>,
}

impl DownloadHandle {
    pub fn progress(&self) -> ProgressSnapshot {
        let status = *self.status_rx.borrow();
        let progress = *self.progress_rx.borrow();
        ProgressSnapshot {
            completed_pieces: progress.complete_pieces,
            total_pieces: progress.total_pieces,
            bytes_complete: progress.bytes_complete,
            bytes_total: progress.bytes_total,
            connected_peers: status.connected_peers,
            download_rate_bps: status.download_rate_bps,
            next_reannounce_in: status.next_reannounce_in,
        }
    }

    /// Requests shutdown and waits for the scheduler task to finish its
    /// final tracker announce and exit.
    pub async fn stop(self) -> anyhow::Result<()> {
        let _ = self.shutdown.send(true);
        self.task.await?
    }

    pub async fn join(self) -> anyhow::Result<()> {
        self.task.await?
    }
}

pub struct Client {
    config: ClientConfig,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    /// Reads and validates the metainfo at `metainfo_path`, then starts
    /// downloading into `destination` on a background task.
    pub async fn download(&self, metainfo_path: &Path, destination: &Path) -> anyhow::Result<DownloadHandle> {
        let bytes = tokio::fs::read(metainfo_path).await?;
        let metainfo = Arc::new(Metainfo::from_bytes(&bytes)?);
        let writer = Arc::new(PieceWriter::new(&metainfo, destination)?);

        let scheduler_config = SchedulerConfig {
            max_peers: self.config.max_peers,
            pipeline_depth: self.config.pipeline_depth,
            listen_port: self.config.listen_port,
        };
        let (mut scheduler, status_rx) = Scheduler::new(metainfo, writer, *PEER_ID, scheduler_config);
        let progress_rx = scheduler.progress_watch();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move { scheduler.run_until(shutdown_rx).await });

        Ok(DownloadHandle {
            task,
            status_rx,
            progress_rx,
            shutdown: shutdown_tx,
        })
    }
}
