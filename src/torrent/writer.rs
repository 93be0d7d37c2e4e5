//! Writes verified piece bytes to disk. One `tokio::sync::Mutex` per
//! destination file serializes writes that span it (a piece can straddle
//! several files in a multi-file torrent), while hashing and the actual
//! `pwrite` happen on a blocking thread via `spawn_blocking`.

use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use super::metainfo::{FileLayout, Metainfo};

#[derive(Debug, Error)]
pub enum WriterError {
    #[error("failed to write to {path}: {cause}")]
    IoFailure { path: PathBuf, cause: String },
}

const MAX_WRITE_RETRIES: u32 = 3;

struct TorrentFile {
    path: PathBuf,
    mutex: Mutex<()>,
}

/// Writes completed, hash-verified pieces into the destination directory
/// tree, using the `.part` working-file convention: each destination file is
/// created as `<name>.part` and atomically renamed once every byte of it has
/// been written.
pub struct PieceWriter {
    files: Vec<Arc<TorrentFile>>,
    destination: PathBuf,
}

impl PieceWriter {
    pub fn new(metainfo: &Metainfo, destination: impl Into<PathBuf>) -> std::io::Result<Self> {
        let destination = destination.into();
        std::fs::create_dir_all(&destination)?;

        let files = match &metainfo.layout {
            FileLayout::Single { name, .. } => vec![Arc::new(TorrentFile {
                path: destination.join(name),
                mutex: Mutex::new(()),
            })],
            FileLayout::Multi { dir_name, files } => {
                let root = destination.join(dir_name);
                std::fs::create_dir_all(&root)?;
                files
                    .iter()
                    .map(|f| {
                        let path = root.join(f.path.iter().collect::<PathBuf>());
                        if let Some(parent) = path.parent() {
                            std::fs::create_dir_all(parent)?;
                        }
                        Ok(Arc::new(TorrentFile {
                            path,
                            mutex: Mutex::new(()),
                        }))
                    })
                    .collect::<std::io::Result<Vec<_>>>()?
            }
        };

        Ok(Self { files, destination })
    }

    /// Writes one completed piece's bytes to every file segment it maps to,
    /// per `Metainfo::locate`. Retries transient IO failures up to
    /// `MAX_WRITE_RETRIES` times before surfacing an error.
    pub async fn write_piece(&self, metainfo: &Metainfo, piece_index: usize, bytes: Vec<u8>) -> Result<(), WriterError> {
        let writes = metainfo.locate(piece_index, 0, bytes.len() as u32);
        for write in writes {
            let file = self.files[write.file_index].clone();
            let source_range = piece_offset_for(metainfo, piece_index, write.file_index, write.file_offset);
            self.write_segment(&file, write.file_offset, &bytes, source_range).await?;
        }
        Ok(())
    }

    async fn write_segment(
        &self,
        file: &Arc<TorrentFile>,
        file_offset: u64,
        piece_bytes: &[u8],
        source_range: (usize, usize),
    ) -> Result<(), WriterError> {
        let _guard = file.mutex.lock().await;
        let path = working_path(&file.path);
        let data = piece_bytes[source_range.0..source_range.1].to_vec();

        let mut attempt = 0;
        loop {
            attempt += 1;
            let path = path.clone();
            let data = data.clone();
            let result = tokio::task::spawn_blocking(move || write_at(&path, file_offset, &data))
                .await
                .expect("blocking write task panicked");
            match result {
                Ok(()) => break,
                Err(err) if attempt < MAX_WRITE_RETRIES => {
                    debug!(attempt, error = %err, "retrying piece write");
                    continue;
                }
                Err(err) => {
                    return Err(WriterError::IoFailure {
                        path: file.path.clone(),
                        cause: err.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Renames every file's `.part` working copy to its final name. Called
    /// once the torrent has every piece.
    pub async fn finalize(&self) -> Result<(), WriterError> {
        for file in &self.files {
            let _guard = file.mutex.lock().await;
            let part = working_path(&file.path);
            if part.exists() {
                std::fs::rename(&part, &file.path).map_err(|e| WriterError::IoFailure {
                    path: file.path.clone(),
                    cause: e.to_string(),
                })?;
            }
        }
        Ok(())
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }
}

fn working_path(final_path: &Path) -> PathBuf {
    let mut os = final_path.as_os_str().to_owned();
    os.push(".part");
    PathBuf::from(os)
}

fn write_at(path: &Path, offset: u64, data: &[u8]) -> std::io::Result<()> {
    let mut file = std::fs::OpenOptions::new().create(true).write(true).open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(data)?;
    Ok(())
}

/// Recomputes which byte range of the piece buffer corresponds to a given
/// file-write segment, by replaying `locate` over the same piece length.
fn piece_offset_for(metainfo: &Metainfo, piece_index: usize, file_index: usize, file_offset: u64) -> (usize, usize) {
    let writes = metainfo.locate(piece_index, 0, metainfo.piece_length_at(piece_index) as u32);
    let mut cursor = 0usize;
    for w in writes {
        let len = w.length as usize;
        if w.file_index == file_index && w.file_offset == file_offset {
            return (cursor, cursor + len);
        }
        cursor += len;
    }
    (0, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::metainfo::FileEntry;

    fn single_file_metainfo(piece_length: u64, total: u64, pieces: Vec<[u8; 20]>) -> Metainfo {
        Metainfo {
            announce: "http://tr".into(),
            announce_list: vec![],
            comment: None,
            info_hash: [0; 20],
            piece_length,
            pieces,
            layout: FileLayout::Single {
                name: "payload.bin".into(),
                length: total,
            },
        }
    }

    #[tokio::test]
    async fn writes_single_file_piece_and_finalizes() {
        let dir = tempfile::tempdir().unwrap();
        let data = vec![42u8; 16];
        let meta = single_file_metainfo(16, 16, vec![[0; 20]]);
        let writer = PieceWriter::new(&meta, dir.path()).unwrap();

        writer.write_piece(&meta, 0, data.clone()).await.unwrap();
        writer.finalize().await.unwrap();

        let out = std::fs::read(dir.path().join("payload.bin")).unwrap();
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn writes_multi_file_piece_spanning_two_files() {
        let dir = tempfile::tempdir().unwrap();
        let files = vec![
            FileEntry { path: vec!["a.bin".into()], length: 8, start_offset: 0 },
            FileEntry { path: vec!["b.bin".into()], length: 8, start_offset: 8 },
        ];
        let meta = Metainfo {
            announce: "http://tr".into(),
            announce_list: vec![],
            comment: None,
            info_hash: [0; 20],
            piece_length: 16,
            pieces: vec![[0; 20]],
            layout: FileLayout::Multi { dir_name: "torrent".into(), files },
        };
        let writer = PieceWriter::new(&meta, dir.path()).unwrap();
        let data: Vec<u8> = (0..16u8).collect();

        writer.write_piece(&meta, 0, data.clone()).await.unwrap();
        writer.finalize().await.unwrap();

        let a = std::fs::read(dir.path().join("torrent").join("a.bin")).unwrap();
        let b = std::fs::read(dir.path().join("torrent").join("b.bin")).unwrap();
        assert_eq!(a, &data[0..8]);
        assert_eq!(b, &data[8..16]);
    }
}
