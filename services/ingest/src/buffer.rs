//! Local buffer for uploaded images.
//!
//! Each upload is streamed into `<dir>/<uuid>.jpg` chunk by chunk and synced
//! to disk before anything downstream is told about it.

use roadscan_pipeline::storage_key_for;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

/// Errors raised while buffering an image
#[derive(Error, Debug)]
pub enum BufferError {
    #[error("Image exceeds the {limit} byte upload limit")]
    TooLarge { limit: u64 },

    #[error("Buffer I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A fully written and synced image
#[derive(Debug, Clone)]
pub struct BufferedImage {
    pub id: Uuid,
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// Directory that holds uploaded images until they are shipped to object storage
#[derive(Debug, Clone)]
pub struct ImageBuffer {
    dir: PathBuf,
    max_bytes: u64,
}

impl ImageBuffer {
    pub fn new(dir: impl Into<PathBuf>, max_bytes: u64) -> Self {
        Self {
            dir: dir.into(),
            max_bytes,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the buffer directory if it does not exist yet
    pub async fn ensure_dir(&self) -> Result<(), BufferError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| BufferError::Io {
                path: self.dir.clone(),
                source,
            })
    }

    /// Path an image with this identifier is buffered at
    pub fn path_for(&self, id: Uuid) -> PathBuf {
        self.dir.join(storage_key_for(id))
    }

    /// Open a new image file for writing
    pub async fn create(&self, id: Uuid) -> Result<BufferWriter, BufferError> {
        let path = self.path_for(id);
        let file = File::create(&path)
            .await
            .map_err(|source| BufferError::Io {
                path: path.clone(),
                source,
            })?;

        debug!(path = %path.display(), "Buffering image");

        Ok(BufferWriter {
            id,
            file,
            path,
            written: 0,
            limit: self.max_bytes,
        })
    }

    /// Remove a buffered image; a missing file is not an error
    pub async fn discard(&self, id: Uuid) {
        let path = self.path_for(id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!(path = %path.display(), "Discarded buffered image"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to discard buffered image"),
        }
    }
}

/// Streaming writer for one buffered image
pub struct BufferWriter {
    id: Uuid,
    file: File,
    path: PathBuf,
    written: u64,
    limit: u64,
}

impl BufferWriter {
    /// Append a chunk, enforcing the size limit
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), BufferError> {
        let next = self.written + chunk.len() as u64;
        if next > self.limit {
            return Err(BufferError::TooLarge { limit: self.limit });
        }

        self.file
            .write_all(chunk)
            .await
            .map_err(|source| BufferError::Io {
                path: self.path.clone(),
                source,
            })?;
        self.written = next;
        Ok(())
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// Flush and fsync the file
    pub async fn finish(mut self) -> Result<BufferedImage, BufferError> {
        let path = self.path.clone();
        let io_err = |source| BufferError::Io {
            path: path.clone(),
            source,
        };

        self.file.flush().await.map_err(io_err)?;
        self.file.sync_all().await.map_err(io_err)?;

        Ok(BufferedImage {
            id: self.id,
            path: self.path,
            size_bytes: self.written,
        })
    }
}
