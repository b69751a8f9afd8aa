//! The stored-payload convention: job file content lives in the durable
//! store gzip-compressed, and is materialized to a working directory only
//! for the duration of one execution.

use std::{
    io::{Read, Write},
    path::{Path, PathBuf},
};

use flate2::{read::GzDecoder, write::GzEncoder, Compression};

use crate::errors::Result;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Whether the bytes already carry the gzip magic.
pub fn is_compressed(bytes: &[u8]) -> bool {
    bytes.starts_with(&GZIP_MAGIC)
}

/// gzip-compress the bytes.
pub fn compress(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    Ok(encoder.finish()?)
}

/// Decompress gzip bytes back to the original content.
pub fn decompress(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

/// Compress the bytes unless they already are; uploads may arrive either
/// way and the store keeps exactly one form.
pub fn ensure_compressed(bytes: &[u8]) -> Result<Vec<u8>> {
    if is_compressed(bytes) {
        Ok(bytes.to_vec())
    } else {
        compress(bytes)
    }
}

/// A job payload decompressed to its working path for the duration of one
/// execution. [StagedPayload::remove] is the normal cleanup; the drop
/// guard catches early-return paths.
#[derive(Debug)]
pub struct StagedPayload {
    path: Option<PathBuf>,
}

impl StagedPayload {
    /// Decompress `compressed` into `<dir>/<file_name>` and hand back a
    /// guard for the working copy.
    pub async fn stage(dir: &Path, file_name: &str, compressed: &[u8]) -> Result<Self> {
        let content = decompress(compressed)?;
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(file_name);
        tokio::fs::write(&path, content).await?;
        Ok(Self { path: Some(path) })
    }

    /// The working copy's location.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Read the staged gcode back as text.
    pub async fn read_to_string(&self) -> Result<String> {
        match &self.path {
            Some(path) => Ok(tokio::fs::read_to_string(path).await?),
            None => Ok(String::new()),
        }
    }

    /// Remove the working copy now.
    pub async fn remove(mut self) -> Result<()> {
        if let Some(path) = self.path.take() {
            tokio::fs::remove_file(path).await?;
        }
        Ok(())
    }
}

impl Drop for StagedPayload {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            tokio::spawn(async move {
                tracing::trace!(path = format!("{:?}", path), "removing dropped working copy");
                let _ = tokio::fs::remove_file(path).await;
            });
        }
    }
}
