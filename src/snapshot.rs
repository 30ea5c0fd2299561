use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use std::fs;
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::registry::{Entity, IdentityRegistry};
use crate::views::{self, Persistent, ViewError, WILDCARD_VIEW};

/// SnapshotError
///
/// A snapshot that exists but cannot be read is fatal for its entity type: the caller must abort
/// startup instead of continuing with an empty registry.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot io for {entity} at {path}: {source}")]
    Io {
        entity: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("snapshot of {entity} at {path} is not valid JSON: {source}")]
    Corrupt {
        entity: &'static str,
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("snapshot of {entity} could not be encoded: {source}")]
    Encode {
        entity: &'static str,
        #[source]
        source: ViewError,
    },
    #[error("snapshot of {entity} could not be decoded: {source}")]
    Decode {
        entity: &'static str,
        #[source]
        source: ViewError,
    },
}

/// SnapshotStore
///
/// Persists whole registries as gzip-compressed JSON, one file per entity type:
/// `<dir>/<entity>.json.gz` holding `{ "allocation": n, "values": [...] }` at the wildcard view.
///
/// *Atomicity*: `save` writes into a temporary file in the same directory, flushes it to disk and
/// renames it over the previous snapshot, so a crash mid-write leaves the old file intact.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for<E: Persistent>(&self) -> PathBuf {
        self.dir.join(format!("{}.json.gz", E::NAME))
    }

    /// save
    ///
    /// Encodes `registry` at the wildcard view and atomically replaces the snapshot for `E`.
    pub fn save<E: Persistent + Entity>(
        &self,
        registry: &IdentityRegistry<E>,
    ) -> Result<(), SnapshotError> {
        let path = self.path_for::<E>();
        let io_error = |source| SnapshotError::Io {
            entity: E::NAME,
            path: path.clone(),
            source,
        };

        let wire = views::encode_registry(registry, WILDCARD_VIEW).map_err(|source| {
            SnapshotError::Encode {
                entity: E::NAME,
                source,
            }
        })?;

        fs::create_dir_all(&self.dir).map_err(io_error)?;
        let temp = NamedTempFile::new_in(&self.dir).map_err(io_error)?;
        {
            let mut encoder = GzEncoder::new(BufWriter::new(temp.as_file()), Compression::default());
            serde_json::to_writer(&mut encoder, &wire).map_err(|e| io_error(e.into()))?;
            let mut writer = encoder.finish().map_err(io_error)?;
            writer.flush().map_err(io_error)?;
        }
        temp.as_file().sync_all().map_err(io_error)?;
        temp.persist(&path).map_err(|e| io_error(e.error))?;

        tracing::info!(
            entity = E::NAME,
            entries = registry.len(),
            allocation = registry.allocation(),
            path = %path.display(),
            "snapshot saved"
        );
        Ok(())
    }

    /// load
    ///
    /// Returns `Ok(None)` on first run, when no snapshot exists for `E`. A truncated, corrupt or
    /// inconsistent file is an error, never an empty registry.
    pub fn load<E: Persistent + Entity>(
        &self,
    ) -> Result<Option<IdentityRegistry<E>>, SnapshotError> {
        let path = self.path_for::<E>();
        let file = match fs::File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(entity = E::NAME, path = %path.display(), "no snapshot found");
                return Ok(None);
            }
            Err(source) => {
                return Err(SnapshotError::Io {
                    entity: E::NAME,
                    path,
                    source,
                });
            }
        };

        let mut raw = Vec::new();
        GzDecoder::new(file)
            .read_to_end(&mut raw)
            .map_err(|source| SnapshotError::Io {
                entity: E::NAME,
                path: path.clone(),
                source,
            })?;
        let wire = serde_json::from_slice(&raw).map_err(|source| SnapshotError::Corrupt {
            entity: E::NAME,
            path: path.clone(),
            source,
        })?;
        let registry =
            views::decode_registry(wire, WILDCARD_VIEW).map_err(|source| SnapshotError::Decode {
                entity: E::NAME,
                source,
            })?;

        tracing::info!(
            entity = E::NAME,
            entries = registry.len(),
            allocation = registry.allocation(),
            "snapshot loaded"
        );
        Ok(Some(registry))
    }
}
