//! On-disk cache of the last built galaxy.
//!
//! File: `galaxy.json` in the base directory. The cache is trusted only when
//! its fingerprint matches the live store; a stale file is left in place and
//! overwritten by the next successful build.

use std::fs::File;
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::galaxy::attributes::DisplayAttributes;
use crate::galaxy::palette::PaletteEntry;
use crate::galaxy::store::Fingerprint;

pub const CACHE_FORMAT_VERSION: u32 = 1;

pub const CACHE_FILE_NAME: &str = "galaxy.json";

/// One item placed in the galaxy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphNode {
    pub item_id: String,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub cluster_index: u16,
    #[serde(flatten)]
    pub display: DisplayAttributes,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GalaxyCacheEntry {
    pub version: u32,
    pub nodes: Vec<GraphNode>,
    pub palette: Vec<PaletteEntry>,
    pub fingerprint: Fingerprint,
    pub built_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid cache file: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unsupported cache version {0}, supported version {CACHE_FORMAT_VERSION}")]
    UnsupportedVersion(u32),

    #[error("Failed to persist cache to {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: Box<CacheError>,
    },
}

/// Only the version, read before committing to the full layout.
#[derive(Deserialize)]
struct VersionProbe {
    version: u32,
}

pub struct GalaxyCache {
    path: PathBuf,
}

impl GalaxyCache {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Cache file inside `base_dir`.
    pub fn in_dir(base_dir: &Path) -> Self {
        Self::new(base_dir.join(CACHE_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the cache regardless of freshness. `Ok(None)` when there is no file.
    pub fn load(&self) -> Result<Option<GalaxyCacheEntry>, CacheError> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let probe: VersionProbe = serde_json::from_str(&text)?;
        if probe.version != CACHE_FORMAT_VERSION {
            return Err(CacheError::UnsupportedVersion(probe.version));
        }

        Ok(Some(serde_json::from_str(&text)?))
    }

    /// The cached entry if it was built for exactly the `live` store.
    ///
    /// Missing, unreadable and stale caches all yield `None`.
    pub fn load_if_fresh(&self, live: &Fingerprint) -> Option<GalaxyCacheEntry> {
        let entry = match self.load() {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                log::info!("No galaxy cache at {}", self.path.display());
                return None;
            }
            Err(err) => {
                log::warn!("Ignoring galaxy cache at {}: {}", self.path.display(), err);
                return None;
            }
        };

        if !entry.fingerprint.matches(live) {
            log::info!(
                "Galaxy cache is stale (cached {} items, store has {})",
                entry.fingerprint.count,
                live.count
            );
            return None;
        }

        log::info!(
            "Using galaxy cache built at {} ({} nodes)",
            entry.built_at,
            entry.nodes.len()
        );
        Some(entry)
    }

    /// Overwrite the cache atomically: temp file, fsync, rename.
    pub fn save(&self, entry: &GalaxyCacheEntry) -> Result<(), CacheError> {
        let temp_path = self.path.with_extension("json-tmp");

        let result = write_to_file(&temp_path, entry).and_then(|()| {
            std::fs::rename(&temp_path, &self.path)?;
            Ok(())
        });

        if let Err(err) = result {
            let _ = std::fs::remove_file(&temp_path);
            return Err(CacheError::Persist {
                path: self.path.clone(),
                source: Box::new(err),
            });
        }

        Ok(())
    }
}

fn write_to_file(path: &Path, entry: &GalaxyCacheEntry) -> Result<(), CacheError> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer(&mut writer, entry)?;
    writer.flush()?;

    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    Ok(())
}
