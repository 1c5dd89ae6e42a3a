//! Append-only in-memory store of catalog embeddings.
//!
//! The store is written by the catalog embedding pipeline and read by the
//! layout reducer and the index builder. Readers take a [`StoreSnapshot`],
//! which shares vector storage with the store through `Arc`, so a snapshot
//! never blocks later appends for longer than a `Vec` clone.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Errors that can occur when appending to the store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Item {0:?} is already in the store")]
    DuplicateItem(String),

    #[error("Item id must not be empty")]
    EmptyItemId,

    #[error("Vector must not be empty")]
    EmptyVector,
}

/// One embedded catalog item.
#[derive(Debug, Clone)]
pub struct StoreEntry {
    pub item_id: Arc<str>,
    pub vector: Arc<[f32]>,
}

/// Cheap summary of a store used to decide whether derived data is stale.
///
/// `id_digest` is an order-independent digest of the id set, so two stores
/// holding the same ids in a different insertion order agree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fingerprint {
    pub count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_digest: Option<String>,
}

impl Fingerprint {
    /// Whether data built for `self` is still valid for the `live` store.
    ///
    /// Counts must agree. Digests are compared only when both sides carry one.
    pub fn matches(&self, live: &Fingerprint) -> bool {
        if self.count != live.count {
            return false;
        }
        match (&self.id_digest, &live.id_digest) {
            (Some(cached), Some(live)) => cached == live,
            _ => true,
        }
    }
}

/// Running digest over a set of ids. Each id contributes the first 16 bytes
/// of its SHA256, combined with wrapping addition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct IdDigest(u128);

impl IdDigest {
    fn add(&mut self, item_id: &str) {
        let hash = Sha256::digest(item_id.as_bytes());
        let mut head = [0u8; 16];
        head.copy_from_slice(&hash[..16]);
        self.0 = self.0.wrapping_add(u128::from_le_bytes(head));
    }

    fn to_hex(self) -> String {
        format!("{:032x}", self.0)
    }
}

#[derive(Default)]
struct StoreInner {
    entries: Vec<StoreEntry>,
    positions: HashMap<Arc<str>, usize>,
    digest: IdDigest,
}

/// In-memory mapping of item id to embedding vector.
///
/// All vectors share one dimensionality. A store created with 0 dimensions
/// takes the length of its first inserted vector. Items can be added but
/// never replaced or removed.
pub struct VectorStore {
    /// 0 while unset; only changes under the write lock.
    dimensions: AtomicUsize,
    inner: RwLock<StoreInner>,
}

impl VectorStore {
    /// Create an empty store for vectors of the given length, or 0 to let
    /// the first insert decide.
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: AtomicUsize::new(dimensions),
            inner: RwLock::new(StoreInner::default()),
        }
    }

    /// Get the expected vector length, 0 if not known yet.
    pub fn dimensions(&self) -> usize {
        self.dimensions.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().entries.is_empty()
    }

    pub fn contains(&self, item_id: &str) -> bool {
        self.read().positions.contains_key(item_id)
    }

    /// Get the vector stored for an item.
    pub fn get(&self, item_id: &str) -> Option<Arc<[f32]>> {
        let inner = self.read();
        inner
            .positions
            .get(item_id)
            .map(|&pos| inner.entries[pos].vector.clone())
    }

    /// Append one item.
    pub fn insert(&self, item_id: impl Into<String>, vector: Vec<f32>) -> Result<(), StoreError> {
        let item_id = item_id.into();
        if item_id.is_empty() {
            return Err(StoreError::EmptyItemId);
        }
        if vector.is_empty() {
            return Err(StoreError::EmptyVector);
        }

        let mut inner = self.write();
        let dimensions = self.dimensions();
        if dimensions == 0 && inner.entries.is_empty() {
            self.dimensions.store(vector.len(), Ordering::SeqCst);
        } else if vector.len() != dimensions {
            return Err(StoreError::DimensionMismatch {
                expected: dimensions,
                got: vector.len(),
            });
        }
        if inner.positions.contains_key(item_id.as_str()) {
            return Err(StoreError::DuplicateItem(item_id));
        }

        let item_id: Arc<str> = Arc::from(item_id);
        let position = inner.entries.len();
        inner.digest.add(&item_id);
        inner.positions.insert(item_id.clone(), position);
        inner.entries.push(StoreEntry {
            item_id,
            vector: Arc::from(vector),
        });

        Ok(())
    }

    /// Append many items, stopping at the first rejected one.
    ///
    /// Returns the number of items inserted.
    pub fn extend<I>(&self, items: I) -> Result<usize, StoreError>
    where
        I: IntoIterator<Item = (String, Vec<f32>)>,
    {
        let mut inserted = 0;
        for (item_id, vector) in items {
            self.insert(item_id, vector)?;
            inserted += 1;
        }
        Ok(inserted)
    }

    /// Current fingerprint. O(1): the digest is maintained on insert.
    pub fn fingerprint(&self) -> Fingerprint {
        let inner = self.read();
        Fingerprint {
            count: inner.entries.len() as u32,
            id_digest: Some(inner.digest.to_hex()),
        }
    }

    /// Take a consistent snapshot of every entry, in insertion order.
    pub fn snapshot(&self) -> StoreSnapshot {
        let inner = self.read();
        StoreSnapshot {
            dimensions: self.dimensions(),
            entries: inner.entries.clone(),
            fingerprint: Fingerprint {
                count: inner.entries.len() as u32,
                id_digest: Some(inner.digest.to_hex()),
            },
        }
    }

    // Entries are immutable once pushed, so a poisoned lock still guards
    // consistent data.
    fn read(&self) -> RwLockReadGuard<'_, StoreInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// Immutable view of a store at one point in time.
#[derive(Debug, Clone)]
pub struct StoreSnapshot {
    dimensions: usize,
    entries: Vec<StoreEntry>,
    fingerprint: Fingerprint,
}

impl StoreSnapshot {
    /// Build a snapshot from raw entries without validating them.
    ///
    /// Consumers (index build, layout reduction) check vector lengths
    /// against `dimensions` themselves.
    #[cfg(test)]
    pub fn from_entries(dimensions: usize, entries: Vec<(String, Vec<f32>)>) -> Self {
        let mut digest = IdDigest::default();
        let entries: Vec<StoreEntry> = entries
            .into_iter()
            .map(|(item_id, vector)| {
                digest.add(&item_id);
                StoreEntry {
                    item_id: Arc::from(item_id),
                    vector: Arc::from(vector),
                }
            })
            .collect();

        Self {
            dimensions,
            fingerprint: Fingerprint {
                count: entries.len() as u32,
                id_digest: Some(digest.to_hex()),
            },
            entries,
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[StoreEntry] {
        &self.entries
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }
}
