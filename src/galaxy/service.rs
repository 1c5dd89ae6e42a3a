//! Entry point used by the CLI and the daemon: similarity queries plus the
//! galaxy cache/build API.

use std::sync::Arc;

use serde::Serialize;

use crate::galaxy::attributes::AttributeSource;
use crate::galaxy::builder::{BuildParams, GalaxyBuilder, GalaxyError};
use crate::galaxy::cache::{GalaxyCache, GalaxyCacheEntry};
use crate::galaxy::catalog::CatalogWriter;
use crate::galaxy::coordinator::{BuildCoordinator, BuildHandle};
use crate::galaxy::index::{AnnIndex, IndexError, Neighbor};
use crate::galaxy::progress::BuildReporter;
use crate::galaxy::store::{Fingerprint, VectorStore};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GalaxyStats {
    pub store: Fingerprint,
    pub dimensions: usize,
    pub ready: bool,
    pub indexed_items: Option<usize>,
    pub build_in_flight: Option<String>,
    pub builds_started: usize,
    pub cache_writes: usize,
}

pub struct GalaxyService {
    store: Arc<VectorStore>,
    coordinator: BuildCoordinator,
}

impl GalaxyService {
    pub fn new(
        store: Arc<VectorStore>,
        catalog: Arc<dyn CatalogWriter>,
        attributes: Arc<dyn AttributeSource>,
        cache: GalaxyCache,
        params: BuildParams,
    ) -> Self {
        let builder = GalaxyBuilder::new(store.clone(), catalog, attributes, cache, params);
        Self {
            store,
            coordinator: BuildCoordinator::new(Arc::new(builder)),
        }
    }

    pub fn store(&self) -> &Arc<VectorStore> {
        &self.store
    }

    fn builder(&self) -> &Arc<GalaxyBuilder> {
        self.coordinator.builder()
    }

    /// Whether an index exists and was built from the current store.
    pub fn is_ready(&self) -> bool {
        self.builder()
            .index()
            .current()
            .is_some_and(|index| index.fingerprint().matches(&self.store.fingerprint()))
    }

    /// Pin the current index for a consistent multi-step read.
    pub fn pinned_index(&self) -> Result<Arc<AnnIndex>, IndexError> {
        let index = self.builder().index().pin()?;
        if !index.fingerprint().matches(&self.store.fingerprint()) {
            return Err(IndexError::NotReady);
        }
        Ok(index)
    }

    pub fn query_with_distances(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>, GalaxyError> {
        Ok(self.pinned_index()?.query_with_distances(query, k)?)
    }

    /// Nearest neighbors of a stored item, excluding the item itself.
    pub fn neighbors_of(&self, item_id: &str, k: usize) -> Result<Vec<Neighbor>, GalaxyError> {
        let vector = self
            .store
            .get(item_id)
            .ok_or_else(|| GalaxyError::UnknownItem(item_id.to_string()))?;

        let index = self.pinned_index()?;
        let mut neighbors = index.query_with_distances(&vector, k.saturating_add(1))?;
        neighbors.retain(|n| n.item_id != item_id);
        neighbors.truncate(k);
        Ok(neighbors)
    }

    pub fn load_cached_galaxy_if_fresh(&self) -> Option<GalaxyCacheEntry> {
        self.builder().load_cached_galaxy_if_fresh()
    }

    /// Attach to or start a build and block until it settles.
    pub fn build_and_cache_galaxy(
        &self,
        reporter: Option<Arc<dyn BuildReporter>>,
    ) -> Result<Arc<GalaxyCacheEntry>, Arc<GalaxyError>> {
        self.request_build(reporter).map_err(Arc::new)?.wait()
    }

    /// Attach to or start a build without waiting.
    pub fn request_build(
        &self,
        reporter: Option<Arc<dyn BuildReporter>>,
    ) -> Result<BuildHandle, GalaxyError> {
        self.coordinator.request(reporter)
    }

    /// The in-flight build, if any.
    pub fn background_build(&self) -> Option<BuildHandle> {
        self.coordinator.in_flight()
    }

    pub fn refresh_index(&self) -> Result<Arc<AnnIndex>, GalaxyError> {
        self.builder().refresh_index()
    }

    /// Call after appending to the store. Cancels an in-flight build that is
    /// already working on an older snapshot.
    pub fn notify_store_changed(&self) -> bool {
        self.coordinator.supersede_stale(&self.store.fingerprint())
    }

    pub fn stats(&self) -> GalaxyStats {
        let builder = self.builder();
        GalaxyStats {
            store: self.store.fingerprint(),
            dimensions: self.store.dimensions(),
            ready: self.is_ready(),
            indexed_items: builder.index().current().map(|index| index.len()),
            build_in_flight: self.background_build().map(|h| h.id().to_string()),
            builds_started: builder.builds_started(),
            cache_writes: builder.cache_writes(),
        }
    }
}
