//! Galaxy build pipeline: gather, reduce, assign clusters, build the index,
//! persist.
//!
//! A build never reads the store while the catalog writer is running. It
//! subscribes to the writer and blocks until the next idle transition.
//!
//! The new index is installed only after every compute stage succeeded, and
//! the cache written by the same run describes the same snapshot, so the two
//! are always ready together.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Instant;

use chrono::Utc;

use crate::galaxy::attributes::AttributeSource;
use crate::galaxy::cache::{GalaxyCache, GalaxyCacheEntry, GraphNode, CACHE_FORMAT_VERSION};
use crate::galaxy::catalog::CatalogWriter;
use crate::galaxy::index::{AnnIndex, IndexError, IndexParams, IndexSlot};
use crate::galaxy::palette;
use crate::galaxy::progress::{BuildStage, Progress, StepStatus};
use crate::galaxy::reducer::{self, LayoutParams};
use crate::galaxy::store::{Fingerprint, StoreError, StoreSnapshot, VectorStore};

/// Errors that can occur while building or querying the galaxy.
#[derive(Debug, thiserror::Error)]
pub enum GalaxyError {
    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Build was superseded by a newer store snapshot")]
    Superseded,

    #[error("Build worker panicked: {0}")]
    WorkerPanicked(String),

    #[error("Unknown item {0:?}")]
    UnknownItem(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Clone, Default)]
pub struct BuildParams {
    pub index: IndexParams,
    pub layout: LayoutParams,
}

/// Shared between a running build and whoever may want to stop it.
#[derive(Default)]
pub struct BuildControl {
    cancelled: AtomicBool,
    snapshot: Mutex<Option<Fingerprint>>,
}

impl BuildControl {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Fingerprint of the snapshot the build is working on, once gathered.
    pub fn snapshot(&self) -> Option<Fingerprint> {
        self.snapshot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_snapshot(&self, fingerprint: Fingerprint) {
        *self.snapshot.lock().unwrap_or_else(|e| e.into_inner()) = Some(fingerprint);
    }

    fn check(&self) -> Result<(), GalaxyError> {
        if self.is_cancelled() {
            Err(GalaxyError::Superseded)
        } else {
            Ok(())
        }
    }
}

pub struct GalaxyBuilder {
    store: Arc<VectorStore>,
    catalog: Arc<dyn CatalogWriter>,
    attributes: Arc<dyn AttributeSource>,
    cache: GalaxyCache,
    index: Arc<IndexSlot>,
    params: BuildParams,
    /// Serializes runs, so a cancelled build finishes before its
    /// replacement touches the store.
    run: Mutex<()>,
    builds_started: AtomicUsize,
    cache_writes: AtomicUsize,
}

impl GalaxyBuilder {
    pub fn new(
        store: Arc<VectorStore>,
        catalog: Arc<dyn CatalogWriter>,
        attributes: Arc<dyn AttributeSource>,
        cache: GalaxyCache,
        params: BuildParams,
    ) -> Self {
        Self {
            store,
            catalog,
            attributes,
            cache,
            index: Arc::new(IndexSlot::new()),
            params,
            run: Mutex::new(()),
            builds_started: AtomicUsize::new(0),
            cache_writes: AtomicUsize::new(0),
        }
    }

    pub fn store(&self) -> &Arc<VectorStore> {
        &self.store
    }

    pub fn index(&self) -> &Arc<IndexSlot> {
        &self.index
    }

    pub fn cache(&self) -> &GalaxyCache {
        &self.cache
    }

    /// Number of runs that reached the pipeline.
    pub fn builds_started(&self) -> usize {
        self.builds_started.load(Ordering::SeqCst)
    }

    /// Number of successful cache writes.
    pub fn cache_writes(&self) -> usize {
        self.cache_writes.load(Ordering::SeqCst)
    }

    pub fn load_cached_galaxy_if_fresh(&self) -> Option<GalaxyCacheEntry> {
        self.cache.load_if_fresh(&self.store.fingerprint())
    }

    /// Rebuild only the index from the current store, e.g. after loading a
    /// fresh cache at startup.
    pub fn refresh_index(&self) -> Result<Arc<AnnIndex>, GalaxyError> {
        let snapshot = self.store.snapshot();
        let index = Arc::new(AnnIndex::build(&snapshot, &self.params.index)?);
        self.index.install(index.clone());
        Ok(index)
    }

    /// Run the whole pipeline. Blocking; call it from a worker thread.
    pub fn build(
        &self,
        progress: &Progress,
        control: &BuildControl,
    ) -> Result<GalaxyCacheEntry, GalaxyError> {
        progress.pending_all();

        let _run = self.run.lock().unwrap_or_else(|e| e.into_inner());

        if let Err(err) = self.wait_for_idle_writer(progress, control) {
            fail_from(progress, BuildStage::GatherVectors, &err);
            return Err(err);
        }

        self.builds_started.fetch_add(1, Ordering::SeqCst);
        let started = Instant::now();

        let snapshot = stage(progress, BuildStage::GatherVectors, || {
            let snapshot = self.store.snapshot();
            control.set_snapshot(snapshot.fingerprint().clone());
            let detail = format!("{} vectors", snapshot.len());
            Ok((snapshot, detail))
        })?;

        let layout = checked_stage(progress, control, BuildStage::ReduceTo3d, || {
            let layout = reducer::reduce(&snapshot, &self.params.layout)?;
            let [first, second, third] = layout.variance();
            let detail = format!(
                "{} points, variance {:.3}/{:.3}/{:.3}",
                layout.len(),
                first,
                second,
                third
            );
            Ok((layout, detail))
        })?;

        let nodes = checked_stage(progress, control, BuildStage::AssignClusters, || {
            let nodes = self.assign_nodes(&snapshot, &layout);
            let clusters = count_clusters(&nodes);
            Ok((nodes, format!("{} clusters", clusters)))
        })?;

        let index = checked_stage(progress, control, BuildStage::BuildIndex, || {
            let index = AnnIndex::build(&snapshot, &self.params.index)?;
            let detail = format!("{} buckets", index.bucket_count());
            Ok((index, detail))
        })?;

        if let Err(err) = control.check() {
            fail_from(progress, BuildStage::PersistCache, &err);
            return Err(err);
        }
        self.index.install(Arc::new(index));

        let entry = GalaxyCacheEntry {
            version: CACHE_FORMAT_VERSION,
            nodes,
            palette: palette::assignment(),
            fingerprint: snapshot.fingerprint().clone(),
            built_at: Utc::now(),
        };

        progress.running(BuildStage::PersistCache);
        match self.cache.save(&entry) {
            Ok(()) => {
                self.cache_writes.fetch_add(1, Ordering::SeqCst);
                progress.done(BuildStage::PersistCache, None);
            }
            Err(err) => {
                log::warn!("Galaxy built but not cached: {}", err);
                progress.error(BuildStage::PersistCache, &err.to_string());
            }
        }

        log::info!(
            "Built galaxy of {} nodes in {}ms",
            entry.nodes.len(),
            started.elapsed().as_millis()
        );

        Ok(entry)
    }

    /// Block until the catalog writer is idle.
    ///
    /// The subscription is taken before checking the flag, so a transition
    /// between the check and the wait is not lost.
    fn wait_for_idle_writer(
        &self,
        progress: &Progress,
        control: &BuildControl,
    ) -> Result<(), GalaxyError> {
        let (tx, rx) = mpsc::channel::<()>();
        let _subscription = self.catalog.subscribe(Box::new(move || {
            let _ = tx.send(());
        }));

        let mut waiting_since = None;
        while self.catalog.is_running() {
            control.check()?;

            if waiting_since.is_none() {
                log::info!("Catalog writer is running, waiting before galaxy build");
                progress.report(
                    BuildStage::GatherVectors,
                    StepStatus::Waiting,
                    Some("waiting for catalog updates to finish"),
                );
                waiting_since = Some(Instant::now());
            }

            if rx.recv().is_err() {
                return Err(GalaxyError::Internal(
                    "catalog writer dropped its subscription".to_string(),
                ));
            }
        }

        if let Some(since) = waiting_since {
            log::info!(
                "Catalog writer idle after {}ms, starting galaxy build",
                since.elapsed().as_millis()
            );
        }

        control.check()
    }

    fn assign_nodes(&self, snapshot: &StoreSnapshot, layout: &reducer::Layout) -> Vec<GraphNode> {
        snapshot
            .entries()
            .iter()
            .zip(layout.points())
            .map(|(entry, point)| {
                let attributes = self.attributes.attributes(&entry.item_id).unwrap_or_default();
                let [x, y, z] = point.position;
                GraphNode {
                    item_id: entry.item_id.to_string(),
                    x,
                    y,
                    z,
                    cluster_index: palette::cluster_for(attributes.category.as_deref()),
                    display: attributes.display,
                }
            })
            .collect()
    }
}

/// Run one stage, reporting `running` then `done` or `error`. On error the
/// later stages are reported as errors too.
fn stage<T>(
    progress: &Progress,
    stage: BuildStage,
    run: impl FnOnce() -> Result<(T, String), GalaxyError>,
) -> Result<T, GalaxyError> {
    progress.running(stage);
    let started = Instant::now();

    match run() {
        Ok((value, detail)) => {
            log::debug!(
                "galaxy stage '{}' took {}ms ({})",
                stage.label(),
                started.elapsed().as_millis(),
                detail
            );
            progress.done(stage, Some(&detail));
            Ok(value)
        }
        Err(err) => {
            log::warn!("galaxy stage '{}' failed: {}", stage.label(), err);
            fail_from(progress, stage, &err);
            Err(err)
        }
    }
}

/// Like [`stage`], but gives up with `Superseded` if the build was cancelled.
fn checked_stage<T>(
    progress: &Progress,
    control: &BuildControl,
    stage_id: BuildStage,
    run: impl FnOnce() -> Result<(T, String), GalaxyError>,
) -> Result<T, GalaxyError> {
    if let Err(err) = control.check() {
        log::info!("galaxy build cancelled before '{}'", stage_id.label());
        fail_from(progress, stage_id, &err);
        return Err(err);
    }
    stage(progress, stage_id, run)
}

/// Report `first` and every later stage as failed.
fn fail_from(progress: &Progress, first: BuildStage, err: &GalaxyError) {
    let message = err.to_string();
    for stage in BuildStage::ALL.into_iter().skip(first.index()) {
        progress.error(stage, &message);
    }
}

fn count_clusters(nodes: &[GraphNode]) -> usize {
    let mut seen = vec![false; palette::slot_count()];
    for node in nodes {
        if let Some(slot) = seen.get_mut(node.cluster_index as usize) {
            *slot = true;
        }
    }
    seen.into_iter().filter(|s| *s).count()
}
