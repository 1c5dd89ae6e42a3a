//! End-to-end scenarios across the galaxy components.

mod cache_freshness;

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::galaxy::attributes::{AttributeSource, NoAttributes};
use crate::galaxy::builder::BuildParams;
use crate::galaxy::cache::GalaxyCache;
use crate::galaxy::catalog::{CatalogWriter, IdleCatalog};
use crate::galaxy::progress::{BuildReporter, StepStatus};
use crate::galaxy::service::GalaxyService;
use crate::galaxy::store::VectorStore;

pub const DIMS: usize = 8;

/// Deterministic vector for item `i`: one of four axes plus a small offset.
pub fn clustered_vector(i: usize) -> Vec<f32> {
    let mut vector = vec![0.0; DIMS];
    vector[i % 4] = 1.0;
    vector[4 + (i / 4) % 4] = 0.05 + (i % 7) as f32 * 0.01;
    vector
}

pub fn fill(store: &VectorStore, range: std::ops::Range<usize>) {
    for i in range {
        store.insert(format!("item-{i}"), clustered_vector(i)).unwrap();
    }
}

pub fn store_with(count: usize) -> Arc<VectorStore> {
    let store = VectorStore::new(DIMS);
    fill(&store, 0..count);
    Arc::new(store)
}

pub fn service_with(
    cache_dir: &Path,
    store: Arc<VectorStore>,
    catalog: Arc<dyn CatalogWriter>,
    attributes: Arc<dyn AttributeSource>,
) -> GalaxyService {
    GalaxyService::new(
        store,
        catalog,
        attributes,
        GalaxyCache::in_dir(cache_dir),
        BuildParams::default(),
    )
}

pub fn idle_service(cache_dir: &Path, store: Arc<VectorStore>) -> GalaxyService {
    service_with(cache_dir, store, Arc::new(IdleCatalog), Arc::new(NoAttributes))
}

pub type Event = (usize, StepStatus, Option<String>);

#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<Event>>,
}

impl Recorder {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    /// Poll until an event matches, panicking after a few seconds.
    pub fn wait_for(&self, matches: impl Fn(&Event) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !self.events().iter().any(&matches) {
            assert!(Instant::now() < deadline, "event never reported");
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}

impl BuildReporter for Recorder {
    fn report(&self, step: usize, status: StepStatus, detail: Option<&str>) {
        self.events
            .lock()
            .unwrap()
            .push((step, status, detail.map(str::to_string)));
    }
}
