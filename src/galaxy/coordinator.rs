//! Process-wide build deduplication.
//!
//! At most one [`BuildHandle`] is live. Callers that arrive while a build is
//! in flight attach to it and receive the same outcome. The handle is cleared
//! when the build settles, so the next request starts a fresh build.

use std::any::Any;
use std::fmt::Display;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use rusty_ulid::Ulid;

use crate::galaxy::builder::{BuildControl, GalaxyBuilder, GalaxyError};
use crate::galaxy::cache::GalaxyCacheEntry;
use crate::galaxy::progress::{BuildReporter, Progress, StageState};
use crate::galaxy::store::Fingerprint;

/// Outcome shared by every waiter of one build.
pub type BuildOutcome = Result<Arc<GalaxyCacheEntry>, Arc<GalaxyError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BuildId(Ulid);

impl BuildId {
    fn generate() -> Self {
        BuildId(Ulid::generate())
    }
}

impl Display for BuildId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct HandleInner {
    id: BuildId,
    control: BuildControl,
    progress: Progress,
    outcome: Mutex<Option<BuildOutcome>>,
    settled: Condvar,
}

/// Shared, cancellable, awaitable token for one build.
#[derive(Clone)]
pub struct BuildHandle(Arc<HandleInner>);

impl BuildHandle {
    fn new() -> Self {
        Self(Arc::new(HandleInner {
            id: BuildId::generate(),
            control: BuildControl::default(),
            progress: Progress::new(),
            outcome: Mutex::new(None),
            settled: Condvar::new(),
        }))
    }

    pub fn id(&self) -> BuildId {
        self.0.id
    }

    /// Block until the build settles.
    pub fn wait(&self) -> BuildOutcome {
        let mut outcome = self.0.outcome.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(settled) = outcome.as_ref() {
                return settled.clone();
            }
            outcome = self
                .0
                .settled
                .wait(outcome)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    pub fn try_outcome(&self) -> Option<BuildOutcome> {
        self.0
            .outcome
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn is_finished(&self) -> bool {
        self.try_outcome().is_some()
    }

    /// Ask the build to stop at its next stage boundary.
    pub fn cancel(&self) {
        log::info!("Cancelling galaxy build {}", self.id());
        self.0.control.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.control.is_cancelled()
    }

    pub fn progress(&self) -> &Progress {
        &self.0.progress
    }

    pub fn stages(&self) -> Vec<StageState> {
        self.0.progress.states()
    }

    /// Fingerprint of the snapshot being built, once gathered.
    pub fn snapshot_fingerprint(&self) -> Option<Fingerprint> {
        self.0.control.snapshot()
    }

    pub fn same_build(&self, other: &BuildHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    fn resolve(&self, result: BuildOutcome) {
        let mut outcome = self.0.outcome.lock().unwrap_or_else(|e| e.into_inner());
        *outcome = Some(result);
        self.0.settled.notify_all();
    }
}

pub struct BuildCoordinator {
    builder: Arc<GalaxyBuilder>,
    current: Arc<Mutex<Option<BuildHandle>>>,
}

impl BuildCoordinator {
    pub fn new(builder: Arc<GalaxyBuilder>) -> Self {
        Self {
            builder,
            current: Arc::new(Mutex::new(None)),
        }
    }

    pub fn builder(&self) -> &Arc<GalaxyBuilder> {
        &self.builder
    }

    /// Attach to the in-flight build or start a new one on a worker thread.
    /// Never blocks on the build itself.
    ///
    /// The reporter is attached after the slot lock is released, so it may
    /// call back into the coordinator.
    pub fn request(
        &self,
        reporter: Option<Arc<dyn BuildReporter>>,
    ) -> Result<BuildHandle, GalaxyError> {
        let handle = self.acquire()?;
        if let Some(reporter) = reporter {
            handle.progress().attach(reporter);
        }
        Ok(handle)
    }

    fn acquire(&self) -> Result<BuildHandle, GalaxyError> {
        let mut current = self
            .current
            .lock()
            .map_err(|e| GalaxyError::Internal(format!("Lock poisoned: {}", e)))?;

        if let Some(handle) = current
            .as_ref()
            .filter(|h| !h.is_cancelled() && !h.is_finished())
        {
            log::debug!("Attaching to in-flight galaxy build {}", handle.id());
            return Ok(handle.clone());
        }

        let handle = BuildHandle::new();
        let spawned = thread::Builder::new()
            .name(format!("galaxy-build-{}", handle.id()))
            .spawn({
                let builder = self.builder.clone();
                let slot = self.current.clone();
                let handle = handle.clone();
                move || run_build(builder, slot, handle)
            });

        if let Err(err) = spawned {
            return Err(GalaxyError::Internal(format!(
                "Failed to spawn build worker: {}",
                err
            )));
        }

        log::info!("Started galaxy build {}", handle.id());
        *current = Some(handle.clone());
        Ok(handle)
    }

    /// The in-flight build, if any.
    pub fn in_flight(&self) -> Option<BuildHandle> {
        self.current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Cancel the in-flight build if it already gathered a snapshot that no
    /// longer matches `live`. Returns whether a build was cancelled.
    pub fn supersede_stale(&self, live: &Fingerprint) -> bool {
        let current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        let Some(handle) = current.as_ref() else {
            return false;
        };

        match handle.snapshot_fingerprint() {
            Some(snapshot) if !snapshot.matches(live) && !handle.is_cancelled() => {
                handle.cancel();
                true
            }
            _ => false,
        }
    }
}

fn run_build(builder: Arc<GalaxyBuilder>, slot: Arc<Mutex<Option<BuildHandle>>>, handle: BuildHandle) {
    let result = catch_unwind(AssertUnwindSafe(|| {
        builder.build(handle.progress(), &handle.0.control)
    }));

    let outcome = match result {
        Ok(Ok(entry)) => Ok(Arc::new(entry)),
        Ok(Err(err)) => {
            log::warn!("Galaxy build {} failed: {}", handle.id(), err);
            Err(Arc::new(err))
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            log::error!("Galaxy build {} panicked: {}", handle.id(), message);
            Err(Arc::new(GalaxyError::WorkerPanicked(message)))
        }
    };

    // clear before resolving so a waiter that retries gets a new build
    {
        let mut current = slot.lock().unwrap_or_else(|e| e.into_inner());
        if current.as_ref().is_some_and(|h| h.same_build(&handle)) {
            *current = None;
        }
    }

    handle.resolve(outcome);
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::galaxy::attributes::NoAttributes;
    use crate::galaxy::builder::BuildParams;
    use crate::galaxy::cache::GalaxyCache;
    use crate::galaxy::catalog::{CatalogActivity, IdleCatalog};
    use crate::galaxy::progress::StepStatus;
    use crate::galaxy::store::VectorStore;

    fn coordinator(dir: &std::path::Path, n: usize) -> BuildCoordinator {
        let store = Arc::new(VectorStore::new(3));
        for i in 0..n {
            let f = i as f32;
            store
                .insert(format!("item-{i}"), vec![f, 1.0 - f, f * f])
                .unwrap();
        }
        let builder = GalaxyBuilder::new(
            store,
            Arc::new(IdleCatalog),
            Arc::new(NoAttributes),
            GalaxyCache::in_dir(dir),
            BuildParams::default(),
        );
        BuildCoordinator::new(Arc::new(builder))
    }

    #[test]
    fn test_build_id_display() {
        let id = BuildId::generate();
        assert_eq!(id.to_string().len(), 26);
    }

    #[test]
    fn test_request_and_wait() {
        let tmp = tempfile::tempdir().unwrap();
        let coordinator = coordinator(tmp.path(), 10);

        let handle = coordinator.request(None).unwrap();
        let entry = handle.wait().unwrap();
        assert_eq!(entry.nodes.len(), 10);
        assert!(handle.is_finished());
        assert!(coordinator.in_flight().is_none());
    }

    #[test]
    fn test_failure_is_shared_and_cleared() {
        let tmp = tempfile::tempdir().unwrap();
        let coordinator = coordinator(tmp.path(), 0);

        let handle = coordinator.request(None).unwrap();
        let first = handle.wait().unwrap_err();
        let second = handle.wait().unwrap_err();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(coordinator.in_flight().is_none());

        let retry = coordinator.request(None).unwrap();
        assert!(!retry.same_build(&handle));
        assert!(retry.wait().is_err());
        assert_eq!(coordinator.builder().builds_started(), 2);
    }

    #[test]
    fn test_reporter_may_call_back_into_coordinator() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(VectorStore::new(3));
        store.insert("a", vec![1.0, 0.0, 0.0]).unwrap();
        store.insert("b", vec![0.0, 1.0, 0.0]).unwrap();
        let catalog = Arc::new(CatalogActivity::new());
        catalog.set_running(true);
        let builder = GalaxyBuilder::new(
            store,
            catalog.clone(),
            Arc::new(NoAttributes),
            GalaxyCache::in_dir(tmp.path()),
            BuildParams::default(),
        );
        let coordinator = Arc::new(BuildCoordinator::new(Arc::new(builder)));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let reporter = {
            let weak = Arc::downgrade(&coordinator);
            let seen = seen.clone();
            Arc::new(move |_: usize, _: StepStatus, _: Option<&str>| {
                if let Some(coordinator) = weak.upgrade() {
                    seen.lock()
                        .unwrap()
                        .push(coordinator.in_flight().map(|h| h.id()));
                }
            })
        };

        let first = coordinator.request(Some(reporter.clone())).unwrap();
        let second = coordinator.request(Some(reporter)).unwrap();
        assert!(first.same_build(&second));
        assert!(seen.lock().unwrap().contains(&Some(first.id())));

        catalog.set_running(false);
        assert!(first.wait().is_ok());
    }

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
        let boxed: Box<dyn Any + Send> = Box::new(3u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }
}
