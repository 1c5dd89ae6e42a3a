//! Contract with the catalog embedding pipeline, the only writer of the
//! vector store.
//!
//! The builder must not read the store while the pipeline is running. It
//! learns about running/idle transitions by subscribing instead of polling.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub type ChangeListener = Box<dyn Fn() + Send + Sync>;

pub trait CatalogWriter: Send + Sync {
    fn is_running(&self) -> bool;

    /// Register `on_change` for running/idle transitions. The listener stays
    /// registered until the returned guard is dropped.
    fn subscribe(&self, on_change: ChangeListener) -> Subscription;
}

/// Unsubscribes when dropped.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(unsubscribe: impl FnOnce() + Send + 'static) -> Self {
        Self {
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    /// A subscription with nothing to undo.
    pub fn noop() -> Self {
        Self { unsubscribe: None }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

/// Writer that is never running. Used by one-shot commands where nothing
/// else appends to the store.
pub struct IdleCatalog;

impl CatalogWriter for IdleCatalog {
    fn is_running(&self) -> bool {
        false
    }

    fn subscribe(&self, _on_change: ChangeListener) -> Subscription {
        Subscription::noop()
    }
}

type Listeners = Arc<Mutex<Vec<(u64, Arc<dyn Fn() + Send + Sync>)>>>;

/// In-process writer flag with change notification.
#[derive(Default)]
pub struct CatalogActivity {
    running: Mutex<bool>,
    listeners: Listeners,
    next_id: AtomicU64,
}

impl CatalogActivity {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the running flag, notifying listeners if it changed.
    pub fn set_running(&self, running: bool) {
        {
            let mut current = self.running.lock().unwrap_or_else(|e| e.into_inner());
            if *current == running {
                return;
            }
            *current = running;
        }

        let listeners: Vec<_> = self
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();

        log::debug!(
            "catalog writer {} ({} listeners)",
            if running { "running" } else { "idle" },
            listeners.len()
        );

        // listeners run outside both locks so they may subscribe or query
        for listener in listeners {
            listener();
        }
    }

    /// Mark the writer running until the guard is dropped.
    pub fn begin(&self) -> ActivityGuard<'_> {
        self.set_running(true);
        ActivityGuard { activity: self }
    }

    #[cfg(test)]
    pub fn listener_count(&self) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

impl CatalogWriter for CatalogActivity {
    fn is_running(&self) -> bool {
        *self.running.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn subscribe(&self, on_change: ChangeListener) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::from(on_change)));

        let listeners = Arc::downgrade(&self.listeners);
        Subscription::new(move || {
            if let Some(listeners) = listeners.upgrade() {
                listeners
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .retain(|(existing, _)| *existing != id);
            }
        })
    }
}

pub struct ActivityGuard<'a> {
    activity: &'a CatalogActivity,
}

impl Drop for ActivityGuard<'_> {
    fn drop(&mut self) {
        self.activity.set_running(false);
    }
}
