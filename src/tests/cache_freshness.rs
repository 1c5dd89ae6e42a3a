use std::sync::Arc;

use super::{fill, idle_service, service_with, store_with, Recorder};
use crate::galaxy::attributes::NoAttributes;
use crate::galaxy::builder::GalaxyError;
use crate::galaxy::cache::GalaxyCache;
use crate::galaxy::catalog::IdleCatalog;
use crate::galaxy::index::IndexError;
use crate::galaxy::progress::{BuildStage, StepStatus};
use crate::galaxy::service::GalaxyService;
use crate::galaxy::store::VectorStore;
use crate::galaxy::BuildParams;

#[test]
fn test_cache_goes_stale_when_store_grows() {
    let tmp = tempfile::tempdir().unwrap();
    let store = store_with(100);
    let service = idle_service(tmp.path(), store.clone());

    let built = service.build_and_cache_galaxy(None).unwrap();
    let cached = service.load_cached_galaxy_if_fresh().unwrap();
    assert_eq!(cached.nodes.len(), 100);
    assert_eq!(cached.fingerprint, built.fingerprint);

    fill(&store, 100..150);
    assert!(service.load_cached_galaxy_if_fresh().is_none());
    assert!(!service.is_ready());
    assert!(tmp.path().join("galaxy.json").exists());

    let rebuilt = service.build_and_cache_galaxy(None).unwrap();
    assert_eq!(rebuilt.nodes.len(), 150);
    assert_eq!(service.load_cached_galaxy_if_fresh().unwrap().nodes.len(), 150);
}

#[test]
fn test_fresh_cache_survives_restart() {
    let tmp = tempfile::tempdir().unwrap();
    let store = store_with(25);
    idle_service(tmp.path(), store.clone())
        .build_and_cache_galaxy(None)
        .unwrap();

    let reopened = idle_service(tmp.path(), store);
    let cached = reopened.load_cached_galaxy_if_fresh().unwrap();
    assert_eq!(cached.nodes.len(), 25);
    assert!(!reopened.is_ready());

    reopened.refresh_index().unwrap();
    assert!(reopened.is_ready());
    assert_eq!(reopened.stats().builds_started, 0);
}

#[test]
fn test_empty_store_fails_without_writing() {
    let tmp = tempfile::tempdir().unwrap();
    let service = idle_service(tmp.path(), Arc::new(VectorStore::new(4)));

    let reporter = Arc::new(Recorder::default());
    let err = service
        .build_and_cache_galaxy(Some(reporter.clone()))
        .unwrap_err();
    assert!(matches!(*err, GalaxyError::Index(IndexError::EmptyIndex)));
    assert!(!service.is_ready());
    assert!(service.load_cached_galaxy_if_fresh().is_none());
    assert!(!tmp.path().join("galaxy.json").exists());
    assert!(reporter.events().iter().any(|e| e.1 == StepStatus::Error));

    // failures are not cached, the next request builds again
    assert!(service.build_and_cache_galaxy(None).is_err());
    assert_eq!(service.stats().builds_started, 2);
}

#[test]
fn test_persist_failure_still_returns_galaxy() {
    let tmp = tempfile::tempdir().unwrap();
    let cache = GalaxyCache::new(tmp.path().join("missing").join("galaxy.json"));
    let service = GalaxyService::new(
        store_with(15),
        Arc::new(IdleCatalog),
        Arc::new(NoAttributes),
        cache,
        BuildParams::default(),
    );

    let handle = service.request_build(None).unwrap();
    let entry = handle.wait().unwrap();
    assert_eq!(entry.nodes.len(), 15);
    assert!(service.is_ready());
    assert_eq!(service.stats().cache_writes, 0);

    let persist = &handle.stages()[BuildStage::PersistCache.index()];
    assert_eq!(persist.status, StepStatus::Error);
    assert!(persist.detail.is_some());
    assert!(service.load_cached_galaxy_if_fresh().is_none());
}

#[test]
fn test_galaxy_nodes_carry_attributes_and_palette() {
    use crate::galaxy::attributes::{AttributeTable, DisplayAttributes, ItemAttributes};
    use crate::galaxy::palette;

    let tmp = tempfile::tempdir().unwrap();
    let attributes = Arc::new(AttributeTable::new());
    attributes.insert(
        "item-0",
        ItemAttributes {
            display: DisplayAttributes {
                title: Some("Zero".to_string()),
                owned: true,
                engagement: 3.0,
            },
            category: Some("Science Fiction".to_string()),
        },
    );
    let service = service_with(
        tmp.path(),
        store_with(8),
        Arc::new(IdleCatalog),
        attributes,
    );

    let entry = service.build_and_cache_galaxy(None).unwrap();
    let zero = entry.nodes.iter().find(|n| n.item_id == "item-0").unwrap();
    assert_eq!(zero.display.title.as_deref(), Some("Zero"));
    assert_eq!(zero.cluster_index, palette::cluster_for(Some("sci-fi")));

    let other = entry.nodes.iter().find(|n| n.item_id == "item-1").unwrap();
    assert_eq!(other.cluster_index, palette::DEFAULT_SLOT);
    assert_eq!(entry.palette.len(), palette::slot_count());
}
