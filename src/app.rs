//! Wiring of the on-disk state in a base directory to a [`GalaxyService`].

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context};
use chrono::{DateTime, Utc};
use homedir::my_home;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::galaxy::attributes::{AttributeTable, DisplayAttributes, ItemAttributes};
use crate::galaxy::cache::GalaxyCache;
use crate::galaxy::catalog::CatalogActivity;
use crate::galaxy::service::{GalaxyService, GalaxyStats};
use crate::galaxy::store::VectorStore;
use crate::galaxy::vectors_file::VectorFile;

const CATALOG_FILE_NAME: &str = "catalog.csv";

/// One catalog item with its embedding, as imported or appended.
#[derive(Debug, Clone, Deserialize)]
pub struct NewItem {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub owned: bool,
    #[serde(default)]
    pub engagement: f64,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatus {
    pub path: PathBuf,
    pub present: bool,
    pub fresh: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub built_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nodes: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub base_path: PathBuf,
    pub galaxy: GalaxyStats,
    pub cache: CacheStatus,
}

pub struct App {
    base_path: PathBuf,
    config: Config,
    store: Arc<VectorStore>,
    attributes: Arc<AttributeTable>,
    catalog: Arc<CatalogActivity>,
    vectors: VectorFile,
    service: Arc<GalaxyService>,
    append_lock: Mutex<()>,
}

/// `GALAXY_BASE_PATH`, or `~/.local/share/galaxy`.
pub fn base_path() -> anyhow::Result<PathBuf> {
    if let Ok(path) = std::env::var("GALAXY_BASE_PATH") {
        return Ok(PathBuf::from(path));
    }

    let home = my_home()
        .map_err(|e| anyhow!("could not determine home directory: {e:?}"))?
        .ok_or(anyhow!("home directory path is empty"))?;
    Ok(home.join(".local").join("share").join("galaxy"))
}

impl App {
    /// Open the state in `base_path`, creating the directory if needed.
    ///
    /// Without a `vectors.bin` the store starts empty with
    /// `default_dimensions`. When that is `None` the first appended batch
    /// decides.
    pub fn open(base_path: &Path, default_dimensions: Option<usize>) -> anyhow::Result<Self> {
        std::fs::create_dir_all(base_path)
            .with_context(|| format!("failed to create {}", base_path.display()))?;

        let config = Config::load_with(base_path)?;

        let vectors = VectorFile::in_dir(base_path);
        let store = if vectors.exists() {
            let store = vectors
                .load()
                .with_context(|| format!("failed to load {}", vectors.path().display()))?;
            log::info!(
                "Loaded {} vectors of dimension {}",
                store.len(),
                store.dimensions()
            );
            store
        } else {
            VectorStore::new(default_dimensions.unwrap_or(0))
        };
        let store = Arc::new(store);

        let attributes = Arc::new(AttributeTable::load(&base_path.join(CATALOG_FILE_NAME))?);
        let catalog = Arc::new(CatalogActivity::new());

        let service = Arc::new(GalaxyService::new(
            store.clone(),
            catalog.clone(),
            attributes.clone(),
            GalaxyCache::in_dir(base_path),
            config.build_params(),
        ));

        Ok(Self {
            base_path: base_path.to_path_buf(),
            config,
            store,
            attributes,
            catalog,
            vectors,
            service,
            append_lock: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn service(&self) -> &Arc<GalaxyService> {
        &self.service
    }

    pub fn store(&self) -> &Arc<VectorStore> {
        &self.store
    }

    /// Append items to the store and the catalog, then persist both.
    ///
    /// The whole batch is validated first, so an invalid batch leaves the
    /// store untouched. A store without dimensions takes them from the first
    /// item. The catalog writer is flagged as running meanwhile, which holds
    /// back galaxy builds until the batch is in.
    ///
    /// If persisting fails the items stay in memory and the error says so.
    pub fn append(&self, items: Vec<NewItem>) -> anyhow::Result<usize> {
        let _appending = self.append_lock.lock().unwrap_or_else(|e| e.into_inner());

        let dimensions = match self.store.dimensions() {
            0 => items.first().map_or(0, |item| item.embedding.len()),
            dimensions => dimensions,
        };

        let mut seen = HashSet::new();
        for item in &items {
            if item.id.is_empty() {
                bail!("item id must not be empty");
            }
            if item.embedding.is_empty() || item.embedding.len() != dimensions {
                bail!(
                    "item {:?} has {} dimensions, store has {}",
                    item.id,
                    item.embedding.len(),
                    dimensions
                );
            }
            if self.store.contains(&item.id) || !seen.insert(item.id.as_str()) {
                bail!("item {:?} is already in the store", item.id);
            }
        }

        let _writing = self.catalog.begin();

        let count = items.len();
        for item in items {
            self.attributes.insert(
                item.id.clone(),
                ItemAttributes {
                    display: DisplayAttributes {
                        title: item.title,
                        owned: item.owned,
                        engagement: item.engagement,
                    },
                    category: item.category,
                },
            );
            self.store.insert(item.id, item.embedding)?;
        }

        self.persist()
            .context("items were appended in memory but could not be persisted")?;

        if self.service.notify_store_changed() {
            log::info!("Store changed under an in-flight build, restarting it");
        }

        log::info!("Appended {} items, store has {}", count, self.store.len());
        Ok(count)
    }

    fn persist(&self) -> anyhow::Result<()> {
        self.vectors.save(&self.store.snapshot())?;
        self.attributes.save()
    }

    pub fn status(&self) -> StatusReport {
        let cache = GalaxyCache::in_dir(&self.base_path);
        let cached = cache.load().ok().flatten();
        let live = self.store.fingerprint();

        StatusReport {
            base_path: self.base_path.clone(),
            galaxy: self.service.stats(),
            cache: CacheStatus {
                path: cache.path().to_path_buf(),
                present: cache.path().exists(),
                fresh: cached
                    .as_ref()
                    .is_some_and(|entry| entry.fingerprint.matches(&live)),
                built_at: cached.as_ref().map(|entry| entry.built_at),
                nodes: cached.as_ref().map(|entry| entry.nodes.len()),
            },
        }
    }
}

/// Read an import file with the columns
/// `id,title,category,owned,engagement,embedding`, where `embedding` is a
/// space separated list of floats.
pub fn read_import_csv(path: &Path) -> anyhow::Result<Vec<NewItem>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("failed to open {}", path.display()))?;

    let mut items = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record?;
        let line = row + 2;
        let field = |idx: usize, name: &str| {
            record
                .get(idx)
                .map(str::trim)
                .ok_or(anyhow!("line {line}: missing column {name}"))
        };

        let optional = |value: &str| (!value.is_empty()).then(|| value.to_string());

        let embedding = field(5, "embedding")?
            .split_whitespace()
            .map(|value| value.parse::<f32>())
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("line {line}: invalid embedding"))?;

        let owned = field(3, "owned")?;
        let engagement = field(4, "engagement")?;

        items.push(NewItem {
            id: field(0, "id")?.to_string(),
            title: optional(field(1, "title")?),
            category: optional(field(2, "category")?),
            owned: !owned.is_empty()
                && owned
                    .parse::<bool>()
                    .with_context(|| format!("line {line}: invalid owned flag {owned:?}"))?,
            engagement: if engagement.is_empty() {
                0.0
            } else {
                engagement
                    .parse::<f64>()
                    .with_context(|| format!("line {line}: invalid engagement {engagement:?}"))?
            },
            embedding,
        });
    }

    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::galaxy::catalog::CatalogWriter;

    fn item(id: &str, embedding: Vec<f32>) -> NewItem {
        NewItem {
            id: id.to_string(),
            title: Some(format!("Title {id}")),
            category: Some("drama".to_string()),
            owned: false,
            engagement: 1.0,
            embedding,
        }
    }

    #[test]
    fn test_read_import_csv() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("import.csv");
        std::fs::write(
            &path,
            "id,title,category,owned,engagement,embedding\n\
             a,Alpha,drama,true,2.5,1 0 0\n\
             b,,,false,,0 1 0.5\n",
        )
        .unwrap();

        let items = read_import_csv(&path).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].title.as_deref(), Some("Alpha"));
        assert!(items[0].owned);
        assert_eq!(items[0].engagement, 2.5);
        assert_eq!(items[1].title, None);
        assert_eq!(items[1].category, None);
        assert_eq!(items[1].embedding, vec![0.0, 1.0, 0.5]);
    }

    #[test]
    fn test_read_import_csv_rejects_bad_embedding() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("import.csv");
        std::fs::write(
            &path,
            "id,title,category,owned,engagement,embedding\na,Alpha,drama,true,1,1 x 0\n",
        )
        .unwrap();

        assert!(read_import_csv(&path).is_err());
    }

    #[test]
    fn test_append_persists_and_reopens() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let app = App::open(tmp.path(), Some(3)).unwrap();
            let added = app
                .append(vec![item("a", vec![1.0, 0.0, 0.0]), item("b", vec![0.0, 1.0, 0.0])])
                .unwrap();
            assert_eq!(added, 2);
        }

        let app = App::open(tmp.path(), None).unwrap();
        assert_eq!(app.store().len(), 2);
        assert_eq!(app.store().dimensions(), 3);
        assert!(tmp.path().join("catalog.csv").exists());
        assert!(tmp.path().join("config.yaml").exists());
    }

    #[test]
    fn test_append_is_all_or_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let app = App::open(tmp.path(), Some(3)).unwrap();
        app.append(vec![item("a", vec![1.0, 0.0, 0.0])]).unwrap();

        let duplicate = app.append(vec![item("b", vec![0.0, 1.0, 0.0]), item("a", vec![0.0, 0.0, 1.0])]);
        assert!(duplicate.is_err());

        let wrong_dims = app.append(vec![item("c", vec![1.0, 0.0])]);
        assert!(wrong_dims.is_err());

        assert_eq!(app.store().len(), 1);
        assert!(!app.catalog.is_running());
    }

    #[test]
    fn test_append_sets_dimensions_of_new_store() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let app = App::open(tmp.path(), None).unwrap();
            assert_eq!(app.store().dimensions(), 0);

            let mismatched = app.append(vec![item("a", vec![1.0, 0.0, 0.0]), item("b", vec![1.0])]);
            assert!(mismatched.is_err());
            assert_eq!(app.store().dimensions(), 0);

            app.append(vec![item("a", vec![1.0, 0.0, 0.0])]).unwrap();
            assert_eq!(app.store().dimensions(), 3);
            assert!(app.append(vec![item("b", vec![1.0, 0.0])]).is_err());
        }

        let app = App::open(tmp.path(), None).unwrap();
        assert_eq!(app.store().dimensions(), 3);
        assert_eq!(app.store().len(), 1);
    }

    #[test]
    fn test_append_reports_persist_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let app = App::open(tmp.path(), Some(3)).unwrap();

        // a non-empty directory in place of vectors.bin makes the rename fail
        let blocker = tmp.path().join("vectors.bin");
        std::fs::create_dir(&blocker).unwrap();
        std::fs::write(blocker.join("keep"), "x").unwrap();

        let err = app.append(vec![item("a", vec![1.0, 0.0, 0.0])]).unwrap_err();
        assert!(err.to_string().contains("appended in memory"));
        assert_eq!(app.store().len(), 1);
        assert!(!app.catalog.is_running());
    }

    #[test]
    fn test_status_reports_cache_freshness() {
        let tmp = tempfile::tempdir().unwrap();
        let app = App::open(tmp.path(), Some(3)).unwrap();
        app.append(vec![
            item("a", vec![1.0, 0.0, 0.0]),
            item("b", vec![0.0, 1.0, 0.0]),
            item("c", vec![0.0, 0.0, 1.0]),
        ])
        .unwrap();

        let before = app.status();
        assert!(!before.cache.present);
        assert!(!before.cache.fresh);

        app.service().build_and_cache_galaxy(None).unwrap();
        let after = app.status();
        assert!(after.cache.fresh);
        assert_eq!(after.cache.nodes, Some(3));
        assert!(after.galaxy.ready);
    }
}
