//! Per-item display attributes merged into the galaxy at build time.
//!
//! Attributes are owned by other parts of the application (library, play
//! history); the builder only reads them through [`AttributeSource`]. The
//! CLI and daemon keep them in `catalog.csv`.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Instant;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

const CSV_HEADERS: [&str; 5] = ["id", "title", "category", "owned", "engagement"];

/// Attributes copied verbatim onto each galaxy node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayAttributes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub owned: bool,
    #[serde(default)]
    pub engagement: f64,
}

/// Everything known about an item besides its vector.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemAttributes {
    pub display: DisplayAttributes,
    /// Dominant genre, used for cluster assignment.
    pub category: Option<String>,
}

pub trait AttributeSource: Send + Sync {
    fn attributes(&self, item_id: &str) -> Option<ItemAttributes>;
}

/// Source for callers that have no attributes at all.
pub struct NoAttributes;

impl AttributeSource for NoAttributes {
    fn attributes(&self, _item_id: &str) -> Option<ItemAttributes> {
        None
    }
}

/// In-memory attribute table, optionally backed by a CSV file.
#[derive(Default)]
pub struct AttributeTable {
    items: RwLock<HashMap<String, ItemAttributes>>,
    path: Option<PathBuf>,
}

impl AttributeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the table from `path`, creating an empty file if missing.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if let Err(err) = std::fs::metadata(path) {
            match err.kind() {
                ErrorKind::NotFound => {
                    log::info!("Creating new catalog at {}", path.display());
                    let mut csv_wrt = csv::Writer::from_path(path)?;
                    csv_wrt.write_record(CSV_HEADERS)?;
                    csv_wrt.flush()?;
                }
                _ => Err(err)?,
            }
        }

        let now = Instant::now();
        let mut csv_reader = csv::Reader::from_path(path)?;

        let mut items = HashMap::new();
        for record in csv_reader.records() {
            let record = record?;
            let id = record
                .get(0)
                .ok_or(anyhow!("couldnt get record id"))?
                .to_string();
            let title = record
                .get(1)
                .ok_or(anyhow!("couldnt get record title"))?
                .to_string();
            let category = record
                .get(2)
                .ok_or(anyhow!("couldnt get record category"))?
                .to_string();
            let owned = record
                .get(3)
                .ok_or(anyhow!("couldnt get record owned"))?
                .parse::<bool>()
                .unwrap_or(false);
            let engagement = record
                .get(4)
                .ok_or(anyhow!("couldnt get record engagement"))?
                .parse::<f64>()
                .unwrap_or(0.0);

            items.insert(
                id,
                ItemAttributes {
                    display: DisplayAttributes {
                        title: (!title.is_empty()).then_some(title),
                        owned,
                        engagement,
                    },
                    category: (!category.is_empty()).then_some(category),
                },
            );
        }

        log::debug!(
            "took {}ms to read {} catalog rows",
            now.elapsed().as_micros() as f64 / 1000.0,
            items.len()
        );

        Ok(Self {
            items: RwLock::new(items),
            path: Some(path.to_path_buf()),
        })
    }

    /// Write the table back to its file through a temp file and rename.
    pub fn save(&self) -> anyhow::Result<()> {
        let Some(path) = &self.path else {
            return Err(anyhow!("attribute table has no backing file"));
        };

        let items = self.items.read().map_err(|e| anyhow!("lock poisoned: {e}"))?;
        let mut ids: Vec<&String> = items.keys().collect();
        ids.sort();

        let temp_path = path.with_extension("csv-tmp");
        let mut csv_wrt = csv::Writer::from_path(&temp_path)?;
        csv_wrt.write_record(CSV_HEADERS)?;
        for id in ids {
            let item = &items[id];
            csv_wrt.write_record([
                id.as_str(),
                item.display.title.as_deref().unwrap_or_default(),
                item.category.as_deref().unwrap_or_default(),
                &item.display.owned.to_string(),
                &item.display.engagement.to_string(),
            ])?;
        }
        csv_wrt.flush()?;
        drop(csv_wrt);

        std::fs::rename(&temp_path, path)?;
        Ok(())
    }

    /// Insert or replace the attributes of one item.
    pub fn insert(&self, item_id: impl Into<String>, attributes: ItemAttributes) {
        let mut items = self.items.write().unwrap_or_else(|e| e.into_inner());
        items.insert(item_id.into(), attributes);
    }

    pub fn len(&self) -> usize {
        self.items.read().map(|items| items.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AttributeSource for AttributeTable {
    fn attributes(&self, item_id: &str) -> Option<ItemAttributes> {
        self.items
            .read()
            .ok()
            .and_then(|items| items.get(item_id).cloned())
    }
}
