//! Fixed genre palette used to color the galaxy.
//!
//! Assignment is a lookup on the item's category; anything unknown lands in
//! the default slot.

use serde::{Deserialize, Serialize};

/// Slot used for missing or unrecognized categories.
pub const DEFAULT_SLOT: u16 = 0;

/// (name, color) per slot, in slot order.
const PALETTE: [(&str, &str); 14] = [
    ("other", "#9aa0a6"),
    ("action", "#e4572e"),
    ("adventure", "#f3a712"),
    ("animation", "#ffd23f"),
    ("comedy", "#a8c256"),
    ("documentary", "#29bf12"),
    ("drama", "#3bceac"),
    ("fantasy", "#0ead69"),
    ("horror", "#540d6e"),
    ("music", "#ee4266"),
    ("mystery", "#4361ee"),
    ("romance", "#f15bb5"),
    ("sci-fi", "#00bbf9"),
    ("thriller", "#7209b7"),
];

/// Spellings folded onto a palette name.
const ALIASES: [(&str, &str); 8] = [
    ("science fiction", "sci-fi"),
    ("science-fiction", "sci-fi"),
    ("scifi", "sci-fi"),
    ("sf", "sci-fi"),
    ("animated", "animation"),
    ("anime", "animation"),
    ("musical", "music"),
    ("crime", "mystery"),
];

/// One palette slot as persisted with the galaxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaletteEntry {
    pub index: u16,
    pub name: String,
    pub color: String,
}

/// Cluster index for an item's category.
pub fn cluster_for(category: Option<&str>) -> u16 {
    let Some(category) = category else {
        return DEFAULT_SLOT;
    };

    let normalized = category.trim().to_lowercase();
    let name = ALIASES
        .iter()
        .find(|(alias, _)| *alias == normalized)
        .map(|(_, name)| *name)
        .unwrap_or(normalized.as_str());

    PALETTE
        .iter()
        .position(|(slot, _)| *slot == name)
        .map(|i| i as u16)
        .unwrap_or(DEFAULT_SLOT)
}

/// The whole palette table.
pub fn assignment() -> Vec<PaletteEntry> {
    PALETTE
        .iter()
        .enumerate()
        .map(|(i, (name, color))| PaletteEntry {
            index: i as u16,
            name: name.to_string(),
            color: color.to_string(),
        })
        .collect()
}

pub fn slot_count() -> usize {
    PALETTE.len()
}
