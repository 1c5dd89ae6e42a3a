//! Similarity index and galaxy layout pipeline.
//!
//! Components, leaves first:
//! - `store`: append-only id -> embedding map with an O(1) fingerprint
//! - `index`: IVF approximate nearest-neighbor index over a store snapshot
//! - `reducer`: projection of every vector onto its top 3 principal axes
//! - `cache`: `galaxy.json`, trusted only while its fingerprint matches
//! - `builder`: gather, reduce, assign clusters, build index, persist
//! - `coordinator`: one build in flight, late callers share its outcome
//! - `service`: query and build API used by the CLI and the daemon

pub mod attributes;
pub mod builder;
pub mod cache;
pub mod catalog;
pub mod coordinator;
pub mod index;
pub mod kmeans;
pub mod palette;
pub mod progress;
pub mod reducer;
pub mod service;
pub mod store;
pub mod vectors_file;

pub use builder::{BuildParams, GalaxyError};
pub use service::GalaxyService;
