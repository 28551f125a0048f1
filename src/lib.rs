//! GTFS static feed ingestion: incremental table sync keyed on content hashes,
//! per-route GeoJSON derivation, and an HTTP API over the result.

pub mod archive;
pub mod checksum;
pub mod config;
pub mod error;
pub mod geometry;
pub mod ingest;
pub mod normalize;
pub mod progress;
pub mod registry;
pub mod server;
pub mod store;
pub mod sync;

#[cfg(test)]
mod testing;

pub use error::{AtlasError, Result};
