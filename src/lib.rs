#![doc = "Convert OpenStreetMap PBF extracts into GeoParquet files."]
//!
//! The converter reconstructs full OSM feature geometries - points for
//! nodes, linestrings/polygons for ways, multipolygons for relations - with
//! optional tag, geometry and feature-id filtering. All intermediate state
//! lives in chunked parquet tables inside a per-conversion temporary
//! directory, so extracts larger than memory stay processable.

mod bucket;
mod common;
mod error;
mod filter;
mod geometry;
mod geoparquet;
mod hash;
mod polygon_features;
mod reader;

pub mod wkb;

pub mod cli;
pub mod commands;

#[doc(inline)]
pub use error::{Error, Result};

#[doc(inline)]
pub use filter::{ElementKind, OsmIdsFilter, TagSpec, TagsFilter};

#[doc(inline)]
pub use polygon_features::WayPolygonConfig;

#[doc(inline)]
pub use reader::{
    ConvertOptions, ElementSource, PbfElementSource, PbfFileReader, RawElement, RawMember,
    ReaderOptions, VecElementSource,
};

#[doc(inline)]
pub use bucket::{detect_rows_per_bucket, rows_per_bucket_for_memory};
