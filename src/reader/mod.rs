//! The conversion driver.
//!
//! `PbfFileReader` owns the filters and configuration of one conversion and
//! chains the pipeline stages: element scatter, prefilter, node emission,
//! bucketed linestring construction, relation assembly and result
//! concatenation. Stages communicate exclusively through chunked parquet
//! tables inside a per-conversion temporary directory; inputs are swept as
//! soon as no later stage needs them.

mod concat;
pub(crate) mod elements;
mod nodes;
mod prefilter;
mod relations;
mod ways;

pub use elements::{
    ElementSource, PbfElementSource, RawElement, RawMember, VecElementSource,
};

use std::path::{Path, PathBuf};

use geo::Geometry;
use polars::prelude::ParquetCompression;

use crate::common::data::compression_from_str;
use crate::common::fs::{delete_directories, ensure_dir_exists};
use crate::error::Result;
use crate::filter::{OsmIdsFilter, TagClauses, TagsFilter};
use crate::polygon_features::WayPolygonConfig;
use crate::{bucket, hash};

/// Conversion-wide settings.
pub struct ReaderOptions {
    /// Optional tag filter; features must match to be emitted.
    pub tags_filter: Option<TagsFilter>,
    /// Optional polygonal filter in WGS84 lon/lat.
    pub geometry_filter: Option<Geometry<f64>>,
    /// Parent directory for results and the per-conversion temp directory.
    pub working_directory: PathBuf,
    /// Polygon classification rules; the bundled default when `None`.
    pub osm_way_polygon_features_config: Option<serde_json::Value>,
    /// Compression of the intermediate parquet chunks.
    pub parquet_compression: String,
    /// Bucket size override; derived from system memory when `None`.
    pub rows_per_bucket: Option<usize>,
    /// Remove the temp directory even when a stage fails.
    pub cleanup_on_error: bool,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            tags_filter: None,
            geometry_filter: None,
            working_directory: PathBuf::from("files"),
            osm_way_polygon_features_config: None,
            parquet_compression: "snappy".to_string(),
            rows_per_bucket: None,
            cleanup_on_error: false,
        }
    }
}

/// Per-call settings.
#[derive(Default)]
pub struct ConvertOptions {
    /// Explicit result path; derived from the inputs when `None`.
    pub result_file_path: Option<PathBuf>,
    /// One column per tag key instead of a single mapping column. Defaults
    /// to `true` when a tag filter is present, `false` otherwise.
    pub explode_tags: Option<bool>,
    /// Convert even when the derived result file already exists.
    pub ignore_cache: bool,
    /// Restrict output to these `node/<id>`, `way/<id>`, `relation/<id>` ids.
    pub filter_osm_ids: Vec<String>,
    /// Emit the full normalized tag set even when a tag filter is present.
    pub keep_all_tags: bool,
}

/// OSM PBF to GeoParquet converter.
pub struct PbfFileReader {
    tags_filter: Option<TagsFilter>,
    merged_clauses: Option<TagClauses>,
    geometry_filter: Option<Geometry<f64>>,
    working_directory: PathBuf,
    polygon_config: WayPolygonConfig,
    compression: ParquetCompression,
    rows_per_bucket: usize,
    cleanup_on_error: bool,
}

impl PbfFileReader {
    /// Validate the filters and configuration; shape errors fail here,
    /// before any I/O.
    pub fn new(options: ReaderOptions) -> Result<Self> {
        let merged_clauses = match &options.tags_filter {
            Some(filter) => Some(filter.merged()?),
            None => None,
        };
        let polygon_config = match &options.osm_way_polygon_features_config {
            Some(raw) => WayPolygonConfig::from_json(raw)?,
            None => WayPolygonConfig::bundled().clone(),
        };
        let compression = compression_from_str(&options.parquet_compression)?;
        let rows_per_bucket =
            options.rows_per_bucket.unwrap_or_else(bucket::detect_rows_per_bucket);

        Ok(Self {
            tags_filter: options.tags_filter,
            merged_clauses,
            geometry_filter: options.geometry_filter,
            working_directory: options.working_directory,
            polygon_config,
            compression,
            rows_per_bucket,
            cleanup_on_error: options.cleanup_on_error,
        })
    }

    /// Convert a local `.osm.pbf` file; returns the GeoParquet path.
    pub fn convert_pbf_to_geoparquet(
        &self,
        pbf_path: &Path,
        options: &ConvertOptions,
    ) -> Result<PathBuf> {
        self.convert_source_to_geoparquet(PbfElementSource::new(pbf_path), pbf_path, options)
    }

    /// Convert any element stream. `input_path` only feeds the derived
    /// result name; the production path is `convert_pbf_to_geoparquet`.
    pub fn convert_source_to_geoparquet(
        &self,
        source: impl ElementSource,
        input_path: &Path,
        options: &ConvertOptions,
    ) -> Result<PathBuf> {
        let ids_filter = OsmIdsFilter::parse(&options.filter_osm_ids)?;
        let explode_tags = options.explode_tags.unwrap_or(self.tags_filter.is_some());

        let result_path = match &options.result_file_path {
            Some(path) => path.clone(),
            None => self.working_directory.join(hash::result_file_name(
                input_path,
                self.tags_filter.as_ref(),
                self.geometry_filter.as_ref(),
                explode_tags,
                &options.filter_osm_ids,
            )),
        };
        if result_path.exists() && !options.ignore_cache {
            log::info!("reusing cached result {}", result_path.display());
            return Ok(result_path);
        }

        ensure_dir_exists(&self.working_directory)?;
        let tmp_dir = tempfile::Builder::new()
            .prefix(".pbf2parquet-")
            .tempdir_in(&self.working_directory)?;

        let outcome = self.run_pipeline(
            tmp_dir.path(),
            source,
            &result_path,
            explode_tags,
            ids_filter.as_ref(),
            options.keep_all_tags,
        );

        match outcome {
            Ok(()) => Ok(result_path),
            Err(error) => {
                if !self.cleanup_on_error {
                    let kept = tmp_dir.into_path();
                    log::warn!(
                        "conversion failed, leaving {} in place for diagnosis",
                        kept.display()
                    );
                }
                Err(error)
            }
        }
    }

    fn run_pipeline(
        &self,
        tmp_dir: &Path,
        source: impl ElementSource,
        result_path: &Path,
        explode_tags: bool,
        ids_filter: Option<&OsmIdsFilter>,
        keep_all_tags: bool,
    ) -> Result<()> {
        let scattered = elements::scatter_elements(source, tmp_dir, self.compression)?;

        let prefiltered = prefilter::prefilter(
            &scattered,
            tmp_dir,
            &prefilter::PrefilterParams {
                geometry_filter: self.geometry_filter.as_ref(),
                tag_clauses: self.merged_clauses.as_ref(),
                ids_filter,
                rows_per_bucket: self.rows_per_bucket,
                compression: self.compression,
            },
        )?;

        let nodes_dir = nodes::emit_node_geometries(
            &scattered,
            &prefiltered.nodes_filtered,
            tmp_dir,
            self.compression,
        )?;
        delete_directories([&scattered.nodes_valid])?;

        let linestrings_dir = ways::build_way_linestrings(
            &prefiltered,
            tmp_dir,
            self.rows_per_bucket,
            self.compression,
        )?;
        delete_directories([&prefiltered.ways_refs_points, &scattered.ways_refs])?;

        let ways_dir = ways::emit_way_geometries(
            &scattered,
            &prefiltered,
            &linestrings_dir,
            &self.polygon_config,
            tmp_dir,
            self.compression,
        )?;

        let relations_dir = relations::emit_relation_geometries(
            &scattered,
            &prefiltered,
            &linestrings_dir,
            tmp_dir,
            self.rows_per_bucket,
            self.compression,
        )?;
        delete_directories([
            &linestrings_dir,
            &scattered.ways_all_tags,
            &scattered.relations_all_tags,
            &scattered.relations_refs,
            &prefiltered.nodes_filtered_dir,
            &prefiltered.ways_filtered_dir,
            &prefiltered.ways_required_dir,
            &prefiltered.relations_filtered_dir,
        ])?;

        let geometry_dirs = vec![nodes_dir, ways_dir, relations_dir];
        let projection = concat::TagProjection::plan(
            self.tags_filter.as_ref(),
            explode_tags,
            keep_all_tags,
            &geometry_dirs,
        )?;

        let tables = concat::concatenate_results(
            &geometry_dirs,
            tmp_dir,
            &projection,
            self.rows_per_bucket,
            self.compression,
        )?;
        delete_directories(&geometry_dirs)?;

        let table_dirs = [tables.valid_dir, tables.fixed_dir];
        let column_names = projection.column_names();
        let layout =
            crate::geoparquet::collect_final_layout(&table_dirs, column_names.as_deref())?;
        if layout.stats.total_rows == 0 {
            log::warn!("no features matched the filters; writing an empty GeoParquet file");
        }
        crate::geoparquet::write_final_geoparquet(&table_dirs, &layout, result_path)?;
        Ok(())
    }
}
