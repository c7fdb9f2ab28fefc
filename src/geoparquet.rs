//! Final GeoParquet emission.
//!
//! Streams the valid and repaired feature tables into one parquet file with
//! WKB geometries, 100 000-row row groups and a `geo` schema-metadata key
//! describing the geometry column, its CRS and its bounding box.

use std::collections::BTreeSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow_array::builder::{BinaryBuilder, MapBuilder, StringBuilder};
use arrow_array::{Array, ArrayRef, RecordBatch};
use arrow_schema::{DataType, Field, Schema};
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, ZstdLevel};
use parquet::file::properties::WriterProperties;
use parquet::format::KeyValue;
use serde_json::json;

use crate::common::data::read_dir_frames;
use crate::error::{Error, Result};
use crate::reader::elements::tags_from_json;
use crate::wkb;

/// Row-group size of the final file.
const RESULT_ROW_GROUP_SIZE: usize = 100_000;

/// Aggregate geometry statistics for the `geo` metadata document.
#[derive(Debug, Clone, Default)]
pub struct GeometryStats {
    pub total_rows: u64,
    pub geometry_types: BTreeSet<&'static str>,
    pub bbox: Option<[f64; 4]>,
}

impl GeometryStats {
    fn include(&mut self, geometry: &geo::Geometry<f64>) {
        use geo::BoundingRect;

        self.total_rows += 1;
        self.geometry_types.insert(wkb::geometry_type_name(geometry));
        if let Some(rect) = geometry.bounding_rect() {
            let bbox = self.bbox.get_or_insert([f64::MAX, f64::MAX, f64::MIN, f64::MIN]);
            bbox[0] = bbox[0].min(rect.min().x);
            bbox[1] = bbox[1].min(rect.min().y);
            bbox[2] = bbox[2].max(rect.max().x);
            bbox[3] = bbox[3].max(rect.max().y);
        }
    }
}

/// Columns kept in the final schema after pruning, plus the row statistics.
pub struct FinalLayout {
    pub tag_columns: Vec<String>,
    pub compact: bool,
    pub stats: GeometryStats,
}

/// Scan the concatenated tables once: geometry statistics and the set of
/// tag columns that are not entirely null.
pub fn collect_final_layout(
    table_dirs: &[PathBuf],
    tag_columns: Option<&[String]>,
) -> Result<FinalLayout> {
    let mut stats = GeometryStats::default();
    let compact = tag_columns.is_none();
    let candidates: Vec<String> = tag_columns.map(<[String]>::to_vec).unwrap_or_default();
    let mut non_null = vec![0u64; candidates.len()];

    for dir in table_dirs {
        for frame in read_dir_frames(dir)? {
            let frame = frame?;
            let wkbs = frame.column("wkb")?.str()?;
            for row in 0..frame.height() {
                let raw = wkbs.get(row).unwrap_or_default();
                let geometry = wkb::read_geometry(
                    &hex::decode(raw).map_err(|e| Error::Internal(e.to_string()))?,
                )?;
                stats.include(&geometry);
            }
            for (index, name) in candidates.iter().enumerate() {
                let column = frame.column(name.as_str())?;
                non_null[index] += (column.len() - column.null_count()) as u64;
            }
        }
    }

    // Entirely-null columns are dropped from the result schema.
    let kept: Vec<String> = candidates
        .into_iter()
        .zip(non_null)
        .filter(|(_, count)| *count > 0)
        .map(|(name, _)| name)
        .collect();

    Ok(FinalLayout { tag_columns: kept, compact, stats })
}

/// Write the final GeoParquet file from the concatenated tables.
pub fn write_final_geoparquet(
    table_dirs: &[PathBuf],
    layout: &FinalLayout,
    result_path: &Path,
) -> Result<()> {
    if let Some(parent) = result_path.parent() {
        crate::common::fs::ensure_dir_exists(parent)?;
    }

    let schema = Arc::new(final_schema(layout));
    let properties = WriterProperties::builder()
        .set_compression(Compression::ZSTD(ZstdLevel::try_new(4)?))
        .set_max_row_group_size(RESULT_ROW_GROUP_SIZE)
        .build();

    let file = File::create(result_path).map_err(|e| Error::intermediate(result_path, e))?;
    let mut writer = ArrowWriter::try_new(file, schema.clone(), Some(properties))?;

    for dir in table_dirs {
        for frame in read_dir_frames(dir)? {
            let frame = frame?;
            if frame.height() == 0 {
                continue;
            }
            let batch = frame_to_batch(&frame, layout, &schema)?;
            writer.write(&batch)?;
        }
    }

    writer.append_key_value_metadata(KeyValue {
        key: "geo".to_string(),
        value: Some(geo_metadata_json(&layout.stats)),
    });
    writer.finish()?;
    Ok(())
}

fn final_schema(layout: &FinalLayout) -> Schema {
    let mut fields = vec![Field::new("feature_id", DataType::Utf8, false)];
    if layout.compact {
        fields.push(Field::new("tags", tags_map_data_type(), true));
    } else {
        for name in &layout.tag_columns {
            fields.push(Field::new(name.as_str(), DataType::Utf8, true));
        }
    }
    fields.push(Field::new("geometry", DataType::Binary, false));
    Schema::new(fields)
}

/// The arrow Map type exactly as `MapBuilder` produces it, probed from an
/// empty builder so the schema always matches the built arrays.
fn tags_map_data_type() -> DataType {
    MapBuilder::new(None, StringBuilder::new(), StringBuilder::new())
        .finish()
        .data_type()
        .clone()
}

fn frame_to_batch(
    frame: &polars::frame::DataFrame,
    layout: &FinalLayout,
    schema: &Arc<Schema>,
) -> Result<RecordBatch> {
    let height = frame.height();
    let mut arrays: Vec<ArrayRef> = Vec::new();

    let feature_ids = frame.column("feature_id")?.str()?;
    let mut feature_builder = StringBuilder::new();
    for row in 0..height {
        feature_builder.append_value(feature_ids.get(row).unwrap_or_default());
    }
    arrays.push(Arc::new(feature_builder.finish()));

    if layout.compact {
        let tags = frame.column("tags")?.str()?;
        let mut builder = MapBuilder::new(None, StringBuilder::new(), StringBuilder::new());
        for row in 0..height {
            for (key, value) in tags_from_json(tags.get(row).unwrap_or("{}"))? {
                builder.keys().append_value(key);
                builder.values().append_value(value);
            }
            builder.append(true)?;
        }
        arrays.push(Arc::new(builder.finish()));
    } else {
        for name in &layout.tag_columns {
            let column = frame.column(name.as_str())?.str()?;
            let mut builder = StringBuilder::new();
            for row in 0..height {
                match column.get(row) {
                    Some(value) => builder.append_value(value),
                    None => builder.append_null(),
                }
            }
            arrays.push(Arc::new(builder.finish()));
        }
    }

    let wkbs = frame.column("wkb")?.str()?;
    let mut geometry_builder = BinaryBuilder::new();
    for row in 0..height {
        let raw = wkbs.get(row).unwrap_or_default();
        geometry_builder
            .append_value(hex::decode(raw).map_err(|e| Error::Internal(e.to_string()))?);
    }
    arrays.push(Arc::new(geometry_builder.finish()));

    Ok(RecordBatch::try_new(schema.clone(), arrays)?)
}

/// The `geo` metadata document: GeoParquet 1.1.0, WKB encoding, CRS84.
fn geo_metadata_json(stats: &GeometryStats) -> String {
    let bbox = stats.bbox.unwrap_or([0.0, 0.0, 0.0, 0.0]);
    let geometry_types: Vec<&str> = stats.geometry_types.iter().copied().collect();
    json!({
        "version": "1.1.0",
        "primary_column": "geometry",
        "columns": {
            "geometry": {
                "encoding": "WKB",
                "crs": crs84_projjson(),
                "geometry_types": geometry_types,
                "bbox": bbox,
            }
        },
        "creator": {
            "library": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        },
    })
    .to_string()
}

/// PROJJSON description of OGC:CRS84, WGS84 longitude-latitude.
fn crs84_projjson() -> serde_json::Value {
    json!({
        "$schema": "https://proj.org/schemas/v0.5/projjson.schema.json",
        "type": "GeographicCRS",
        "name": "WGS 84 longitude-latitude",
        "datum": {
            "type": "GeodeticReferenceFrame",
            "name": "World Geodetic System 1984",
            "ellipsoid": {
                "name": "WGS 84",
                "semi_major_axis": 6378137,
                "inverse_flattening": 298.257223563
            }
        },
        "coordinate_system": {
            "subtype": "ellipsoidal",
            "axis": [
                {
                    "name": "Geodetic longitude",
                    "abbreviation": "Lon",
                    "direction": "east",
                    "unit": "degree"
                },
                {
                    "name": "Geodetic latitude",
                    "abbreviation": "Lat",
                    "direction": "north",
                    "unit": "degree"
                }
            ]
        },
        "id": {"authority": "OGC", "code": "CRS84"}
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{Geometry, Point};

    #[test]
    fn stats_accumulate_bbox_and_types() {
        let mut stats = GeometryStats::default();
        stats.include(&Geometry::Point(Point::new(1.0, 2.0)));
        stats.include(&Geometry::Point(Point::new(-3.0, 5.0)));
        assert_eq!(stats.total_rows, 2);
        assert_eq!(stats.bbox, Some([-3.0, 2.0, 1.0, 5.0]));
        assert!(stats.geometry_types.contains("Point"));
    }

    #[test]
    fn metadata_document_has_required_fields() {
        let mut stats = GeometryStats::default();
        stats.include(&Geometry::Point(Point::new(1.0, 2.0)));
        let raw = geo_metadata_json(&stats);
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed["version"], "1.1.0");
        assert_eq!(parsed["primary_column"], "geometry");
        assert_eq!(parsed["columns"]["geometry"]["encoding"], "WKB");
        assert_eq!(parsed["columns"]["geometry"]["crs"]["id"]["code"], "CRS84");
        assert_eq!(parsed["creator"]["library"], "pbf2parquet");
    }
}
