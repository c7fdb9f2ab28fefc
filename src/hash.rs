//! Deterministic result-file naming.
//!
//! When the caller does not pick an output path, the file name is a pure
//! function of the conversion inputs:
//! `<stem>_<tagHash>_<geomHash>_<exploded|compact>[_<idsHash>].geoparquet`.

use std::collections::BTreeSet;
use std::path::Path;

use geo::Geometry;
use sha2::{Digest, Sha256};
use wkt::ToWkt;

use crate::filter::TagsFilter;

/// Derive the result file name from the conversion inputs.
pub fn result_file_name(
    pbf_path: &Path,
    tags_filter: Option<&TagsFilter>,
    geometry_filter: Option<&Geometry<f64>>,
    explode_tags: bool,
    filter_osm_ids: &[String],
) -> String {
    let file_name = pbf_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = file_name.strip_suffix(".osm.pbf").unwrap_or(&file_name);

    let tags_part = match tags_filter {
        Some(filter) => sha256_hex(filter.to_json().to_string().as_bytes()),
        None => "nofilter".to_string(),
    };

    let clip_part = match geometry_filter {
        Some(geometry) => sha256_hex(geometry.wkt_string().as_bytes()),
        None => "noclip".to_string(),
    };

    let exploded_part = if explode_tags { "exploded" } else { "compact" };

    let ids_part = if filter_osm_ids.is_empty() {
        String::new()
    } else {
        let sorted: BTreeSet<&str> = filter_osm_ids.iter().map(String::as_str).collect();
        let serialized = serde_json::to_string(&sorted).expect("string list serializes");
        format!("_{}", sha256_hex(serialized.as_bytes()))
    };

    format!("{stem}_{tags_part}_{clip_part}_{exploded_part}{ids_part}.geoparquet")
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{polygon, Geometry};
    use serde_json::json;
    use std::path::PathBuf;

    #[test]
    fn unfiltered_name_uses_placeholders() {
        let name = result_file_name(&PathBuf::from("monaco.osm.pbf"), None, None, false, &[]);
        assert_eq!(name, "monaco_nofilter_noclip_compact.geoparquet");
    }

    #[test]
    fn naming_is_idempotent() {
        let filter = TagsFilter::from_json(&json!({"building": true})).unwrap();
        let geometry: Geometry<f64> =
            polygon![(x: 0.0, y: 0.0), (x: 1.0, y: 0.0), (x: 1.0, y: 1.0), (x: 0.0, y: 0.0)]
                .into();
        let ids = vec!["way/1".to_string()];
        let a = result_file_name(
            &PathBuf::from("x.osm.pbf"),
            Some(&filter),
            Some(&geometry),
            true,
            &ids,
        );
        let b = result_file_name(
            &PathBuf::from("x.osm.pbf"),
            Some(&filter),
            Some(&geometry),
            true,
            &ids,
        );
        assert_eq!(a, b);
        assert!(a.starts_with("x_"));
        assert!(a.contains("_exploded_"));
        assert!(a.ends_with(".geoparquet"));
    }

    #[test]
    fn different_filters_yield_different_names() {
        let a = TagsFilter::from_json(&json!({"building": true})).unwrap();
        let b = TagsFilter::from_json(&json!({"highway": true})).unwrap();
        let path = PathBuf::from("x.osm.pbf");
        assert_ne!(
            result_file_name(&path, Some(&a), None, true, &[]),
            result_file_name(&path, Some(&b), None, true, &[])
        );
    }

    #[test]
    fn id_order_does_not_change_the_name() {
        let path = PathBuf::from("x.osm.pbf");
        let forward = vec!["node/1".to_string(), "way/2".to_string()];
        let backward = vec!["way/2".to_string(), "node/1".to_string()];
        assert_eq!(
            result_file_name(&path, None, None, false, &forward),
            result_file_name(&path, None, None, false, &backward)
        );
    }
}
