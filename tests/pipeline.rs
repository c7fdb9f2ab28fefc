//! End-to-end conversions driven through the element-stream seam.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::path::{Path, PathBuf};

use arrow_array::{Array, BinaryArray, MapArray, RecordBatch, StringArray};
use geo::{polygon, Geometry, Validation};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use serde_json::json;

use pbf2parquet::{
    ConvertOptions, ElementKind, PbfFileReader, RawElement, RawMember, ReaderOptions, TagsFilter,
    VecElementSource,
};

fn node(id: i64, lon: f64, lat: f64, tags: &[(&str, &str)]) -> RawElement {
    RawElement::Node {
        id,
        lon,
        lat,
        tags: tags.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
    }
}

fn way(id: i64, refs: &[i64], tags: &[(&str, &str)]) -> RawElement {
    RawElement::Way {
        id,
        refs: refs.to_vec(),
        tags: tags.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
    }
}

fn relation(id: i64, members: &[(i64, &str)], tags: &[(&str, &str)]) -> RawElement {
    RawElement::Relation {
        id,
        members: members
            .iter()
            .map(|(ref_id, role)| RawMember {
                ref_id: *ref_id,
                kind: ElementKind::Way,
                role: role.to_string(),
            })
            .collect(),
        tags: tags.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
    }
}

/// A small world: one tagged node, one building way, one highway way, and a
/// forest multipolygon with a hole, built from three member ways.
fn world() -> Vec<RawElement> {
    let mut elements = vec![
        node(1, 7.4210001, 43.7310001, &[("amenity", "bench"), ("source", "survey")]),
        // Building square corners.
        node(10, 7.42, 43.73, &[]),
        node(11, 7.4201, 43.73, &[]),
        node(12, 7.4201, 43.7301, &[]),
        node(13, 7.42, 43.7301, &[]),
        // Highway endpooints, one with more than 7 decimals.
        node(20, 7.4219638499, 43.7311424499, &[]),
        node(21, 7.4230001, 43.7320001, &[]),
        // Outer ring corners of the forest relation.
        node(30, 7.40, 43.70, &[]),
        node(31, 7.41, 43.70, &[]),
        node(32, 7.41, 43.71, &[]),
        node(33, 7.40, 43.71, &[]),
        // Inner ring corners.
        node(40, 7.403, 43.703, &[]),
        node(41, 7.407, 43.703, &[]),
        node(42, 7.407, 43.707, &[]),
        node(43, 7.403, 43.707, &[]),
    ];
    elements.push(way(
        101,
        &[10, 11, 12, 13, 10],
        &[
            ("building", "apartments"),
            ("addr:city", "Monaco"),
            ("addr:country", "MC"),
            ("addr:housenumber", "1"),
            ("addr:postcode", "98000"),
            ("addr:street", "Rue"),
            ("building:levels", "3"),
        ],
    ));
    elements.push(way(102, &[20, 21], &[("highway", "primary"), ("name", "Avenue")]));
    // Outer ring split across two untagged ways, plus one closed inner way.
    elements.push(way(201, &[30, 31, 32], &[]));
    elements.push(way(202, &[32, 33, 30], &[]));
    elements.push(way(203, &[40, 41, 42, 43, 40], &[]));
    elements.push(relation(
        301,
        &[(201, "outer"), (202, "outer"), (203, "inner")],
        &[("type", "multipolygon"), ("landuse", "forest")],
    ));
    elements
}

fn reader(working_dir: &Path, tags_filter: Option<TagsFilter>) -> PbfFileReader {
    PbfFileReader::new(ReaderOptions {
        tags_filter,
        working_directory: working_dir.to_path_buf(),
        rows_per_bucket: Some(2),
        ..ReaderOptions::default()
    })
    .unwrap()
}

fn convert(
    reader: &PbfFileReader,
    elements: Vec<RawElement>,
    options: &ConvertOptions,
) -> PathBuf {
    reader
        .convert_source_to_geoparquet(
            VecElementSource(elements),
            Path::new("world.osm.pbf"),
            options,
        )
        .unwrap()
}

fn read_result(path: &Path) -> (Vec<RecordBatch>, serde_json::Value) {
    let file = File::open(path).unwrap();
    let builder = ParquetRecordBatchReaderBuilder::try_new(file).unwrap();
    let key_values = builder.metadata().file_metadata().key_value_metadata().unwrap();
    let geo_raw = key_values
        .iter()
        .find(|kv| kv.key == "geo")
        .and_then(|kv| kv.value.clone())
        .expect("geo metadata present");
    let geo: serde_json::Value = serde_json::from_str(&geo_raw).unwrap();
    let batches: Vec<RecordBatch> = builder.build().unwrap().map(|b| b.unwrap()).collect();
    (batches, geo)
}

fn string_column(batches: &[RecordBatch], name: &str) -> Vec<Option<String>> {
    let mut values = Vec::new();
    for batch in batches {
        let column = batch
            .column_by_name(name)
            .unwrap_or_else(|| panic!("column {name} missing"))
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap();
        for row in 0..column.len() {
            values.push(column.is_valid(row).then(|| column.value(row).to_string()));
        }
    }
    values
}

fn feature_ids(batches: &[RecordBatch]) -> Vec<String> {
    string_column(batches, "feature_id").into_iter().flatten().collect()
}

fn geometries(batches: &[RecordBatch]) -> Vec<Geometry<f64>> {
    let mut geometries = Vec::new();
    for batch in batches {
        let column =
            batch.column_by_name("geometry").unwrap().as_any().downcast_ref::<BinaryArray>().unwrap();
        for row in 0..column.len() {
            geometries.push(pbf2parquet::wkb::read_geometry(column.value(row)).unwrap());
        }
    }
    geometries
}

fn compact_tags(batches: &[RecordBatch]) -> Vec<BTreeMap<String, String>> {
    let mut rows = Vec::new();
    for batch in batches {
        let column =
            batch.column_by_name("tags").unwrap().as_any().downcast_ref::<MapArray>().unwrap();
        for row in 0..column.len() {
            let entries = column.value(row);
            let keys = entries.column(0).as_any().downcast_ref::<StringArray>().unwrap();
            let values = entries.column(1).as_any().downcast_ref::<StringArray>().unwrap();
            let mut tags = BTreeMap::new();
            for entry in 0..keys.len() {
                tags.insert(keys.value(entry).to_string(), values.value(entry).to_string());
            }
            rows.push(tags);
        }
    }
    rows
}

fn column_names(batches: &[RecordBatch]) -> Vec<String> {
    batches[0].schema().fields().iter().map(|f| f.name().clone()).collect()
}

#[test]
fn unfiltered_conversion_emits_all_feature_kinds() {
    let tmp = tempfile::tempdir().unwrap();
    let reader = reader(tmp.path(), None);
    let path = convert(&reader, world(), &ConvertOptions::default());
    assert!(path.file_name().unwrap().to_string_lossy().contains("nofilter_noclip_compact"));

    let (batches, geo) = read_result(&path);
    let ids = feature_ids(&batches);
    let unique: BTreeSet<&String> = ids.iter().collect();
    assert_eq!(ids.len(), unique.len(), "feature ids are unique");
    assert_eq!(
        unique.iter().map(|s| s.as_str()).collect::<BTreeSet<_>>(),
        ["node/1", "way/101", "way/102", "relation/301"].into_iter().collect::<BTreeSet<_>>()
    );

    let by_id: BTreeMap<String, Geometry<f64>> =
        ids.iter().cloned().zip(geometries(&batches)).collect();
    assert!(matches!(by_id["node/1"], Geometry::Point(_)));
    assert!(matches!(by_id["way/101"], Geometry::Polygon(_)));
    assert!(matches!(by_id["way/102"], Geometry::LineString(_)));
    let Geometry::MultiPolygon(forest) = &by_id["relation/301"] else {
        panic!("relation should assemble into a multipolygon");
    };
    assert_eq!(forest.0.len(), 1);
    assert_eq!(forest.0[0].interiors().len(), 1, "inner ring becomes a hole");

    for geometry in by_id.values() {
        assert!(geometry.is_valid());
    }

    let types: BTreeSet<&str> = geo["columns"]["geometry"]["geometry_types"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap())
        .collect();
    assert_eq!(
        types,
        ["Point", "Polygon", "LineString", "MultiPolygon"].into_iter().collect::<BTreeSet<_>>()
    );
    assert_eq!(geo["version"], "1.1.0");
    assert_eq!(geo["primary_column"], "geometry");
    assert_eq!(geo["columns"]["geometry"]["encoding"], "WKB");

    let bbox: Vec<f64> =
        geo["columns"]["geometry"]["bbox"].as_array().unwrap().iter().map(|v| v.as_f64().unwrap()).collect();
    let expected = [7.40, 43.70, 7.4230001, 43.7320001];
    for (actual, expected) in bbox.iter().zip(expected) {
        assert!((actual - expected).abs() < 1e-8, "bbox {bbox:?}");
    }
}

#[test]
fn coordinates_are_rounded_and_tags_normalized() {
    let tmp = tempfile::tempdir().unwrap();
    let reader = reader(tmp.path(), None);
    let path = convert(&reader, world(), &ConvertOptions::default());
    let (batches, _) = read_result(&path);

    for geometry in geometries(&batches) {
        use geo::CoordsIter;
        // Overlay output may sit a hair off the grid; original coordinates
        // are exactly on it.
        let exact = !matches!(geometry, Geometry::MultiPolygon(_));
        for coord in geometry.coords_iter() {
            let snapped = ((coord.x * 1e7).round() / 1e7, (coord.y * 1e7).round() / 1e7);
            if exact {
                assert_eq!((coord.x, coord.y), snapped);
            } else {
                assert!((coord.x - snapped.0).abs() < 1e-8);
                assert!((coord.y - snapped.1).abs() < 1e-8);
            }
        }
    }

    let ids = feature_ids(&batches);
    let tags = compact_tags(&batches);
    let bench = ids.iter().position(|id| id == "node/1").unwrap();
    assert_eq!(tags[bench].get("amenity").map(String::as_str), Some("bench"));
    assert!(!tags[bench].contains_key("source"), "ignored keys are dropped");
}

#[test]
fn conversion_is_deterministic() {
    let tmp = tempfile::tempdir().unwrap();
    let reader = reader(tmp.path(), None);
    let first = convert(
        &reader,
        world(),
        &ConvertOptions {
            result_file_path: Some(tmp.path().join("a.geoparquet")),
            ..ConvertOptions::default()
        },
    );
    let second = convert(
        &reader,
        world(),
        &ConvertOptions {
            result_file_path: Some(tmp.path().join("b.geoparquet")),
            ..ConvertOptions::default()
        },
    );

    let (batches_a, geo_a) = read_result(&first);
    let (batches_b, geo_b) = read_result(&second);
    assert_eq!(feature_ids(&batches_a), feature_ids(&batches_b));
    assert_eq!(geo_a, geo_b);
}

#[test]
fn tag_filter_explodes_filter_keys_into_columns() {
    let tmp = tempfile::tempdir().unwrap();
    let filter = TagsFilter::from_json(&json!({"building": true})).unwrap();
    let reader = reader(tmp.path(), Some(filter));
    let path = convert(&reader, world(), &ConvertOptions::default());
    assert!(path.file_name().unwrap().to_string_lossy().contains("_exploded"));

    let (batches, _) = read_result(&path);
    assert_eq!(feature_ids(&batches), vec!["way/101".to_string()]);
    assert_eq!(column_names(&batches), vec!["feature_id", "building", "geometry"]);
    assert_eq!(
        string_column(&batches, "building"),
        vec![Some("apartments".to_string())]
    );
}

#[test]
fn grouped_filter_emits_first_match_group_column() {
    let tmp = tempfile::tempdir().unwrap();
    let filter = TagsFilter::from_json(&json!({
        "group": {"building": true, "highway": ["primary", "secondary"], "amenity": "bench"}
    }))
    .unwrap();
    let reader = reader(tmp.path(), Some(filter));
    let path = convert(&reader, world(), &ConvertOptions::default());

    let (batches, _) = read_result(&path);
    assert_eq!(column_names(&batches), vec!["feature_id", "group", "geometry"]);
    let ids = feature_ids(&batches);
    let groups = string_column(&batches, "group");
    let by_id: BTreeMap<String, Option<String>> = ids.into_iter().zip(groups).collect();
    assert_eq!(by_id["node/1"], Some("amenity=bench".to_string()));
    assert_eq!(by_id["way/101"], Some("building=apartments".to_string()));
    assert_eq!(by_id["way/102"], Some("highway=primary".to_string()));
    assert!(!by_id.contains_key("relation/301"), "non-matching rows are absent");
}

#[test]
fn id_filter_restricts_rows_and_keep_all_tags_widens_columns() {
    let tmp = tempfile::tempdir().unwrap();
    let filter = TagsFilter::from_json(&json!({"building": "apartments"})).unwrap();
    let ids = vec!["way/101".to_string()];

    let reader = reader(tmp.path(), Some(filter));
    let narrow = convert(
        &reader,
        world(),
        &ConvertOptions { filter_osm_ids: ids.clone(), ..ConvertOptions::default() },
    );
    let (batches, _) = read_result(&narrow);
    assert_eq!(feature_ids(&batches), vec!["way/101".to_string()]);
    assert_eq!(column_names(&batches), vec!["feature_id", "building", "geometry"]);

    // Exploding stays the default while a tag filter is present; keeping all
    // tags only widens the column set to every observed key.
    let wide = convert(
        &reader,
        world(),
        &ConvertOptions {
            result_file_path: Some(tmp.path().join("wide.geoparquet")),
            filter_osm_ids: ids.clone(),
            keep_all_tags: true,
            ..ConvertOptions::default()
        },
    );
    let (batches, _) = read_result(&wide);
    assert_eq!(feature_ids(&batches), vec!["way/101".to_string()]);
    assert_eq!(
        column_names(&batches),
        vec![
            "feature_id",
            "addr:city",
            "addr:country",
            "addr:housenumber",
            "addr:postcode",
            "addr:street",
            "building",
            "building:levels",
            "geometry"
        ]
    );
    assert_eq!(
        string_column(&batches, "building"),
        vec![Some("apartments".to_string())]
    );

    let wide_compact = convert(
        &reader,
        world(),
        &ConvertOptions {
            result_file_path: Some(tmp.path().join("wide_compact.geoparquet")),
            explode_tags: Some(false),
            filter_osm_ids: ids,
            keep_all_tags: true,
            ..ConvertOptions::default()
        },
    );
    let (batches, _) = read_result(&wide_compact);
    assert_eq!(feature_ids(&batches), vec!["way/101".to_string()]);
    let tags = compact_tags(&batches);
    let keys: BTreeSet<&str> = tags[0].keys().map(String::as_str).collect();
    assert_eq!(
        keys,
        [
            "addr:city",
            "addr:country",
            "addr:housenumber",
            "addr:postcode",
            "addr:street",
            "building",
            "building:levels"
        ]
        .into_iter()
        .collect::<BTreeSet<_>>()
    );
}

#[test]
fn empty_input_writes_valid_empty_file() {
    let tmp = tempfile::tempdir().unwrap();
    let reader = reader(tmp.path(), None);
    let path = convert(&reader, Vec::new(), &ConvertOptions::default());

    let (batches, geo) = read_result(&path);
    assert!(feature_ids(&batches).is_empty());
    assert_eq!(geo["version"], "1.1.0");
    assert_eq!(geo["primary_column"], "geometry");
    assert_eq!(
        geo["columns"]["geometry"]["bbox"].as_array().unwrap().len(),
        4
    );
}

#[test]
fn geometry_filter_keeps_touching_features_only() {
    let tmp = tempfile::tempdir().unwrap();
    // Covers the bench, the building and one highway endpoint, not the forest.
    let clip: Geometry<f64> = polygon![
        (x: 7.419, y: 43.729),
        (x: 7.422, y: 43.729),
        (x: 7.422, y: 43.7315),
        (x: 7.419, y: 43.7315),
        (x: 7.419, y: 43.729)
    ]
    .into();

    let reader = PbfFileReader::new(ReaderOptions {
        geometry_filter: Some(clip),
        working_directory: tmp.path().to_path_buf(),
        rows_per_bucket: Some(2),
        ..ReaderOptions::default()
    })
    .unwrap();

    let path = convert(&reader, world(), &ConvertOptions::default());
    assert!(path.file_name().unwrap().to_string_lossy().contains("_compact"));
    assert!(!path.file_name().unwrap().to_string_lossy().contains("noclip"));

    let (batches, _) = read_result(&path);
    let ids: BTreeSet<String> = feature_ids(&batches).into_iter().collect();
    assert!(ids.contains("node/1"));
    assert!(ids.contains("way/101"));
    // One highway endpoint is inside the clip polygon.
    assert!(ids.contains("way/102"));
    assert!(!ids.contains("relation/301"));
}

#[test]
fn self_intersecting_polygons_are_repaired() {
    let tmp = tempfile::tempdir().unwrap();
    let mut elements = vec![
        node(50, 0.0, 0.0, &[]),
        node(51, 2.0, 2.0, &[]),
        node(52, 2.0, 0.0, &[]),
        node(53, 0.0, 2.0, &[]),
    ];
    // A closed bowtie ring tagged as a building.
    elements.push(way(500, &[50, 51, 52, 53, 50], &[("building", "yes")]));

    let reader = reader(tmp.path(), None);
    let path = convert(&reader, elements, &ConvertOptions::default());
    let (batches, _) = read_result(&path);
    assert_eq!(feature_ids(&batches), vec!["way/500".to_string()]);
    for geometry in geometries(&batches) {
        assert!(geometry.is_valid(), "repaired geometry is valid");
    }
}

#[test]
fn open_outer_rings_drop_the_relation_only() {
    let tmp = tempfile::tempdir().unwrap();
    let mut elements = vec![
        node(60, 0.0, 0.0, &[("amenity", "bench")]),
        node(61, 1.0, 0.0, &[]),
        node(62, 1.0, 1.0, &[]),
    ];
    elements.push(way(600, &[60, 61, 62], &[]));
    elements.push(relation(
        700,
        &[(600, "outer")],
        &[("type", "multipolygon"), ("landuse", "forest")],
    ));

    let reader = reader(tmp.path(), None);
    let path = convert(&reader, elements, &ConvertOptions::default());
    let (batches, _) = read_result(&path);
    let ids: BTreeSet<String> = feature_ids(&batches).into_iter().collect();
    assert!(ids.contains("node/60"));
    assert!(!ids.contains("relation/700"));
}

#[test]
fn dangling_way_references_invalidate_the_way() {
    let tmp = tempfile::tempdir().unwrap();
    let mut elements = vec![node(70, 0.0, 0.0, &[]), node(71, 1.0, 1.0, &[])];
    // Way 801 references node 99 which does not exist.
    elements.push(way(800, &[70, 71], &[("highway", "primary")]));
    elements.push(way(801, &[70, 99], &[("highway", "primary")]));

    let reader = reader(tmp.path(), None);
    let path = convert(&reader, elements, &ConvertOptions::default());
    let (batches, _) = read_result(&path);
    assert_eq!(feature_ids(&batches), vec!["way/800".to_string()]);
}

#[test]
fn missing_pbf_file_is_input_not_readable() {
    let tmp = tempfile::tempdir().unwrap();
    let reader = reader(tmp.path(), None);
    let error = reader
        .convert_pbf_to_geoparquet(&tmp.path().join("missing.osm.pbf"), &ConvertOptions::default())
        .unwrap_err();
    assert!(matches!(error, pbf2parquet::Error::InputNotReadable { .. }));
}
