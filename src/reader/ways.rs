//! Bucketed way linestring construction and way geometry emission.
//!
//! The joined `(id, ref_idx, x, y)` point rows do not fit in memory for
//! country-scale extracts. Required ways are therefore assigned to buckets
//! of a bounded row count; point rows are routed to one on-disk partition
//! per bucket, and each bucket is then sorted and grouped in memory on its
//! own. Point order within a way follows `ref_idx` only, never the global
//! row order.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use ahash::{AHashMap, AHashSet};
use geo::{Coord, Geometry, LineString, Polygon};
use polars::prelude::{ParquetCompression, SortMultipleOptions};

use crate::common::data::{read_dir_concat, read_dir_frames, write_chunk, CHUNK_ROWS};
use crate::common::fs::delete_directories;
use crate::error::Result;
use crate::polygon_features::WayPolygonConfig;
use crate::reader::elements::{tags_from_json, ScatteredTables};
use crate::reader::prefilter::Prefiltered;
use crate::wkb;

const PARTITION_BUFFER_ROWS: usize = 16_384;

/// Build one linestring per required way, one parquet chunk per bucket.
///
/// The required set is a superset of the filtered set, so a single run
/// services both the way output and the relation assembly.
pub fn build_way_linestrings(
    prefiltered: &Prefiltered,
    tmp_dir: &Path,
    rows_per_bucket: usize,
    compression: ParquetCompression,
) -> Result<PathBuf> {
    let grouped_dir = tmp_dir.join("ways_grouped");
    let out_dir = tmp_dir.join("ways_linestrings");
    crate::common::fs::ensure_dir_exists(&out_dir)?;

    if prefiltered.ways_required.is_empty() {
        return Ok(out_dir);
    }

    // Bucket index per required way, from its rank in the sorted id list.
    let groups: AHashMap<i64, usize> = prefiltered
        .ways_required
        .iter()
        .enumerate()
        .map(|(rank, id)| (*id, rank / rows_per_bucket))
        .collect();
    let group_count = (prefiltered.ways_required.len() - 1) / rows_per_bucket + 1;

    route_points_to_groups(&prefiltered.ways_refs_points, &grouped_dir, &groups, group_count, compression)?;

    for group in 0..group_count {
        let group_dir = grouped_dir.join(format!("group={group}"));
        let Some(frame) = read_dir_concat(&group_dir)? else {
            delete_directories([&group_dir])?;
            continue;
        };
        let frame = frame.sort(["id", "ref_idx"], SortMultipleOptions::default())?;

        let ids = frame.column("id")?.i64()?;
        let xs = frame.column("x")?.f64()?;
        let ys = frame.column("y")?.f64()?;

        let mut out_ids: Vec<i64> = Vec::new();
        let mut out_wkbs: Vec<String> = Vec::new();
        let mut current: Option<(i64, Vec<Coord<f64>>)> = None;

        for row in 0..frame.height() {
            let (Some(id), Some(x), Some(y)) = (ids.get(row), xs.get(row), ys.get(row)) else {
                continue;
            };
            let extends_current = matches!(&current, Some((current_id, _)) if *current_id == id);
            if extends_current {
                if let Some((_, coords)) = current.as_mut() {
                    coords.push(Coord { x, y });
                }
            } else {
                if let Some((finished_id, coords)) = current.take() {
                    push_linestring(&mut out_ids, &mut out_wkbs, finished_id, coords)?;
                }
                current = Some((id, vec![Coord { x, y }]));
            }
        }
        if let Some((finished_id, coords)) = current.take() {
            push_linestring(&mut out_ids, &mut out_wkbs, finished_id, coords)?;
        }

        let df = polars::df!("id" => out_ids, "wkb" => out_wkbs)?;
        write_chunk(df, &out_dir, group, compression)?;
        delete_directories([&group_dir])?;
    }

    delete_directories([&grouped_dir])?;
    Ok(out_dir)
}

fn push_linestring(
    ids: &mut Vec<i64>,
    wkbs: &mut Vec<String>,
    id: i64,
    coords: Vec<Coord<f64>>,
) -> Result<()> {
    let geometry = Geometry::LineString(LineString::from(coords));
    ids.push(id);
    wkbs.push(hex::encode(wkb::write_geometry(&geometry)?));
    Ok(())
}

fn route_points_to_groups(
    points_dir: &Path,
    grouped_dir: &Path,
    groups: &AHashMap<i64, usize>,
    group_count: usize,
    compression: ParquetCompression,
) -> Result<()> {
    let mut seqs = vec![0usize; group_count];
    let mut ids: Vec<Vec<i64>> = vec![Vec::new(); group_count];
    let mut ref_idx: Vec<Vec<i64>> = vec![Vec::new(); group_count];
    let mut xs: Vec<Vec<f64>> = vec![Vec::new(); group_count];
    let mut ys: Vec<Vec<f64>> = vec![Vec::new(); group_count];

    let mut flush = |group: usize,
                     seqs: &mut Vec<usize>,
                     ids: &mut Vec<Vec<i64>>,
                     ref_idx: &mut Vec<Vec<i64>>,
                     xs: &mut Vec<Vec<f64>>,
                     ys: &mut Vec<Vec<f64>>|
     -> Result<()> {
        if ids[group].is_empty() {
            return Ok(());
        }
        let df = polars::df!(
            "id" => std::mem::take(&mut ids[group]),
            "ref_idx" => std::mem::take(&mut ref_idx[group]),
            "x" => std::mem::take(&mut xs[group]),
            "y" => std::mem::take(&mut ys[group]),
        )?;
        write_chunk(df, &grouped_dir.join(format!("group={group}")), seqs[group], compression)?;
        seqs[group] += 1;
        Ok(())
    };

    for frame in read_dir_frames(points_dir)? {
        let frame = frame?;
        let frame_ids = frame.column("id")?.i64()?;
        let frame_idx = frame.column("ref_idx")?.i64()?;
        let frame_xs = frame.column("x")?.f64()?;
        let frame_ys = frame.column("y")?.f64()?;
        for row in 0..frame.height() {
            let (Some(id), Some(idx), Some(x), Some(y)) =
                (frame_ids.get(row), frame_idx.get(row), frame_xs.get(row), frame_ys.get(row))
            else {
                continue;
            };
            let Some(&group) = groups.get(&id) else { continue };
            ids[group].push(id);
            ref_idx[group].push(idx);
            xs[group].push(x);
            ys[group].push(y);
            if ids[group].len() >= PARTITION_BUFFER_ROWS {
                flush(group, &mut seqs, &mut ids, &mut ref_idx, &mut xs, &mut ys)?;
            }
        }
    }
    for group in 0..group_count {
        flush(group, &mut seqs, &mut ids, &mut ref_idx, &mut xs, &mut ys)?;
    }
    Ok(())
}

/// Emit `way/<id>` features, classifying closed ways via the polygon rules.
pub fn emit_way_geometries(
    scattered: &ScatteredTables,
    prefiltered: &Prefiltered,
    linestrings_dir: &Path,
    polygon_config: &WayPolygonConfig,
    tmp_dir: &Path,
    compression: ParquetCompression,
) -> Result<PathBuf> {
    let out_dir = tmp_dir.join("geometry_ways");
    crate::common::fs::ensure_dir_exists(&out_dir)?;

    let way_tags = load_way_tags(scattered, &prefiltered.ways_filtered)?;

    let mut seq = 0usize;
    let mut feature_ids: Vec<String> = Vec::new();
    let mut tags_out: Vec<String> = Vec::new();
    let mut wkbs: Vec<String> = Vec::new();

    for frame in read_dir_frames(linestrings_dir)? {
        let frame = frame?;
        let ids = frame.column("id")?.i64()?;
        let lines = frame.column("wkb")?.str()?;
        for row in 0..frame.height() {
            let Some(id) = ids.get(row) else { continue };
            if !prefiltered.ways_filtered.contains(&id) {
                continue;
            }
            let Some((tags_json, raw_tags_json)) = way_tags.get(&id) else { continue };
            let Some(raw) = lines.get(row) else { continue };
            let Geometry::LineString(line) =
                wkb::read_geometry(&hex::decode(raw).map_err(internal)?)?
            else {
                continue;
            };

            let closed = crate::geometry::ring::is_closed(&line);
            let raw_tags: BTreeMap<String, String> = tags_from_json(raw_tags_json)?;
            let geometry = if polygon_config.is_polygon(closed, &raw_tags) {
                Geometry::Polygon(Polygon::new(line, Vec::new()))
            } else {
                Geometry::LineString(line)
            };

            feature_ids.push(format!("way/{id}"));
            tags_out.push(tags_json.clone());
            wkbs.push(hex::encode(wkb::write_geometry(&geometry)?));
            if feature_ids.len() >= CHUNK_ROWS {
                flush_ways(&out_dir, &mut seq, &mut feature_ids, &mut tags_out, &mut wkbs, compression)?;
            }
        }
    }
    flush_ways(&out_dir, &mut seq, &mut feature_ids, &mut tags_out, &mut wkbs, compression)?;
    Ok(out_dir)
}

fn load_way_tags(
    scattered: &ScatteredTables,
    ways_filtered: &AHashSet<i64>,
) -> Result<AHashMap<i64, (String, String)>> {
    let mut map: AHashMap<i64, (String, String)> = AHashMap::with_capacity(ways_filtered.len());
    for frame in read_dir_frames(&scattered.ways_all_tags)? {
        let frame = frame?;
        let ids = frame.column("id")?.i64()?;
        let tags = frame.column("tags")?.str()?;
        let raw_tags = frame.column("raw_tags")?.str()?;
        for row in 0..frame.height() {
            let Some(id) = ids.get(row) else { continue };
            if !ways_filtered.contains(&id) {
                continue;
            }
            if let (Some(t), Some(r)) = (tags.get(row), raw_tags.get(row)) {
                map.insert(id, (t.to_string(), r.to_string()));
            }
        }
    }
    Ok(map)
}

fn flush_ways(
    dir: &Path,
    seq: &mut usize,
    feature_ids: &mut Vec<String>,
    tags: &mut Vec<String>,
    wkbs: &mut Vec<String>,
    compression: ParquetCompression,
) -> Result<()> {
    if feature_ids.is_empty() && *seq > 0 {
        return Ok(());
    }
    let df = polars::df!(
        "feature_id" => std::mem::take(feature_ids),
        "tags" => std::mem::take(tags),
        "wkb" => std::mem::take(wkbs),
    )?;
    write_chunk(df, dir, *seq, compression)?;
    *seq += 1;
    Ok(())
}

fn internal(error: hex::FromHexError) -> crate::error::Error {
    crate::error::Error::Internal(error.to_string())
}
