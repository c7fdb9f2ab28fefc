//! Multipolygon assembly for filtered relations.
//!
//! Members are joined to their way linestrings in `ref_idx` order, merged
//! into rings per role, and reconciled: inner rings become holes subtracted
//! from the outer rings that contain them. Relations whose outer rings do
//! not close are skipped, never fatal. Relations are processed in bounded
//! buckets so member geometries of one bucket only are held in memory.

use std::path::{Path, PathBuf};

use ahash::{AHashMap, AHashSet};
use geo::{BooleanOps, Contains, Geometry, LineString, MultiPolygon, Polygon};
use polars::prelude::ParquetCompression;

use crate::common::data::{read_dir_frames, write_chunk, CHUNK_ROWS};
use crate::error::Result;
use crate::geometry::ring::{is_closed, merge_lines};
use crate::geometry::validity::make_valid_multi_polygon;
use crate::reader::elements::ScatteredTables;
use crate::reader::prefilter::Prefiltered;
use crate::wkb;

/// Merged ring parts shorter than this are discarded.
const MIN_RING_POINTS: usize = 4;

struct Member {
    ref_idx: i64,
    way_id: i64,
    role: String,
}

/// Emit `relation/<id>` multipolygon features.
pub fn emit_relation_geometries(
    scattered: &ScatteredTables,
    prefiltered: &Prefiltered,
    linestrings_dir: &Path,
    tmp_dir: &Path,
    rows_per_bucket: usize,
    compression: ParquetCompression,
) -> Result<PathBuf> {
    let out_dir = tmp_dir.join("geometry_relations");
    crate::common::fs::ensure_dir_exists(&out_dir)?;

    if prefiltered.relations_filtered.is_empty() {
        return Ok(out_dir);
    }

    let relation_tags = load_relation_tags(scattered, &prefiltered.relations_filtered)?;
    let mut members = load_members(scattered, &prefiltered.relations_filtered)?;
    for list in members.values_mut() {
        list.sort_by_key(|member| member.ref_idx);
    }

    let mut relation_ids: Vec<i64> = members.keys().copied().collect();
    relation_ids.sort_unstable();

    let mut seq = 0usize;
    let mut feature_ids: Vec<String> = Vec::new();
    let mut tags_out: Vec<String> = Vec::new();
    let mut wkbs: Vec<String> = Vec::new();

    for bucket in relation_ids.chunks(rows_per_bucket.max(1)) {
        let needed_ways: AHashSet<i64> = bucket
            .iter()
            .flat_map(|id| members[id].iter().map(|member| member.way_id))
            .collect();
        let way_lines = load_way_lines(linestrings_dir, &needed_ways)?;

        for relation_id in bucket {
            let Some(geometry) = assemble_relation(&members[relation_id], &way_lines) else {
                log::warn!("relation/{relation_id} has no closed outer ring, skipping");
                continue;
            };
            let tags = relation_tags.get(relation_id).cloned().unwrap_or_else(|| "{}".to_string());
            feature_ids.push(format!("relation/{relation_id}"));
            tags_out.push(tags);
            wkbs.push(hex::encode(wkb::write_geometry(&Geometry::MultiPolygon(geometry))?));
            if feature_ids.len() >= CHUNK_ROWS {
                flush(&out_dir, &mut seq, &mut feature_ids, &mut tags_out, &mut wkbs, compression)?;
            }
        }
    }
    flush(&out_dir, &mut seq, &mut feature_ids, &mut tags_out, &mut wkbs, compression)?;
    Ok(out_dir)
}

/// Reconcile one relation's members into a multipolygon.
///
/// Returns `None` when the relation has no outer ring or any outer ring
/// stays open after merging.
fn assemble_relation(
    members: &[Member],
    way_lines: &AHashMap<i64, LineString<f64>>,
) -> Option<MultiPolygon<f64>> {
    // Members are treated as outer only when no member is explicitly outer.
    let any_outer = members.iter().any(|member| member.role == "outer");

    let mut outer_lines: Vec<LineString<f64>> = Vec::new();
    let mut inner_lines: Vec<LineString<f64>> = Vec::new();
    for member in members {
        let Some(line) = way_lines.get(&member.way_id) else { continue };
        let role = if any_outer { member.role.as_str() } else { "outer" };
        match role {
            "outer" => outer_lines.push(line.clone()),
            "inner" => inner_lines.push(line.clone()),
            _ => {}
        }
    }

    let outer_rings: Vec<LineString<f64>> = merge_lines(outer_lines)
        .into_iter()
        .filter(|line| line.0.len() >= MIN_RING_POINTS)
        .collect();
    let inner_rings: Vec<LineString<f64>> = merge_lines(inner_lines)
        .into_iter()
        .filter(|line| line.0.len() >= MIN_RING_POINTS)
        .collect();

    if outer_rings.is_empty() || !outer_rings.iter().all(is_closed) {
        return None;
    }

    // Malformed rings are common; repair both part sets before overlaying.
    let outer_parts: Vec<MultiPolygon<f64>> = outer_rings
        .into_iter()
        .map(|ring| make_valid_multi_polygon(MultiPolygon::new(vec![Polygon::new(ring, Vec::new())])))
        .collect();
    let inner_parts: Vec<MultiPolygon<f64>> = inner_rings
        .into_iter()
        .filter(is_closed)
        .map(|ring| make_valid_multi_polygon(MultiPolygon::new(vec![Polygon::new(ring, Vec::new())])))
        .collect();

    let mut assembled: Option<MultiPolygon<f64>> = None;
    for outer in outer_parts {
        let mut hole_union: Option<MultiPolygon<f64>> = None;
        for inner in inner_parts.iter().filter(|inner| outer.contains(*inner)) {
            hole_union = Some(match hole_union {
                Some(acc) => acc.union(inner),
                None => inner.clone(),
            });
        }
        let with_holes = match hole_union {
            Some(holes) => outer.difference(&holes),
            None => outer,
        };
        assembled = Some(match assembled {
            Some(acc) => acc.union(&with_holes),
            None => with_holes,
        });
    }
    assembled
}

fn load_relation_tags(
    scattered: &ScatteredTables,
    relations_filtered: &AHashSet<i64>,
) -> Result<AHashMap<i64, String>> {
    let mut map = AHashMap::with_capacity(relations_filtered.len());
    for frame in read_dir_frames(&scattered.relations_all_tags)? {
        let frame = frame?;
        let ids = frame.column("id")?.i64()?;
        let tags = frame.column("tags")?.str()?;
        for row in 0..frame.height() {
            let Some(id) = ids.get(row) else { continue };
            if !relations_filtered.contains(&id) {
                continue;
            }
            if let Some(value) = tags.get(row) {
                map.insert(id, value.to_string());
            }
        }
    }
    Ok(map)
}

fn load_members(
    scattered: &ScatteredTables,
    relations_filtered: &AHashSet<i64>,
) -> Result<AHashMap<i64, Vec<Member>>> {
    let mut members: AHashMap<i64, Vec<Member>> = AHashMap::new();
    for frame in read_dir_frames(&scattered.relations_refs)? {
        let frame = frame?;
        let ids = frame.column("id")?.i64()?;
        let refs = frame.column("ref")?.i64()?;
        let roles = frame.column("ref_role")?.str()?;
        let ref_idx = frame.column("ref_idx")?.i64()?;
        for row in 0..frame.height() {
            let (Some(id), Some(way_id), Some(idx)) =
                (ids.get(row), refs.get(row), ref_idx.get(row))
            else {
                continue;
            };
            if !relations_filtered.contains(&id) {
                continue;
            }
            members.entry(id).or_default().push(Member {
                ref_idx: idx,
                way_id,
                role: roles.get(row).unwrap_or_default().to_string(),
            });
        }
    }
    Ok(members)
}

fn load_way_lines(
    linestrings_dir: &Path,
    needed: &AHashSet<i64>,
) -> Result<AHashMap<i64, LineString<f64>>> {
    let mut lines = AHashMap::with_capacity(needed.len());
    for frame in read_dir_frames(linestrings_dir)? {
        let frame = frame?;
        let ids = frame.column("id")?.i64()?;
        let wkbs = frame.column("wkb")?.str()?;
        for row in 0..frame.height() {
            let Some(id) = ids.get(row) else { continue };
            if !needed.contains(&id) {
                continue;
            }
            let Some(raw) = wkbs.get(row) else { continue };
            let decoded = hex::decode(raw)
                .map_err(|e| crate::error::Error::Internal(e.to_string()))?;
            if let Geometry::LineString(line) = wkb::read_geometry(&decoded)? {
                lines.insert(id, line);
            }
        }
    }
    Ok(lines)
}

fn flush(
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

#[cfg(test)]
mod tests {
    use super::*;
    use geo::line_string;

    fn member(ref_idx: i64, way_id: i64, role: &str) -> Member {
        Member { ref_idx, way_id, role: role.to_string() }
    }

    fn square(x0: f64, y0: f64, size: f64) -> LineString<f64> {
        line_string![
            (x: x0, y: y0),
            (x: x0 + size, y: y0),
            (x: x0 + size, y: y0 + size),
            (x: x0, y: y0 + size),
            (x: x0, y: y0)
        ]
    }

    #[test]
    fn assembles_ring_with_hole() {
        let mut lines = AHashMap::new();
        lines.insert(1, square(0.0, 0.0, 10.0));
        lines.insert(2, square(2.0, 2.0, 2.0));
        let members = vec![member(0, 1, "outer"), member(1, 2, "inner")];
        let assembled = assemble_relation(&members, &lines).unwrap();
        assert_eq!(assembled.0.len(), 1);
        assert_eq!(assembled.0[0].interiors().len(), 1);
    }

    #[test]
    fn merges_split_outer_ways() {
        let mut lines = AHashMap::new();
        lines.insert(1, line_string![(x: 0.0, y: 0.0), (x: 4.0, y: 0.0), (x: 4.0, y: 4.0)]);
        lines.insert(2, line_string![(x: 4.0, y: 4.0), (x: 0.0, y: 4.0), (x: 0.0, y: 0.0)]);
        let members = vec![member(0, 1, "outer"), member(1, 2, "outer")];
        let assembled = assemble_relation(&members, &lines).unwrap();
        assert_eq!(assembled.0.len(), 1);
        assert!(assembled.0[0].interiors().is_empty());
    }

    #[test]
    fn open_outer_ring_drops_the_relation() {
        let mut lines = AHashMap::new();
        lines.insert(1, line_string![(x: 0.0, y: 0.0), (x: 4.0, y: 0.0), (x: 4.0, y: 4.0), (x: 2.0, y: 5.0)]);
        let members = vec![member(0, 1, "outer")];
        assert!(assemble_relation(&members, &lines).is_none());
    }

    #[test]
    fn missing_roles_default_to_outer_only_without_explicit_outer() {
        let mut lines = AHashMap::new();
        lines.insert(1, square(0.0, 0.0, 10.0));
        let members = vec![member(0, 1, "")];
        assert!(assemble_relation(&members, &lines).is_some());

        // With an explicit outer present, unlabeled members stay unused.
        let mut lines = AHashMap::new();
        lines.insert(1, square(0.0, 0.0, 10.0));
        lines.insert(2, line_string![(x: 100.0, y: 100.0), (x: 101.0, y: 100.0), (x: 101.0, y: 101.0), (x: 100.5, y: 102.0)]);
        let members = vec![member(0, 1, "outer"), member(1, 2, "")];
        let assembled = assemble_relation(&members, &lines).unwrap();
        assert_eq!(assembled.0.len(), 1);
    }

    #[test]
    fn disjoint_outers_union_into_multipolygon() {
        let mut lines = AHashMap::new();
        lines.insert(1, square(0.0, 0.0, 2.0));
        lines.insert(2, square(10.0, 10.0, 2.0));
        let members = vec![member(0, 1, "outer"), member(1, 2, "outer")];
        let assembled = assemble_relation(&members, &lines).unwrap();
        assert_eq!(assembled.0.len(), 2);
    }
}
