//! Prefiltering of element ids.
//!
//! Materializes the id-level tables in dependency order: filtered nodes,
//! valid/intersecting/filtered ways, valid/intersecting/filtered relations
//! and finally the required ways (filtered ways plus every way referenced by
//! a filtered relation).
//!
//! The node-reference checks are a disk-backed hash join: node coordinates
//! and way references are hash-partitioned by node id so that each pass
//! holds only one partition's nodes in memory. The same join detects ways
//! with dangling references (the valid-refs EXCEPT formulation) and ways
//! touching the geometry filter.

use std::path::{Path, PathBuf};

use ahash::AHashSet;
use geo::{Geometry, Intersects, Point};
use polars::prelude::ParquetCompression;

use crate::common::data::{read_dir_frames, write_chunk, write_id_chunks, CHUNK_ROWS};
use crate::common::fs::delete_directories;
use crate::error::Result;
use crate::filter::{clauses_match, ElementKind, OsmIdsFilter, TagClauses};
use crate::geometry::round7;
use crate::reader::elements::{tags_from_json, ScatteredTables};

/// Rows buffered per hash partition before flushing to disk.
const PARTITION_BUFFER_ROWS: usize = 16_384;

/// Upper bound on hash partitions; below it the per-partition node maps
/// stay within the bucket budget.
const MAX_PARTITIONS: usize = 512;

/// Outputs of the prefilter stage.
pub struct Prefiltered {
    pub nodes_filtered: AHashSet<i64>,
    pub nodes_filtered_dir: PathBuf,
    /// Way references joined to node points: `(id, ref_idx, x, y)`.
    pub ways_refs_points: PathBuf,
    pub ways_filtered: AHashSet<i64>,
    pub ways_filtered_dir: PathBuf,
    /// Sorted: the bucket index of a required way is its rank divided by
    /// the bucket size.
    pub ways_required: Vec<i64>,
    pub ways_required_dir: PathBuf,
    pub relations_filtered: AHashSet<i64>,
    pub relations_filtered_dir: PathBuf,
}

pub struct PrefilterParams<'a> {
    pub geometry_filter: Option<&'a Geometry<f64>>,
    pub tag_clauses: Option<&'a TagClauses>,
    pub ids_filter: Option<&'a OsmIdsFilter>,
    pub rows_per_bucket: usize,
    pub compression: ParquetCompression,
}

pub fn prefilter(
    scattered: &ScatteredTables,
    tmp_dir: &Path,
    params: &PrefilterParams<'_>,
) -> Result<Prefiltered> {
    let partitions = partition_count(scattered.node_count, params.rows_per_bucket);

    let node_parts_dir = tmp_dir.join("node_parts");
    let ref_parts_dir = tmp_dir.join("way_ref_parts");
    let nodes_filtered_dir = tmp_dir.join("nodes_filtered_ids");
    let ways_refs_points = tmp_dir.join("ways_refs_points");

    let nodes_filtered = filter_and_partition_nodes(
        scattered,
        &nodes_filtered_dir,
        &node_parts_dir,
        partitions,
        params,
    )?;

    partition_way_refs(scattered, &ref_parts_dir, partitions, params.compression)?;

    let join = join_refs_to_nodes(
        &node_parts_dir,
        &ref_parts_dir,
        &ways_refs_points,
        partitions,
        params.compression,
    )?;
    delete_directories([&node_parts_dir, &ref_parts_dir])?;

    let ways_valid: AHashSet<i64> =
        scattered.way_ids.iter().copied().filter(|id| !join.invalid_ways.contains(id)).collect();

    let ways_intersecting = params.geometry_filter.map(|_| {
        join.intersecting_ways.iter().copied().filter(|id| ways_valid.contains(id)).collect()
    });

    let ways_filtered_dir = tmp_dir.join("ways_filtered_ids");
    let ways_filtered = filter_ways(
        scattered,
        &ways_filtered_dir,
        &ways_valid,
        ways_intersecting.as_ref(),
        params,
    )?;

    let relations_filtered_dir = tmp_dir.join("relations_filtered_ids");
    let relations_filtered = filter_relations(
        scattered,
        &relations_filtered_dir,
        &ways_valid,
        ways_intersecting.as_ref(),
        params,
    )?;

    let ways_required_dir = tmp_dir.join("ways_required_ids");
    let ways_required = collect_required_ways(
        scattered,
        &ways_required_dir,
        &ways_filtered,
        &relations_filtered,
        params.compression,
    )?;

    Ok(Prefiltered {
        nodes_filtered,
        nodes_filtered_dir,
        ways_refs_points,
        ways_filtered,
        ways_filtered_dir,
        ways_required,
        ways_required_dir,
        relations_filtered,
        relations_filtered_dir,
    })
}

fn partition_count(node_count: u64, rows_per_bucket: usize) -> usize {
    let needed = node_count.div_ceil(rows_per_bucket.max(1) as u64) as usize;
    needed.clamp(1, MAX_PARTITIONS)
}

/// Buffered writer routing `(id, x, y, intersecting)` node rows to hash
/// partitions.
struct NodePartitionWriter {
    base: PathBuf,
    compression: ParquetCompression,
    seqs: Vec<usize>,
    ids: Vec<Vec<i64>>,
    xs: Vec<Vec<f64>>,
    ys: Vec<Vec<f64>>,
    inter: Vec<Vec<bool>>,
}

impl NodePartitionWriter {
    fn new(base: PathBuf, partitions: usize, compression: ParquetCompression) -> Self {
        Self {
            base,
            compression,
            seqs: vec![0; partitions],
            ids: vec![Vec::new(); partitions],
            xs: vec![Vec::new(); partitions],
            ys: vec![Vec::new(); partitions],
            inter: vec![Vec::new(); partitions],
        }
    }

    fn push(&mut self, id: i64, x: f64, y: f64, intersecting: bool) -> Result<()> {
        let p = id.rem_euclid(self.seqs.len() as i64) as usize;
        self.ids[p].push(id);
        self.xs[p].push(x);
        self.ys[p].push(y);
        self.inter[p].push(intersecting);
        if self.ids[p].len() >= PARTITION_BUFFER_ROWS {
            self.flush(p)?;
        }
        Ok(())
    }

    fn flush(&mut self, p: usize) -> Result<()> {
        if self.ids[p].is_empty() {
            return Ok(());
        }
        let df = polars::df!(
            "id" => std::mem::take(&mut self.ids[p]),
            "x" => std::mem::take(&mut self.xs[p]),
            "y" => std::mem::take(&mut self.ys[p]),
            "intersecting" => std::mem::take(&mut self.inter[p]),
        )?;
        write_chunk(df, &self.base.join(format!("part={p}")), self.seqs[p], self.compression)?;
        self.seqs[p] += 1;
        Ok(())
    }

    fn finish(mut self) -> Result<()> {
        for p in 0..self.seqs.len() {
            self.flush(p)?;
        }
        Ok(())
    }
}

/// Buffered writer routing `(id, ref, ref_idx)` rows to hash partitions
/// keyed on the referenced node id.
struct RefPartitionWriter {
    base: PathBuf,
    compression: ParquetCompression,
    seqs: Vec<usize>,
    ids: Vec<Vec<i64>>,
    refs: Vec<Vec<i64>>,
    ref_idx: Vec<Vec<i64>>,
}

impl RefPartitionWriter {
    fn new(base: PathBuf, partitions: usize, compression: ParquetCompression) -> Self {
        Self {
            base,
            compression,
            seqs: vec![0; partitions],
            ids: vec![Vec::new(); partitions],
            refs: vec![Vec::new(); partitions],
            ref_idx: vec![Vec::new(); partitions],
        }
    }

    fn push(&mut self, id: i64, reference: i64, ref_idx: i64) -> Result<()> {
        let p = reference.rem_euclid(self.seqs.len() as i64) as usize;
        self.ids[p].push(id);
        self.refs[p].push(reference);
        self.ref_idx[p].push(ref_idx);
        if self.ids[p].len() >= PARTITION_BUFFER_ROWS {
            self.flush(p)?;
        }
        Ok(())
    }

    fn flush(&mut self, p: usize) -> Result<()> {
        if self.ids[p].is_empty() {
            return Ok(());
        }
        let df = polars::df!(
            "id" => std::mem::take(&mut self.ids[p]),
            "ref" => std::mem::take(&mut self.refs[p]),
            "ref_idx" => std::mem::take(&mut self.ref_idx[p]),
        )?;
        write_chunk(df, &self.base.join(format!("part={p}")), self.seqs[p], self.compression)?;
        self.seqs[p] += 1;
        Ok(())
    }

    fn finish(mut self) -> Result<()> {
        for p in 0..self.seqs.len() {
            self.flush(p)?;
        }
        Ok(())
    }
}

fn filter_and_partition_nodes(
    scattered: &ScatteredTables,
    filtered_dir: &Path,
    parts_dir: &Path,
    partitions: usize,
    params: &PrefilterParams<'_>,
) -> Result<AHashSet<i64>> {
    let mut writer =
        NodePartitionWriter::new(parts_dir.to_path_buf(), partitions, params.compression);
    let mut filtered: AHashSet<i64> = AHashSet::new();
    let mut filtered_order: Vec<i64> = Vec::new();

    for frame in read_dir_frames(&scattered.nodes_valid)? {
        let frame = frame?;
        let ids = frame.column("id")?.i64()?;
        let lons = frame.column("lon")?.f64()?;
        let lats = frame.column("lat")?.f64()?;
        let tags = frame.column("tags")?.str()?;

        for row in 0..frame.height() {
            let (Some(id), Some(lon), Some(lat)) = (ids.get(row), lons.get(row), lats.get(row))
            else {
                continue;
            };
            let intersecting = match params.geometry_filter {
                Some(geometry) => geometry.intersects(&Point::new(lon, lat)),
                None => true,
            };
            writer.push(id, round7(lon), round7(lat), intersecting)?;

            if !intersecting {
                continue;
            }
            let tags_json = tags.get(row).unwrap_or("{}");
            if tags_json == "{}" {
                continue;
            }
            if let Some(clauses) = params.tag_clauses {
                if !clauses_match(clauses, &tags_from_json(tags_json)?) {
                    continue;
                }
            }
            if let Some(ids_filter) = params.ids_filter {
                if !ids_filter.allows(ElementKind::Node, id) {
                    continue;
                }
            }
            if filtered.insert(id) {
                filtered_order.push(id);
            }
        }
    }
    writer.finish()?;
    write_id_chunks(filtered_order, filtered_dir, params.compression)?;
    Ok(filtered)
}

fn partition_way_refs(
    scattered: &ScatteredTables,
    parts_dir: &Path,
    partitions: usize,
    compression: ParquetCompression,
) -> Result<()> {
    let mut writer = RefPartitionWriter::new(parts_dir.to_path_buf(), partitions, compression);
    for frame in read_dir_frames(&scattered.ways_refs)? {
        let frame = frame?;
        let ids = frame.column("id")?.i64()?;
        let refs = frame.column("ref")?.i64()?;
        let ref_idx = frame.column("ref_idx")?.i64()?;
        for row in 0..frame.height() {
            let (Some(id), Some(reference), Some(idx)) =
                (ids.get(row), refs.get(row), ref_idx.get(row))
            else {
                continue;
            };
            writer.push(id, reference, idx)?;
        }
    }
    writer.finish()
}

struct RefJoinOutcome {
    invalid_ways: AHashSet<i64>,
    intersecting_ways: AHashSet<i64>,
}

/// Per-partition hash join of way references against node points.
fn join_refs_to_nodes(
    node_parts_dir: &Path,
    ref_parts_dir: &Path,
    points_dir: &Path,
    partitions: usize,
    compression: ParquetCompression,
) -> Result<RefJoinOutcome> {
    let mut invalid_ways: AHashSet<i64> = AHashSet::new();
    let mut intersecting_ways: AHashSet<i64> = AHashSet::new();

    let mut out_seq = 0usize;
    let mut out_ids: Vec<i64> = Vec::new();
    let mut out_idx: Vec<i64> = Vec::new();
    let mut out_xs: Vec<f64> = Vec::new();
    let mut out_ys: Vec<f64> = Vec::new();

    for p in 0..partitions {
        let node_part = node_parts_dir.join(format!("part={p}"));
        let mut nodes: ahash::AHashMap<i64, (f64, f64, bool)> = ahash::AHashMap::new();
        for frame in read_dir_frames(&node_part)? {
            let frame = frame?;
            let ids = frame.column("id")?.i64()?;
            let xs = frame.column("x")?.f64()?;
            let ys = frame.column("y")?.f64()?;
            let inter = frame.column("intersecting")?.bool()?;
            for row in 0..frame.height() {
                if let (Some(id), Some(x), Some(y), Some(i)) =
                    (ids.get(row), xs.get(row), ys.get(row), inter.get(row))
                {
                    nodes.insert(id, (x, y, i));
                }
            }
        }

        let ref_part = ref_parts_dir.join(format!("part={p}"));
        for frame in read_dir_frames(&ref_part)? {
            let frame = frame?;
            let ids = frame.column("id")?.i64()?;
            let refs = frame.column("ref")?.i64()?;
            let ref_idx = frame.column("ref_idx")?.i64()?;
            for row in 0..frame.height() {
                let (Some(id), Some(reference), Some(idx)) =
                    (ids.get(row), refs.get(row), ref_idx.get(row))
                else {
                    continue;
                };
                match nodes.get(&reference) {
                    Some((x, y, intersecting)) => {
                        if *intersecting {
                            intersecting_ways.insert(id);
                        }
                        out_ids.push(id);
                        out_idx.push(idx);
                        out_xs.push(*x);
                        out_ys.push(*y);
                        if out_ids.len() >= CHUNK_ROWS {
                            flush_points(
                                points_dir,
                                &mut out_seq,
                                &mut out_ids,
                                &mut out_idx,
                                &mut out_xs,
                                &mut out_ys,
                                compression,
                            )?;
                        }
                    }
                    None => {
                        invalid_ways.insert(id);
                    }
                }
            }
        }
    }

    flush_points(points_dir, &mut out_seq, &mut out_ids, &mut out_idx, &mut out_xs, &mut out_ys, compression)?;

    Ok(RefJoinOutcome { invalid_ways, intersecting_ways })
}

#[allow(clippy::too_many_arguments)]
fn flush_points(
    dir: &Path,
    seq: &mut usize,
    ids: &mut Vec<i64>,
    ref_idx: &mut Vec<i64>,
    xs: &mut Vec<f64>,
    ys: &mut Vec<f64>,
    compression: ParquetCompression,
) -> Result<()> {
    if ids.is_empty() && *seq > 0 {
        return Ok(());
    }
    let df = polars::df!(
        "id" => std::mem::take(ids),
        "ref_idx" => std::mem::take(ref_idx),
        "x" => std::mem::take(xs),
        "y" => std::mem::take(ys),
    )?;
    write_chunk(df, dir, *seq, compression)?;
    *seq += 1;
    Ok(())
}

fn filter_ways(
    scattered: &ScatteredTables,
    filtered_dir: &Path,
    ways_valid: &AHashSet<i64>,
    ways_intersecting: Option<&AHashSet<i64>>,
    params: &PrefilterParams<'_>,
) -> Result<AHashSet<i64>> {
    let mut filtered: AHashSet<i64> = AHashSet::new();
    let mut order: Vec<i64> = Vec::new();

    for frame in read_dir_frames(&scattered.ways_all_tags)? {
        let frame = frame?;
        let ids = frame.column("id")?.i64()?;
        let tags = frame.column("tags")?.str()?;
        for row in 0..frame.height() {
            let Some(id) = ids.get(row) else { continue };
            let reachable = match ways_intersecting {
                Some(intersecting) => intersecting.contains(&id),
                None => ways_valid.contains(&id),
            };
            if !reachable {
                continue;
            }
            if let Some(clauses) = params.tag_clauses {
                let tags_json = tags.get(row).unwrap_or("{}");
                if !clauses_match(clauses, &tags_from_json(tags_json)?) {
                    continue;
                }
            }
            if let Some(ids_filter) = params.ids_filter {
                if !ids_filter.allows(ElementKind::Way, id) {
                    continue;
                }
            }
            if filtered.insert(id) {
                order.push(id);
            }
        }
    }
    write_id_chunks(order, filtered_dir, params.compression)?;
    Ok(filtered)
}

fn filter_relations(
    scattered: &ScatteredTables,
    filtered_dir: &Path,
    ways_valid: &AHashSet<i64>,
    ways_intersecting: Option<&AHashSet<i64>>,
    params: &PrefilterParams<'_>,
) -> Result<AHashSet<i64>> {
    let mut seen: AHashSet<i64> = AHashSet::new();
    let mut invalid: AHashSet<i64> = AHashSet::new();
    let mut touching: AHashSet<i64> = AHashSet::new();

    for frame in read_dir_frames(&scattered.relations_refs)? {
        let frame = frame?;
        let ids = frame.column("id")?.i64()?;
        let refs = frame.column("ref")?.i64()?;
        for row in 0..frame.height() {
            let (Some(id), Some(reference)) = (ids.get(row), refs.get(row)) else { continue };
            seen.insert(id);
            if !ways_valid.contains(&reference) {
                invalid.insert(id);
            }
            if ways_intersecting.is_some_and(|ways| ways.contains(&reference)) {
                touching.insert(id);
            }
        }
    }

    let reachable = |id: i64| -> bool {
        if invalid.contains(&id) || !seen.contains(&id) {
            return false;
        }
        match ways_intersecting {
            Some(_) => touching.contains(&id),
            None => true,
        }
    };

    let mut filtered: AHashSet<i64> = AHashSet::new();
    let mut order: Vec<i64> = Vec::new();
    for frame in read_dir_frames(&scattered.relations_all_tags)? {
        let frame = frame?;
        let ids = frame.column("id")?.i64()?;
        let tags = frame.column("tags")?.str()?;
        for row in 0..frame.height() {
            let Some(id) = ids.get(row) else { continue };
            if !reachable(id) {
                continue;
            }
            if let Some(clauses) = params.tag_clauses {
                let tags_json = tags.get(row).unwrap_or("{}");
                if !clauses_match(clauses, &tags_from_json(tags_json)?) {
                    continue;
                }
            }
            if let Some(ids_filter) = params.ids_filter {
                if !ids_filter.allows(ElementKind::Relation, id) {
                    continue;
                }
            }
            if filtered.insert(id) {
                order.push(id);
            }
        }
    }
    write_id_chunks(order, filtered_dir, params.compression)?;
    Ok(filtered)
}

fn collect_required_ways(
    scattered: &ScatteredTables,
    required_dir: &Path,
    ways_filtered: &AHashSet<i64>,
    relations_filtered: &AHashSet<i64>,
    compression: ParquetCompression,
) -> Result<Vec<i64>> {
    let mut required: AHashSet<i64> = ways_filtered.clone();
    for frame in read_dir_frames(&scattered.relations_refs)? {
        let frame = frame?;
        let ids = frame.column("id")?.i64()?;
        let refs = frame.column("ref")?.i64()?;
        for row in 0..frame.height() {
            let (Some(id), Some(reference)) = (ids.get(row), refs.get(row)) else { continue };
            if relations_filtered.contains(&id) {
                required.insert(reference);
            }
        }
    }
    let mut sorted: Vec<i64> = required.into_iter().collect();
    sorted.sort_unstable();
    write_id_chunks(sorted.iter().copied(), required_dir, compression)?;
    Ok(sorted)
}
