//! Point emission for filtered nodes.

use std::path::{Path, PathBuf};

use ahash::AHashSet;
use geo::{Geometry, Point};
use polars::prelude::ParquetCompression;

use crate::common::data::{read_dir_frames, write_chunk, CHUNK_ROWS};
use crate::error::Result;
use crate::geometry::round7;
use crate::reader::elements::ScatteredTables;
use crate::wkb;

/// Emit `node/<id>` features with rounded point geometries.
pub fn emit_node_geometries(
    scattered: &ScatteredTables,
    nodes_filtered: &AHashSet<i64>,
    tmp_dir: &Path,
    compression: ParquetCompression,
) -> Result<PathBuf> {
    let out_dir = tmp_dir.join("geometry_nodes");

    let mut seq = 0usize;
    let mut feature_ids: Vec<String> = Vec::new();
    let mut tags_out: Vec<String> = Vec::new();
    let mut wkbs: Vec<String> = Vec::new();

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
            if !nodes_filtered.contains(&id) {
                continue;
            }
            let point = Geometry::Point(Point::new(round7(lon), round7(lat)));
            feature_ids.push(format!("node/{id}"));
            tags_out.push(tags.get(row).unwrap_or("{}").to_string());
            wkbs.push(hex::encode(wkb::write_geometry(&point)?));

            if feature_ids.len() >= CHUNK_ROWS {
                flush(&out_dir, &mut seq, &mut feature_ids, &mut tags_out, &mut wkbs, compression)?;
            }
        }
    }
    flush(&out_dir, &mut seq, &mut feature_ids, &mut tags_out, &mut wkbs, compression)?;
    Ok(out_dir)
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
