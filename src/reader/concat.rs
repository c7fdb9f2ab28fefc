//! Result concatenation.
//!
//! Unions the node/way/relation geometry streams, projects tags into the
//! requested schema, splits rows by geometry validity, repairs the invalid
//! rows in bounded buckets and prepares the pruned column set for the final
//! GeoParquet emission.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use polars::frame::DataFrame;
use polars::prelude::{
    BooleanChunked, NamedFrom, NewChunkedArray, ParquetCompression, Series, StringChunked,
};

use crate::common::data::{read_dir_frames, write_chunk};
use crate::error::{Error, Result};
use crate::filter::{TagClauses, TagSpec, TagsFilter};
use crate::geometry::validity::{is_valid_geometry, make_valid};
use crate::reader::elements::tags_from_json;
use crate::wkb;

/// How tags map onto the output schema: a single mapping column or one
/// column per key/group.
#[derive(Debug, Clone)]
pub enum TagProjection {
    CompactAll,
    CompactClauses(TagClauses),
    CompactGrouped(Vec<(String, TagClauses)>),
    ExplodedKeys(Vec<String>),
    ExplodedClauses(TagClauses),
    ExplodedGrouped(Vec<(String, TagClauses)>),
}

impl TagProjection {
    /// Decide the output schema from the filter and flags. Exploding without
    /// a filter scans the geometry streams for the set of observed keys.
    pub fn plan(
        tags_filter: Option<&TagsFilter>,
        explode_tags: bool,
        keep_all_tags: bool,
        geometry_dirs: &[PathBuf],
    ) -> Result<Self> {
        let effective = if keep_all_tags { None } else { tags_filter };
        let plan = match (effective, explode_tags) {
            (None, false) => Self::CompactAll,
            (None, true) => Self::ExplodedKeys(observed_tag_keys(geometry_dirs)?),
            (Some(filter), explode) => match filter {
                TagsFilter::Flat(_) => {
                    let merged = filter.merged()?;
                    if explode {
                        Self::ExplodedClauses(merged)
                    } else {
                        Self::CompactClauses(merged)
                    }
                }
                TagsFilter::Grouped(groups) => {
                    let mut sorted = groups.clone();
                    sorted.sort_by(|a, b| a.0.cmp(&b.0));
                    if explode {
                        Self::ExplodedGrouped(sorted)
                    } else {
                        Self::CompactGrouped(sorted)
                    }
                }
            },
        };
        if let Some(count) = plan.column_names().map(|names| names.len()) {
            if count > 100 {
                log::warn!(
                    "result schema has {count} tag columns; consider a more restrictive filter"
                );
            }
        }
        Ok(plan)
    }

    /// Exploded column names, `None` for the compact variants.
    pub fn column_names(&self) -> Option<Vec<String>> {
        match self {
            Self::CompactAll | Self::CompactClauses(_) | Self::CompactGrouped(_) => None,
            Self::ExplodedKeys(keys) => Some(keys.clone()),
            Self::ExplodedClauses(clauses) => {
                Some(clauses.iter().map(|(key, _)| key.clone()).collect())
            }
            Self::ExplodedGrouped(groups) => {
                Some(groups.iter().map(|(group, _)| group.clone()).collect())
            }
        }
    }

    pub fn is_exploded(&self) -> bool {
        self.column_names().is_some()
    }

    /// Project one row's tags into the compact mapping column.
    fn compact_tags(&self, tags: &BTreeMap<String, String>) -> Result<String> {
        let projected: BTreeMap<String, String> = match self {
            Self::CompactAll => tags.clone(),
            Self::CompactClauses(clauses) => tags
                .iter()
                .filter(|(key, value)| {
                    clauses.iter().any(|(clause_key, spec)| {
                        clause_key == *key && spec_matches(spec, value)
                    })
                })
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            Self::CompactGrouped(groups) => groups
                .iter()
                .filter_map(|(group, clauses)| {
                    first_group_match(clauses, tags).map(|value| (group.clone(), value))
                })
                .collect(),
            _ => {
                return Err(Error::Internal(
                    "compact projection requested for an exploded plan".into(),
                ))
            }
        };
        crate::reader::elements::tags_to_json(&projected)
    }

    /// Project one row's tags into the exploded column cells.
    fn exploded_cells(&self, tags: &BTreeMap<String, String>) -> Result<Vec<Option<String>>> {
        match self {
            Self::ExplodedKeys(keys) => {
                Ok(keys.iter().map(|key| tags.get(key).cloned()).collect())
            }
            Self::ExplodedClauses(clauses) => Ok(clauses
                .iter()
                .map(|(key, spec)| {
                    tags.get(key).and_then(|value| {
                        if spec_matches(spec, value) {
                            Some(value.clone())
                        } else {
                            None
                        }
                    })
                })
                .collect()),
            Self::ExplodedGrouped(groups) => Ok(groups
                .iter()
                .map(|(_, clauses)| first_group_match(clauses, tags))
                .collect()),
            _ => Err(Error::Internal("exploded projection requested for a compact plan".into())),
        }
    }
}

fn spec_matches(spec: &TagSpec, value: &str) -> bool {
    match spec {
        TagSpec::Present(positive) => *positive,
        TagSpec::Value(expected) => expected == value,
        TagSpec::OneOf(values) => values.iter().any(|v| v == value),
    }
}

/// First matching `key=value` cell for a group, in clause order.
fn first_group_match(clauses: &TagClauses, tags: &BTreeMap<String, String>) -> Option<String> {
    for (key, spec) in clauses {
        if matches!(spec, TagSpec::Present(false)) {
            continue;
        }
        if let Some(value) = tags.get(key) {
            if spec_matches(spec, value) {
                return Some(format!("{key}={value}"));
            }
        }
    }
    None
}

fn observed_tag_keys(geometry_dirs: &[PathBuf]) -> Result<Vec<String>> {
    let mut keys: BTreeSet<String> = BTreeSet::new();
    for dir in geometry_dirs {
        for frame in read_dir_frames(dir)? {
            let frame = frame?;
            let tags = frame.column("tags")?.str()?;
            for row in 0..frame.height() {
                let raw = tags.get(row).unwrap_or("{}");
                if raw == "{}" {
                    continue;
                }
                keys.extend(tags_from_json(raw)?.into_keys());
            }
        }
    }
    Ok(keys.into_iter().collect())
}

/// Tables produced by the split/repair passes, ready for final emission.
pub struct ConcatenatedTables {
    pub valid_dir: PathBuf,
    pub fixed_dir: PathBuf,
}

/// Union the geometry streams, project tags, and split by validity; invalid
/// rows are repaired bucket by bucket.
pub fn concatenate_results(
    geometry_dirs: &[PathBuf],
    tmp_dir: &Path,
    projection: &TagProjection,
    rows_per_bucket: usize,
    compression: ParquetCompression,
) -> Result<ConcatenatedTables> {
    let unioned_dir = tmp_dir.join("features_unioned");
    let valid_dir = tmp_dir.join("features_valid");
    let invalid_dir = tmp_dir.join("features_invalid");
    let fixed_dir = tmp_dir.join("features_fixed");

    project_unioned(geometry_dirs, &unioned_dir, projection, compression)?;
    split_by_validity(&unioned_dir, &valid_dir, &invalid_dir, rows_per_bucket, compression)?;
    crate::common::fs::delete_directories([&unioned_dir])?;
    repair_invalid(&invalid_dir, &fixed_dir, compression)?;
    crate::common::fs::delete_directories([&invalid_dir])?;

    Ok(ConcatenatedTables { valid_dir, fixed_dir })
}

fn project_unioned(
    geometry_dirs: &[PathBuf],
    unioned_dir: &Path,
    projection: &TagProjection,
    compression: ParquetCompression,
) -> Result<()> {
    crate::common::fs::ensure_dir_exists(unioned_dir)?;
    let mut seq = 0usize;
    for dir in geometry_dirs {
        for frame in read_dir_frames(dir)? {
            let frame = frame?;
            let feature_ids = frame.column("feature_id")?.str()?;
            let tags = frame.column("tags")?.str()?;
            let wkbs = frame.column("wkb")?.str()?;

            let height = frame.height();
            let mut out_feature_ids: Vec<String> = Vec::with_capacity(height);
            let mut out_wkbs: Vec<String> = Vec::with_capacity(height);
            let mut out_compact: Vec<String> = Vec::new();
            let mut out_exploded: Vec<Vec<Option<String>>> = Vec::new();

            for row in 0..height {
                let (Some(feature_id), Some(raw_wkb)) = (feature_ids.get(row), wkbs.get(row))
                else {
                    continue;
                };
                let row_tags = tags_from_json(tags.get(row).unwrap_or("{}"))?;
                out_feature_ids.push(feature_id.to_string());
                out_wkbs.push(raw_wkb.to_string());
                if projection.is_exploded() {
                    out_exploded.push(projection.exploded_cells(&row_tags)?);
                } else {
                    out_compact.push(projection.compact_tags(&row_tags)?);
                }
            }

            let df = build_projected_frame(
                projection,
                out_feature_ids,
                out_compact,
                out_exploded,
                out_wkbs,
            )?;
            write_chunk(df, unioned_dir, seq, compression)?;
            seq += 1;
        }
    }
    // An input with no features still needs one chunk carrying the schema.
    if seq == 0 {
        let df = build_projected_frame(projection, Vec::new(), Vec::new(), Vec::new(), Vec::new())?;
        write_chunk(df, unioned_dir, 0, compression)?;
    }
    Ok(())
}

fn build_projected_frame(
    projection: &TagProjection,
    feature_ids: Vec<String>,
    compact: Vec<String>,
    exploded: Vec<Vec<Option<String>>>,
    wkbs: Vec<String>,
) -> Result<DataFrame> {
    let mut columns = Vec::new();
    columns.push(Series::new("feature_id".into(), feature_ids));

    match projection.column_names() {
        Some(names) => {
            for (index, name) in names.iter().enumerate() {
                let values: Vec<Option<String>> =
                    exploded.iter().map(|cells| cells[index].clone()).collect();
                columns.push(Series::new(name.as_str().into(), values));
            }
        }
        None => {
            columns.push(Series::new("tags".into(), compact));
        }
    }

    columns.push(Series::new("wkb".into(), wkbs));
    Ok(DataFrame::new(columns.into_iter().map(Into::into).collect())?)
}

fn split_by_validity(
    unioned_dir: &Path,
    valid_dir: &Path,
    invalid_dir: &Path,
    rows_per_bucket: usize,
    compression: ParquetCompression,
) -> Result<()> {
    crate::common::fs::ensure_dir_exists(valid_dir)?;
    let mut valid_seq = 0usize;
    let mut invalid_group = 0usize;
    let mut invalid_pending: Option<DataFrame> = None;
    let mut wrote_valid = false;

    for frame in read_dir_frames(unioned_dir)? {
        let frame = frame?;
        let wkbs = frame.column("wkb")?.str()?;
        let mut flags: Vec<bool> = Vec::with_capacity(frame.height());
        for row in 0..frame.height() {
            let raw = wkbs.get(row).unwrap_or_default();
            let geometry = wkb::read_geometry(&decode_hex(raw)?)?;
            flags.push(is_valid_geometry(&geometry));
        }
        let mask = BooleanChunked::new("valid".into(), flags);
        let valid = frame.filter(&mask)?;
        let invalid = frame.filter(&(!&mask))?;

        if valid.height() > 0 || !wrote_valid {
            write_chunk(valid, valid_dir, valid_seq, compression)?;
            valid_seq += 1;
            wrote_valid = true;
        }

        if invalid.height() > 0 {
            invalid_pending = Some(match invalid_pending.take() {
                Some(acc) => acc.vstack(&invalid)?,
                None => invalid,
            });
        }
        while invalid_pending.as_ref().is_some_and(|df| df.height() >= rows_per_bucket) {
            let pending = invalid_pending.take().unwrap_or_default();
            let group = pending.slice(0, rows_per_bucket);
            let rest = pending.slice(rows_per_bucket as i64, usize::MAX);
            write_chunk(group, &invalid_dir.join(format!("group={invalid_group}")), 0, compression)?;
            invalid_group += 1;
            if rest.height() > 0 {
                invalid_pending = Some(rest);
            }
        }
    }
    if let Some(pending) = invalid_pending {
        write_chunk(pending, &invalid_dir.join(format!("group={invalid_group}")), 0, compression)?;
    }
    Ok(())
}

/// Re-encode every invalid bucket through geometry repair.
fn repair_invalid(
    invalid_dir: &Path,
    fixed_dir: &Path,
    compression: ParquetCompression,
) -> Result<()> {
    crate::common::fs::ensure_dir_exists(fixed_dir)?;
    let mut seq = 0usize;
    let mut group = 0usize;
    loop {
        let group_dir = invalid_dir.join(format!("group={group}"));
        if !group_dir.exists() {
            break;
        }
        for frame in read_dir_frames(&group_dir)? {
            let mut frame = frame?;
            let wkbs = frame.column("wkb")?.str()?;
            let mut repaired: Vec<String> = Vec::with_capacity(frame.height());
            for row in 0..frame.height() {
                let raw = wkbs.get(row).unwrap_or_default();
                let geometry = make_valid(wkb::read_geometry(&decode_hex(raw)?)?);
                repaired.push(hex::encode(wkb::write_geometry(&geometry)?));
            }
            let column =
                StringChunked::from_iter_values("wkb".into(), repaired.iter().map(String::as_str));
            frame.replace("wkb", column)?;
            write_chunk(frame, fixed_dir, seq, compression)?;
            seq += 1;
        }
        group += 1;
    }
    Ok(())
}

fn decode_hex(raw: &str) -> Result<Vec<u8>> {
    hex::decode(raw).map_err(|e| Error::Internal(e.to_string()))
}
