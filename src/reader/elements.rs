//! Streaming element pass.
//!
//! Reads the PBF once and scatters the primitives into the raw chunked
//! tables every later stage works from: valid nodes, way tags, way node
//! references, relation tags and relation way references.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use ahash::AHashSet;
use osmpbf::{Element, ElementReader};
use polars::prelude::ParquetCompression;

use crate::common::data::{write_chunk, CHUNK_ROWS};
use crate::error::{Error, Result};
use crate::filter::ElementKind;

/// Tag keys dropped during normalization, matching what OGR ignores.
const IGNORED_TAG_KEYS: [&str; 10] = [
    "area", "created_by", "converted_by", "source", "time", "ele", "note", "todo", "fixme",
    "FIXME",
];
const IGNORED_TAG_PREFIX: &str = "openGeoDB:";

/// Relation types considered for multipolygon assembly.
const RELATION_TYPES: [&str; 2] = ["boundary", "multipolygon"];

/// One OSM primitive, decoupled from the PBF decoder.
#[derive(Debug, Clone)]
pub enum RawElement {
    Node { id: i64, lon: f64, lat: f64, tags: Vec<(String, String)> },
    Way { id: i64, refs: Vec<i64>, tags: Vec<(String, String)> },
    Relation { id: i64, members: Vec<RawMember>, tags: Vec<(String, String)> },
}

/// A relation member reference with its role.
#[derive(Debug, Clone)]
pub struct RawMember {
    pub ref_id: i64,
    pub kind: ElementKind,
    pub role: String,
}

/// A stream of OSM primitives. The PBF decoder is the production source;
/// tests drive the pipeline with synthetic streams.
pub trait ElementSource {
    fn read_elements(self, handler: &mut dyn FnMut(RawElement) -> Result<()>) -> Result<()>;
}

/// Element stream backed by an `.osm.pbf` file.
pub struct PbfElementSource {
    path: PathBuf,
}

impl PbfElementSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ElementSource for PbfElementSource {
    fn read_elements(self, handler: &mut dyn FnMut(RawElement) -> Result<()>) -> Result<()> {
        let reader = ElementReader::from_path(&self.path)
            .map_err(|source| Error::InputNotReadable { path: self.path.clone(), source })?;

        let mut deferred: Option<crate::error::Error> = None;
        reader
            .for_each(|element| {
                if deferred.is_some() {
                    return;
                }
                let raw = match element {
                    Element::Node(node) => RawElement::Node {
                        id: node.id(),
                        lon: node.lon(),
                        lat: node.lat(),
                        tags: node
                            .tags()
                            .map(|(k, v)| (k.to_string(), v.to_string()))
                            .collect(),
                    },
                    Element::DenseNode(node) => RawElement::Node {
                        id: node.id(),
                        lon: node.lon(),
                        lat: node.lat(),
                        tags: node
                            .tags()
                            .map(|(k, v)| (k.to_string(), v.to_string()))
                            .collect(),
                    },
                    Element::Way(way) => RawElement::Way {
                        id: way.id(),
                        refs: way.refs().collect(),
                        tags: way.tags().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
                    },
                    Element::Relation(relation) => RawElement::Relation {
                        id: relation.id(),
                        members: relation
                            .members()
                            .map(|member| RawMember {
                                ref_id: member.member_id,
                                kind: match member.member_type {
                                    osmpbf::RelMemberType::Node => ElementKind::Node,
                                    osmpbf::RelMemberType::Way => ElementKind::Way,
                                    osmpbf::RelMemberType::Relation => ElementKind::Relation,
                                },
                                role: member.role().unwrap_or_default().to_string(),
                            })
                            .collect(),
                        tags: relation
                            .tags()
                            .map(|(k, v)| (k.to_string(), v.to_string()))
                            .collect(),
                    },
                };
                if let Err(error) = handler(raw) {
                    deferred = Some(error);
                }
            })
            .map_err(|source| Error::InputNotReadable { path: self.path.clone(), source })?;

        match deferred {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// Element stream over an in-memory vector.
pub struct VecElementSource(pub Vec<RawElement>);

impl ElementSource for VecElementSource {
    fn read_elements(self, handler: &mut dyn FnMut(RawElement) -> Result<()>) -> Result<()> {
        for element in self.0 {
            handler(element)?;
        }
        Ok(())
    }
}

/// Drop the ignored tag keys; the result is ordered and deterministic.
pub fn normalize_tags(tags: &[(String, String)]) -> BTreeMap<String, String> {
    tags.iter()
        .filter(|(key, _)| {
            !IGNORED_TAG_KEYS.contains(&key.as_str()) && !key.starts_with(IGNORED_TAG_PREFIX)
        })
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Serialize a tag mapping for storage inside intermediate chunks.
pub fn tags_to_json(tags: &BTreeMap<String, String>) -> Result<String> {
    serde_json::to_string(tags).map_err(|e| Error::Internal(e.to_string()))
}

/// Deserialize a tag mapping from an intermediate chunk.
pub fn tags_from_json(raw: &str) -> Result<BTreeMap<String, String>> {
    serde_json::from_str(raw).map_err(|e| Error::Internal(e.to_string()))
}

/// The raw chunked tables produced by the element pass.
pub struct ScatteredTables {
    pub nodes_valid: PathBuf,
    pub ways_all_tags: PathBuf,
    pub ways_refs: PathBuf,
    pub relations_all_tags: PathBuf,
    pub relations_refs: PathBuf,
    pub node_count: u64,
    pub way_ids: AHashSet<i64>,
}

struct NodeBuffer {
    id: Vec<i64>,
    lon: Vec<f64>,
    lat: Vec<f64>,
    tags: Vec<String>,
}

struct WayTagsBuffer {
    id: Vec<i64>,
    tags: Vec<String>,
    raw_tags: Vec<String>,
}

struct WayRefsBuffer {
    id: Vec<i64>,
    reference: Vec<i64>,
    ref_idx: Vec<i64>,
}

struct RelationTagsBuffer {
    id: Vec<i64>,
    tags: Vec<String>,
}

struct RelationRefsBuffer {
    id: Vec<i64>,
    reference: Vec<i64>,
    ref_role: Vec<String>,
    ref_idx: Vec<i64>,
}

/// Stream the source once and write the raw tables.
pub fn scatter_elements(
    source: impl ElementSource,
    tmp_dir: &Path,
    compression: ParquetCompression,
) -> Result<ScatteredTables> {
    let nodes_valid = tmp_dir.join("nodes_valid");
    let ways_all_tags = tmp_dir.join("ways_all_tags");
    let ways_refs = tmp_dir.join("ways_refs");
    let relations_all_tags = tmp_dir.join("relations_all_tags");
    let relations_refs = tmp_dir.join("relations_refs");

    let mut nodes = NodeBuffer { id: Vec::new(), lon: Vec::new(), lat: Vec::new(), tags: Vec::new() };
    let mut way_tags = WayTagsBuffer { id: Vec::new(), tags: Vec::new(), raw_tags: Vec::new() };
    let mut way_refs = WayRefsBuffer { id: Vec::new(), reference: Vec::new(), ref_idx: Vec::new() };
    let mut relation_tags = RelationTagsBuffer { id: Vec::new(), tags: Vec::new() };
    let mut relation_refs = RelationRefsBuffer {
        id: Vec::new(),
        reference: Vec::new(),
        ref_role: Vec::new(),
        ref_idx: Vec::new(),
    };

    let mut node_seq = 0usize;
    let mut way_tags_seq = 0usize;
    let mut way_refs_seq = 0usize;
    let mut relation_tags_seq = 0usize;
    let mut relation_refs_seq = 0usize;

    let mut node_count = 0u64;
    let mut way_ids: AHashSet<i64> = AHashSet::new();

    let mut handle = |element: RawElement| -> Result<()> {
        match element {
            RawElement::Node { id, lon, lat, tags } => {
                if !lon.is_finite() || !lat.is_finite() {
                    return Ok(());
                }
                node_count += 1;
                nodes.id.push(id);
                nodes.lon.push(lon);
                nodes.lat.push(lat);
                nodes.tags.push(tags_to_json(&normalize_tags(&tags))?);
                if nodes.id.len() >= CHUNK_ROWS {
                    flush_nodes(&mut nodes, &nodes_valid, &mut node_seq, compression)?;
                }
            }
            RawElement::Way { id, refs, tags } => {
                if refs.len() < 2 {
                    return Ok(());
                }
                way_ids.insert(id);
                for (idx, reference) in refs.iter().enumerate() {
                    way_refs.id.push(id);
                    way_refs.reference.push(*reference);
                    way_refs.ref_idx.push(idx as i64);
                }
                if way_refs.id.len() >= CHUNK_ROWS {
                    flush_way_refs(&mut way_refs, &ways_refs, &mut way_refs_seq, compression)?;
                }

                let normalized = normalize_tags(&tags);
                if !normalized.is_empty() {
                    let raw: BTreeMap<String, String> = tags.into_iter().collect();
                    way_tags.id.push(id);
                    way_tags.tags.push(tags_to_json(&normalized)?);
                    way_tags.raw_tags.push(tags_to_json(&raw)?);
                    if way_tags.id.len() >= CHUNK_ROWS {
                        flush_way_tags(&mut way_tags, &ways_all_tags, &mut way_tags_seq, compression)?;
                    }
                }
            }
            RawElement::Relation { id, members, tags } => {
                if members.is_empty() {
                    return Ok(());
                }
                let type_tag = tags.iter().find(|(key, _)| key == "type");
                let is_area_relation = type_tag
                    .is_some_and(|(_, value)| RELATION_TYPES.contains(&value.as_str()));
                if !is_area_relation {
                    return Ok(());
                }

                for (idx, member) in members.iter().enumerate() {
                    // Only way members; nested relation references are skipped.
                    if member.kind != ElementKind::Way {
                        continue;
                    }
                    relation_refs.id.push(id);
                    relation_refs.reference.push(member.ref_id);
                    relation_refs.ref_role.push(member.role.clone());
                    relation_refs.ref_idx.push(idx as i64);
                }
                if relation_refs.id.len() >= CHUNK_ROWS {
                    flush_relation_refs(
                        &mut relation_refs,
                        &relations_refs,
                        &mut relation_refs_seq,
                        compression,
                    )?;
                }

                let normalized = normalize_tags(&tags);
                if !normalized.is_empty() {
                    relation_tags.id.push(id);
                    relation_tags.tags.push(tags_to_json(&normalized)?);
                    if relation_tags.id.len() >= CHUNK_ROWS {
                        flush_relation_tags(
                            &mut relation_tags,
                            &relations_all_tags,
                            &mut relation_tags_seq,
                            compression,
                        )?;
                    }
                }
            }
        }
        Ok(())
    };

    source.read_elements(&mut handle)?;

    flush_nodes(&mut nodes, &nodes_valid, &mut node_seq, compression)?;
    flush_way_tags(&mut way_tags, &ways_all_tags, &mut way_tags_seq, compression)?;
    flush_way_refs(&mut way_refs, &ways_refs, &mut way_refs_seq, compression)?;
    flush_relation_tags(&mut relation_tags, &relations_all_tags, &mut relation_tags_seq, compression)?;
    flush_relation_refs(&mut relation_refs, &relations_refs, &mut relation_refs_seq, compression)?;

    log::debug!("scattered {} nodes, {} ways", node_count, way_ids.len());

    Ok(ScatteredTables {
        nodes_valid,
        ways_all_tags,
        ways_refs,
        relations_all_tags,
        relations_refs,
        node_count,
        way_ids,
    })
}

fn flush_nodes(
    buffer: &mut NodeBuffer,
    dir: &Path,
    seq: &mut usize,
    compression: ParquetCompression,
) -> Result<()> {
    if buffer.id.is_empty() && *seq > 0 {
        return Ok(());
    }
    let df = polars::df!(
        "id" => std::mem::take(&mut buffer.id),
        "lon" => std::mem::take(&mut buffer.lon),
        "lat" => std::mem::take(&mut buffer.lat),
        "tags" => std::mem::take(&mut buffer.tags),
    )?;
    write_chunk(df, dir, *seq, compression)?;
    *seq += 1;
    Ok(())
}

fn flush_way_tags(
    buffer: &mut WayTagsBuffer,
    dir: &Path,
    seq: &mut usize,
    compression: ParquetCompression,
) -> Result<()> {
    if buffer.id.is_empty() && *seq > 0 {
        return Ok(());
    }
    let df = polars::df!(
        "id" => std::mem::take(&mut buffer.id),
        "tags" => std::mem::take(&mut buffer.tags),
        "raw_tags" => std::mem::take(&mut buffer.raw_tags),
    )?;
    write_chunk(df, dir, *seq, compression)?;
    *seq += 1;
    Ok(())
}

fn flush_way_refs(
    buffer: &mut WayRefsBuffer,
    dir: &Path,
    seq: &mut usize,
    compression: ParquetCompression,
) -> Result<()> {
    if buffer.id.is_empty() && *seq > 0 {
        return Ok(());
    }
    let df = polars::df!(
        "id" => std::mem::take(&mut buffer.id),
        "ref" => std::mem::take(&mut buffer.reference),
        "ref_idx" => std::mem::take(&mut buffer.ref_idx),
    )?;
    write_chunk(df, dir, *seq, compression)?;
    *seq += 1;
    Ok(())
}

fn flush_relation_tags(
    buffer: &mut RelationTagsBuffer,
    dir: &Path,
    seq: &mut usize,
    compression: ParquetCompression,
) -> Result<()> {
    if buffer.id.is_empty() && *seq > 0 {
        return Ok(());
    }
    let df = polars::df!(
        "id" => std::mem::take(&mut buffer.id),
        "tags" => std::mem::take(&mut buffer.tags),
    )?;
    write_chunk(df, dir, *seq, compression)?;
    *seq += 1;
    Ok(())
}

fn flush_relation_refs(
    buffer: &mut RelationRefsBuffer,
    dir: &Path,
    seq: &mut usize,
    compression: ParquetCompression,
) -> Result<()> {
    if buffer.id.is_empty() && *seq > 0 {
        return Ok(());
    }
    let df = polars::df!(
        "id" => std::mem::take(&mut buffer.id),
        "ref" => std::mem::take(&mut buffer.reference),
        "ref_role" => std::mem::take(&mut buffer.ref_role),
        "ref_idx" => std::mem::take(&mut buffer.ref_idx),
    )?;
    write_chunk(df, dir, *seq, compression)?;
    *seq += 1;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_drops_ignored_keys() {
        let tags = vec![
            ("building".to_string(), "yes".to_string()),
            ("source".to_string(), "survey".to_string()),
            ("area".to_string(), "yes".to_string()),
            ("openGeoDB:loc_id".to_string(), "123".to_string()),
            ("FIXME".to_string(), "check".to_string()),
        ];
        let normalized = normalize_tags(&tags);
        assert_eq!(normalized.len(), 1);
        assert_eq!(normalized.get("building").map(String::as_str), Some("yes"));
    }

    #[test]
    fn tags_json_round_trip() {
        let tags = normalize_tags(&[("highway".to_string(), "primary".to_string())]);
        let json = tags_to_json(&tags).unwrap();
        assert_eq!(tags_from_json(&json).unwrap(), tags);
    }

    #[test]
    fn scatter_partitions_by_kind() {
        let tmp = tempfile::tempdir().unwrap();
        let elements = vec![
            RawElement::Node {
                id: 1,
                lon: 1.0,
                lat: 2.0,
                tags: vec![("amenity".to_string(), "bench".to_string())],
            },
            RawElement::Way {
                id: 10,
                refs: vec![1, 2],
                tags: vec![("highway".to_string(), "primary".to_string())],
            },
            // Too few refs: dropped entirely.
            RawElement::Way { id: 11, refs: vec![1], tags: vec![] },
            RawElement::Relation {
                id: 20,
                members: vec![RawMember {
                    ref_id: 10,
                    kind: ElementKind::Way,
                    role: "outer".to_string(),
                }],
                tags: vec![
                    ("type".to_string(), "multipolygon".to_string()),
                    ("landuse".to_string(), "forest".to_string()),
                ],
            },
            // Wrong type tag: dropped.
            RawElement::Relation {
                id: 21,
                members: vec![RawMember {
                    ref_id: 10,
                    kind: ElementKind::Way,
                    role: String::new(),
                }],
                tags: vec![("type".to_string(), "route".to_string())],
            },
        ];
        let tables = scatter_elements(
            VecElementSource(elements),
            tmp.path(),
            polars::prelude::ParquetCompression::Snappy,
        )
        .unwrap();

        assert_eq!(tables.node_count, 1);
        assert_eq!(tables.way_ids.len(), 1);

        let refs = crate::common::data::read_dir_concat(&tables.ways_refs).unwrap().unwrap();
        assert_eq!(refs.height(), 2);
        let relations =
            crate::common::data::read_dir_concat(&tables.relations_refs).unwrap().unwrap();
        assert_eq!(relations.height(), 1);
    }
}
