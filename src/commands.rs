use anyhow::{Context, Result};
use geo::Geometry;
use wkt::TryFromWkt;

use crate::cli::{Cli, ConvertArgs};
use crate::{ConvertOptions, PbfFileReader, ReaderOptions, TagsFilter};

/// Run one conversion from CLI arguments and print the result path.
pub fn convert(cli: &Cli, args: &ConvertArgs) -> Result<()> {
    let tags_filter = args
        .osm_tags_filter
        .as_deref()
        .map(|raw| -> Result<TagsFilter> {
            let value = serde_json::from_str(raw).context("tags filter is not valid JSON")?;
            Ok(TagsFilter::from_json(&value)?)
        })
        .transpose()?;

    let geometry_filter = args
        .geom_filter_wkt
        .as_deref()
        .map(|raw| -> Result<Geometry<f64>> {
            Geometry::try_from_wkt_str(raw)
                .map_err(|e| anyhow::anyhow!("geometry filter is not valid WKT: {e}"))
        })
        .transpose()?;

    let polygon_config = args
        .polygon_features_config
        .as_deref()
        .map(|path| -> Result<serde_json::Value> {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&raw).context("polygon features config is not valid JSON")
        })
        .transpose()?;

    let reader = PbfFileReader::new(ReaderOptions {
        tags_filter,
        geometry_filter,
        working_directory: args.working_directory.clone(),
        osm_way_polygon_features_config: polygon_config,
        ..ReaderOptions::default()
    })?;

    let explode_tags = if args.explode_tags {
        Some(true)
    } else if args.compact_tags {
        Some(false)
    } else {
        None
    };

    if cli.verbose > 0 {
        eprintln!("[convert] reading {}", args.pbf.display());
    }

    let result = reader.convert_pbf_to_geoparquet(
        &args.pbf,
        &ConvertOptions {
            result_file_path: args.output.clone(),
            explode_tags,
            ignore_cache: args.ignore_cache,
            filter_osm_ids: args.filter_osm_ids.clone(),
            keep_all_tags: args.keep_all_tags,
        },
    )?;

    println!("{}", result.display());
    Ok(())
}
