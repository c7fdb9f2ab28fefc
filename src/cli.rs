use clap::{Args, Parser, Subcommand, ValueHint};
use std::path::PathBuf;

/// PBF-to-GeoParquet CLI (argument schema only)
#[derive(Parser, Debug)]
#[command(name = "pbf2parquet", version, about, propagate_version = true)]
pub struct Cli {
    /// Increase output verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Convert a local OSM PBF extract into a GeoParquet file
    Convert(ConvertArgs),
}

#[derive(Args, Debug)]
pub struct ConvertArgs {
    /// Input `*.osm.pbf` file
    #[arg(value_hint = ValueHint::FilePath)]
    pub pbf: PathBuf,

    /// Output file path (derived from the inputs when omitted)
    #[arg(short, long, value_hint = ValueHint::FilePath)]
    pub output: Option<PathBuf>,

    /// OSM tags filter as JSON, flat or grouped
    #[arg(long)]
    pub osm_tags_filter: Option<String>,

    /// Geometry filter as WKT in WGS84 lon/lat
    #[arg(long)]
    pub geom_filter_wkt: Option<String>,

    /// Keep only these feature ids (node/<id>, way/<id>, relation/<id>)
    #[arg(long)]
    pub filter_osm_ids: Vec<String>,

    /// One column per tag key instead of a single mapping column
    #[arg(long, conflicts_with = "compact_tags")]
    pub explode_tags: bool,

    /// Force the single mapping column
    #[arg(long)]
    pub compact_tags: bool,

    /// Emit all tags even when a tag filter is present
    #[arg(long)]
    pub keep_all_tags: bool,

    /// Directory for the result and the intermediate files
    #[arg(long, default_value = "files", value_hint = ValueHint::DirPath)]
    pub working_directory: PathBuf,

    /// Convert even when a cached result exists
    #[arg(long)]
    pub ignore_cache: bool,

    /// Path to a custom way polygon features config (JSON)
    #[arg(long, value_hint = ValueHint::FilePath)]
    pub polygon_features_config: Option<PathBuf>,
}
