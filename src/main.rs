use anyhow::Result;
use clap::Parser;

use pbf2parquet::cli::{Cli, Commands};
use pbf2parquet::commands::convert;

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        _ => log::LevelFilter::Debug,
    };
    simple_logger::SimpleLogger::new().with_level(level).init()?;

    match &cli.command {
        Commands::Convert(args) => convert(&cli, args),
    }
}
