use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the conversion pipeline.
///
/// Shape and configuration errors are raised before any I/O happens.
/// Intermediate I/O errors are fatal and leave the temporary directory in
/// place for diagnosis. Invalid geometries are never fatal; they are either
/// repaired or, for relations, dropped.
#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot read PBF file at {path:?}")]
    InputNotReadable {
        path: PathBuf,
        #[source]
        source: osmpbf::Error,
    },

    #[error("invalid OSM tags filter: {0}")]
    FilterShapeInvalid(String),

    #[error("invalid way polygon features config: {0}")]
    PolygonFeaturesConfigInvalid(String),

    #[error("intermediate file error at {path:?}")]
    IntermediateIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed intermediate data: {0}")]
    Internal(String),

    #[error(transparent)]
    Polars(#[from] polars::prelude::PolarsError),

    #[error(transparent)]
    Arrow(#[from] arrow_schema::ArrowError),

    #[error(transparent)]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Wrap an I/O error with the path that produced it.
    pub fn intermediate(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::IntermediateIo { path: path.into(), source }
    }
}
