use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use ahash::AHashSet;
use polars::frame::DataFrame;
use polars::io::SerReader;
use polars::prelude::{ParquetCompression, ParquetReader, ParquetWriter};

use crate::common::fs::{ensure_dir_exists, parquet_files};
use crate::error::{Error, Result};

/// Rows per intermediate chunk file.
pub const CHUNK_ROWS: usize = 100_000;

/// Row-group size inside intermediate chunk files.
const INTERMEDIATE_ROW_GROUP_SIZE: usize = 25_000;

/// Resolve a parquet compression name for the intermediate files.
pub fn compression_from_str(name: &str) -> Result<ParquetCompression> {
    match name {
        "snappy" => Ok(ParquetCompression::Snappy),
        "zstd" => Ok(ParquetCompression::Zstd(None)),
        "gzip" => Ok(ParquetCompression::Gzip(None)),
        "lz4" => Ok(ParquetCompression::Lz4Raw),
        "uncompressed" => Ok(ParquetCompression::Uncompressed),
        other => Err(Error::Internal(format!("unsupported parquet compression: {other}"))),
    }
}

/// Path of the `seq`-th chunk inside a table directory.
pub fn chunk_path(dir: &Path, seq: usize) -> PathBuf {
    dir.join(format!("chunk_{seq:05}.parquet"))
}

/// Write one chunk of a table directory.
pub fn write_chunk(
    mut df: DataFrame,
    dir: &Path,
    seq: usize,
    compression: ParquetCompression,
) -> Result<()> {
    ensure_dir_exists(dir)?;
    let path = chunk_path(dir, seq);
    let file = File::create(&path).map_err(|e| Error::intermediate(&path, e))?;
    ParquetWriter::new(BufWriter::new(file))
        .with_compression(compression)
        .with_row_group_size(Some(INTERMEDIATE_ROW_GROUP_SIZE))
        .finish(&mut df)?;
    Ok(())
}

/// Read a single parquet file into a DataFrame.
pub fn read_parquet_file(path: &Path) -> Result<DataFrame> {
    let file = File::open(path).map_err(|e| Error::intermediate(path, e))?;
    Ok(ParquetReader::new(file).finish()?)
}

/// Iterate the chunks of a table directory lazily, in chunk order; one
/// chunk is resident at a time.
pub fn read_dir_frames(dir: &Path) -> Result<impl Iterator<Item = Result<DataFrame>>> {
    let files = parquet_files(dir)?;
    Ok(files.into_iter().map(|path| read_parquet_file(&path)))
}

/// Read a whole table directory into one DataFrame; `None` when empty.
/// Only for row sets already bounded by the bucket size.
pub fn read_dir_concat(dir: &Path) -> Result<Option<DataFrame>> {
    let mut combined: Option<DataFrame> = None;
    for frame in read_dir_frames(dir)? {
        let frame = frame?;
        combined = Some(match combined {
            Some(acc) => acc.vstack(&frame)?,
            None => frame,
        });
    }
    Ok(combined)
}

/// Write an id table as chunked parquet.
pub fn write_id_chunks(
    ids: impl IntoIterator<Item = i64>,
    dir: &Path,
    compression: ParquetCompression,
) -> Result<()> {
    ensure_dir_exists(dir)?;
    let mut buffer: Vec<i64> = Vec::with_capacity(CHUNK_ROWS);
    let mut seq = 0;
    for id in ids {
        buffer.push(id);
        if buffer.len() >= CHUNK_ROWS {
            let df = polars::df!("id" => std::mem::take(&mut buffer))?;
            write_chunk(df, dir, seq, compression)?;
            seq += 1;
        }
    }
    if !buffer.is_empty() || seq == 0 {
        let df = polars::df!("id" => buffer)?;
        write_chunk(df, dir, seq, compression)?;
    }
    Ok(())
}

/// Load an id table into a set.
pub fn read_id_set(dir: &Path) -> Result<AHashSet<i64>> {
    let mut ids = AHashSet::new();
    for frame in read_dir_frames(dir)? {
        let frame = frame?;
        let column = frame.column("id")?.i64()?;
        ids.extend(column.into_iter().flatten());
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunked_id_table_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("ids");
        write_id_chunks([3, 1, 2], &dir, ParquetCompression::Snappy).unwrap();
        let ids = read_id_set(&dir).unwrap();
        assert_eq!(ids.len(), 3);
        assert!(ids.contains(&1) && ids.contains(&2) && ids.contains(&3));
    }

    #[test]
    fn empty_id_table_still_writes_a_chunk() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("ids");
        write_id_chunks([], &dir, ParquetCompression::Snappy).unwrap();
        assert_eq!(parquet_files(&dir).unwrap().len(), 1);
        assert!(read_id_set(&dir).unwrap().is_empty());
    }

    #[test]
    fn concatenates_chunks_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("table");
        let a = polars::df!("id" => [1i64, 2]).unwrap();
        let b = polars::df!("id" => [3i64]).unwrap();
        write_chunk(a, &dir, 0, ParquetCompression::Snappy).unwrap();
        write_chunk(b, &dir, 1, ParquetCompression::Snappy).unwrap();
        let combined = read_dir_concat(&dir).unwrap().unwrap();
        assert_eq!(combined.height(), 3);
    }
}
