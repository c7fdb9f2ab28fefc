use std::fs;
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::Duration;

use walkdir::WalkDir;

use crate::error::{Error, Result};

/// Create the directory if it doesn't exist; error if a non-directory exists there.
pub fn ensure_dir_exists(path: &Path) -> Result<()> {
    if path.exists() {
        if !path.is_dir() {
            return Err(Error::Internal(format!(
                "path exists but is not a directory: {}",
                path.display()
            )));
        }
    } else {
        fs::create_dir_all(path).map_err(|e| Error::intermediate(path, e))?;
    }
    Ok(())
}

/// Delete intermediate directories after their consumers are done.
///
/// Retries tolerate filesystems where file handles are released lazily.
pub fn delete_directories<I, P>(paths: I) -> Result<()>
where
    I: IntoIterator<Item = P>,
    P: AsRef<Path>,
{
    for path in paths {
        let path = path.as_ref();
        let mut tries = 100;
        while path.exists() {
            match fs::remove_dir_all(path) {
                Ok(()) => break,
                Err(error) => {
                    tries -= 1;
                    if tries == 0 {
                        return Err(Error::intermediate(path, error));
                    }
                    log::debug!("retrying removal of {}: {error}", path.display());
                    sleep(Duration::from_millis(500));
                }
            }
        }
    }
    Ok(())
}

/// All parquet chunk files under a directory, sorted for determinism.
/// A missing directory reads as an empty table.
pub fn parquet_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in WalkDir::new(dir) {
        let entry = entry.map_err(|e| {
            Error::intermediate(dir, std::io::Error::other(e))
        })?;
        if entry.file_type().is_file()
            && entry.path().extension().is_some_and(|ext| ext == "parquet")
        {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_directory_lists_no_files() {
        let tmp = tempfile::tempdir().unwrap();
        let files = parquet_files(&tmp.path().join("nope")).unwrap();
        assert!(files.is_empty());
    }

    #[test]
    fn lists_parquet_files_sorted() {
        let tmp = tempfile::tempdir().unwrap();
        for name in ["b.parquet", "a.parquet", "ignored.txt"] {
            fs::write(tmp.path().join(name), b"x").unwrap();
        }
        let files = parquet_files(tmp.path()).unwrap();
        let names: Vec<_> =
            files.iter().map(|p| p.file_name().unwrap().to_string_lossy().into_owned()).collect();
        assert_eq!(names, vec!["a.parquet", "b.parquet"]);
    }

    #[test]
    fn delete_directories_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("stage");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("chunk_0.parquet"), b"x").unwrap();
        delete_directories([&dir]).unwrap();
        assert!(!dir.exists());
        delete_directories([&dir]).unwrap();
    }
}
