//! Reproducible zip bundles.
//!
//! Entries are written in sorted order with a fixed timestamp and fixed
//! permissions, so zipping the same directory twice yields identical bytes.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipWriter};

use crate::error::{io_at, Result};

const ENTRY_PERMISSIONS: u32 = 0o644;

/// Zip every file under `dir` into `out`. Returns the number of entries.
///
/// # Errors
///
/// Returns an error if the directory cannot be read or the zip written.
pub async fn create_predictable_zip(dir: &Path, out: &Path) -> Result<usize> {
    let dir = dir.to_path_buf();
    let out = out.to_path_buf();
    tokio::task::spawn_blocking(move || write_zip(&dir, &out)).await?
}

fn write_zip(dir: &Path, out: &Path) -> Result<usize> {
    let entries = sorted_entries(dir)?;

    if let Some(parent) = out.parent() {
        fs::create_dir_all(parent).map_err(io_at(parent))?;
    }
    let file = fs::File::create(out).map_err(io_at(out))?;
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(DateTime::default())
        .unix_permissions(ENTRY_PERMISSIONS);

    for (name, path) in &entries {
        let data = fs::read(path).map_err(io_at(path))?;
        zip.start_file(name.as_str(), options)?;
        zip.write_all(&data).map_err(io_at(path))?;
    }
    zip.finish()?;

    debug!(path = %out.display(), entries = entries.len(), "Wrote bundle");
    Ok(entries.len())
}

/// Files under `dir` as `(relative name with '/' separators, path)`, sorted.
fn sorted_entries(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut entries = Vec::new();
    let mut stack = vec![dir.to_path_buf()];

    while let Some(current) = stack.pop() {
        for entry in fs::read_dir(&current).map_err(io_at(&current))? {
            let entry = entry.map_err(io_at(&current))?;
            let path = entry.path();
            let file_type = entry.file_type().map_err(io_at(&path))?;
            if file_type.is_dir() {
                stack.push(path);
            } else if file_type.is_file() {
                let name = path
                    .strip_prefix(dir)
                    .unwrap_or(&path)
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                entries.push((name, path));
            }
        }
    }

    entries.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::TempDir;

    fn populate(dir: &Path) {
        fs::create_dir_all(dir.join("example.com/b")).unwrap();
        fs::write(dir.join("index.html"), "<html></html>").unwrap();
        fs::write(dir.join("example.com/b/img.png"), [0u8, 1, 2, 3]).unwrap();
        fs::write(dir.join("example.com/site.css"), "body{}").unwrap();
    }

    #[tokio::test]
    async fn test_zip_is_byte_identical_across_builds() {
        let src = TempDir::new().unwrap();
        populate(src.path());
        let out = TempDir::new().unwrap();

        let first = out.path().join("first.zip");
        let second = out.path().join("second.zip");
        create_predictable_zip(src.path(), &first).await.unwrap();
        create_predictable_zip(src.path(), &second).await.unwrap();

        assert_eq!(fs::read(&first).unwrap(), fs::read(&second).unwrap());
    }

    #[tokio::test]
    async fn test_zip_entries_sorted_and_complete() {
        let src = TempDir::new().unwrap();
        populate(src.path());
        let out_dir = TempDir::new().unwrap();
        let out = out_dir.path().join("bundle.zip");

        let count = create_predictable_zip(src.path(), &out).await.unwrap();
        assert_eq!(count, 3);

        let mut archive = zip::ZipArchive::new(fs::File::open(&out).unwrap()).unwrap();
        let names: Vec<String> = archive.file_names().map(str::to_string).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
        assert!(names.contains(&"example.com/b/img.png".to_string()));

        let mut index = String::new();
        archive
            .by_name("index.html")
            .unwrap()
            .read_to_string(&mut index)
            .unwrap();
        assert_eq!(index, "<html></html>");
    }
}
