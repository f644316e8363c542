//! Common assertions for tiler testing

use anyhow::Result;
use std::path::Path;
use tiler_store::ObjectStoreClient;
use walkdir::WalkDir;

/// Relative, `/`-separated paths of every file under `dir`, sorted
pub fn list_files(dir: &Path) -> Result<Vec<String>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir) {
        let entry = entry?;
        if entry.file_type().is_file() {
            let relative = entry.path().strip_prefix(dir)?;
            files.push(
                relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/"),
            );
        }
    }
    files.sort();
    Ok(files)
}

/// Asserts that `dir` is gone or holds nothing
pub fn assert_dir_empty_or_missing(dir: &Path) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    let leftovers: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .collect();
    assert!(
        leftovers.is_empty(),
        "Expected {} to be empty, found {:?}",
        dir.display(),
        leftovers
    );
    Ok(())
}

/// Keys stored under `prefix`, sorted
pub async fn object_keys(
    store: &dyn ObjectStoreClient,
    bucket: &str,
    prefix: &str,
) -> Result<Vec<String>> {
    let listing = store.list_objects(bucket, prefix).await?;
    Ok(listing.into_iter().map(|entry| entry.key).collect())
}

/// Asserts that every key starts with `prefix/`
pub fn assert_keys_under_prefix(keys: &[String], prefix: &str) {
    let expected = format!("{}/", prefix.trim_end_matches('/'));
    for key in keys {
        assert!(
            key.starts_with(&expected),
            "Key {key} is outside {expected}"
        );
    }
}
