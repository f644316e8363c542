//! Synthetic slides and store seeding

use crate::TestDir;
use anyhow::{Context, Result};
use image::{Rgb, RgbImage};
use std::path::{Path, PathBuf};
use tiler_store::ObjectStoreClient;

/// Writes a `width` x `height` gradient image; the format follows the file
/// extension (`.png`, `.tif`/`.tiff`, `.jpg`)
pub fn write_test_slide(path: &Path, width: u32, height: u32) -> Result<()> {
    let slide = RgbImage::from_fn(width, height, |x, y| {
        Rgb([
            (x * 255 / width.max(1)) as u8,
            (y * 255 / height.max(1)) as u8,
            ((x ^ y) & 0xFF) as u8,
        ])
    });

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    slide
        .save(path)
        .with_context(|| format!("writing test slide {}", path.display()))?;
    Ok(())
}

/// Creates a slide named `name` inside `test_dir`
pub fn create_slide(test_dir: &TestDir, name: &str, width: u32, height: u32) -> Result<PathBuf> {
    let path = test_dir.join(name);
    write_test_slide(&path, width, height)?;
    Ok(path)
}

/// Creates `bucket` if needed and uploads `local` as `key`
pub async fn seed_object(
    store: &dyn ObjectStoreClient,
    bucket: &str,
    key: &str,
    local: &Path,
) -> Result<u64> {
    store
        .create_bucket(bucket)
        .await
        .with_context(|| format!("creating bucket {bucket}"))?;
    let written = store
        .upload_file(bucket, key, local)
        .await
        .with_context(|| format!("uploading {bucket}/{key}"))?;
    Ok(written)
}

/// Generates a slide and seeds it into the store in one go
pub async fn seed_slide(
    store: &dyn ObjectStoreClient,
    test_dir: &TestDir,
    bucket: &str,
    key: &str,
    width: u32,
    height: u32,
) -> Result<u64> {
    let file_name = key.rsplit('/').next().unwrap_or(key);
    let local = create_slide(test_dir, &format!("seed/{file_name}"), width, height)?;
    seed_object(store, bucket, key, &local).await
}
