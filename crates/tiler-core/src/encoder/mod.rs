//! Pyramid encoding
//!
//! The pipeline drives encoding through the [`PyramidEncoder`] trait and does
//! not look at the source format itself. [`DeepZoomEncoder`] is the bundled
//! implementation; it writes a `.dzi` descriptor and one directory of tiles per
//! level.

mod deepzoom;
mod descriptor;

pub use deepzoom::DeepZoomEncoder;
pub use descriptor::DziDescriptor;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised while building a pyramid
#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid encoder options: {0}")]
    InvalidOptions(String),

    #[error("Invalid descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("Image of {width}x{height} needs more than {limit} bytes decoded")]
    TooLarge { width: u32, height: u32, limit: u64 },
}

/// Which levels are materialized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LevelGranularity {
    /// Every power-of-two level down to 1x1
    OnePixel,
    /// Stop at the first level that fits in a single tile
    OneTile,
}

/// Tile file format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TileFormat {
    Jpeg,
    Png,
}

impl TileFormat {
    /// File extension and DZI `Format` attribute
    pub fn extension(&self) -> &'static str {
        match self {
            TileFormat::Jpeg => "jpg",
            TileFormat::Png => "png",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Some(TileFormat::Jpeg),
            "png" => Some(TileFormat::Png),
            _ => None,
        }
    }
}

/// Encoder parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncodeOptions {
    /// Tile edge in pixels
    pub tile_size: u32,
    /// Pixels shared between neighbouring tiles
    pub overlap: u32,
    /// JPEG quality, 1-100
    pub quality: u8,
    pub level_granularity: LevelGranularity,
    pub format: TileFormat,
    /// Descriptor is `<base_name>.dzi`, tiles live in `<base_name>_files/`
    pub base_name: String,
    /// Upper bound on decoded pixel memory; larger sources are rejected
    /// before decoding
    pub max_decoded_bytes: u64,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            tile_size: 256,
            overlap: 0,
            quality: 85,
            level_granularity: LevelGranularity::OnePixel,
            format: TileFormat::Jpeg,
            base_name: "image".to_string(),
            max_decoded_bytes: 16 * 1024 * 1024 * 1024, // 16GB
        }
    }
}

impl EncodeOptions {
    pub fn validate(&self) -> Result<(), EncodeError> {
        if self.tile_size == 0 {
            return Err(EncodeError::InvalidOptions("tile_size must be positive".into()));
        }
        if self.overlap >= self.tile_size {
            return Err(EncodeError::InvalidOptions(format!(
                "overlap {} must be smaller than tile_size {}",
                self.overlap, self.tile_size
            )));
        }
        if !(1..=100).contains(&self.quality) {
            return Err(EncodeError::InvalidOptions(format!(
                "quality {} is outside 1-100",
                self.quality
            )));
        }
        if self.base_name.is_empty() || self.base_name.contains(['/', '\\']) {
            return Err(EncodeError::InvalidOptions(format!(
                "base_name '{}' must be a plain file name",
                self.base_name
            )));
        }
        Ok(())
    }
}

/// Dimensions and tile grid of one pyramid level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelInfo {
    pub level: u32,
    pub width: u32,
    pub height: u32,
    pub columns: u32,
    pub rows: u32,
}

impl LevelInfo {
    pub fn tile_count(&self) -> u64 {
        u64::from(self.columns) * u64::from(self.rows)
    }
}

/// What an encoder produced on disk
#[derive(Debug, Clone, PartialEq)]
pub struct PyramidLayout {
    pub width: u32,
    pub height: u32,
    pub tile_size: u32,
    pub overlap: u32,
    pub format: TileFormat,
    /// Levels from coarsest to finest
    pub levels: Vec<LevelInfo>,
    pub descriptor_path: PathBuf,
    pub tiles_dir: PathBuf,
}

impl PyramidLayout {
    pub fn tile_count(&self) -> u64 {
        self.levels.iter().map(LevelInfo::tile_count).sum()
    }

    /// Tiles plus the descriptor
    pub fn file_count(&self) -> u64 {
        self.tile_count() + 1
    }
}

/// Level grid for an image, coarsest level first.
///
/// Level `n` is the full-resolution image where `n = ceil(log2(max(w, h)))`;
/// each lower level halves the dimensions, rounding up.
pub fn plan_levels(width: u32, height: u32, options: &EncodeOptions) -> Vec<LevelInfo> {
    let mut dims = vec![(width.max(1), height.max(1))];
    while let Some(&(w, h)) = dims.last() {
        if w == 1 && h == 1 {
            break;
        }
        dims.push((w.div_ceil(2), h.div_ceil(2)));
    }

    let max_level = (dims.len() - 1) as u32;
    let mut levels: Vec<LevelInfo> = dims
        .into_iter()
        .enumerate()
        .map(|(i, (w, h))| LevelInfo {
            level: max_level - i as u32,
            width: w,
            height: h,
            columns: w.div_ceil(options.tile_size),
            rows: h.div_ceil(options.tile_size),
        })
        .collect();

    if options.level_granularity == LevelGranularity::OneTile {
        if let Some(first_single) = levels
            .iter()
            .position(|l| l.width <= options.tile_size && l.height <= options.tile_size)
        {
            levels.truncate(first_single + 1);
        }
    }

    levels.reverse();
    levels
}

/// Turns a source image into a tile pyramid on local disk.
///
/// Implementations are blocking; the orchestrator runs them on the blocking
/// thread pool.
pub trait PyramidEncoder: Send + Sync + std::fmt::Debug {
    /// Encode `source` into `output_dir`, returning what was written
    fn encode(
        &self,
        source: &Path,
        output_dir: &Path,
        options: &EncodeOptions,
    ) -> Result<PyramidLayout, EncodeError>;
}
