//! Deep Zoom pyramid writer built on the `image` crate

use super::{
    plan_levels, DziDescriptor, EncodeError, EncodeOptions, LevelInfo, PyramidEncoder,
    PyramidLayout, TileFormat,
};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{ImageFormat, ImageReader, Limits, RgbImage};
use rayon::prelude::*;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info};

/// Writes `<base>.dzi` plus `<base>_files/<level>/<col>_<row>.<ext>`.
///
/// The full-resolution level is tiled first; every lower level is produced by
/// halving the previous one, so only one level is held in memory at a time.
/// Tiles within a level are encoded in parallel.
///
/// The source is decoded whole into an RGB buffer of `width * height * 3`
/// bytes. Sources above [`EncodeOptions::max_decoded_bytes`] fail with
/// [`EncodeError::TooLarge`] before any pixel data is read.
#[derive(Debug, Default, Clone)]
pub struct DeepZoomEncoder;

impl DeepZoomEncoder {
    pub fn new() -> Self {
        Self
    }
}

impl PyramidEncoder for DeepZoomEncoder {
    fn encode(
        &self,
        source: &Path,
        output_dir: &Path,
        options: &EncodeOptions,
    ) -> Result<PyramidLayout, EncodeError> {
        options.validate()?;
        let start = Instant::now();

        let mut reader = open_within_budget(source, options.max_decoded_bytes)?;
        let mut limits = Limits::no_limits();
        limits.max_alloc = Some(options.max_decoded_bytes);
        reader.limits(limits);
        let mut current = reader.decode()?.into_rgb8();
        let (width, height) = current.dimensions();
        debug!("Decoded {} ({}x{})", source.display(), width, height);

        let levels = plan_levels(width, height, options);
        let tiles_dir = output_dir.join(format!("{}_files", options.base_name));
        fs::create_dir_all(&tiles_dir)?;

        // Finest level first; `levels` is ordered coarsest first.
        for info in levels.iter().rev() {
            if current.dimensions() != (info.width, info.height) {
                current = imageops::resize(&current, info.width, info.height, FilterType::Triangle);
            }
            write_level(&current, info, &tiles_dir, options)?;
        }

        let descriptor = DziDescriptor {
            width,
            height,
            tile_size: options.tile_size,
            overlap: options.overlap,
            format: options.format,
        };
        let descriptor_path = output_dir.join(format!("{}.dzi", options.base_name));
        fs::write(&descriptor_path, descriptor.to_xml())?;

        let layout = PyramidLayout {
            width,
            height,
            tile_size: options.tile_size,
            overlap: options.overlap,
            format: options.format,
            levels,
            descriptor_path,
            tiles_dir,
        };

        info!(
            "Encoded {} levels, {} tiles in {:.2}s",
            layout.levels.len(),
            layout.tile_count(),
            start.elapsed().as_secs_f64()
        );
        Ok(layout)
    }
}

fn write_level(
    level_image: &RgbImage,
    info: &LevelInfo,
    tiles_dir: &Path,
    options: &EncodeOptions,
) -> Result<(), EncodeError> {
    let level_dir = tiles_dir.join(info.level.to_string());
    fs::create_dir_all(&level_dir)?;

    let positions: Vec<(u32, u32)> = (0..info.rows)
        .flat_map(|row| (0..info.columns).map(move |col| (col, row)))
        .collect();

    positions.par_iter().try_for_each(|&(col, row)| {
        let (x, y, w, h) = tile_bounds(col, row, info, options);
        let tile = imageops::crop_imm(level_image, x, y, w, h).to_image();
        let path = level_dir.join(format!("{col}_{row}.{}", options.format.extension()));
        write_tile(&tile, &path, options)
    })?;

    debug!(
        "Level {} ({}x{}): {} tiles",
        info.level,
        info.width,
        info.height,
        info.tile_count()
    );
    Ok(())
}

/// Pixel rectangle of a tile, including overlap on the sides that have a
/// neighbour.
fn tile_bounds(
    col: u32,
    row: u32,
    info: &LevelInfo,
    options: &EncodeOptions,
) -> (u32, u32, u32, u32) {
    let axis = |index: u32, count: u32, extent: u32| {
        let lead = if index > 0 { options.overlap } else { 0 };
        let trail = if index + 1 < count { options.overlap } else { 0 };
        let start = index * options.tile_size - lead;
        let len = (options.tile_size + lead + trail).min(extent - start);
        (start, len)
    };

    let (x, w) = axis(col, info.columns, info.width);
    let (y, h) = axis(row, info.rows, info.height);
    (x, y, w, h)
}

fn write_tile(tile: &RgbImage, path: &Path, options: &EncodeOptions) -> Result<(), EncodeError> {
    match options.format {
        TileFormat::Jpeg => {
            let mut writer = BufWriter::new(File::create(path)?);
            JpegEncoder::new_with_quality(&mut writer, options.quality).encode_image(tile)?;
            writer.flush()?;
        }
        TileFormat::Png => tile.save_with_format(path, ImageFormat::Png)?,
    }
    Ok(())
}

/// Reader for `source` once its RGB size is known to fit in `budget` bytes
fn open_within_budget(
    source: &Path,
    budget: u64,
) -> Result<ImageReader<BufReader<File>>, EncodeError> {
    let (width, height) = ImageReader::open(source)?
        .with_guessed_format()?
        .into_dimensions()?;
    if u64::from(width) * u64::from(height) * 3 > budget {
        return Err(EncodeError::TooLarge {
            width,
            height,
            limit: budget,
        });
    }
    Ok(ImageReader::open(source)?.with_guessed_format()?)
}
