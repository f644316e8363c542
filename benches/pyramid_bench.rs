//! Pyramid encoding performance benchmarks

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use image::{Rgb, RgbImage};
use rand::{Rng, SeedableRng};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tiler_core::encoder::{plan_levels, LevelGranularity};
use tiler_core::{DeepZoomEncoder, EncodeOptions, PyramidEncoder};

/// Write a slide of the given size; noisy slides compress poorly
fn generate_slide(dir: &Path, size: u32, noisy: bool) -> PathBuf {
    let mut rng = rand::rngs::StdRng::seed_from_u64(42);
    let slide = RgbImage::from_fn(size, size, |x, y| {
        if noisy {
            Rgb([rng.gen(), rng.gen(), rng.gen()])
        } else {
            Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
        }
    });

    let path = dir.join(format!("slide_{size}.png"));
    slide.save(&path).unwrap();
    path
}

/// Benchmark full pyramid generation for growing slide sizes
fn bench_slide_sizes(c: &mut Criterion) {
    let mut group = c.benchmark_group("slide_sizes");
    group.sample_size(10);

    for size in [1024u32, 2048, 4096] {
        let source_dir = TempDir::new().unwrap();
        let source = generate_slide(source_dir.path(), size, false);

        group.bench_with_input(BenchmarkId::new("encode", size), &source, |b, source| {
            b.iter_with_setup(
                || TempDir::new().unwrap(),
                |output_dir| {
                    DeepZoomEncoder::new()
                        .encode(
                            black_box(source),
                            black_box(output_dir.path()),
                            &EncodeOptions::default(),
                        )
                        .unwrap();
                },
            );
        });
    }

    group.finish();
}

/// Benchmark JPEG quality and content against each other
fn bench_quality(c: &mut Criterion) {
    let mut group = c.benchmark_group("jpeg_quality");
    group.sample_size(10);

    let source_dir = TempDir::new().unwrap();
    let smooth = generate_slide(source_dir.path(), 1024, false);
    let noisy_dir = TempDir::new().unwrap();
    let noisy = generate_slide(noisy_dir.path(), 1024, true);

    for (content, source) in [("smooth", &smooth), ("noisy", &noisy)] {
        for quality in [70u8, 85, 95] {
            let options = EncodeOptions {
                quality,
                ..Default::default()
            };
            group.bench_with_input(
                BenchmarkId::new(content, quality),
                &options,
                |b, options| {
                    b.iter_with_setup(
                        || TempDir::new().unwrap(),
                        |output_dir| {
                            DeepZoomEncoder::new()
                                .encode(black_box(source), output_dir.path(), options)
                                .unwrap();
                        },
                    );
                },
            );
        }
    }

    group.finish();
}

/// Benchmark level planning for whole-slide sized images
fn bench_level_planning(c: &mut Criterion) {
    let mut group = c.benchmark_group("level_planning");

    for granularity in [LevelGranularity::OnePixel, LevelGranularity::OneTile] {
        let options = EncodeOptions {
            level_granularity: granularity,
            ..Default::default()
        };
        group.bench_with_input(
            BenchmarkId::new("plan_levels", format!("{granularity:?}")),
            &options,
            |b, options| b.iter(|| plan_levels(black_box(150_000), black_box(90_000), options)),
        );
    }

    group.finish();
}

criterion_group!(benches, bench_slide_sizes, bench_quality, bench_level_planning);
criterion_main!(benches);
