//! Benchmarks for the block render path
//!
//! Measures full-engine rendering at different polyphony levels.
//!
//! Run with: cargo bench --bench render_bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use strata::bus::StereoBus;
use strata::engine::Engine;
use strata::region::{NumRange, Region};
use strata::sample::SampleBuffer;

const RATE: f32 = 48_000.0;
const BLOCK: usize = 256;

fn build_engine(filters: bool) -> Engine {
    let mut engine = Engine::with_config(RATE, 64, BLOCK);
    let data: Vec<f32> = (0..RATE as usize)
        .map(|i| (std::f32::consts::TAU * 220.0 * i as f32 / RATE).sin())
        .collect();
    let mut region = Region::new(0);
    region.set_sample(Arc::new(SampleBuffer::from_mono(data, RATE)));
    region.key_range = NumRange::new(0, 127);
    region.amp_eg.release = 0.1;
    // Keep voices alive for the whole measurement
    region.loop_desc.mode = strata::region::LoopMode::Continuous;
    if filters {
        region.filters.push(strata::filter::FilterDescription::default());
        region.equalizers.push(strata::filter::EqDescription::default());
    }
    engine.load_regions(vec![region]);
    engine
}

fn bench_render(c: &mut Criterion) {
    let mut group = c.benchmark_group("render_block");
    for voices in [1usize, 8, 32] {
        group.bench_with_input(BenchmarkId::new("plain", voices), &voices, |b, &voices| {
            let mut engine = build_engine(false);
            for i in 0..voices {
                engine.note_on(0, (36 + i) as u8, 0.8);
            }
            let mut buses = vec![StereoBus::new(BLOCK)];
            b.iter(|| {
                engine.render_block(black_box(&mut buses), BLOCK);
            });
        });
        group.bench_with_input(
            BenchmarkId::new("filtered", voices),
            &voices,
            |b, &voices| {
                let mut engine = build_engine(true);
                for i in 0..voices {
                    engine.note_on(0, (36 + i) as u8, 0.8);
                }
                let mut buses = vec![StereoBus::new(BLOCK)];
                b.iter(|| {
                    engine.render_block(black_box(&mut buses), BLOCK);
                });
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_render);
criterion_main!(benches);
