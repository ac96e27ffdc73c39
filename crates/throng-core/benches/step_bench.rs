//! Frame-step throughput benchmarks. Population and frame counts can be
//! overridden without recompiling:
//!
//! ```text
//! THRONG_BENCH_POPULATION=100000 cargo bench -p throng-core
//! ```

use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use std::env;
use throng_core::{Scenario, Simulation, SimulationConfig, StepParams};

fn env_u32(name: &str, default: u32) -> u32 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn bench_config(population: u32, scenario: Scenario) -> SimulationConfig {
    SimulationConfig {
        population,
        scenario,
        ..SimulationConfig::default()
    }
}

/// Warmed simulation: a few frames in, the crowd is in contact and the solve
/// passes do real work.
fn warmed(config: SimulationConfig, frames: u32, params: StepParams) -> Simulation {
    let mut sim = Simulation::new(config).expect("benchmark configuration");
    for _ in 0..frames {
        sim.step(params);
    }
    sim
}

fn bench_step(c: &mut Criterion) {
    let population = env_u32("THRONG_BENCH_POPULATION", 10_000);
    let warmup_frames = env_u32("THRONG_BENCH_WARMUP_FRAMES", 50);
    let params = StepParams::default();

    let mut group = c.benchmark_group("step");
    group.sample_size(env_u32("THRONG_BENCH_SAMPLES", 20) as usize);

    let streams = warmed(
        bench_config(population, Scenario::OpposingStreams),
        warmup_frames,
        params,
    );
    group.bench_function("opposing_streams", |b| {
        b.iter_batched(
            || streams.clone(),
            |mut sim| {
                sim.step(params);
                sim
            },
            BatchSize::LargeInput,
        );
    });

    let avoidance_params = StepParams {
        avoidance: true,
        ..StepParams::default()
    };
    let crossing = warmed(
        bench_config(population, Scenario::DenseCrossing),
        warmup_frames,
        avoidance_params,
    );
    group.bench_function("dense_crossing_avoidance", |b| {
        b.iter_batched(
            || crossing.clone(),
            |mut sim| {
                sim.step(avoidance_params);
                sim
            },
            BatchSize::LargeInput,
        );
    });

    group.finish();
}

fn bench_initialize(c: &mut Criterion) {
    let population = env_u32("THRONG_BENCH_POPULATION", 10_000);
    let config = bench_config(population, Scenario::ScatteredClusters);

    c.bench_function("initialize/scattered_clusters", |b| {
        b.iter_batched(
            || config.clone(),
            |config| Simulation::new(config).expect("benchmark configuration"),
            BatchSize::LargeInput,
        );
    });
}

criterion_group!(benches, bench_step, bench_initialize);
criterion_main!(benches);
