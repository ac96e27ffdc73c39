use anyhow::{Context, Result};
use clap::Parser;
use std::time::Instant;
use throng_core::{Agent, Scenario, Simulation, SimulationConfig, StepParams};
use tracing::{info, warn};

/// Frames between progress log lines.
const LOG_INTERVAL: u64 = 60;

#[derive(Parser, Debug)]
#[command(
    name = "throng",
    version,
    about = "Headless crowd-simulation driver: run a scenario preset and log aggregates"
)]
struct Options {
    /// Scenario preset: opposing-streams, bottleneck, dense-crossing,
    /// sparse-crossing, scattered-clusters, or ring.
    #[arg(long, default_value_t = Scenario::OpposingStreams)]
    scenario: Scenario,

    /// Agent count before power-of-two capacity rounding.
    #[arg(long, default_value_t = 10_000)]
    population: u32,

    /// Frames to advance before exiting.
    #[arg(long, default_value_t = 600)]
    frames: u64,

    /// Enable predictive look-ahead steering.
    #[arg(long)]
    avoidance: bool,
}

fn main() -> Result<()> {
    init_tracing();
    let options = Options::parse();

    let config = SimulationConfig {
        population: options.population,
        scenario: options.scenario,
        ..SimulationConfig::default()
    };
    let mut sim = Simulation::new(config).context("simulation setup failed")?;
    info!(
        scenario = %options.scenario,
        population = sim.population(),
        capacity = sim.capacity(),
        sort_passes = sim.sort_pass_count(),
        obstacles = sim.obstacles().len(),
        avoidance = options.avoidance,
        "simulation ready"
    );
    if options.frames == 0 {
        warn!("no frames requested; exiting after setup");
        return Ok(());
    }

    let params = StepParams {
        avoidance: options.avoidance,
        ..StepParams::default()
    };
    let started = Instant::now();
    for _ in 0..options.frames {
        let report = sim.step(params);
        if report.tick.0 % LOG_INTERVAL == 0 {
            let (mean_speed, mean_goal_distance) = crowd_summary(sim.agents());
            info!(
                tick = report.tick.0,
                mean_speed, mean_goal_distance, "frame"
            );
        }
    }
    let elapsed = started.elapsed();
    let steps_per_second = options.frames as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
    info!(
        frames = options.frames,
        elapsed_ms = elapsed.as_millis() as u64,
        steps_per_second,
        "run complete"
    );
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Mean speed and mean goal distance over the live population.
fn crowd_summary(agents: &[Agent]) -> (f64, f64) {
    if agents.is_empty() {
        return (0.0, 0.0);
    }
    let mut speed = 0.0f64;
    let mut goal_distance = 0.0f64;
    for agent in agents {
        speed += f64::from(agent.velocity.length());
        goal_distance += f64::from(agent.position.distance(agent.goal));
    }
    let count = agents.len() as f64;
    (speed / count, goal_distance / count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_default_to_the_standard_run() {
        let options = Options::try_parse_from(["throng"]).expect("defaults");
        assert_eq!(options.scenario, Scenario::OpposingStreams);
        assert_eq!(options.population, 10_000);
        assert_eq!(options.frames, 600);
        assert!(!options.avoidance);
    }

    #[test]
    fn options_parse_the_full_flag_set() {
        let options = Options::try_parse_from([
            "throng",
            "--scenario",
            "ring",
            "--population",
            "4096",
            "--frames",
            "1200",
            "--avoidance",
        ])
        .expect("flags");
        assert_eq!(options.scenario, Scenario::Ring);
        assert_eq!(options.population, 4096);
        assert_eq!(options.frames, 1200);
        assert!(options.avoidance);
    }

    #[test]
    fn unknown_scenarios_are_rejected() {
        assert!(Options::try_parse_from(["throng", "--scenario", "flying-v"]).is_err());
        assert!(Options::try_parse_from(["throng", "--population", "not-a-number"]).is_err());
    }
}
