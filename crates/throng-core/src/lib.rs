//! Parallel position-based crowd simulation engine.
//!
//! The engine advances a fixed-capacity population of goal-seeking agents
//! through a barrier-sequenced pipeline each frame: explicit integration,
//! spatial-hash cell assignment, a bitonic sort by cell, cell-range table
//! construction, a contact pass, a fixed number of constraint relaxation
//! passes, and velocity finalization. Two copies of the agent array exist at
//! all times; every stage that rewrites agent state reads one role and
//! writes the other, then the roles swap, so concurrent workers never
//! observe a half-written neighbor. All stages are deterministic for a given
//! configuration regardless of worker count.

use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec3, Vec4};
use ordered_float::OrderedFloat;
use rand::{Rng, SeedableRng, rngs::SmallRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::TryReserveError;
use std::f32::consts::TAU;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use throng_grid::{CellTable, GridError, GridLayout, SENTINEL_CELL, pass_count, sort_by_cell};

/// Upper bound on the requested population; the padded capacity stays in the
/// low millions.
pub const MAX_POPULATION: u32 = 1 << 21;

/// Below this separation a contact normal is considered degenerate and the
/// pair is pushed apart along the x axis by index order instead.
const CONTACT_EPSILON: f32 = 1e-4;

/// Display height of obstacle boxes; collision happens in the ground plane.
const OBSTACLE_HEIGHT: f32 = 2.0;

const SUB_GROUP_COUNT: usize = 6;

const GROUP_COLORS: [Vec4; SUB_GROUP_COUNT] = [
    Vec4::new(0.9, 0.2, 0.2, 1.0),
    Vec4::new(0.2, 0.3, 0.9, 1.0),
    Vec4::new(0.2, 0.8, 0.3, 1.0),
    Vec4::new(0.95, 0.8, 0.2, 1.0),
    Vec4::new(0.7, 0.3, 0.9, 1.0),
    Vec4::new(0.2, 0.8, 0.8, 1.0),
];

/// Errors surfaced by simulation construction and reset.
#[derive(Debug, Error)]
pub enum SimError {
    /// Configuration values that cannot be used.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// Caller-supplied initial agent state violates a store invariant.
    #[error("invalid initial state: {0}")]
    InvalidState(&'static str),
    /// An agent buffer could not be allocated; previous state is untouched.
    #[error("agent buffer allocation failed: {0}")]
    Allocation(#[from] TryReserveError),
    /// The spatial grid rejected its configuration or allocation.
    #[error("spatial grid failure: {0}")]
    Grid(#[from] GridError),
}

/// Monotonic frame counter; advances only when a frame commits.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Tick(pub u64);

impl Tick {
    /// Tick before any frame has run.
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    /// The following tick.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

/// Per-frame inputs supplied by the driving collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepParams {
    /// Seconds advanced by the frame. Zero (or less) pauses: the pipeline is
    /// skipped and the buffers are left untouched.
    pub delta_time: f32,
    /// Enables predictive look-ahead steering during integration.
    pub avoidance: bool,
    /// Seconds of forward prediction used by the avoidance model.
    pub look_ahead: f32,
}

impl Default for StepParams {
    fn default() -> Self {
        Self {
            delta_time: 0.04,
            avoidance: false,
            look_ahead: 0.5,
        }
    }
}

/// Outcome of one [`Simulation::step`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepReport {
    /// Tick after the call; unchanged when the frame was skipped.
    pub tick: Tick,
    /// Whether the pipeline ran and the buffer roles advanced.
    pub committed: bool,
}

/// Parameter block mirrored into the store before each frame, the analogue
/// of the uniform block a compute dispatch would read. The solve kernel is
/// stateless: `constraint_iteration` is rewritten before each pass instead
/// of being recomputed inside it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrameParams {
    pub delta_time: f32,
    pub avoidance: bool,
    pub look_ahead: f32,
    /// Padded power-of-two agent capacity.
    pub agent_capacity: u32,
    pub grid_width: u32,
    /// Current solve pass, zero-based; the contact pass is pass zero.
    pub constraint_iteration: u32,
    pub frame_tick: Tick,
}

impl FrameParams {
    fn idle(layout: &GridLayout, capacity: usize) -> Self {
        Self {
            delta_time: 0.0,
            avoidance: false,
            look_ahead: 0.0,
            agent_capacity: capacity as u32,
            grid_width: layout.width(),
            constraint_iteration: 0,
            frame_tick: Tick::zero(),
        }
    }
}

/// One simulated individual. Fixed 96-byte stride, plain-old-data, so the
/// active buffer can be handed to a renderer or compared bytewise.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Agent {
    pub position: Vec3,
    /// Collision disk radius; always positive, padding slots included.
    pub radius: f32,
    pub color: Vec4,
    pub velocity: Vec3,
    /// Zero marks an immovable agent (and every padding slot).
    pub inverse_mass: f32,
    /// Predicted position; written by integration, corrected by the solver,
    /// committed to `position` by finalization.
    pub planned: Vec3,
    pub preferred_speed: f32,
    pub goal: Vec3,
    /// Spatial-hash cell id; [`SENTINEL_CELL`] for padding slots. Consistent
    /// with `planned` right after cell assignment and intentionally stale
    /// for the rest of the frame.
    pub cell: u32,
    /// Goal minus position, refreshed at finalization.
    pub direction: Vec3,
    /// Cohort id used by scenarios for color and goal assignment.
    pub group: u32,
}

impl Agent {
    /// Inert slot used to round the population up to a power of two: zero
    /// mass, sentinel cell, positive radius so the store invariant holds
    /// across the whole capacity.
    #[must_use]
    pub fn padding(radius: f32) -> Self {
        Self {
            position: Vec3::ZERO,
            radius,
            color: Vec4::ZERO,
            velocity: Vec3::ZERO,
            inverse_mass: 0.0,
            planned: Vec3::ZERO,
            preferred_speed: 0.0,
            goal: Vec3::ZERO,
            cell: SENTINEL_CELL,
            direction: Vec3::ZERO,
            group: u32::MAX,
        }
    }
}

/// Static box obstacle, rotated about the vertical axis. 32-byte stride.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Obstacle {
    /// Footprint center; only x and z matter for collision.
    pub position: Vec3,
    /// Rotation about the vertical axis, radians.
    pub rotation_y: f32,
    /// Footprint half-extents: x along the local x axis, y along local z.
    pub scale: Vec2,
    /// Display height; collision is purely in the ground plane.
    pub height: f32,
    pub _pad: f32,
}

impl Obstacle {
    /// Push that moves a disk of `radius` at `center` out of the footprint,
    /// or `None` when they do not overlap. The push has no vertical
    /// component, and a disk whose center is inside the box leaves through
    /// the nearest face.
    #[must_use]
    pub fn collide(&self, center: Vec3, radius: f32) -> Option<Vec3> {
        let rel_x = center.x - self.position.x;
        let rel_z = center.z - self.position.z;
        let (sin, cos) = self.rotation_y.sin_cos();
        let local_x = cos * rel_x - sin * rel_z;
        let local_z = sin * rel_x + cos * rel_z;

        if local_x.abs() < self.scale.x && local_z.abs() < self.scale.y {
            let pen_x = self.scale.x - local_x.abs() + radius;
            let pen_z = self.scale.y - local_z.abs() + radius;
            let (push_x, push_z) = if pen_x <= pen_z {
                (signum_or(local_x, 1.0) * pen_x, 0.0)
            } else {
                (0.0, signum_or(local_z, 1.0) * pen_z)
            };
            return Some(rotate_to_world(push_x, push_z, sin, cos));
        }

        let gap_x = local_x - local_x.clamp(-self.scale.x, self.scale.x);
        let gap_z = local_z - local_z.clamp(-self.scale.y, self.scale.y);
        let dist_sq = gap_x * gap_x + gap_z * gap_z;
        if dist_sq >= radius * radius {
            return None;
        }
        let dist = dist_sq.sqrt();
        let penetration = radius - dist;
        let (dir_x, dir_z) = if dist > CONTACT_EPSILON {
            (gap_x / dist, gap_z / dist)
        } else {
            (1.0, 0.0)
        };
        Some(rotate_to_world(dir_x * penetration, dir_z * penetration, sin, cos))
    }
}

/// Rotate a local-frame xz vector back into world axes.
fn rotate_to_world(x: f32, z: f32, sin: f32, cos: f32) -> Vec3 {
    Vec3::new(cos * x + sin * z, 0.0, -sin * x + cos * z)
}

fn signum_or(value: f32, fallback: f32) -> f32 {
    if value == 0.0 { fallback } else { value.signum() }
}

/// Deterministic initial-placement presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scenario {
    /// Two cohorts marching toward each other across the platform.
    OpposingStreams,
    /// One cohort funneling through a gap between two walls.
    Bottleneck,
    /// Two cohorts crossing in narrow, tightly packed bands.
    DenseCrossing,
    /// Two cohorts crossing spread over most of the platform.
    SparseCrossing,
    /// Uniformly scattered agents converging on six hexagonal sub-goals.
    ScatteredClusters,
    /// Agents on a circle, each heading to the antipodal point.
    Ring,
}

impl Scenario {
    /// Every preset, in declaration order.
    pub const ALL: [Scenario; 6] = [
        Scenario::OpposingStreams,
        Scenario::Bottleneck,
        Scenario::DenseCrossing,
        Scenario::SparseCrossing,
        Scenario::ScatteredClusters,
        Scenario::Ring,
    ];

    /// Stable kebab-case name, accepted back by [`FromStr`].
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Scenario::OpposingStreams => "opposing-streams",
            Scenario::Bottleneck => "bottleneck",
            Scenario::DenseCrossing => "dense-crossing",
            Scenario::SparseCrossing => "sparse-crossing",
            Scenario::ScatteredClusters => "scattered-clusters",
            Scenario::Ring => "ring",
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Scenario {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "opposing-streams" | "opposing_streams" => Ok(Scenario::OpposingStreams),
            "bottleneck" => Ok(Scenario::Bottleneck),
            "dense-crossing" | "dense_crossing" => Ok(Scenario::DenseCrossing),
            "sparse-crossing" | "sparse_crossing" => Ok(Scenario::SparseCrossing),
            "scattered-clusters" | "scattered_clusters" => Ok(Scenario::ScatteredClusters),
            "ring" => Ok(Scenario::Ring),
            _ => Err(SimError::InvalidConfig("unknown scenario name")),
        }
    }
}

/// Simulation configuration; validated at construction and reset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Requested agent count; the store rounds it up to a power of two and
    /// fills the excess with inert padding slots.
    pub population: u32,
    /// Initial placement preset.
    pub scenario: Scenario,
    /// Cells per side of the spatial hash grid.
    pub grid_width: u32,
    /// Edge length of one grid cell in world units.
    pub cell_size: f32,
    /// Collision disk radius shared by scenario-spawned agents.
    pub agent_radius: f32,
    /// Base goal-seeking speed, world units per second.
    pub preferred_speed: f32,
    /// Half-width of the uniform per-agent jitter around the base speed.
    pub speed_jitter: f32,
    /// Neighbor search reach in cells around an agent's own cell; 1 scans
    /// the 3x3 block.
    pub neighbor_cell_radius: u32,
    /// Constraint relaxation passes run after the contact pass.
    pub constraint_iterations: u32,
    /// Cap on grid neighbors examined per agent in one solve pass; excess
    /// candidates are skipped rather than overflowing the working set.
    pub max_neighbor_contacts: usize,
    /// Seed for deterministic scenario layout.
    pub layout_seed: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            population: 10_000,
            scenario: Scenario::OpposingStreams,
            grid_width: 50,
            cell_size: 2.0,
            agent_radius: 0.5,
            preferred_speed: 1.0,
            speed_jitter: 0.25,
            neighbor_cell_radius: 1,
            constraint_iterations: 6,
            max_neighbor_contacts: 64,
            layout_seed: 0x7468_726F_6E67_5EED,
        }
    }
}

impl SimulationConfig {
    /// Check every field and derive the grid layout. No allocation happens
    /// here, so a rejected config leaves callers fully untouched.
    pub fn validate(&self) -> Result<GridLayout, SimError> {
        if self.population == 0 {
            return Err(SimError::InvalidConfig("population must be positive"));
        }
        if self.population > MAX_POPULATION {
            return Err(SimError::InvalidConfig("population exceeds supported capacity"));
        }
        if !(self.agent_radius > 0.0) || !self.agent_radius.is_finite() {
            return Err(SimError::InvalidConfig("agent radius must be positive and finite"));
        }
        if !(self.preferred_speed > 0.0) || !self.preferred_speed.is_finite() {
            return Err(SimError::InvalidConfig(
                "preferred speed must be positive and finite",
            ));
        }
        if self.speed_jitter < 0.0
            || !self.speed_jitter.is_finite()
            || self.speed_jitter >= self.preferred_speed
        {
            return Err(SimError::InvalidConfig(
                "speed jitter must be non-negative and below the preferred speed",
            ));
        }
        if self.max_neighbor_contacts == 0 {
            return Err(SimError::InvalidConfig(
                "neighbor contact budget must be positive",
            ));
        }
        Ok(GridLayout::new(self.grid_width, self.cell_size)?)
    }

    /// Padded buffer capacity: the next power of two at or above the
    /// requested population.
    #[must_use]
    pub fn capacity(&self) -> usize {
        (self.population as usize).next_power_of_two()
    }
}

/// Spawn one agent of the configured scenario. Pure in `index`, so the fill
/// parallelizes and is bit-identical for a given seed regardless of worker
/// count.
fn spawn_agent(config: &SimulationConfig, layout: &GridLayout, index: usize) -> Agent {
    let mut rng = SmallRng::seed_from_u64(config.layout_seed.wrapping_add(index as u64));
    let population = config.population as usize;
    let h = layout.half_extent();
    let y = config.agent_radius;
    let preferred_speed =
        config.preferred_speed + config.speed_jitter * rng.gen_range(-1.0_f32..=1.0);

    let (position, goal, group, color) = match config.scenario {
        Scenario::OpposingStreams => {
            let group = u32::from(index >= population / 2);
            let side = if group == 0 { 1.0 } else { -1.0 };
            let x = rng.gen_range(-0.45 * h..=0.45 * h);
            let z = side * rng.gen_range(0.7 * h..=0.9 * h);
            (
                Vec3::new(x, y, z),
                Vec3::new(x, y, -z),
                group,
                GROUP_COLORS[group as usize],
            )
        }
        Scenario::Bottleneck => {
            let x = rng.gen_range(-0.45 * h..=0.45 * h);
            let z = rng.gen_range(0.5 * h..=0.9 * h);
            // goals compress toward the center line so the cohort aims at the gap
            (
                Vec3::new(x, y, z),
                Vec3::new(0.2 * x, y, -0.9 * h),
                0,
                GROUP_COLORS[3],
            )
        }
        Scenario::DenseCrossing | Scenario::SparseCrossing => {
            let band = if config.scenario == Scenario::DenseCrossing {
                0.2
            } else {
                0.45
            };
            let group = u32::from(index >= population / 2);
            let side = if group == 0 { 1.0 } else { -1.0 };
            let x = side * rng.gen_range(0.5 * h..=0.9 * h);
            let z = rng.gen_range(-band * h..=band * h);
            (
                Vec3::new(x, y, z),
                Vec3::new(-side * 0.9 * h, y, z),
                group,
                GROUP_COLORS[group as usize],
            )
        }
        Scenario::ScatteredClusters => {
            let group = (index % SUB_GROUP_COUNT) as u32;
            let x = rng.gen_range(-0.9 * h..=0.9 * h);
            let z = rng.gen_range(-0.9 * h..=0.9 * h);
            (
                Vec3::new(x, y, z),
                hex_goal(group, h, y),
                group,
                GROUP_COLORS[group as usize],
            )
        }
        Scenario::Ring => {
            let angle = index as f32 / population.max(1) as f32 * TAU;
            let radial = 0.9 * h;
            let position = Vec3::new(angle.cos() * radial, y, angle.sin() * radial);
            let color = Vec4::new(0.5 + 0.5 * angle.cos(), 0.35, 0.5 + 0.5 * angle.sin(), 1.0);
            (
                position,
                Vec3::new(-position.x, y, -position.z),
                0,
                color,
            )
        }
    };

    Agent {
        position,
        radius: config.agent_radius,
        color,
        velocity: Vec3::ZERO,
        inverse_mass: 1.0,
        planned: position,
        preferred_speed,
        goal,
        cell: layout.cell_of(position),
        direction: goal - position,
        group,
    }
}

/// One of the six hexagonally arranged cluster goals.
fn hex_goal(group: u32, half_extent: f32, y: f32) -> Vec3 {
    let angle = group as f32 * (TAU / SUB_GROUP_COUNT as f32);
    Vec3::new(
        angle.cos() * 0.7 * half_extent,
        y,
        angle.sin() * 0.7 * half_extent,
    )
}

/// Obstacles and representative display goals for a scenario.
fn scenario_fixtures(config: &SimulationConfig, layout: &GridLayout) -> (Vec<Obstacle>, Vec<Vec3>) {
    let h = layout.half_extent();
    let y = config.agent_radius;
    match config.scenario {
        Scenario::OpposingStreams => (
            Vec::new(),
            vec![Vec3::new(0.0, y, -0.8 * h), Vec3::new(0.0, y, 0.8 * h)],
        ),
        Scenario::Bottleneck => {
            let gap_half = 4.0 * config.agent_radius;
            let wall_half = (h - gap_half) * 0.5;
            let depth = 2.0 * config.agent_radius;
            let walls = vec![
                Obstacle {
                    position: Vec3::new(-(gap_half + wall_half), 0.0, 0.0),
                    rotation_y: 0.0,
                    scale: Vec2::new(wall_half, depth),
                    height: OBSTACLE_HEIGHT,
                    _pad: 0.0,
                },
                Obstacle {
                    position: Vec3::new(gap_half + wall_half, 0.0, 0.0),
                    rotation_y: 0.0,
                    scale: Vec2::new(wall_half, depth),
                    height: OBSTACLE_HEIGHT,
                    _pad: 0.0,
                },
            ];
            (walls, vec![Vec3::new(0.0, y, -0.9 * h)])
        }
        Scenario::DenseCrossing | Scenario::SparseCrossing => (
            Vec::new(),
            vec![Vec3::new(-0.9 * h, y, 0.0), Vec3::new(0.9 * h, y, 0.0)],
        ),
        Scenario::ScatteredClusters => (
            Vec::new(),
            (0..SUB_GROUP_COUNT as u32)
                .map(|group| hex_goal(group, h, y))
                .collect(),
        ),
        Scenario::Ring => (Vec::new(), Vec::new()),
    }
}

/// Double-buffered agent storage plus the per-scenario fixtures and the
/// spatial table. Only the frame driver mutates it.
#[derive(Clone)]
struct AgentStore {
    buffers: [Vec<Agent>; 2],
    /// Index of the buffer role currently holding authoritative state.
    active: usize,
    /// Valid agents at the front of each buffer; the rest is padding.
    population: usize,
    obstacles: Vec<Obstacle>,
    goals: Vec<Vec3>,
    table: CellTable,
    layout: GridLayout,
    params: FrameParams,
}

/// Borrow bundle for one pipeline stage: the read role, the write role, and
/// the frozen lookup structures.
struct FrameView<'a> {
    read: &'a [Agent],
    write: &'a mut [Agent],
    table: &'a CellTable,
    layout: &'a GridLayout,
    obstacles: &'a [Obstacle],
    params: &'a FrameParams,
}

impl AgentStore {
    /// Build a store from a scenario layout. Everything is allocated and
    /// filled before `Self` exists, so failure leaves no partial state.
    fn initialize(config: &SimulationConfig) -> Result<Self, SimError> {
        let layout = config.validate()?;
        let capacity = config.capacity();
        let population = config.population as usize;

        let mut agents: Vec<Agent> = Vec::new();
        agents.try_reserve_exact(capacity)?;
        agents.resize(capacity, Agent::padding(config.agent_radius));
        agents[..population]
            .par_iter_mut()
            .enumerate()
            .for_each(|(index, slot)| *slot = spawn_agent(config, &layout, index));

        let (obstacles, goals) = scenario_fixtures(config, &layout);
        Self::finish(config, layout, agents, obstacles, goals)
    }

    /// Build a store from caller-supplied agents (the collaborator-supplied
    /// initial-conditions path). Derived fields are normalized; velocity,
    /// color, and per-agent radii are kept as given.
    fn from_agents(
        config: &SimulationConfig,
        mut agents: Vec<Agent>,
        obstacles: Vec<Obstacle>,
    ) -> Result<Self, SimError> {
        let layout = config.validate()?;
        if agents.len() != config.population as usize {
            return Err(SimError::InvalidState(
                "initial agent count must match the configured population",
            ));
        }
        if agents
            .iter()
            .any(|agent| !(agent.radius > 0.0) || !agent.radius.is_finite())
        {
            return Err(SimError::InvalidState("agent radius must be positive and finite"));
        }
        if agents
            .iter()
            .any(|agent| agent.inverse_mass < 0.0 || !agent.inverse_mass.is_finite())
        {
            return Err(SimError::InvalidState(
                "agent inverse mass must be non-negative and finite",
            ));
        }

        let capacity = config.capacity();
        agents.try_reserve_exact(capacity - agents.len())?;
        agents.resize(capacity, Agent::padding(config.agent_radius));
        let population = config.population as usize;
        agents[..population].par_iter_mut().for_each(|agent| {
            agent.planned = agent.position;
            agent.direction = agent.goal - agent.position;
            agent.cell = layout.cell_of(agent.position);
        });

        Self::finish(config, layout, agents, obstacles, Vec::new())
    }

    /// Shared tail of both construction paths: sort, build the table, and
    /// mirror the active buffer so both roles start identical.
    fn finish(
        config: &SimulationConfig,
        layout: GridLayout,
        mut agents: Vec<Agent>,
        obstacles: Vec<Obstacle>,
        goals: Vec<Vec3>,
    ) -> Result<Self, SimError> {
        sort_by_cell(&mut agents, |agent| agent.cell)?;

        let mut table = CellTable::new(layout.cell_count())?;
        table.rebuild_by(&agents, |agent| agent.cell);

        let mut mirror: Vec<Agent> = Vec::new();
        mirror.try_reserve_exact(agents.len())?;
        mirror.extend_from_slice(&agents);

        let params = FrameParams::idle(&layout, agents.len());
        Ok(Self {
            buffers: [agents, mirror],
            active: 0,
            population: config.population as usize,
            obstacles,
            goals,
            table,
            layout,
            params,
        })
    }

    fn write_params(&mut self, step: StepParams, tick: Tick) {
        self.params = FrameParams {
            delta_time: step.delta_time,
            avoidance: step.avoidance,
            look_ahead: step.look_ahead,
            agent_capacity: self.capacity() as u32,
            grid_width: self.layout.width(),
            constraint_iteration: 0,
            frame_tick: tick,
        };
    }

    fn agents(&self) -> &[Agent] {
        &self.buffers[self.active][..self.population]
    }

    fn capacity(&self) -> usize {
        self.buffers[0].len()
    }

    fn active_mut(&mut self) -> &mut [Agent] {
        &mut self.buffers[self.active]
    }

    /// Split the two roles for a read-then-write stage. The caller swaps
    /// roles after its dispatch completes.
    fn frame_view(&mut self) -> FrameView<'_> {
        let (lo, hi) = self.buffers.split_at_mut(1);
        let (read, write) = if self.active == 0 {
            (lo[0].as_slice(), hi[0].as_mut_slice())
        } else {
            (hi[0].as_slice(), lo[0].as_mut_slice())
        };
        FrameView {
            read,
            write,
            table: &self.table,
            layout: &self.layout,
            obstacles: &self.obstacles,
            params: &self.params,
        }
    }

    fn swap_roles(&mut self) {
        self.active ^= 1;
    }

    fn rebuild_table(&mut self) {
        let agents = &self.buffers[self.active];
        self.table.rebuild_by(agents, |agent| agent.cell);
    }

    fn debug_assert_coherent(&self) {
        debug_assert_eq!(self.buffers[0].len(), self.buffers[1].len());
        debug_assert!(self.buffers[0].len().is_power_of_two());
        debug_assert!(self.population <= self.buffers[0].len());
        debug_assert!(
            self.buffers[self.active]
                .iter()
                .all(|agent| agent.radius > 0.0 && agent.inverse_mass >= 0.0),
            "store invariant violated: radius/inverse mass out of range"
        );
    }
}

/// The frame driver: owns the store, sequences the pipeline, and manages
/// buffer-role ping-ponging. See the crate docs for the stage order.
#[derive(Clone)]
pub struct Simulation {
    store: AgentStore,
    config: SimulationConfig,
    tick: Tick,
}

impl Simulation {
    /// Initialize from a scenario preset.
    pub fn new(config: SimulationConfig) -> Result<Self, SimError> {
        let store = AgentStore::initialize(&config)?;
        Ok(Self {
            store,
            config,
            tick: Tick::zero(),
        })
    }

    /// Initialize from caller-supplied initial conditions. `agents` must
    /// match `config.population`; positions are taken as-is, while the
    /// derived fields (`planned`, `cell`, `direction`) are recomputed.
    pub fn with_initial_state(
        config: SimulationConfig,
        agents: Vec<Agent>,
        obstacles: Vec<Obstacle>,
    ) -> Result<Self, SimError> {
        let store = AgentStore::from_agents(&config, agents, obstacles)?;
        Ok(Self {
            store,
            config,
            tick: Tick::zero(),
        })
    }

    /// Tear down and rebuild for a new configuration. The replacement store
    /// is fully constructed before the old one is dropped, so on error the
    /// running simulation is untouched and may keep stepping.
    pub fn reset(&mut self, config: SimulationConfig) -> Result<(), SimError> {
        let store = AgentStore::initialize(&config)?;
        self.store = store;
        self.config = config;
        self.tick = Tick::zero();
        Ok(())
    }

    /// Advance exactly one frame through the barrier-sequenced pipeline.
    ///
    /// A non-positive `delta_time` pauses: nothing is dispatched, no role
    /// swaps happen, and the tick does not advance. The result is
    /// deterministic for a given configuration and parameter sequence,
    /// independent of the rayon worker count.
    pub fn step(&mut self, params: StepParams) -> StepReport {
        if !(params.delta_time > 0.0) {
            return StepReport {
                tick: self.tick,
                committed: false,
            };
        }
        let next = self.tick.next();
        self.store.write_params(params, next);

        self.stage_integrate();
        self.stage_assign_cells();
        self.stage_sort();
        self.stage_build_table();
        self.stage_contacts();
        self.stage_constraints();
        self.stage_finalize();

        self.tick = next;
        self.store.debug_assert_coherent();
        StepReport {
            tick: self.tick,
            committed: true,
        }
    }

    /// Agents in the buffer role last written by finalization, padding
    /// excluded. The underlying buffer alternates between frames.
    #[must_use]
    pub fn agents(&self) -> &[Agent] {
        self.store.agents()
    }

    /// Scenario obstacles, in placement order.
    #[must_use]
    pub fn obstacles(&self) -> &[Obstacle] {
        &self.store.obstacles
    }

    /// Representative per-scenario goal points for display.
    #[must_use]
    pub fn goals(&self) -> &[Vec3] {
        &self.store.goals
    }

    /// Parameter block of the most recent committed frame.
    #[must_use]
    pub fn frame_params(&self) -> &FrameParams {
        &self.store.params
    }

    #[must_use]
    pub fn tick(&self) -> Tick {
        self.tick
    }

    /// Valid agent count (the requested population).
    #[must_use]
    pub fn population(&self) -> usize {
        self.store.population
    }

    /// Padded power-of-two buffer capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.store.capacity()
    }

    /// Compare-exchange passes the sort network runs each frame. Fixed by
    /// the capacity, so it holds until a [`Simulation::reset`] resizes the
    /// buffers.
    #[must_use]
    pub fn sort_pass_count(&self) -> u32 {
        pass_count(self.store.capacity())
    }

    #[must_use]
    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// Steering integration: velocity from goal direction (optionally biased
    /// by look-ahead avoidance against the previous frame's frozen
    /// ordering), then the position prediction. Reads the active role,
    /// writes the inactive one, swaps.
    fn stage_integrate(&mut self) {
        let reach = self.config.neighbor_cell_radius;
        let FrameView {
            read,
            write,
            table,
            layout,
            params,
            ..
        } = self.store.frame_view();
        write.par_iter_mut().enumerate().for_each(|(index, out)| {
            *out = integrated_agent(index, read, table, layout, params, reach);
        });
        self.store.swap_roles();
    }

    /// Hash every valid agent's predicted position to a grid cell, in place
    /// on the active role. Padding slots keep their sentinel, so they sort
    /// behind every real agent. No role swap: positions are not touched.
    fn stage_assign_cells(&mut self) {
        let layout = self.store.layout;
        let population = self.store.population;
        let agents = self.store.active_mut();
        agents[..population].par_iter_mut().for_each(|agent| {
            agent.cell = layout.cell_of(agent.planned);
        });
    }

    /// Bitonic sort of the whole capacity by cell id, in place on the
    /// active role. No role swap.
    fn stage_sort(&mut self) {
        let agents = self.store.active_mut();
        // capacity is a power of two by construction
        let sorted = sort_by_cell(agents, |agent| agent.cell);
        debug_assert!(sorted.is_ok());
    }

    /// Derive the per-cell `[start, end)` table from the sorted order.
    fn stage_build_table(&mut self) {
        self.store.rebuild_table();
    }

    /// First solve pass over fresh predictions.
    fn stage_contacts(&mut self) {
        self.solve_pass(0);
    }

    /// The fixed constraint iterations; each re-reads the previous pass's
    /// output role.
    fn stage_constraints(&mut self) {
        for iteration in 1..=self.config.constraint_iterations {
            self.solve_pass(iteration);
        }
    }

    /// One relaxation pass: separate overlapping pairs by mass share and
    /// push agents out of obstacles. The kernel is stateless; `iteration`
    /// only distinguishes the pass. Reads active, writes inactive, swaps.
    fn solve_pass(&mut self, iteration: u32) {
        debug_assert!(iteration <= self.config.constraint_iterations);
        self.store.params.constraint_iteration = iteration;
        let reach = self.config.neighbor_cell_radius;
        let budget = self.config.max_neighbor_contacts;
        let FrameView {
            read,
            write,
            table,
            layout,
            obstacles,
            ..
        } = self.store.frame_view();
        write.par_iter_mut().enumerate().for_each(|(index, out)| {
            *out = relaxed_agent(index, read, table, layout, obstacles, reach, budget);
        });
        self.store.swap_roles();
    }

    /// Commit predictions: reconstruct velocity from the position delta,
    /// adopt the corrected prediction as the new position, refresh the
    /// steering direction and the final cell id. Reads active, writes
    /// inactive, swaps.
    fn stage_finalize(&mut self) {
        let FrameView {
            read,
            write,
            layout,
            params,
            ..
        } = self.store.frame_view();
        let dt = params.delta_time;
        write.par_iter_mut().enumerate().for_each(|(index, out)| {
            let agent = read[index];
            let mut next = agent;
            if agent.inverse_mass > 0.0 {
                next.velocity = (agent.planned - agent.position) / dt;
                next.position = agent.planned;
                next.direction = agent.goal - agent.planned;
                next.cell = layout.cell_of(agent.planned);
            }
            *out = next;
        });
        self.store.swap_roles();
    }
}

impl fmt::Debug for Simulation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Simulation")
            .field("tick", &self.tick)
            .field("scenario", &self.config.scenario)
            .field("population", &self.store.population)
            .field("capacity", &self.store.capacity())
            .field("obstacles", &self.store.obstacles.len())
            .finish_non_exhaustive()
    }
}

/// Integration kernel for one agent. Immovable agents (and padding) do not
/// move: zero velocity, prediction pinned to the current position.
fn integrated_agent(
    index: usize,
    read: &[Agent],
    table: &CellTable,
    layout: &GridLayout,
    params: &FrameParams,
    reach: u32,
) -> Agent {
    let agent = read[index];
    let mut next = agent;
    if agent.inverse_mass == 0.0 {
        next.velocity = Vec3::ZERO;
        next.planned = agent.position;
        return next;
    }
    let steer = (agent.goal - agent.position).normalize_or_zero() * agent.preferred_speed;
    let velocity = if params.avoidance {
        avoidance_velocity(index, &agent, steer, read, table, layout, params, reach)
    } else {
        steer
    };
    next.velocity = velocity;
    next.planned = agent.position + velocity * params.delta_time;
    next
}

/// Bias the steering velocity away from the nearest predicted threat within
/// clearance, using the previous frame's frozen cell ordering. Ties go to
/// the lower agent index so the selection is total. Obstacles are left to
/// the contact passes.
#[allow(clippy::too_many_arguments)]
fn avoidance_velocity(
    index: usize,
    agent: &Agent,
    steer: Vec3,
    read: &[Agent],
    table: &CellTable,
    layout: &GridLayout,
    params: &FrameParams,
    reach: u32,
) -> Vec3 {
    let look_ahead = params.look_ahead;
    if !(look_ahead > 0.0) {
        return steer;
    }
    let probe = agent.position + steer * look_ahead;
    let mut nearest: Option<(OrderedFloat<f32>, usize, Vec3, f32)> = None;
    for cell in layout.cells_around(agent.cell, reach) {
        for other_idx in table.range(cell).indices() {
            if other_idx == index {
                continue;
            }
            let other = &read[other_idx];
            let predicted = other.position + other.velocity * look_ahead;
            let clearance = agent.radius + other.radius + agent.preferred_speed * look_ahead;
            let distance = probe.distance(predicted);
            if distance >= clearance {
                continue;
            }
            let closer = nearest
                .as_ref()
                .is_none_or(|best| (OrderedFloat(distance), other_idx) < (best.0, best.1));
            if closer {
                nearest = Some((OrderedFloat(distance), other_idx, predicted, clearance));
            }
        }
    }
    let Some((distance, other_idx, predicted, clearance)) = nearest else {
        return steer;
    };
    let fallback = if index < other_idx { Vec3::X } else { -Vec3::X };
    let away = (probe - predicted).normalize_or(fallback);
    let weight = 1.0 - distance.0 / clearance;
    let biased = steer + away * (weight * agent.preferred_speed);
    biased.normalize_or(fallback) * agent.preferred_speed
}

/// Relaxation kernel for one agent: accumulate mass-weighted separation
/// corrections against every overlapping neighbor in the cell block, plus
/// full-strength pushes out of obstacles, then apply the contact-averaged
/// correction to the prediction. Immovable agents pass through unchanged,
/// which is what keeps them (and padding) bit-stable across passes.
fn relaxed_agent(
    index: usize,
    read: &[Agent],
    table: &CellTable,
    layout: &GridLayout,
    obstacles: &[Obstacle],
    reach: u32,
    budget: usize,
) -> Agent {
    let agent = read[index];
    let mut next = agent;
    if agent.inverse_mass == 0.0 {
        return next;
    }
    let mut correction = Vec3::ZERO;
    let mut contacts = 0u32;
    let mut examined = 0usize;
    'cells: for cell in layout.cells_around(agent.cell, reach) {
        for other_idx in table.range(cell).indices() {
            if other_idx == index {
                continue;
            }
            if examined >= budget {
                break 'cells;
            }
            examined += 1;
            let other = &read[other_idx];
            let offset = agent.planned - other.planned;
            let distance = offset.length();
            let penetration = agent.radius + other.radius - distance;
            if penetration <= 0.0 {
                continue;
            }
            let share = agent.inverse_mass / (agent.inverse_mass + other.inverse_mass);
            let direction = if distance > CONTACT_EPSILON {
                offset / distance
            } else if index < other_idx {
                Vec3::X
            } else {
                -Vec3::X
            };
            correction += direction * (penetration * share);
            contacts += 1;
        }
    }
    for obstacle in obstacles {
        if let Some(push) = obstacle.collide(agent.planned, agent.radius) {
            correction += push;
            contacts += 1;
        }
    }
    if contacts > 0 {
        next.planned += correction / contacts as f32;
    }
    next
}
