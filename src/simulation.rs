use ::rand as external_rand;
use external_rand::Rng;
use serde::Serialize;
use std::collections::HashMap;

use crate::config::{PopulationTunables, SimulationConfig};
use crate::connections::{compute_connections, Connection, ConnectionParams};
use crate::error::SimResult;
use crate::lod::{should_update, LodHint, LodTier};
use crate::physics::{integrate, ForceField, SoulSnapshot};
use crate::quality::{QualityProfile, QualityTier};
use crate::soul::{IdAllocator, Soul, SoulId, SoulSeed};
use crate::spatial::SpatialIndex;
use crate::types::{Rgb, Vec3};

pub const DEFAULT_DELTA_TIME: f32 = 1.0 / 60.0;

// Simulation state - contains all mutable state data
pub struct SimulationState {
    pub souls: Vec<Soul>,
    pub index_of: HashMap<SoulId, usize>,
    pub spatial: SpatialIndex,
    pub connections: Vec<Connection>,
    pub frame_index: u64,
    pub time: f32,
    ids: IdAllocator,
}

impl SimulationState {
    pub fn new(cell_size: f32) -> Self {
        Self {
            souls: Vec::new(),
            index_of: HashMap::new(),
            spatial: SpatialIndex::new(cell_size),
            connections: Vec::new(),
            frame_index: 0,
            time: 0.0,
            ids: IdAllocator::default(),
        }
    }

    fn reindex(&mut self) {
        self.index_of.clear();
        for (i, soul) in self.souls.iter().enumerate() {
            self.index_of.insert(soul.id, i);
        }
    }
}

/// Per-step input from the consumer.
#[derive(Clone, Debug, Default)]
pub struct StepInput {
    pub pointer: Option<Vec3>,
    pub viewpoint: Option<Vec3>,
    pub lod_hints: HashMap<SoulId, LodHint>,
    pub delta_time: Option<f32>,
}

/// What changed during a step.
#[derive(Clone, Debug, Default)]
pub struct StepOutput {
    pub created: Vec<Soul>,
    pub removed: Vec<SoulId>,
    pub physics_updates: usize,
}

/// Render-facing view of one soul after a step.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RenderState {
    pub id: SoulId,
    pub position: Vec3,
    pub color: Rgb,
    pub opacity: f32,
    pub visible: bool,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationStats {
    pub population: usize,
    pub specials: usize,
    pub culled: usize,
    pub connections: usize,
    pub frame: u64,
    pub tier: QualityTier,
    pub equilibrium: f32,
}

// Simulation - owns state, config, and the active quality profile
pub struct Simulation {
    pub state: SimulationState,
    pub config: SimulationConfig,
    pub quality: QualityProfile,
    pointer: Option<Vec3>,
}

// Implement Deref for convenience - allows sim.souls instead of sim.state.souls
impl std::ops::Deref for Simulation {
    type Target = SimulationState;
    fn deref(&self) -> &Self::Target {
        &self.state
    }
}

impl std::ops::DerefMut for Simulation {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.state
    }
}

impl Simulation {
    pub fn new(config: SimulationConfig, quality: QualityProfile) -> Self {
        Self {
            state: SimulationState::new(quality.cell_size),
            config,
            quality,
            pointer: None,
        }
    }

    /// A simulation seeded with `config.initial_souls` random souls.
    pub fn with_config<R: Rng>(rng: &mut R, config: SimulationConfig) -> Self {
        let mut sim = Self::new(config, QualityTier::Medium.profile());
        for _ in 0..sim.config.initial_souls {
            sim.spawn_random(rng);
        }
        sim
    }

    pub fn population(&self) -> usize {
        self.state.souls.len()
    }

    pub fn get(&self, id: SoulId) -> Option<&Soul> {
        self.state.index_of.get(&id).map(|&i| &self.state.souls[i])
    }

    fn push_soul(&mut self, soul: Soul) -> &Soul {
        let i = self.state.souls.len();
        self.state.index_of.insert(soul.id, i);
        self.state.spatial.insert(i, soul.position);
        self.state.souls.push(soul);
        &self.state.souls[i]
    }

    pub fn spawn_random<R: Rng>(&mut self, rng: &mut R) -> &Soul {
        let id = self.state.ids.allocate();
        let soul = Soul::random(id, rng, &self.config);
        self.push_soul(soul)
    }

    /// Create a soul from a consumer request. Invalid seeds are dropped.
    pub fn add_soul<R: Rng>(&mut self, seed: &SoulSeed, rng: &mut R) -> Option<&Soul> {
        if let Err(err) = seed.validate(self.config.max_seed_distance()) {
            tracing::warn!(?seed, %err, "dropping soul");
            return None;
        }
        let id = self.state.ids.allocate();
        let soul = Soul::from_seed(id, seed, rng, &self.config);
        Some(self.push_soul(soul))
    }

    /// Remove a soul by id. Removing an unknown id is a no-op.
    pub fn remove_soul(&mut self, id: SoulId) -> bool {
        let Some(i) = self.state.index_of.remove(&id) else {
            return false;
        };
        self.state.souls.swap_remove(i);
        if let Some(moved) = self.state.souls.get(i) {
            self.state.index_of.insert(moved.id, i);
        }
        // Handles in the spatial index are slice positions, which just shifted
        self.rebuild_spatial();
        true
    }

    /// Drop every soul, returning their ids. Ids are not recycled.
    pub fn clear(&mut self) -> Vec<SoulId> {
        let ids = self.state.souls.iter().map(|s| s.id).collect();
        self.state.souls.clear();
        self.state.index_of.clear();
        self.state.spatial.clear();
        self.state.connections.clear();
        ids
    }

    pub fn set_tunables(&mut self, tunables: &PopulationTunables) -> SimResult<()> {
        tunables.validate()?;
        self.config.apply_tunables(tunables);
        Ok(())
    }

    pub fn apply_quality(&mut self, profile: QualityProfile) {
        self.quality = profile;
        self.state.spatial.set_cell_size(profile.cell_size);
        self.rebuild_spatial();
    }

    fn rebuild_spatial(&mut self) {
        let state = &mut self.state;
        state
            .spatial
            .rebuild(state.souls.iter().map(|s| s.position).enumerate());
    }

    /// LOD for every soul: an explicit hint wins, then the viewpoint, else full detail.
    fn assign_lod(&mut self, input: &StepInput) -> Vec<LodHint> {
        let classifier = self.quality.classifier();
        let hints: Vec<LodHint> = self
            .state
            .souls
            .iter()
            .map(|soul| match input.lod_hints.get(&soul.id) {
                Some(hint) if hint.is_valid() => *hint,
                _ => match input.viewpoint.filter(Vec3::is_finite) {
                    Some(viewpoint) => classifier.classify(soul.position, viewpoint),
                    None => LodHint::full(),
                },
            })
            .collect();
        for (soul, hint) in self.state.souls.iter_mut().zip(&hints) {
            soul.lod = hint.tier;
        }
        hints
    }

    fn update_pointer(&mut self, pointer: Option<Vec3>) {
        match pointer {
            Some(p) if p.is_finite() => self.pointer = Some(p),
            Some(p) => tracing::warn!(?p, "ignoring non-finite pointer, keeping previous"),
            None => self.pointer = None,
        }
    }

    /// Age every soul by one frame and remove the ones that ran out of life.
    fn age_souls(&mut self) -> Vec<SoulId> {
        let mut removed = Vec::new();
        for soul in &mut self.state.souls {
            soul.life = soul.life.saturating_sub(1);
            if soul.life == 0 {
                removed.push(soul.id);
            }
        }
        if !removed.is_empty() {
            self.state.souls.retain(|s| s.life > 0);
            self.state.reindex();
        }
        removed
    }

    pub fn colors(&self) -> Vec<Rgb> {
        let time = self.state.time;
        let pulse = self.config.pulse_speed;
        self.state
            .souls
            .iter()
            .map(|s| s.color(time, pulse))
            .collect()
    }

    pub fn step<R: Rng>(&mut self, rng: &mut R, input: &StepInput) -> StepOutput {
        self.state.frame_index = self.state.frame_index.wrapping_add(1);
        let dt = input
            .delta_time
            .filter(|dt| dt.is_finite() && *dt >= 0.0)
            .unwrap_or(DEFAULT_DELTA_TIME);
        self.state.time += dt;
        self.update_pointer(input.pointer);

        let hints = self.assign_lod(input);
        let frame = self.state.frame_index;
        let active: Vec<bool> = hints
            .iter()
            .map(|h| !h.tier.is_culled() && should_update(h.physics_rate, frame))
            .collect();

        // Forces from a consistent snapshot
        self.rebuild_spatial();
        let snapshot: Vec<SoulSnapshot> = self.state.souls.iter().map(SoulSnapshot::from).collect();
        let specials: Vec<usize> = snapshot
            .iter()
            .enumerate()
            .filter(|(_, s)| s.kind.is_special())
            .map(|(i, _)| i)
            .collect();
        let steering = {
            let field = ForceField {
                config: &self.config,
                snapshot: &snapshot,
                index: &self.state.spatial,
                pointer: self.pointer,
                specials: &specials,
            };
            field.steer_all(&self.state.souls, &active)
        };

        let mut physics_updates = 0;
        for (soul, steer) in self.state.souls.iter_mut().zip(&steering) {
            if let Some(steer) = steer {
                integrate(soul, steer, dt, &self.config);
                physics_updates += 1;
            }
        }

        // Lifecycle
        let removed = self.age_souls();
        let mut created = Vec::new();
        if rng.gen::<f32>() < self.config.new_soul_spawn_rate {
            created.push(self.spawn_random(rng).clone());
        }

        // Connections and visibility follow the post-step positions
        self.rebuild_spatial();
        let hints = self.assign_lod(input);
        let colors = self.colors();
        let params = ConnectionParams {
            interaction_distance: self.config.interaction_distance,
            max_lines_multiplier: self.config.max_lines_multiplier,
            check_budget: self.quality.connection_check_budget,
        };
        self.state.connections = compute_connections(
            &self.state.souls,
            &hints,
            &colors,
            &self.state.spatial,
            &params,
            rng,
        );

        tracing::debug!(
            frame,
            population = self.state.souls.len(),
            physics_updates,
            connections = self.state.connections.len(),
            "step complete"
        );

        StepOutput {
            created,
            removed,
            physics_updates,
        }
    }

    pub fn render_states(&self) -> Vec<RenderState> {
        let colors = self.colors();
        self.state
            .souls
            .iter()
            .zip(colors)
            .map(|(soul, color)| RenderState {
                id: soul.id,
                position: soul.position,
                color,
                opacity: soul.opacity(),
                visible: !soul.lod.is_culled(),
            })
            .collect()
    }

    pub fn stats(&self) -> SimulationStats {
        SimulationStats {
            population: self.state.souls.len(),
            specials: self.state.souls.iter().filter(|s| s.kind.is_special()).count(),
            culled: self.state.souls.iter().filter(|s| s.lod == LodTier::Culled).count(),
            connections: self.state.connections.len(),
            frame: self.state.frame_index,
            tier: self.quality.tier,
            equilibrium: self.config.equilibrium_population(),
        }
    }

    /// Rough resident size of the simulation state, in megabytes.
    pub fn estimated_memory_mb(&self) -> f32 {
        let souls = self.state.souls.capacity() * std::mem::size_of::<Soul>();
        let edges = self.state.connections.capacity() * std::mem::size_of::<Connection>();
        let index = self.state.index_of.capacity() * std::mem::size_of::<(SoulId, usize)>() * 2;
        (souls + edges + index) as f32 / (1024.0 * 1024.0)
    }
}
