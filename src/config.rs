// Global configuration and constants

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{SimError, SimResult};

pub const DEFAULT_CONFIG_PATHS: [&str; 3] = ["soulflock.yaml", "soulflock.yml", "soulflock.json"];

// Seeds may start outside the world, but not absurdly far from it
const SEED_DISTANCE_FACTOR: f32 = 10.0;

// Configuration struct for simulation parameters
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    // Population dynamics
    pub new_soul_spawn_rate: f32,
    pub min_lifespan: u32,
    pub max_lifespan: u32,
    pub special_spawn_chance: f32,
    pub initial_souls: usize,

    // Separation
    pub separation_distance: f32,
    pub separation_strength: f32,

    // Neighbor speed coupling
    pub neighbor_speed_influence_radius: f32,
    pub neighbor_speed_influence_strength: f32,

    // Pointer
    pub pointer_interaction_radius: f32,
    pub pointer_attraction_strength: f32,

    // Special ("dewa") attraction
    pub dewa_attraction_radius: f32,
    pub dewa_attraction_strength: f32,

    // Speeds
    pub special_speed: f32,
    pub min_base_speed: f32,
    pub max_base_speed: f32,
    pub speed_relaxation: f32,

    // World bounds
    pub world_radius: f32,
    pub boundary_strength: f32,

    // Connections
    pub interaction_distance: f32,
    pub max_lines_multiplier: f32,

    // Appearance
    pub pulse_speed: f32,

    // Adaptive quality
    pub target_fps: f32,
    pub evaluation_interval_ms: u64,
    pub memory_budget_mb: f32,
    pub gpu_tier: Option<u8>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            new_soul_spawn_rate: 0.7,
            min_lifespan: 300,
            max_lifespan: 900,
            special_spawn_chance: 0.02,
            initial_souls: 300,
            separation_distance: 1.2,
            separation_strength: 0.6,
            neighbor_speed_influence_radius: 4.0,
            neighbor_speed_influence_strength: 0.05,
            pointer_interaction_radius: 12.0,
            pointer_attraction_strength: 0.4,
            dewa_attraction_radius: 18.0,
            dewa_attraction_strength: 0.25,
            special_speed: 0.6,
            min_base_speed: 1.2,
            max_base_speed: 3.0,
            speed_relaxation: 0.1,
            world_radius: 60.0,
            boundary_strength: 0.8,
            interaction_distance: 3.5,
            max_lines_multiplier: 1.5,
            pulse_speed: 2.0,
            target_fps: 60.0,
            evaluation_interval_ms: 1000,
            memory_budget_mb: 512.0,
            gpu_tier: None,
        }
    }
}

impl SimulationConfig {
    /// Farthest a seeded soul may start from the origin.
    pub fn max_seed_distance(&self) -> f32 {
        self.world_radius * SEED_DISTANCE_FACTOR
    }

    /// Analytic equilibrium population: spawn rate times mean lifespan.
    pub fn equilibrium_population(&self) -> f32 {
        self.tunables().equilibrium_population()
    }

    /// Load a config file, choosing YAML or JSON by extension.
    pub fn from_file<P: AsRef<Path>>(path: P) -> SimResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let config: SimulationConfig = if is_json(path) {
            serde_json::from_str(&contents)?
        } else {
            serde_yaml::from_str(&contents)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Search the working directory for a config file, falling back to defaults.
    pub fn from_default_paths() -> Self {
        for candidate in DEFAULT_CONFIG_PATHS {
            if Path::new(candidate).exists() {
                match Self::from_file(candidate) {
                    Ok(config) => {
                        tracing::info!(path = candidate, "loaded configuration");
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!(path = candidate, error = %e, "ignoring unreadable config");
                    }
                }
            }
        }
        Self::default()
    }

    pub fn validate(&self) -> SimResult<()> {
        self.tunables().validate()?;
        if !(0.0..=1.0).contains(&self.special_spawn_chance) {
            return Err(SimError::Config(
                "special_spawn_chance must be within [0, 1]".into(),
            ));
        }
        let radii = [
            ("separation_distance", self.separation_distance),
            ("neighbor_speed_influence_radius", self.neighbor_speed_influence_radius),
            ("pointer_interaction_radius", self.pointer_interaction_radius),
            ("dewa_attraction_radius", self.dewa_attraction_radius),
            ("interaction_distance", self.interaction_distance),
            ("world_radius", self.world_radius),
        ];
        for (name, value) in radii {
            if !(value.is_finite() && value > 0.0) {
                return Err(SimError::Config(format!("{} must be positive", name)));
            }
        }
        if self.min_base_speed > self.max_base_speed {
            return Err(SimError::Config(
                "min_base_speed must not exceed max_base_speed".into(),
            ));
        }
        if !(self.target_fps > 0.0) {
            return Err(SimError::Config("target_fps must be positive".into()));
        }
        Ok(())
    }

    pub fn tunables(&self) -> PopulationTunables {
        PopulationTunables {
            new_soul_spawn_rate: self.new_soul_spawn_rate,
            min_lifespan: self.min_lifespan,
            max_lifespan: self.max_lifespan,
        }
    }

    pub fn apply_tunables(&mut self, tunables: &PopulationTunables) {
        self.new_soul_spawn_rate = tunables.new_soul_spawn_rate;
        self.min_lifespan = tunables.min_lifespan;
        self.max_lifespan = tunables.max_lifespan;
    }
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

/// Population-dynamics constants owned by the UI layer and persisted across runs.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct PopulationTunables {
    pub new_soul_spawn_rate: f32,
    pub min_lifespan: u32,
    pub max_lifespan: u32,
}

impl Default for PopulationTunables {
    fn default() -> Self {
        SimulationConfig::default().tunables()
    }
}

impl PopulationTunables {
    pub const SPAWN_RATE_KEY: &'static str = "NEW_SOUL_SPAWN_RATE";
    pub const MIN_LIFESPAN_KEY: &'static str = "MIN_LIFESPAN";
    pub const MAX_LIFESPAN_KEY: &'static str = "MAX_LIFESPAN";

    pub fn equilibrium_population(&self) -> f32 {
        self.new_soul_spawn_rate * (self.min_lifespan + self.max_lifespan) as f32 / 2.0
    }

    pub fn validate(&self) -> SimResult<()> {
        if !(0.0..=1.0).contains(&self.new_soul_spawn_rate) {
            return Err(SimError::Config(
                "NEW_SOUL_SPAWN_RATE must be within [0, 1]".into(),
            ));
        }
        if self.min_lifespan == 0 {
            return Err(SimError::Config("MIN_LIFESPAN must be at least 1".into()));
        }
        if self.min_lifespan > self.max_lifespan {
            return Err(SimError::Config(
                "MIN_LIFESPAN must not exceed MAX_LIFESPAN".into(),
            ));
        }
        Ok(())
    }

    pub fn to_pairs(&self) -> BTreeMap<String, String> {
        let mut pairs = BTreeMap::new();
        pairs.insert(
            Self::SPAWN_RATE_KEY.to_string(),
            self.new_soul_spawn_rate.to_string(),
        );
        pairs.insert(
            Self::MIN_LIFESPAN_KEY.to_string(),
            self.min_lifespan.to_string(),
        );
        pairs.insert(
            Self::MAX_LIFESPAN_KEY.to_string(),
            self.max_lifespan.to_string(),
        );
        pairs
    }

    /// Overlay persisted pairs on `base`. Unknown keys are ignored and
    /// unparsable values keep the base value.
    pub fn from_pairs(base: PopulationTunables, pairs: &BTreeMap<String, String>) -> Self {
        let mut tunables = base;
        if let Some(v) = pairs.get(Self::SPAWN_RATE_KEY).and_then(|v| v.parse().ok()) {
            tunables.new_soul_spawn_rate = v;
        }
        if let Some(v) = pairs.get(Self::MIN_LIFESPAN_KEY).and_then(|v| v.parse().ok()) {
            tunables.min_lifespan = v;
        }
        if let Some(v) = pairs.get(Self::MAX_LIFESPAN_KEY).and_then(|v| v.parse().ok()) {
            tunables.max_lifespan = v;
        }
        tunables
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> SimResult<()> {
        let path = path.as_ref();
        let pairs = self.to_pairs();
        let contents = if is_json(path) {
            serde_json::to_string_pretty(&pairs)?
        } else {
            serde_yaml::to_string(&pairs)?
        };
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P, base: PopulationTunables) -> SimResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let pairs: BTreeMap<String, String> = if is_json(path) {
            serde_json::from_str(&contents)?
        } else {
            serde_yaml::from_str(&contents)?
        };
        let tunables = Self::from_pairs(base, &pairs);
        tunables.validate()?;
        Ok(tunables)
    }
}
