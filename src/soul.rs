// Souls: the unit of simulation

use ::rand as external_rand;
use external_rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::SimulationConfig;
use crate::error::{SimError, SimResult};
use crate::lod::LodTier;
use crate::types::{Hsl, Rgb, Vec3};

pub type SoulId = u64;

const FADE_IN_FRAMES: u32 = 30;
const FADE_OUT_FRAMES: u32 = 60;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SoulKind {
    StandardA,
    StandardB,
    /// "Dewa": slow, immune to speed coupling, attracts everyone else.
    Special,
}

impl SoulKind {
    pub fn is_special(self) -> bool {
        self == SoulKind::Special
    }

    fn base_hsl(self) -> Hsl {
        match self {
            SoulKind::StandardA => Hsl::new(200.0, 0.7, 0.6),
            SoulKind::StandardB => Hsl::new(330.0, 0.65, 0.6),
            SoulKind::Special => Hsl::new(45.0, 0.9, 0.65),
        }
    }

    pub fn random<R: Rng>(rng: &mut R, special_chance: f32) -> Self {
        if rng.gen::<f32>() < special_chance {
            SoulKind::Special
        } else if rng.gen_bool(0.5) {
            SoulKind::StandardA
        } else {
            SoulKind::StandardB
        }
    }
}

/// Monotonic id source. Ids are never handed out twice within a process.
#[derive(Clone, Debug)]
pub struct IdAllocator {
    next: SoulId,
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self { next: 1 }
    }
}

impl IdAllocator {
    pub fn allocate(&mut self) -> SoulId {
        let id = self.next;
        self.next += 1;
        id
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Soul {
    pub id: SoulId,
    pub kind: SoulKind,
    pub position: Vec3,
    pub velocity: Vec3,
    pub base_speed: f32,
    pub speed: f32,
    pub life: u32,
    pub lifespan: u32,
    pub hsl: Hsl,
    pub phase: f32,
    pub target_special: Option<SoulId>,
    #[serde(skip)]
    pub lod: LodTier,
}

impl Soul {
    pub fn new<R: Rng>(
        id: SoulId,
        kind: SoulKind,
        position: Vec3,
        rng: &mut R,
        config: &SimulationConfig,
    ) -> Self {
        let lifespan = draw_lifespan(rng, config.min_lifespan, config.max_lifespan);
        let base_speed = if kind.is_special() {
            config.special_speed
        } else if config.max_base_speed > config.min_base_speed {
            rng.gen_range(config.min_base_speed..=config.max_base_speed)
        } else {
            config.min_base_speed
        };
        let direction = random_unit(rng);
        let base = kind.base_hsl();

        Self {
            id,
            kind,
            position,
            velocity: direction * base_speed,
            base_speed,
            speed: base_speed,
            life: lifespan,
            lifespan,
            hsl: Hsl::new(
                base.h + rng.gen_range(-15.0..15.0),
                (base.s + rng.gen_range(-0.1..0.1)).clamp(0.0, 1.0),
                base.l,
            ),
            phase: rng.gen_range(0.0..std::f32::consts::TAU),
            target_special: None,
            lod: LodTier::High,
        }
    }

    /// A soul at a uniformly random point inside the world sphere.
    pub fn random<R: Rng>(id: SoulId, rng: &mut R, config: &SimulationConfig) -> Self {
        let kind = SoulKind::random(rng, config.special_spawn_chance);
        let radius = config.world_radius * rng.gen::<f32>().cbrt();
        let position = random_unit(rng) * radius;
        Self::new(id, kind, position, rng, config)
    }

    pub fn from_seed<R: Rng>(
        id: SoulId,
        seed: &SoulSeed,
        rng: &mut R,
        config: &SimulationConfig,
    ) -> Self {
        let kind = seed
            .kind
            .unwrap_or_else(|| SoulKind::random(rng, config.special_spawn_chance));
        let mut soul = Self::new(id, kind, seed.position, rng, config);
        if let Some(velocity) = seed.velocity {
            soul.velocity = velocity;
        }
        if let Some(lifespan) = seed.lifespan {
            soul.lifespan = lifespan.max(1);
            soul.life = soul.lifespan;
        }
        soul
    }

    pub fn age(&self) -> u32 {
        self.lifespan.saturating_sub(self.life)
    }

    /// Pulsing color at simulation time `time` (seconds).
    pub fn color(&self, time: f32, pulse_speed: f32) -> Rgb {
        let pulse = (time * pulse_speed + self.phase).sin() * 0.1;
        Hsl::new(self.hsl.h, self.hsl.s, (self.hsl.l + pulse).clamp(0.0, 1.0)).to_rgb()
    }

    /// Fades in after birth and out before death.
    pub fn opacity(&self) -> f32 {
        let fade_in = (self.age() as f32 / FADE_IN_FRAMES as f32).min(1.0);
        let fade_out = (self.life as f32 / FADE_OUT_FRAMES as f32).min(1.0);
        fade_in.min(fade_out).clamp(0.0, 1.0)
    }
}

/// Consumer-supplied creation request. The simulation assigns the id.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SoulSeed {
    #[serde(default)]
    pub kind: Option<SoulKind>,
    pub position: Vec3,
    #[serde(default)]
    pub velocity: Option<Vec3>,
    #[serde(default)]
    pub lifespan: Option<u32>,
}

impl SoulSeed {
    pub fn at(position: Vec3) -> Self {
        Self {
            position,
            ..Default::default()
        }
    }

    /// Reject non-finite vectors and positions farther than `max_distance`
    /// from the origin.
    pub fn validate(&self, max_distance: f32) -> SimResult<()> {
        if !self.position.is_finite() || !self.velocity.map_or(true, |v| v.is_finite()) {
            return Err(SimError::InvalidInput("seed has non-finite components".into()));
        }
        let distance = self.position.length();
        if distance > max_distance {
            return Err(SimError::InvalidInput(format!(
                "seed at distance {distance} is beyond {max_distance}"
            )));
        }
        Ok(())
    }
}

pub fn draw_lifespan<R: Rng>(rng: &mut R, min: u32, max: u32) -> u32 {
    let min = min.max(1);
    if max > min {
        rng.gen_range(min..=max)
    } else {
        min
    }
}

pub fn random_unit<R: Rng>(rng: &mut R) -> Vec3 {
    // Rejection sampling keeps the direction distribution uniform.
    loop {
        let v = Vec3::new(
            rng.gen_range(-1.0..1.0),
            rng.gen_range(-1.0..1.0),
            rng.gen_range(-1.0..1.0),
        );
        let len_sq = v.length_squared();
        if len_sq > 1e-4 && len_sq <= 1.0 {
            return v * (1.0 / len_sq.sqrt());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use external_rand::rngs::StdRng;
    use external_rand::SeedableRng;

    #[test]
    fn ids_are_monotonic() {
        let mut ids = IdAllocator::default();
        let a = ids.allocate();
        let b = ids.allocate();
        let c = ids.allocate();
        assert!(b > a);
        assert_eq!(c, b + 1);
    }

    #[test]
    fn lifespan_is_within_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        let config = SimulationConfig::default();
        for id in 0..500 {
            let soul = Soul::random(id, &mut rng, &config);
            assert!(soul.life >= config.min_lifespan && soul.life <= config.max_lifespan);
            assert!(soul.position.length() <= config.world_radius + 1e-3);
        }
    }

    #[test]
    fn special_souls_move_at_fixed_speed() {
        let mut rng = StdRng::seed_from_u64(1);
        let config = SimulationConfig::default();
        let soul = Soul::new(1, SoulKind::Special, Vec3::ZERO, &mut rng, &config);
        assert_eq!(soul.base_speed, config.special_speed);
        assert!((soul.velocity.length() - config.special_speed).abs() < 1e-4);
    }

    #[test]
    fn opacity_fades_at_both_ends() {
        let mut rng = StdRng::seed_from_u64(2);
        let config = SimulationConfig::default();
        let mut soul = Soul::new(1, SoulKind::StandardA, Vec3::ZERO, &mut rng, &config);
        assert_eq!(soul.opacity(), 0.0);
        soul.life = soul.lifespan / 2;
        assert_eq!(soul.opacity(), 1.0);
        soul.life = 30;
        assert!((soul.opacity() - 0.5).abs() < 1e-5);
    }

    #[test]
    fn seed_rejects_non_finite_and_distant_positions() {
        assert!(SoulSeed::at(Vec3::new(1.0, 2.0, 3.0)).validate(100.0).is_ok());
        assert!(SoulSeed::at(Vec3::new(f32::NAN, 0.0, 0.0)).validate(100.0).is_err());
        let far = SoulSeed::at(Vec3::new(1e10, 0.0, 0.0)).validate(100.0);
        assert!(matches!(far, Err(SimError::InvalidInput(_))));
        let fast = SoulSeed {
            velocity: Some(Vec3::new(0.0, f32::INFINITY, 0.0)),
            ..SoulSeed::at(Vec3::ZERO)
        };
        assert!(fast.validate(100.0).is_err());
    }
}
