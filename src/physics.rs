// Physics module - force model for souls
//
// Forces are computed from an immutable snapshot of the previous positions,
// so nobody sees a half-updated neighbor, then applied and integrated in a
// second pass. In order:
// 1. Separation from close neighbors
// 2. Speed coupling toward the neighborhood mean (standard souls only)
// 3. Pointer attraction
// 4. Attraction to a tracked special soul (standard souls only)
// 5. Boundary containment

use rayon::prelude::*;

use crate::config::SimulationConfig;
use crate::soul::{Soul, SoulId, SoulKind};
use crate::spatial::SpatialIndex;
use crate::types::Vec3;

// Closest distance used when weighting separation, avoids blowing up on overlaps
const MIN_SEPARATION_DISTANCE: f32 = 0.05;
const MAX_DELTA_TIME: f32 = 0.1;

/// Read-only view of one soul at the start of a step.
#[derive(Clone, Copy, Debug)]
pub struct SoulSnapshot {
    pub id: SoulId,
    pub kind: SoulKind,
    pub position: Vec3,
    pub speed: f32,
}

impl From<&Soul> for SoulSnapshot {
    fn from(soul: &Soul) -> Self {
        Self {
            id: soul.id,
            kind: soul.kind,
            position: soul.position,
            speed: soul.speed,
        }
    }
}

/// Forces accumulated for one soul during a step.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Steering {
    pub impulse: Vec3,
    pub speed: f32,
    pub target_special: Option<SoulId>,
}

pub struct ForceField<'a> {
    pub config: &'a SimulationConfig,
    pub snapshot: &'a [SoulSnapshot],
    pub index: &'a SpatialIndex,
    pub pointer: Option<Vec3>,
    /// Indices into `snapshot` of every special soul.
    pub specials: &'a [usize],
}

impl<'a> ForceField<'a> {
    fn separation(&self, i: usize) -> Vec3 {
        let me = &self.snapshot[i];
        let mut push = Vec3::ZERO;
        for (j, d_sq) in self
            .index
            .query_neighbors(me.position, self.config.separation_distance)
        {
            if j == i || d_sq <= 0.0 {
                continue;
            }
            let d = d_sq.sqrt().max(MIN_SEPARATION_DISTANCE);
            let away = (me.position - self.snapshot[j].position).normalize_or_zero();
            push += away * (self.config.separation_strength / d);
        }
        push
    }

    fn coupled_speed(&self, i: usize) -> f32 {
        let me = &self.snapshot[i];
        if me.kind.is_special() {
            return self.config.special_speed;
        }
        let mut total = 0.0;
        let mut count = 0;
        for (j, _) in self
            .index
            .query_neighbors(me.position, self.config.neighbor_speed_influence_radius)
        {
            if j == i {
                continue;
            }
            total += self.snapshot[j].speed;
            count += 1;
        }
        if count == 0 {
            return me.speed;
        }
        let mean = total / count as f32;
        me.speed + (mean - me.speed) * self.config.neighbor_speed_influence_strength
    }

    fn pointer_pull(&self, i: usize) -> Vec3 {
        let Some(pointer) = self.pointer else {
            return Vec3::ZERO;
        };
        let me = &self.snapshot[i];
        let radius = self.config.pointer_interaction_radius;
        let d_sq = me.position.distance_squared(pointer);
        if !(d_sq <= radius * radius) {
            return Vec3::ZERO;
        }
        let falloff = 1.0 - d_sq.sqrt() / radius;
        (pointer - me.position).normalize_or_zero() * (self.config.pointer_attraction_strength * falloff)
    }

    /// Keep the tracked special soul if it is still alive and in range,
    /// otherwise pick the nearest one in range (lowest id on ties).
    pub fn resolve_special(&self, i: usize, current: Option<SoulId>) -> Option<usize> {
        let me = &self.snapshot[i];
        if me.kind.is_special() {
            return None;
        }
        let radius_sq = self.config.dewa_attraction_radius * self.config.dewa_attraction_radius;

        if let Some(id) = current {
            let tracked = self
                .specials
                .iter()
                .copied()
                .find(|&s| self.snapshot[s].id == id);
            if let Some(s) = tracked {
                if self.snapshot[s].position.distance_squared(me.position) <= radius_sq {
                    return Some(s);
                }
            }
        }

        self.specials
            .iter()
            .copied()
            .filter_map(|s| {
                let d_sq = self.snapshot[s].position.distance_squared(me.position);
                (d_sq <= radius_sq).then_some((d_sq, self.snapshot[s].id, s))
            })
            .min_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)))
            .map(|(_, _, s)| s)
    }

    fn boundary_pull(&self, i: usize) -> Vec3 {
        let position = self.snapshot[i].position;
        let distance = position.length();
        if distance <= self.config.world_radius {
            return Vec3::ZERO;
        }
        let overshoot = (distance - self.config.world_radius) / self.config.world_radius;
        position.normalize_or_zero() * (-self.config.boundary_strength * (1.0 + overshoot))
    }

    pub fn steering(&self, i: usize, current_target: Option<SoulId>) -> Steering {
        let me = &self.snapshot[i];
        let mut impulse = self.separation(i) + self.pointer_pull(i) + self.boundary_pull(i);

        let target = self.resolve_special(i, current_target);
        if let Some(s) = target {
            let toward = (self.snapshot[s].position - me.position).normalize_or_zero();
            impulse += toward * self.config.dewa_attraction_strength;
        }

        Steering {
            impulse,
            speed: self.coupled_speed(i),
            target_special: target.map(|s| self.snapshot[s].id),
        }
    }

    /// Steering for every soul flagged in `active`, computed in parallel.
    pub fn steer_all(&self, souls: &[Soul], active: &[bool]) -> Vec<Option<Steering>> {
        (0..souls.len())
            .into_par_iter()
            .map(|i| active[i].then(|| self.steering(i, souls[i].target_special)))
            .collect()
    }
}

/// Apply a steering result and advance the soul by `dt` seconds.
/// Non-finite results leave the soul where it was.
pub fn integrate(soul: &mut Soul, steering: &Steering, dt: f32, config: &SimulationConfig) {
    let dt = if dt.is_finite() {
        dt.clamp(0.0, MAX_DELTA_TIME)
    } else {
        0.0
    };

    soul.target_special = steering.target_special;

    let speed = match soul.kind {
        SoulKind::Special => config.special_speed,
        _ => {
            let coupled = if steering.speed.is_finite() {
                steering.speed
            } else {
                soul.speed
            };
            coupled + (soul.base_speed - coupled) * config.speed_relaxation
        }
    };

    let mut velocity = soul.velocity;
    if steering.impulse.is_finite() {
        velocity += steering.impulse;
    }
    let direction = match velocity.normalize_or_zero() {
        d if d == Vec3::ZERO => soul.velocity.normalize_or_zero(),
        d => d,
    };
    let velocity = direction * speed;
    let position = soul.position + velocity * dt;

    if velocity.is_finite() && position.is_finite() {
        soul.speed = speed;
        soul.velocity = velocity;
        soul.position = position;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ::rand::rngs::StdRng;
    use ::rand::SeedableRng;

    fn soul(id: SoulId, kind: SoulKind, position: Vec3) -> Soul {
        let mut rng = StdRng::seed_from_u64(id);
        Soul::new(id, kind, position, &mut rng, &SimulationConfig::default())
    }

    fn field_for<'a>(
        config: &'a SimulationConfig,
        snapshot: &'a [SoulSnapshot],
        index: &'a SpatialIndex,
        specials: &'a [usize],
        pointer: Option<Vec3>,
    ) -> ForceField<'a> {
        ForceField {
            config,
            snapshot,
            index,
            pointer,
            specials,
        }
    }

    fn build(souls: &[Soul]) -> (Vec<SoulSnapshot>, SpatialIndex, Vec<usize>) {
        let snapshot: Vec<SoulSnapshot> = souls.iter().map(SoulSnapshot::from).collect();
        let mut index = SpatialIndex::new(4.0);
        index.rebuild(souls.iter().map(|s| s.position).enumerate());
        let specials = souls
            .iter()
            .enumerate()
            .filter(|(_, s)| s.kind.is_special())
            .map(|(i, _)| i)
            .collect();
        (snapshot, index, specials)
    }

    #[test]
    fn close_neighbors_push_apart() {
        let config = SimulationConfig::default();
        let souls = vec![
            soul(1, SoulKind::StandardA, Vec3::ZERO),
            soul(2, SoulKind::StandardA, Vec3::new(0.5, 0.0, 0.0)),
        ];
        let (snapshot, index, specials) = build(&souls);
        let field = field_for(&config, &snapshot, &index, &specials, None);

        let s = field.steering(0, None);
        assert!(s.impulse.x < 0.0);
        let s = field.steering(1, None);
        assert!(s.impulse.x > 0.0);
    }

    #[test]
    fn overlapping_souls_do_not_produce_nan() {
        let config = SimulationConfig::default();
        let souls = vec![
            soul(1, SoulKind::StandardA, Vec3::ZERO),
            soul(2, SoulKind::StandardB, Vec3::ZERO),
        ];
        let (snapshot, index, specials) = build(&souls);
        let field = field_for(&config, &snapshot, &index, &specials, None);
        let s = field.steering(0, None);
        assert!(s.impulse.is_finite());
        assert!(s.speed.is_finite());
    }

    #[test]
    fn speed_couples_toward_neighbors_except_for_specials() {
        let config = SimulationConfig::default();
        let mut souls = vec![
            soul(1, SoulKind::StandardA, Vec3::ZERO),
            soul(2, SoulKind::StandardA, Vec3::new(2.0, 0.0, 0.0)),
            soul(3, SoulKind::Special, Vec3::new(0.0, 2.0, 0.0)),
        ];
        souls[0].speed = 1.0;
        souls[1].speed = 3.0;
        let (snapshot, index, specials) = build(&souls);
        let field = field_for(&config, &snapshot, &index, &specials, None);

        let s = field.steering(0, None);
        assert!(s.speed > 1.0);
        let special = field.steering(2, None);
        assert_eq!(special.speed, config.special_speed);
    }

    #[test]
    fn pointer_only_pulls_within_radius() {
        let config = SimulationConfig::default();
        let souls = vec![soul(1, SoulKind::StandardA, Vec3::ZERO)];
        let (snapshot, index, specials) = build(&souls);

        let near = field_for(&config, &snapshot, &index, &specials, Some(Vec3::new(5.0, 0.0, 0.0)));
        assert!(near.steering(0, None).impulse.x > 0.0);

        let far = field_for(&config, &snapshot, &index, &specials, Some(Vec3::new(500.0, 0.0, 0.0)));
        assert_eq!(far.steering(0, None).impulse, Vec3::ZERO);
    }

    #[test]
    fn tracked_special_is_kept_until_it_leaves() {
        let config = SimulationConfig::default();
        let souls = vec![
            soul(1, SoulKind::StandardA, Vec3::ZERO),
            soul(2, SoulKind::Special, Vec3::new(10.0, 0.0, 0.0)),
            soul(3, SoulKind::Special, Vec3::new(5.0, 0.0, 0.0)),
        ];
        let (snapshot, index, specials) = build(&souls);
        let field = field_for(&config, &snapshot, &index, &specials, None);

        // Fresh choice picks the nearest
        assert_eq!(field.steering(0, None).target_special, Some(3));
        // An existing choice in range sticks even if another is closer
        assert_eq!(field.steering(0, Some(2)).target_special, Some(2));
        // A vanished choice is replaced by the nearest remaining one
        assert_eq!(field.steering(0, Some(99)).target_special, Some(3));
        // Specials never track anyone
        assert_eq!(field.steering(1, None).target_special, None);
    }

    #[test]
    fn out_of_range_special_is_dropped() {
        let config = SimulationConfig::default();
        let souls = vec![
            soul(1, SoulKind::StandardA, Vec3::ZERO),
            soul(2, SoulKind::Special, Vec3::new(config.dewa_attraction_radius + 1.0, 0.0, 0.0)),
        ];
        let (snapshot, index, specials) = build(&souls);
        let field = field_for(&config, &snapshot, &index, &specials, None);
        assert_eq!(field.steering(0, Some(2)).target_special, None);
    }

    #[test]
    fn integration_holds_speed_near_base() {
        let config = SimulationConfig::default();
        let mut s = soul(1, SoulKind::StandardA, Vec3::ZERO);
        let steering = Steering {
            impulse: Vec3::new(50.0, 0.0, 0.0),
            speed: 100.0,
            target_special: None,
        };
        integrate(&mut s, &steering, 1.0 / 60.0, &config);
        assert!(s.velocity.length() < 100.0);
        assert!(s.velocity.x > 0.0);
        assert!(s.position.is_finite());
    }

    #[test]
    fn integration_ignores_non_finite_input() {
        let config = SimulationConfig::default();
        let mut s = soul(1, SoulKind::StandardB, Vec3::new(1.0, 2.0, 3.0));
        let before = s.position;
        let steering = Steering {
            impulse: Vec3::new(f32::NAN, 0.0, 0.0),
            speed: f32::INFINITY,
            target_special: None,
        };
        integrate(&mut s, &steering, f32::NAN, &config);
        assert_eq!(s.position, before);
        assert!(s.velocity.is_finite());
    }

    #[test]
    fn souls_outside_the_world_are_pulled_back() {
        let config = SimulationConfig::default();
        let souls = vec![soul(1, SoulKind::StandardA, Vec3::new(config.world_radius * 2.0, 0.0, 0.0))];
        let (snapshot, index, specials) = build(&souls);
        let field = field_for(&config, &snapshot, &index, &specials, None);
        assert!(field.steering(0, None).impulse.x < 0.0);
    }
}
