// Orbiting viewpoint used by the headless consumer for LOD hints

use serde::{Deserialize, Serialize};

use crate::types::Vec3;

/// Camera orbiting a target point
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Viewpoint {
    pub target: Vec3,
    pub distance: f32, // Orbit radius in world units
    pub yaw: f32,      // Radians around the vertical axis
    pub pitch: f32,    // Radians above the horizontal plane
    pub orbit_speed: f32, // Yaw radians per second
}

impl Viewpoint {
    /// Default orbit sized to a world of `world_radius`, 1.5× the radius out.
    pub fn new(world_radius: f32) -> Self {
        let radius = if world_radius.is_finite() && world_radius > 0.0 {
            world_radius
        } else {
            1.0
        };
        Self {
            target: Vec3::ZERO,
            distance: radius * 1.5,
            yaw: 0.0,
            pitch: 0.3,
            orbit_speed: 0.1,
        }
    }

    pub fn position(&self) -> Vec3 {
        let (sin_yaw, cos_yaw) = self.yaw.sin_cos();
        let (sin_pitch, cos_pitch) = self.pitch.sin_cos();
        self.target
            + Vec3::new(
                cos_pitch * sin_yaw * self.distance,
                sin_pitch * self.distance,
                cos_pitch * cos_yaw * self.distance,
            )
    }

    /// Orbit by `dt` seconds.
    pub fn advance(&mut self, dt: f32) {
        if !dt.is_finite() || dt <= 0.0 {
            return;
        }
        self.yaw = (self.yaw + self.orbit_speed * dt).rem_euclid(std::f32::consts::TAU);
    }
}

impl Default for Viewpoint {
    fn default() -> Self {
        Self::new(60.0)
    }
}
