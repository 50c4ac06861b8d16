// Distance-based level of detail
//
// Every frame each soul is placed into a tier from its squared distance to
// the viewpoint. The tier decides how often its physics runs, how likely its
// connections are kept, and whether it is culled outright. Classification is
// stateless: the previous tier plays no part.
//
//   High    every frame   all connections    rendered
//   Medium  reduced       most               rendered
//   Low     rare          few                rendered
//   Culled  skipped       none               hidden

use serde::{Deserialize, Serialize};

use crate::types::Vec3;

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub enum LodTier {
    #[default]
    High,
    Medium,
    Low,
    Culled,
}

impl LodTier {
    pub fn is_culled(self) -> bool {
        self == LodTier::Culled
    }
}

/// Squared distance thresholds, `medium_sq < low_sq < culled_sq`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LodThresholds {
    pub medium_sq: f32,
    pub low_sq: f32,
    pub culled_sq: f32,
}

impl LodThresholds {
    /// Build from plain distances. Out-of-order distances are pushed up so
    /// the thresholds stay monotonic.
    pub fn from_distances(medium: f32, low: f32, culled: f32) -> Self {
        let medium = medium.max(0.0);
        let low = low.max(medium);
        let culled = culled.max(low);
        Self {
            medium_sq: medium * medium,
            low_sq: low * low,
            culled_sq: culled * culled,
        }
    }
}

/// What a tier costs: physics rate in (0, 1] and connection keep probability.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TierBudget {
    pub physics_rate: f32,
    pub connection_multiplier: f32,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LodPolicy {
    pub high: TierBudget,
    pub medium: TierBudget,
    pub low: TierBudget,
}

impl Default for LodPolicy {
    fn default() -> Self {
        Self {
            high: TierBudget {
                physics_rate: 1.0,
                connection_multiplier: 1.0,
            },
            medium: TierBudget {
                physics_rate: 0.5,
                connection_multiplier: 0.6,
            },
            low: TierBudget {
                physics_rate: 0.25,
                connection_multiplier: 0.25,
            },
        }
    }
}

impl LodPolicy {
    pub fn budget(&self, tier: LodTier) -> TierBudget {
        match tier {
            LodTier::High => self.high,
            LodTier::Medium => self.medium,
            LodTier::Low => self.low,
            LodTier::Culled => TierBudget {
                physics_rate: 0.0,
                connection_multiplier: 0.0,
            },
        }
    }
}

/// Per-soul LOD annotation, as produced by the classifier or sent by the consumer.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LodHint {
    pub tier: LodTier,
    pub physics_rate: f32,
    pub connection_multiplier: f32,
}

impl LodHint {
    pub fn full() -> Self {
        Self {
            tier: LodTier::High,
            physics_rate: 1.0,
            connection_multiplier: 1.0,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.physics_rate.is_finite() && self.connection_multiplier.is_finite()
    }
}

pub fn classify(distance_sq: f32, thresholds: &LodThresholds) -> LodTier {
    // NaN distances fall through every comparison and end up culled
    if distance_sq < thresholds.medium_sq {
        LodTier::High
    } else if distance_sq < thresholds.low_sq {
        LodTier::Medium
    } else if distance_sq < thresholds.culled_sq {
        LodTier::Low
    } else {
        LodTier::Culled
    }
}

/// Whether a soul with the given physics rate steps on `frame`.
#[inline]
pub fn should_update(physics_rate: f32, frame: u64) -> bool {
    if !physics_rate.is_finite() || physics_rate <= 0.0 {
        return false;
    }
    if physics_rate >= 1.0 {
        return true;
    }
    let interval = (1.0 / physics_rate).round().max(1.0) as u64;
    frame % interval == 0
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LodClassifier {
    pub thresholds: LodThresholds,
    pub policy: LodPolicy,
}

impl LodClassifier {
    pub fn new(thresholds: LodThresholds, policy: LodPolicy) -> Self {
        Self { thresholds, policy }
    }

    pub fn classify(&self, position: Vec3, viewpoint: Vec3) -> LodHint {
        let tier = classify(position.distance_squared(viewpoint), &self.thresholds);
        let budget = self.policy.budget(tier);
        LodHint {
            tier,
            physics_rate: budget.physics_rate,
            connection_multiplier: budget.connection_multiplier,
        }
    }
}
