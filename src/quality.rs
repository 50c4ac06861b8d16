// Global quality presets that bundle LOD distances and simulation budgets

use serde::{Deserialize, Serialize};

use crate::lod::{LodClassifier, LodPolicy, LodThresholds, TierBudget};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QualityTier {
    Minimal,
    Low,
    Medium,
    High,
    Ultra,
}

impl QualityTier {
    pub const ALL: [QualityTier; 5] = [
        QualityTier::Minimal,
        QualityTier::Low,
        QualityTier::Medium,
        QualityTier::High,
        QualityTier::Ultra,
    ];

    pub fn ordinal(self) -> usize {
        self as usize
    }

    pub fn from_ordinal(ordinal: usize) -> Self {
        Self::ALL[ordinal.min(Self::ALL.len() - 1)]
    }

    pub fn lower(self) -> Option<Self> {
        self.ordinal().checked_sub(1).map(Self::from_ordinal)
    }

    pub fn higher(self) -> Option<Self> {
        (self != QualityTier::Ultra).then(|| Self::from_ordinal(self.ordinal() + 1))
    }

    pub fn profile(self) -> QualityProfile {
        QualityProfile::for_tier(self)
    }
}

/// Everything a quality tier controls.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityProfile {
    pub tier: QualityTier,
    /// Render budget for the consumer and cap for initial batches. The
    /// running population is never truncated to it.
    pub max_souls: usize,
    pub thresholds: LodThresholds,
    pub policy: LodPolicy,
    /// Souls examined for connections per step.
    pub connection_check_budget: usize,
    pub cell_size: f32,
}

fn budget(physics_rate: f32, connection_multiplier: f32) -> TierBudget {
    TierBudget {
        physics_rate,
        connection_multiplier,
    }
}

impl QualityProfile {
    pub fn for_tier(tier: QualityTier) -> Self {
        match tier {
            QualityTier::Minimal => Self {
                tier,
                max_souls: 500,
                thresholds: LodThresholds::from_distances(15.0, 30.0, 50.0),
                policy: LodPolicy {
                    high: budget(1.0, 0.5),
                    medium: budget(0.34, 0.25),
                    low: budget(0.2, 0.1),
                },
                connection_check_budget: 200,
                cell_size: 6.0,
            },
            QualityTier::Low => Self {
                tier,
                max_souls: 1000,
                thresholds: LodThresholds::from_distances(20.0, 40.0, 70.0),
                policy: LodPolicy {
                    high: budget(1.0, 0.7),
                    medium: budget(0.5, 0.4),
                    low: budget(0.25, 0.15),
                },
                connection_check_budget: 500,
                cell_size: 5.0,
            },
            QualityTier::Medium => Self {
                tier,
                max_souls: 2000,
                thresholds: LodThresholds::from_distances(30.0, 55.0, 90.0),
                policy: LodPolicy::default(),
                connection_check_budget: 1000,
                cell_size: 4.0,
            },
            QualityTier::High => Self {
                tier,
                max_souls: 4000,
                thresholds: LodThresholds::from_distances(40.0, 70.0, 120.0),
                policy: LodPolicy {
                    high: budget(1.0, 1.0),
                    medium: budget(0.5, 0.8),
                    low: budget(0.34, 0.4),
                },
                connection_check_budget: 2500,
                cell_size: 4.0,
            },
            QualityTier::Ultra => Self {
                tier,
                max_souls: 8000,
                thresholds: LodThresholds::from_distances(60.0, 100.0, 180.0),
                policy: LodPolicy {
                    high: budget(1.0, 1.0),
                    medium: budget(1.0, 0.9),
                    low: budget(0.5, 0.6),
                },
                connection_check_budget: 10_000,
                cell_size: 3.5,
            },
        }
    }

    pub fn classifier(&self) -> LodClassifier {
        LodClassifier::new(self.thresholds, self.policy)
    }
}
