// Adaptive quality controller
//
// Samples frame telemetry from the consumer and, at most once per evaluation
// window, moves the global quality tier by a single step: down when the
// average FPS drops below 80% of target, up when it exceeds 110% of target
// and memory has headroom. Starting and maximum tiers come from a one-time
// hardware probe.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::config::SimulationConfig;
use crate::error::{SimError, SimResult};
use crate::quality::{QualityProfile, QualityTier};

const DOWNGRADE_RATIO: f32 = 0.8;
const UPGRADE_RATIO: f32 = 1.1;
const MEMORY_HEADROOM_RATIO: f32 = 0.8;
const MAX_SAMPLES: usize = 240;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySample {
    pub fps: f32,
    pub frame_time_ms: f32,
    #[serde(default)]
    pub memory_mb: Option<f32>,
    /// Consumer clock, milliseconds.
    pub timestamp_ms: u64,
}

impl TelemetrySample {
    pub fn is_valid(&self) -> bool {
        self.fps.is_finite()
            && self.fps >= 0.0
            && self.frame_time_ms.is_finite()
            && self.memory_mb.map_or(true, |m| m.is_finite() && m >= 0.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HardwareCapabilities {
    /// Instanced drawing is required for anything above the minimal tier.
    pub instancing: bool,
    pub cores: usize,
    /// Coarse GPU class, 0 (integrated/unknown) to 3 (discrete high-end).
    pub gpu_tier: u8,
}

impl HardwareCapabilities {
    /// Highest tier this hardware is allowed to reach.
    pub fn ceiling(&self) -> QualityTier {
        if !self.instancing {
            return QualityTier::Minimal;
        }
        let by_gpu = match self.gpu_tier {
            0 => QualityTier::Low,
            1 => QualityTier::Medium,
            2 => QualityTier::High,
            _ => QualityTier::Ultra,
        };
        if self.cores < 4 {
            by_gpu.lower().unwrap_or(QualityTier::Minimal)
        } else {
            by_gpu
        }
    }

    pub fn initial_tier(&self) -> QualityTier {
        self.ceiling().min(QualityTier::Medium)
    }
}

pub trait CapabilityProbe {
    fn probe(&self) -> SimResult<HardwareCapabilities>;
}

/// Probe for the host process. Headless hosts have no GPU to inspect, so
/// the GPU class comes from configuration, or from the core count when the
/// configuration leaves it unset.
pub struct SystemProbe {
    gpu_tier: Option<u8>,
}

impl SystemProbe {
    pub fn new(gpu_tier: Option<u8>) -> Self {
        Self { gpu_tier }
    }

    pub fn from_config(config: &SimulationConfig) -> Self {
        Self::new(config.gpu_tier)
    }
}

impl CapabilityProbe for SystemProbe {
    fn probe(&self) -> SimResult<HardwareCapabilities> {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .map_err(|e| SimError::Probe(e.to_string()))?;
        let gpu_tier = match self.gpu_tier {
            Some(tier) => tier,
            None => {
                let tier = gpu_tier_from_cores(cores);
                tracing::info!(cores, gpu_tier = tier, "no GPU tier configured, deriving one from core count");
                tier
            }
        };
        Ok(HardwareCapabilities {
            instancing: true,
            cores,
            gpu_tier,
        })
    }
}

/// Rough GPU class for hosts that cannot report one.
pub fn gpu_tier_from_cores(cores: usize) -> u8 {
    match cores {
        0..=7 => 1,
        _ => 2,
    }
}

/// Outcome of a single evaluation that changed the tier.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TierChange {
    pub from: QualityTier,
    pub to: QualityTier,
    pub average_fps: f32,
}

pub struct AdaptiveController {
    tier: QualityTier,
    ceiling: QualityTier,
    target_fps: f32,
    window_ms: u64,
    memory_budget_mb: f32,
    samples: VecDeque<TelemetrySample>,
    last_evaluation_ms: Option<u64>,
    capabilities: Option<HardwareCapabilities>,
}

impl AdaptiveController {
    pub fn new(config: &SimulationConfig, probe: &dyn CapabilityProbe) -> Self {
        let (tier, ceiling, capabilities) = match probe.probe() {
            Ok(caps) => {
                let ceiling = caps.ceiling();
                if ceiling == QualityTier::Minimal {
                    tracing::warn!(?caps, "hardware lacks required features, forcing minimal quality");
                }
                (caps.initial_tier(), ceiling, Some(caps))
            }
            Err(e) => {
                tracing::warn!(error = %e, "hardware probe failed, starting at minimal quality");
                (QualityTier::Minimal, QualityTier::Medium, None)
            }
        };
        tracing::info!(?tier, ?ceiling, "adaptive quality initialised");

        Self {
            tier,
            ceiling,
            target_fps: config.target_fps,
            window_ms: config.evaluation_interval_ms.max(1),
            memory_budget_mb: config.memory_budget_mb,
            samples: VecDeque::with_capacity(MAX_SAMPLES),
            last_evaluation_ms: None,
            capabilities,
        }
    }

    pub fn tier(&self) -> QualityTier {
        self.tier
    }

    pub fn ceiling(&self) -> QualityTier {
        self.ceiling
    }

    pub fn profile(&self) -> QualityProfile {
        self.tier.profile()
    }

    pub fn capabilities(&self) -> Option<HardwareCapabilities> {
        self.capabilities
    }

    /// Invalid samples are dropped.
    pub fn record(&mut self, sample: TelemetrySample) -> bool {
        if !sample.is_valid() {
            return false;
        }
        if self.samples.len() == MAX_SAMPLES {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
        true
    }

    pub fn average_fps(&self) -> Option<f32> {
        if self.samples.is_empty() {
            return None;
        }
        let total: f32 = self.samples.iter().map(|s| s.fps).sum();
        Some(total / self.samples.len() as f32)
    }

    fn memory_has_headroom(&self) -> bool {
        match self.samples.iter().rev().find_map(|s| s.memory_mb) {
            Some(used) => used < self.memory_budget_mb * MEMORY_HEADROOM_RATIO,
            None => true,
        }
    }

    /// Evaluate at consumer time `now_ms`. Does nothing until a full window
    /// has passed since the previous evaluation, and moves at most one tier.
    pub fn evaluate(&mut self, now_ms: u64) -> Option<TierChange> {
        match self.last_evaluation_ms {
            None => {
                // First sample opens the window
                self.last_evaluation_ms = Some(now_ms);
                return None;
            }
            Some(last) if now_ms.saturating_sub(last) < self.window_ms => return None,
            Some(_) => {}
        }
        self.last_evaluation_ms = Some(now_ms);

        let average_fps = self.average_fps()?;
        let headroom = self.memory_has_headroom();
        self.samples.clear();

        let next = if average_fps < self.target_fps * DOWNGRADE_RATIO {
            self.tier.lower()
        } else if average_fps > self.target_fps * UPGRADE_RATIO && headroom {
            self.tier.higher().filter(|t| *t <= self.ceiling)
        } else {
            None
        }?;

        let change = TierChange {
            from: self.tier,
            to: next,
            average_fps,
        };
        self.tier = next;
        tracing::info!(from = ?change.from, to = ?change.to, average_fps, "quality tier changed");
        Some(change)
    }
}
