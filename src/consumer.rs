// Consumer side of the simulation channel
//
// SoulView mirrors the simulation from the event stream alone. Events are
// applied in arrival order and every application is idempotent, so a
// duplicated removal or a delta for an already-removed soul is harmless.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

use crate::adaptive::TelemetrySample;
use crate::channel::{SimulationEvent, SoulDelta};
use crate::connections::Connection;
use crate::error::ChannelStatus;
use crate::lod::LodHint;
use crate::quality::{QualityProfile, QualityTier};
use crate::soul::{Soul, SoulId, SoulKind};
use crate::types::{Rgb, Vec3};

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderedSoul {
    pub id: SoulId,
    pub kind: SoulKind,
    pub position: Vec3,
    #[serde(rename = "colorRGB")]
    pub color_rgb: Rgb,
    pub opacity: f32,
    pub visible: bool,
}

impl From<&Soul> for RenderedSoul {
    fn from(soul: &Soul) -> Self {
        Self {
            id: soul.id,
            kind: soul.kind,
            position: soul.position,
            color_rgb: soul.hsl.to_rgb(),
            opacity: soul.opacity(),
            visible: true,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SoulView {
    pub souls: BTreeMap<SoulId, RenderedSoul>,
    pub connections: Vec<Connection>,
    pub profile: QualityProfile,
    pub status: ChannelStatus,
    /// Number of `soulsUpdated` batches applied.
    pub frames: u64,
}

impl Default for SoulView {
    fn default() -> Self {
        Self {
            souls: BTreeMap::new(),
            connections: Vec::new(),
            profile: QualityTier::Minimal.profile(),
            status: ChannelStatus::Starting,
            frames: 0,
        }
    }
}

impl SoulView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.souls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.souls.is_empty()
    }

    pub fn apply(&mut self, event: &SimulationEvent) {
        match event {
            SimulationEvent::SoulsCreated { souls } => {
                for soul in souls {
                    self.souls.insert(soul.id, RenderedSoul::from(soul));
                }
            }
            SimulationEvent::SoulsUpdated { deltas } => {
                for delta in deltas {
                    self.apply_delta(delta);
                }
                self.frames += 1;
            }
            SimulationEvent::SoulRemoved { id } => {
                self.souls.remove(id);
            }
            SimulationEvent::ConnectionsUpdated { edges } => {
                self.connections.clone_from(edges);
            }
            SimulationEvent::QualityChanged { profile, .. } => {
                self.profile = *profile;
            }
        }
    }

    fn apply_delta(&mut self, delta: &SoulDelta) {
        // Late deltas for removed souls are dropped
        let Some(soul) = self.souls.get_mut(&delta.id) else {
            return;
        };
        soul.position = delta.position;
        if let Some(color) = delta.color_rgb {
            soul.color_rgb = color;
        }
        if let Some(opacity) = delta.opacity {
            soul.opacity = opacity;
        }
        if let Some(visible) = delta.visible {
            soul.visible = visible;
        }
    }

    /// Per-soul hints for the current quality profile as seen from `viewpoint`.
    pub fn lod_hints(&self, viewpoint: Vec3) -> HashMap<SoulId, LodHint> {
        let classifier = self.profile.classifier();
        self.souls
            .values()
            .map(|soul| (soul.id, classifier.classify(soul.position, viewpoint)))
            .collect()
    }

    /// Once the channel has failed the view is frozen at its last state.
    pub fn is_static(&self) -> bool {
        self.status.is_degraded()
    }
}

// Floor for the fps division; frames faster than this all read as 10k fps
const MIN_FRAME_MS: f32 = 0.1;

/// Accumulates frame durations and emits one telemetry sample per window.
/// The reported fps is what the measured frame time could sustain, not the
/// paced rate the loop actually ran at.
pub struct FrameTimer {
    window_ms: u64,
    window_start_ms: Option<u64>,
    frames: u32,
    total_frame_ms: f32,
}

impl FrameTimer {
    pub fn new(window_ms: u64) -> Self {
        Self {
            window_ms: window_ms.max(1),
            window_start_ms: None,
            frames: 0,
            total_frame_ms: 0.0,
        }
    }

    /// Record a frame that took `frame_ms` and finished at `now_ms`.
    pub fn record(&mut self, frame_ms: f32, now_ms: u64) -> Option<TelemetrySample> {
        if !(frame_ms.is_finite() && frame_ms >= 0.0) {
            return None;
        }
        let start = *self.window_start_ms.get_or_insert(now_ms);
        self.frames += 1;
        self.total_frame_ms += frame_ms;

        let elapsed = now_ms.saturating_sub(start);
        if elapsed < self.window_ms {
            return None;
        }

        let frame_time_ms = self.total_frame_ms / self.frames as f32;
        let fps = 1000.0 / frame_time_ms.max(MIN_FRAME_MS);
        let sample = TelemetrySample {
            fps,
            frame_time_ms,
            memory_mb: None,
            timestamp_ms: now_ms,
        };
        self.window_start_ms = Some(now_ms);
        self.frames = 0;
        self.total_frame_ms = 0.0;
        Some(sample)
    }
}
