// Message protocol between the simulation worker and its consumer
//
// Commands flow consumer -> simulation, events flow simulation -> consumer.
// Both directions are fire-and-forget over unbounded queues with no
// request/response correlation. An `update` command is the step trigger,
// so the worker never free-runs ahead of the consumer. On a byte stream the
// messages are framed as JSON lines (encode_frame / decode_frame).

use ::rand as external_rand;
use external_rand::rngs::StdRng;
use external_rand::SeedableRng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;

use crate::adaptive::{AdaptiveController, CapabilityProbe, TelemetrySample};
use crate::config::{PopulationTunables, SimulationConfig};
use crate::connections::Connection;
use crate::error::{ChannelStatus, SimError, SimResult};
use crate::lod::LodHint;
use crate::quality::{QualityProfile, QualityTier};
use crate::simulation::{RenderState, Simulation, StepInput};
use crate::soul::{Soul, SoulId, SoulSeed};
use crate::types::{Rgb, Vec3};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SimulationCommand {
    /// Replace the population with `souls` and optionally new tunables.
    #[serde(rename_all = "camelCase")]
    Init {
        souls: Vec<SoulSeed>,
        #[serde(default)]
        constants: Option<PopulationTunables>,
    },
    /// Advance one step.
    #[serde(rename_all = "camelCase")]
    Update {
        #[serde(default)]
        pointer_position: Option<Vec3>,
        #[serde(default)]
        viewpoint: Option<Vec3>,
        #[serde(default)]
        lod_hints: HashMap<SoulId, LodHint>,
        #[serde(default)]
        delta_time: Option<f32>,
    },
    #[serde(rename_all = "camelCase")]
    AddSoul { soul: SoulSeed },
    #[serde(rename_all = "camelCase")]
    RemoveSoul { id: SoulId },
    #[serde(rename_all = "camelCase")]
    Telemetry { sample: TelemetrySample },
    #[serde(rename_all = "camelCase")]
    SetTunables { tunables: PopulationTunables },
}

impl SimulationCommand {
    pub fn step() -> Self {
        SimulationCommand::Update {
            pointer_position: None,
            viewpoint: None,
            lod_hints: HashMap::new(),
            delta_time: None,
        }
    }
}

/// Per-soul change. Position is always present; color and opacity only when
/// they changed since the last delta for that soul.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SoulDelta {
    pub id: SoulId,
    pub position: Vec3,
    #[serde(default, rename = "colorRGB", skip_serializing_if = "Option::is_none")]
    pub color_rgb: Option<Rgb>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opacity: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visible: Option<bool>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SimulationEvent {
    #[serde(rename_all = "camelCase")]
    SoulsCreated { souls: Vec<Soul> },
    #[serde(rename_all = "camelCase")]
    SoulsUpdated { deltas: Vec<SoulDelta> },
    #[serde(rename_all = "camelCase")]
    SoulRemoved { id: SoulId },
    #[serde(rename_all = "camelCase")]
    ConnectionsUpdated { edges: Vec<Connection> },
    #[serde(rename_all = "camelCase")]
    QualityChanged {
        tier: QualityTier,
        profile: QualityProfile,
    },
}

/// Serialize one message as a JSON line.
pub fn encode_frame<T: Serialize>(message: &T) -> SimResult<String> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

pub fn decode_frame<T: DeserializeOwned>(line: &str) -> SimResult<T> {
    Ok(serde_json::from_str(line.trim_end())?)
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct SentAppearance {
    color: Rgb,
    opacity: u8,
    visible: bool,
}

fn quantize_opacity(opacity: f32) -> u8 {
    (opacity.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// Remembers what each consumer-side soul last looked like so that deltas
/// only carry appearance changes.
#[derive(Default)]
pub struct DeltaEncoder {
    sent: HashMap<SoulId, SentAppearance>,
}

impl DeltaEncoder {
    pub fn encode(&mut self, states: &[RenderState]) -> Vec<SoulDelta> {
        let mut deltas = Vec::with_capacity(states.len());
        for state in states {
            let now = SentAppearance {
                color: state.color,
                opacity: quantize_opacity(state.opacity),
                visible: state.visible,
            };
            let previous = self.sent.insert(state.id, now);

            // Culled souls do not move, so they only need a delta when they flip
            if !state.visible && previous.map_or(false, |p| !p.visible) {
                continue;
            }

            deltas.push(SoulDelta {
                id: state.id,
                position: state.position,
                color_rgb: (previous.map(|p| p.color) != Some(now.color)).then_some(now.color),
                opacity: (previous.map(|p| p.opacity) != Some(now.opacity))
                    .then(|| now.opacity as f32 / 255.0),
                visible: (previous.map(|p| p.visible) != Some(now.visible)).then_some(now.visible),
            });
        }
        deltas
    }

    pub fn forget(&mut self, id: SoulId) {
        self.sent.remove(&id);
    }
}

/// Owns the simulation and translates commands into events. Runs inside
/// the worker task but is usable directly, which keeps tests synchronous.
pub struct SimulationWorker {
    sim: Simulation,
    controller: AdaptiveController,
    encoder: DeltaEncoder,
    rng: StdRng,
}

impl SimulationWorker {
    pub fn new(config: SimulationConfig, probe: &dyn CapabilityProbe, seed: Option<u64>) -> Self {
        let controller = AdaptiveController::new(&config, probe);
        let sim = Simulation::new(config, controller.profile());
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            sim,
            controller,
            encoder: DeltaEncoder::default(),
            rng,
        }
    }

    pub fn simulation(&self) -> &Simulation {
        &self.sim
    }

    pub fn controller(&self) -> &AdaptiveController {
        &self.controller
    }

    /// Events announced once when the worker starts.
    pub fn greeting(&self) -> Vec<SimulationEvent> {
        let profile = self.sim.quality;
        vec![SimulationEvent::QualityChanged {
            tier: profile.tier,
            profile,
        }]
    }

    fn remove(&mut self, id: SoulId, events: &mut Vec<SimulationEvent>) {
        if self.sim.remove_soul(id) {
            self.encoder.forget(id);
            events.push(SimulationEvent::SoulRemoved { id });
        }
    }

    pub fn handle(&mut self, command: SimulationCommand) -> Vec<SimulationEvent> {
        let mut events = Vec::new();
        match command {
            SimulationCommand::Init { souls, constants } => {
                if let Some(tunables) = constants {
                    if let Err(e) = self.sim.set_tunables(&tunables) {
                        tracing::warn!(error = %e, "ignoring invalid init constants");
                    }
                }
                for id in self.sim.clear() {
                    self.encoder.forget(id);
                    events.push(SimulationEvent::SoulRemoved { id });
                }
                let max_souls = self.sim.quality.max_souls;
                if souls.len() > max_souls {
                    tracing::warn!(
                        requested = souls.len(),
                        max_souls,
                        "initial batch exceeds the quality budget, truncating"
                    );
                }
                let created: Vec<Soul> = souls
                    .iter()
                    .take(max_souls)
                    .filter_map(|seed| self.sim.add_soul(seed, &mut self.rng).cloned())
                    .collect();
                tracing::info!(population = created.len(), "simulation initialised");
                if !created.is_empty() {
                    events.push(SimulationEvent::SoulsCreated { souls: created });
                }
            }
            SimulationCommand::Update {
                pointer_position,
                viewpoint,
                lod_hints,
                delta_time,
            } => {
                let input = StepInput {
                    pointer: pointer_position,
                    viewpoint,
                    lod_hints,
                    delta_time,
                };
                let output = self.sim.step(&mut self.rng, &input);
                if !output.created.is_empty() {
                    events.push(SimulationEvent::SoulsCreated {
                        souls: output.created,
                    });
                }
                for id in output.removed {
                    self.encoder.forget(id);
                    events.push(SimulationEvent::SoulRemoved { id });
                }
                let deltas = self.encoder.encode(&self.sim.render_states());
                events.push(SimulationEvent::SoulsUpdated { deltas });
                events.push(SimulationEvent::ConnectionsUpdated {
                    edges: self.sim.connections.clone(),
                });
            }
            SimulationCommand::AddSoul { soul } => {
                if let Some(created) = self.sim.add_soul(&soul, &mut self.rng).cloned() {
                    events.push(SimulationEvent::SoulsCreated {
                        souls: vec![created],
                    });
                }
            }
            SimulationCommand::RemoveSoul { id } => self.remove(id, &mut events),
            SimulationCommand::Telemetry { mut sample } => {
                if sample.memory_mb.is_none() {
                    sample.memory_mb = Some(self.sim.estimated_memory_mb());
                }
                if !self.controller.record(sample) {
                    tracing::warn!(?sample, "dropping invalid telemetry sample");
                } else if self.controller.evaluate(sample.timestamp_ms).is_some() {
                    let profile = self.controller.profile();
                    self.sim.apply_quality(profile);
                    events.push(SimulationEvent::QualityChanged {
                        tier: profile.tier,
                        profile,
                    });
                }
            }
            SimulationCommand::SetTunables { tunables } => {
                if let Err(e) = self.sim.set_tunables(&tunables) {
                    tracing::warn!(error = %e, "ignoring invalid tunables");
                }
            }
        }
        events
    }
}

/// Consumer-side handle to a running simulation worker.
pub struct SimulationHandle {
    commands: mpsc::UnboundedSender<SimulationCommand>,
    status: watch::Receiver<ChannelStatus>,
    worker: AbortHandle,
}

impl SimulationHandle {
    /// Fire-and-forget send. Fails only when the worker is gone.
    pub fn send(&self, command: SimulationCommand) -> SimResult<()> {
        self.commands
            .send(command)
            .map_err(|_| SimError::ChannelClosed)
    }

    pub fn status(&self) -> ChannelStatus {
        self.status.borrow().clone()
    }

    pub fn status_receiver(&self) -> watch::Receiver<ChannelStatus> {
        self.status.clone()
    }

    /// Stop the worker immediately. Nothing is flushed.
    pub fn terminate(&self) {
        self.worker.abort();
    }
}

/// Start the simulation worker on the current tokio runtime. Returns the
/// command handle and the event stream.
pub fn spawn_simulation(
    config: SimulationConfig,
    probe: &dyn CapabilityProbe,
    seed: Option<u64>,
) -> SimResult<(SimulationHandle, mpsc::UnboundedReceiver<SimulationEvent>)> {
    config.validate()?;
    let runtime = tokio::runtime::Handle::try_current()
        .map_err(|e| SimError::WorkerFailed(e.to_string()))?;

    let (command_tx, mut command_rx) = mpsc::unbounded_channel::<SimulationCommand>();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = watch::channel(ChannelStatus::Starting);

    let mut worker = SimulationWorker::new(config, probe, seed);

    let task = runtime.spawn(async move {
        for event in worker.greeting() {
            if event_tx.send(event).is_err() {
                return;
            }
        }
        while let Some(command) = command_rx.recv().await {
            for event in worker.handle(command) {
                if event_tx.send(event).is_err() {
                    tracing::info!("event receiver dropped, stopping simulation worker");
                    return;
                }
            }
        }
        tracing::info!("command channel closed, stopping simulation worker");
    });
    let abort = task.abort_handle();
    status_tx.send_replace(ChannelStatus::Running);

    // Supervisor turns the worker's exit into a status change
    runtime.spawn(async move {
        let status = match task.await {
            Ok(()) => ChannelStatus::Terminated,
            Err(e) if e.is_panic() => {
                tracing::error!("simulation worker panicked");
                ChannelStatus::Failed("simulation worker panicked".into())
            }
            Err(_) => ChannelStatus::Terminated,
        };
        let _ = status_tx.send(status);
    });

    tracing::info!("simulation worker started");
    Ok((
        SimulationHandle {
            commands: command_tx,
            status: status_rx,
            worker: abort,
        },
        event_rx,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adaptive::HardwareCapabilities;
    use std::collections::HashSet;

    struct TestProbe;

    impl CapabilityProbe for TestProbe {
        fn probe(&self) -> SimResult<HardwareCapabilities> {
            Ok(HardwareCapabilities {
                instancing: true,
                cores: 8,
                gpu_tier: 2,
            })
        }
    }

    fn worker() -> SimulationWorker {
        let config = SimulationConfig {
            initial_souls: 0,
            ..SimulationConfig::default()
        };
        SimulationWorker::new(config, &TestProbe, Some(7))
    }

    fn seeds(n: usize) -> Vec<SoulSeed> {
        (0..n)
            .map(|i| SoulSeed::at(Vec3::new(i as f32, 0.0, 0.0)))
            .collect()
    }

    fn removed_ids(events: &[SimulationEvent]) -> Vec<SoulId> {
        events
            .iter()
            .filter_map(|e| match e {
                SimulationEvent::SoulRemoved { id } => Some(*id),
                _ => None,
            })
            .collect()
    }

    fn created_ids(events: &[SimulationEvent]) -> Vec<SoulId> {
        events
            .iter()
            .flat_map(|e| match e {
                SimulationEvent::SoulsCreated { souls } => souls.iter().map(|s| s.id).collect(),
                _ => Vec::new(),
            })
            .collect()
    }

    #[test]
    fn command_wire_format() {
        let json = r#"{"type":"update","pointerPosition":{"x":1.0,"y":2.0,"z":3.0},
            "lodHints":{"4":{"tier":"low","physicsRate":0.25,"connectionMultiplier":0.25}}}"#;
        let command: SimulationCommand = serde_json::from_str(json).unwrap();
        match command {
            SimulationCommand::Update {
                pointer_position,
                lod_hints,
                viewpoint,
                delta_time,
            } => {
                assert_eq!(pointer_position, Some(Vec3::new(1.0, 2.0, 3.0)));
                assert_eq!(lod_hints[&4].physics_rate, 0.25);
                assert!(viewpoint.is_none());
                assert!(delta_time.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }

        let line = encode_frame(&SimulationCommand::RemoveSoul { id: 9 }).unwrap();
        assert_eq!(line, "{\"type\":\"removeSoul\",\"id\":9}\n");
    }

    #[test]
    fn frames_round_trip_events() {
        let event = SimulationEvent::SoulsUpdated {
            deltas: vec![SoulDelta {
                id: 3,
                position: Vec3::new(0.5, 0.0, -1.0),
                color_rgb: Some(Rgb::new(1, 2, 3)),
                opacity: None,
                visible: None,
            }],
        };
        let line = encode_frame(&event).unwrap();
        assert!(line.contains("\"colorRGB\""));
        assert!(!line.contains("opacity"));
        match decode_frame::<SimulationEvent>(&line).unwrap() {
            SimulationEvent::SoulsUpdated { deltas } => assert_eq!(deltas.len(), 1),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(decode_frame::<SimulationEvent>("{\"type\":\"bogus\"}").is_err());
    }

    #[test]
    fn delta_encoder_sends_appearance_only_on_change() {
        let mut encoder = DeltaEncoder::default();
        let mut state = RenderState {
            id: 1,
            position: Vec3::ZERO,
            color: Rgb::new(100, 100, 100),
            opacity: 0.5,
            visible: true,
        };

        let first = encoder.encode(&[state]);
        assert!(first[0].color_rgb.is_some());
        assert!(first[0].opacity.is_some());

        state.position = Vec3::new(1.0, 0.0, 0.0);
        let second = encoder.encode(&[state]);
        assert_eq!(second[0].position, state.position);
        assert!(second[0].color_rgb.is_none());
        assert!(second[0].opacity.is_none());
        assert!(second[0].visible.is_none());

        state.color = Rgb::new(101, 100, 100);
        let third = encoder.encode(&[state]);
        assert_eq!(third[0].color_rgb, Some(state.color));
        assert!(third[0].opacity.is_none());
    }

    #[test]
    fn culled_souls_only_send_visibility_flips() {
        let mut encoder = DeltaEncoder::default();
        let mut state = RenderState {
            id: 2,
            position: Vec3::ZERO,
            color: Rgb::new(0, 0, 0),
            opacity: 1.0,
            visible: true,
        };
        encoder.encode(&[state]);

        state.visible = false;
        let flip = encoder.encode(&[state]);
        assert_eq!(flip[0].visible, Some(false));
        assert!(encoder.encode(&[state]).is_empty());

        state.visible = true;
        assert_eq!(encoder.encode(&[state])[0].visible, Some(true));
    }

    #[test]
    fn init_creates_and_echoes_ids() {
        let mut worker = worker();
        let events = worker.handle(SimulationCommand::Init {
            souls: seeds(10),
            constants: None,
        });
        let ids = created_ids(&events);
        assert_eq!(ids.len(), 10);
        assert_eq!(ids.iter().collect::<HashSet<_>>().len(), 10);
        assert!(removed_ids(&events).is_empty());
    }

    #[test]
    fn repeated_init_replaces_population() {
        let mut worker = worker();
        let first = created_ids(&worker.handle(SimulationCommand::Init {
            souls: seeds(4),
            constants: None,
        }));
        let events = worker.handle(SimulationCommand::Init {
            souls: seeds(2),
            constants: None,
        });
        let mut removed = removed_ids(&events);
        removed.sort_unstable();
        assert_eq!(removed, first);
        assert_eq!(worker.simulation().population(), 2);
        assert!(created_ids(&events).iter().all(|id| !first.contains(id)));
    }

    #[test]
    fn removal_is_idempotent() {
        let mut worker = worker();
        let ids = created_ids(&worker.handle(SimulationCommand::Init {
            souls: seeds(3),
            constants: None,
        }));
        let first = worker.handle(SimulationCommand::RemoveSoul { id: ids[0] });
        let second = worker.handle(SimulationCommand::RemoveSoul { id: ids[0] });
        assert_eq!(removed_ids(&first), vec![ids[0]]);
        assert!(second.is_empty());
        assert!(worker
            .handle(SimulationCommand::RemoveSoul { id: 10_000 })
            .is_empty());
    }

    #[test]
    fn update_emits_deltas_then_connections() {
        let mut worker = worker();
        worker.handle(SimulationCommand::Init {
            souls: seeds(5),
            constants: None,
        });
        let events = worker.handle(SimulationCommand::step());
        let kinds: Vec<&str> = events
            .iter()
            .map(|e| match e {
                SimulationEvent::SoulsCreated { .. } => "created",
                SimulationEvent::SoulsUpdated { .. } => "updated",
                SimulationEvent::SoulRemoved { .. } => "removed",
                SimulationEvent::ConnectionsUpdated { .. } => "connections",
                SimulationEvent::QualityChanged { .. } => "quality",
            })
            .collect();
        assert_eq!(&kinds[kinds.len() - 2..], &["updated", "connections"]);
    }

    #[test]
    fn invalid_added_soul_is_ignored() {
        let mut worker = worker();
        let events = worker.handle(SimulationCommand::AddSoul {
            soul: SoulSeed::at(Vec3::new(f32::NAN, 0.0, 0.0)),
        });
        assert!(events.is_empty());
        assert_eq!(worker.simulation().population(), 0);
    }

    #[test]
    fn distant_added_soul_is_ignored() {
        let mut worker = worker();
        let events = worker.handle(SimulationCommand::AddSoul {
            soul: SoulSeed::at(Vec3::new(1e10, 0.0, 0.0)),
        });
        assert!(events.is_empty());
        assert_eq!(worker.simulation().population(), 0);
    }

    #[test]
    fn init_batch_is_capped_by_quality_budget() {
        let mut worker = worker();
        let max_souls = worker.simulation().quality.max_souls;
        let souls: Vec<SoulSeed> = (0..max_souls + 25)
            .map(|i| SoulSeed::at(Vec3::new((i % 40) as f32, (i / 40 % 40) as f32, 0.0)))
            .collect();
        let events = worker.handle(SimulationCommand::Init {
            souls,
            constants: None,
        });
        assert_eq!(created_ids(&events).len(), max_souls);
        assert_eq!(worker.simulation().population(), max_souls);
    }

    #[test]
    fn sustained_low_fps_lowers_quality() {
        let mut worker = worker();
        let start = worker.controller().tier();
        let mut changes = Vec::new();
        for frame in 0..=70u64 {
            let events = worker.handle(SimulationCommand::Telemetry {
                sample: TelemetrySample {
                    fps: 20.0,
                    frame_time_ms: 50.0,
                    memory_mb: None,
                    timestamp_ms: frame * 16,
                },
            });
            changes.extend(events.into_iter().filter_map(|e| match e {
                SimulationEvent::QualityChanged { tier, .. } => Some(tier),
                _ => None,
            }));
        }
        assert_eq!(changes, vec![start.lower().unwrap()]);
        assert_eq!(worker.simulation().quality.tier, changes[0]);
    }

    #[test]
    fn invalid_tunables_are_rejected() {
        let mut worker = worker();
        let before = worker.simulation().config.tunables();
        worker.handle(SimulationCommand::SetTunables {
            tunables: PopulationTunables {
                new_soul_spawn_rate: -1.0,
                ..before
            },
        });
        assert_eq!(worker.simulation().config.tunables(), before);
    }

    #[tokio::test]
    async fn spawned_worker_streams_events() {
        let config = SimulationConfig {
            initial_souls: 0,
            ..SimulationConfig::default()
        };
        let (handle, mut events) = spawn_simulation(config, &TestProbe, Some(1)).unwrap();

        match events.recv().await {
            Some(SimulationEvent::QualityChanged { tier, .. }) => assert_eq!(tier, QualityTier::Medium),
            other => panic!("expected quality announcement, got {other:?}"),
        }

        handle
            .send(SimulationCommand::Init {
                souls: seeds(3),
                constants: None,
            })
            .unwrap();
        handle.send(SimulationCommand::step()).unwrap();

        let mut saw_created = false;
        loop {
            match events.recv().await {
                Some(SimulationEvent::SoulsCreated { souls }) => {
                    saw_created = true;
                    assert_eq!(souls.len(), 3);
                }
                Some(SimulationEvent::ConnectionsUpdated { .. }) => break,
                Some(_) => {}
                None => panic!("event stream closed early"),
            }
        }
        assert!(saw_created);
        assert_eq!(handle.status(), ChannelStatus::Running);
    }

    #[tokio::test]
    async fn far_added_soul_keeps_worker_running() {
        let config = SimulationConfig {
            initial_souls: 0,
            new_soul_spawn_rate: 0.0,
            ..SimulationConfig::default()
        };
        let (handle, mut events) = spawn_simulation(config, &TestProbe, Some(4)).unwrap();

        for position in [Vec3::new(1e10, 0.0, 0.0), Vec3::new(f32::MAX, f32::MAX, 0.0)] {
            handle
                .send(SimulationCommand::AddSoul {
                    soul: SoulSeed::at(position),
                })
                .unwrap();
        }
        handle
            .send(SimulationCommand::AddSoul {
                soul: SoulSeed::at(Vec3::new(2.0, 0.0, 0.0)),
            })
            .unwrap();
        for _ in 0..3 {
            handle.send(SimulationCommand::step()).unwrap();
        }

        let mut created = 0;
        let mut steps = 0;
        while steps < 3 {
            match events.recv().await {
                Some(SimulationEvent::SoulsCreated { souls }) => created += souls.len(),
                Some(SimulationEvent::ConnectionsUpdated { .. }) => steps += 1,
                Some(_) => {}
                None => panic!("event stream closed early"),
            }
        }
        assert_eq!(created, 1);
        assert_eq!(handle.status(), ChannelStatus::Running);
    }

    #[tokio::test]
    async fn terminate_reports_status() {
        let (handle, _events) = spawn_simulation(SimulationConfig::default(), &TestProbe, Some(2)).unwrap();
        let mut status = handle.status_receiver();
        handle.terminate();
        while *status.borrow_and_update() != ChannelStatus::Terminated {
            status.changed().await.unwrap();
        }
        assert!(handle.send(SimulationCommand::step()).is_err());
    }
}
