// Flocking "soul" particle simulation with level-of-detail scaling,
// adaptive quality, and a message channel to an asynchronous consumer.

pub mod adaptive;
pub mod api;
pub mod camera;
pub mod channel;
pub mod config;
pub mod connections;
pub mod consumer;
pub mod error;
pub mod lod;
pub mod physics;
pub mod quality;
pub mod simulation;
pub mod soul;
pub mod spatial;
pub mod types;

pub use adaptive::{AdaptiveController, CapabilityProbe, HardwareCapabilities, SystemProbe, TelemetrySample};
pub use channel::{spawn_simulation, SimulationCommand, SimulationEvent, SimulationHandle, SimulationWorker};
pub use config::{PopulationTunables, SimulationConfig};
pub use error::{ChannelStatus, SimError, SimResult};
pub use lod::{LodHint, LodTier};
pub use quality::{QualityProfile, QualityTier};
pub use simulation::{Simulation, StepInput};
pub use soul::{Soul, SoulId, SoulKind, SoulSeed};
pub use types::Vec3;
