use ::rand as external_rand;
use clap::{Parser, Subcommand};
use external_rand::rngs::StdRng;
use external_rand::{Rng, SeedableRng};
use std::io::Write;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use soulflock::api::{run_server, ApiState};
use soulflock::channel::{encode_frame, SimulationCommand, SimulationEvent, SimulationWorker};
use soulflock::config::SimulationConfig;
use soulflock::soul::{random_unit, SoulSeed};
use soulflock::SystemProbe;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path (YAML or JSON). If not specified, searches for soulflock.yaml, soulflock.yml, or soulflock.json in current directory.
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the headless HTTP API with a background consumer loop
    Serve {
        #[arg(long, default_value_t = 8080)]
        port: u16,

        /// Seed for the simulation RNG
        #[arg(long)]
        seed: Option<u64>,

        /// File the population tunables are loaded from and saved to
        #[arg(long)]
        tunables: Option<PathBuf>,
    },
    /// Step the simulation in-process and print final statistics
    Run {
        #[arg(long, default_value_t = 1000)]
        steps: u64,

        #[arg(long)]
        seed: Option<u64>,

        /// Print every simulation event to stdout as JSON lines
        #[arg(long)]
        emit: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("soulflock=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = load_config(args.config.as_deref())?;

    match args.command {
        Command::Serve {
            port,
            seed,
            tunables,
        } => {
            let (api_state, events) = ApiState::start(config, tunables, seed)?;
            run_server(api_state, events, port).await
        }
        Command::Run { steps, seed, emit } => batch_run(config, steps, seed, emit),
    }
}

/// Load configuration from file or use default
fn load_config(config_path: Option<&str>) -> Result<SimulationConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        SimulationConfig::from_file(path)
            .map_err(|e| format!("Failed to load config from {}: {}", path, e).into())
    } else {
        Ok(SimulationConfig::from_default_paths())
    }
}

/// Drive a worker synchronously, optionally streaming its events.
fn batch_run(
    config: SimulationConfig,
    steps: u64,
    seed: Option<u64>,
    emit: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(1)),
        None => StdRng::from_entropy(),
    };
    let souls: Vec<SoulSeed> = (0..config.initial_souls)
        .map(|_| SoulSeed::at(random_unit(&mut rng) * (config.world_radius * rng.gen::<f32>().cbrt())))
        .collect();

    let probe = SystemProbe::from_config(&config);
    let mut worker = SimulationWorker::new(config, &probe, seed);
    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    let mut emit_all = |events: Vec<SimulationEvent>| -> Result<(), Box<dyn std::error::Error>> {
        if emit {
            for event in &events {
                out.write_all(encode_frame(event)?.as_bytes())?;
            }
        }
        Ok(())
    };

    emit_all(worker.greeting())?;
    emit_all(worker.handle(SimulationCommand::Init {
        souls,
        constants: None,
    }))?;
    for _ in 0..steps {
        emit_all(worker.handle(SimulationCommand::step()))?;
    }

    let stats = worker.simulation().stats();
    tracing::info!(
        population = stats.population,
        equilibrium = stats.equilibrium,
        frame = stats.frame,
        "run finished"
    );
    if !emit {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    }
    Ok(())
}
