// API module for headless mode - HTTP endpoints over the consumer-side view

use ::rand as external_rand;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{delete, get, post},
    Router,
};
use external_rand::Rng;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;

use crate::adaptive::SystemProbe;
use crate::camera::Viewpoint;
use crate::channel::{spawn_simulation, SimulationCommand, SimulationEvent, SimulationHandle};
use crate::config::{PopulationTunables, SimulationConfig};
use crate::connections::Connection;
use crate::consumer::{FrameTimer, RenderedSoul, SoulView};
use crate::error::{ChannelStatus, SimResult};
use crate::quality::{QualityProfile, QualityTier};
use crate::soul::{random_unit, SoulId, SoulSeed};

#[derive(Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct StateResponse {
    pub souls: Vec<RenderedSoul>,
    pub connections: Vec<Connection>,
    pub tier: QualityTier,
    pub status: ChannelStatus,
}

#[derive(Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub population: usize,
    pub visible: usize,
    pub connections: usize,
    pub frames: u64,
    pub tier: QualityTier,
    pub equilibrium: f32,
    pub status: ChannelStatus,
}

// How long the consumer waits for an update to come back before moving on
const FRAME_TIMEOUT: Duration = Duration::from_millis(500);

// Shared state for the API server
#[derive(Clone)]
pub struct ApiState {
    pub view: Arc<Mutex<SoulView>>,
    /// Count of simulation steps fully applied to `view`.
    pub frames_applied: Arc<watch::Sender<u64>>,
    pub handle: Arc<SimulationHandle>,
    pub viewpoint: Arc<Mutex<Viewpoint>>,
    pub tunables: Arc<Mutex<PopulationTunables>>,
    pub tunables_path: Option<PathBuf>,
    pub config: Arc<SimulationConfig>,
}

impl ApiState {
    /// Start the simulation worker and seed it with the configured initial
    /// population. The returned receiver must be drained with [`pump_events`].
    pub fn start(
        config: SimulationConfig,
        tunables_path: Option<PathBuf>,
        seed: Option<u64>,
    ) -> SimResult<(Self, UnboundedReceiver<SimulationEvent>)> {
        let tunables = match &tunables_path {
            Some(path) if path.exists() => PopulationTunables::load(path, config.tunables())?,
            _ => config.tunables(),
        };

        let probe = SystemProbe::from_config(&config);
        let (handle, events) = spawn_simulation(config.clone(), &probe, seed)?;

        let mut rng = external_rand::thread_rng();
        let souls = (0..config.initial_souls)
            .map(|_| SoulSeed::at(random_unit(&mut rng) * (config.world_radius * rng.gen::<f32>().cbrt())))
            .collect();
        handle.send(SimulationCommand::Init {
            souls,
            constants: Some(tunables),
        })?;

        let state = Self {
            view: Arc::new(Mutex::new(SoulView::new())),
            frames_applied: Arc::new(watch::channel(0).0),
            handle: Arc::new(handle),
            viewpoint: Arc::new(Mutex::new(Viewpoint::new(config.world_radius))),
            tunables: Arc::new(Mutex::new(tunables)),
            tunables_path,
            config: Arc::new(config),
        };
        Ok((state, events))
    }

    fn send(&self, command: SimulationCommand) -> Result<(), StatusCode> {
        self.handle.send(command).map_err(|e| {
            tracing::warn!(error = %e, "simulation channel unavailable");
            StatusCode::SERVICE_UNAVAILABLE
        })
    }
}

// GET /state - Get the consumer-side mirror of the simulation
async fn get_state(State(api_state): State<ApiState>) -> Result<Json<StateResponse>, StatusCode> {
    let view = api_state
        .view
        .lock()
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(StateResponse {
        souls: view.souls.values().copied().collect(),
        connections: view.connections.clone(),
        tier: view.profile.tier,
        status: view.status.clone(),
    }))
}

// GET /stats - Get simulation statistics
async fn get_stats(State(api_state): State<ApiState>) -> Result<Json<StatsResponse>, StatusCode> {
    let tunables = *api_state
        .tunables
        .lock()
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    let view = api_state
        .view
        .lock()
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(StatsResponse {
        population: view.len(),
        visible: view.souls.values().filter(|s| s.visible).count(),
        connections: view.connections.len(),
        frames: view.frames,
        tier: view.profile.tier,
        equilibrium: tunables.equilibrium_population(),
        status: view.status.clone(),
    }))
}

// GET /quality - Current quality profile
async fn get_quality(State(api_state): State<ApiState>) -> Result<Json<QualityProfile>, StatusCode> {
    let view = api_state
        .view
        .lock()
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(view.profile))
}

// GET /config - Get simulation configuration
async fn get_config(State(api_state): State<ApiState>) -> Json<SimulationConfig> {
    Json((*api_state.config).clone())
}

// GET /tunables - Population tunables currently in effect
async fn get_tunables(
    State(api_state): State<ApiState>,
) -> Result<Json<PopulationTunables>, StatusCode> {
    let tunables = api_state
        .tunables
        .lock()
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(*tunables))
}

// PUT /tunables - Replace tunables, persist them, forward to the simulation
async fn put_tunables(
    State(api_state): State<ApiState>,
    Json(tunables): Json<PopulationTunables>,
) -> Result<Json<PopulationTunables>, (StatusCode, String)> {
    tunables
        .validate()
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    api_state
        .send(SimulationCommand::SetTunables { tunables })
        .map_err(|code| (code, "simulation unavailable".to_string()))?;

    if let Some(path) = &api_state.tunables_path {
        if let Err(e) = tunables.save(path) {
            tracing::warn!(error = %e, path = %path.display(), "failed to persist tunables");
        }
    }
    let mut current = api_state
        .tunables
        .lock()
        .map_err(|_| (StatusCode::INTERNAL_SERVER_ERROR, "state poisoned".to_string()))?;
    *current = tunables;
    Ok(Json(tunables))
}

// POST /souls - Request a new soul outside the spawn cadence
async fn add_soul(
    State(api_state): State<ApiState>,
    Json(seed): Json<SoulSeed>,
) -> Result<StatusCode, StatusCode> {
    if let Err(e) = seed.validate(api_state.config.max_seed_distance()) {
        tracing::debug!(error = %e, "rejecting soul");
        return Err(StatusCode::BAD_REQUEST);
    }
    api_state.send(SimulationCommand::AddSoul { soul: seed })?;
    Ok(StatusCode::ACCEPTED)
}

// DELETE /souls/:id - Request removal; unknown ids are ignored by the simulation
async fn remove_soul(
    State(api_state): State<ApiState>,
    Path(id): Path<SoulId>,
) -> Result<StatusCode, StatusCode> {
    api_state.send(SimulationCommand::RemoveSoul { id })?;
    Ok(StatusCode::ACCEPTED)
}

// Create the API router
pub fn create_router(api_state: ApiState) -> Router {
    Router::new()
        .route("/state", get(get_state))
        .route("/stats", get(get_stats))
        .route("/quality", get(get_quality))
        .route("/config", get(get_config))
        .route("/tunables", get(get_tunables).put(put_tunables))
        .route("/souls", post(add_soul))
        .route("/souls/:id", delete(remove_soul))
        .layer(CorsLayer::permissive())
        .with_state(api_state)
}

/// Apply simulation events to the shared view until the worker stops.
pub async fn pump_events(api_state: ApiState, mut events: UnboundedReceiver<SimulationEvent>) {
    while let Some(event) = events.recv().await {
        let mut view = match api_state.view.lock() {
            Ok(view) => view,
            Err(_) => break,
        };
        view.apply(&event);
        view.status = api_state.handle.status();
        // connectionsUpdated closes every step
        if matches!(event, SimulationEvent::ConnectionsUpdated { .. }) {
            api_state.frames_applied.send_replace(view.frames);
        }
    }

    // Keep the last mirror, just record why it stopped updating
    let status = match api_state.handle.status() {
        ChannelStatus::Running | ChannelStatus::Starting => ChannelStatus::Terminated,
        other => other,
    };
    tracing::warn!(?status, "simulation event stream ended");
    if let Ok(mut view) = api_state.view.lock() {
        view.status = status;
    }
}

// Run the API server with the consumer loop driving the simulation
pub async fn run_server(
    api_state: ApiState,
    events: UnboundedReceiver<SimulationEvent>,
    port: u16,
) -> Result<(), Box<dyn std::error::Error>> {
    let app = create_router(api_state.clone());
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    tracing::info!(port, "soulflock headless API server listening");
    tracing::info!("endpoints: GET /state /stats /quality /config, GET|PUT /tunables, POST /souls, DELETE /souls/:id");

    let pump_task = tokio::spawn(pump_events(api_state.clone(), events));
    let consumer_task = tokio::spawn(consumer_loop(api_state.clone()));
    let server_handle = tokio::spawn(async move { axum::serve(listener, app).await });

    // Wait for either task to complete
    tokio::select! {
        result = server_handle => {
            result??;
        }
        _ = consumer_task => {
            tracing::error!("consumer loop ended, simulation is no longer driven");
        }
    }

    api_state.handle.terminate();
    pump_task.abort();
    Ok(())
}

/// Background frame loop: orbit the viewpoint, send `update` with fresh LOD
/// hints, wait for the step to land in the view, and report the time that
/// took as telemetry. At most one update is in flight.
pub async fn consumer_loop(api_state: ApiState) {
    let target_fps = api_state.config.target_fps.max(1.0);
    let frame_duration = Duration::from_secs_f32(1.0 / target_fps);
    let mut timer = FrameTimer::new(api_state.config.evaluation_interval_ms);
    let mut applied = api_state.frames_applied.subscribe();
    let mut sent = *applied.borrow();
    let started = Instant::now();
    let mut last = Instant::now();

    loop {
        let frame_start = Instant::now();
        let dt = frame_start.duration_since(last).as_secs_f32();
        last = frame_start;

        let viewpoint = match api_state.viewpoint.lock() {
            Ok(mut view) => {
                view.advance(dt);
                view.position()
            }
            Err(_) => break,
        };
        let lod_hints = match api_state.view.lock() {
            Ok(view) if view.is_static() => {
                tracing::warn!(status = ?view.status, "simulation failed, holding last frame");
                break;
            }
            Ok(view) => view.lod_hints(viewpoint),
            Err(_) => break,
        };

        let update = SimulationCommand::Update {
            pointer_position: None,
            viewpoint: Some(viewpoint),
            lod_hints,
            delta_time: Some(dt.min(0.1)),
        };
        if api_state.handle.send(update).is_err() {
            break;
        }
        sent += 1;

        let landed = tokio::time::timeout(FRAME_TIMEOUT, applied.wait_for(|&n| n >= sent))
            .await
            .map(|result| result.is_ok());
        match landed {
            Ok(true) => {}
            Ok(false) => break,
            Err(_) => {
                if api_state.handle.status().is_degraded() {
                    tracing::warn!("simulation stopped answering updates");
                    break;
                }
                tracing::debug!(frame = sent, "update not applied in time, skipping telemetry");
                continue;
            }
        }

        let frame_ms = frame_start.elapsed().as_secs_f32() * 1000.0;
        let now_ms = started.elapsed().as_millis() as u64;
        if let Some(sample) = timer.record(frame_ms, now_ms) {
            if api_state.handle.send(SimulationCommand::Telemetry { sample }).is_err() {
                break;
            }
        }

        // Sleep to maintain target FPS
        let elapsed = frame_start.elapsed();
        if elapsed < frame_duration {
            tokio::time::sleep(frame_duration - elapsed).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_state(initial_souls: usize) -> (ApiState, UnboundedReceiver<SimulationEvent>) {
        let config = SimulationConfig {
            initial_souls,
            gpu_tier: Some(1),
            ..SimulationConfig::default()
        };
        ApiState::start(config, None, Some(3)).unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn wait_for<F: Fn(&SoulView) -> bool>(state: &ApiState, check: F) {
        for _ in 0..200 {
            if check(&state.view.lock().unwrap()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("view never reached the expected state");
    }

    #[tokio::test]
    async fn state_reflects_initial_population() {
        let (state, events) = test_state(25);
        tokio::spawn(pump_events(state.clone(), events));
        wait_for(&state, |view| view.len() == 25).await;

        let app = create_router(state);
        let response = app
            .oneshot(Request::builder().uri("/state").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["souls"].as_array().unwrap().len(), 25);
        assert_eq!(json["status"]["state"], "running");
    }

    #[tokio::test]
    async fn add_and_remove_souls() {
        let (state, events) = test_state(0);
        tokio::spawn(pump_events(state.clone(), events));
        let app = create_router(state.clone());

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/souls")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"position":{"x":1.0,"y":2.0,"z":3.0}}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        wait_for(&state, |view| view.len() == 1).await;

        let id = *state.view.lock().unwrap().souls.keys().next().unwrap();
        for _ in 0..2 {
            let response = app
                .clone()
                .oneshot(
                    Request::builder()
                        .method("DELETE")
                        .uri(format!("/souls/{}", id))
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::ACCEPTED);
        }
        wait_for(&state, |view| view.is_empty()).await;
    }

    #[tokio::test]
    async fn distant_soul_is_rejected() {
        let (state, _events) = test_state(0);
        let response = create_router(state)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/souls")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"position":{"x":1e10,"y":0.0,"z":0.0}}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn consumer_waits_for_each_frame_to_land() {
        let (state, mut events) = test_state(10);
        let consumer = tokio::spawn(consumer_loop(state.clone()));
        tokio::time::sleep(Duration::from_millis(200)).await;
        consumer.abort();

        // Nothing is pumping, so the first update is never acknowledged
        let mut steps = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, SimulationEvent::SoulsUpdated { .. }) {
                steps += 1;
            }
        }
        assert_eq!(steps, 1);
    }

    #[tokio::test]
    async fn consumer_advances_as_frames_land() {
        let (state, events) = test_state(10);
        tokio::spawn(pump_events(state.clone(), events));
        let consumer = tokio::spawn(consumer_loop(state.clone()));
        wait_for(&state, |view| view.frames >= 3).await;
        consumer.abort();
        assert!(*state.frames_applied.borrow() >= 3);
    }

    #[tokio::test]
    async fn invalid_tunables_are_rejected() {
        let (state, _events) = test_state(0);
        let app = create_router(state.clone());
        let response = app
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/tunables")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"NEW_SOUL_SPAWN_RATE":0.5,"MIN_LIFESPAN":900,"MAX_LIFESPAN":300}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(*state.tunables.lock().unwrap(), state.config.tunables());
    }

    #[tokio::test]
    async fn tunables_are_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tunables.json");
        let config = SimulationConfig {
            initial_souls: 0,
            ..SimulationConfig::default()
        };
        let (state, _events) = ApiState::start(config, Some(path.clone()), Some(1)).unwrap();
        let app = create_router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/tunables")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"NEW_SOUL_SPAWN_RATE":0.4,"MIN_LIFESPAN":400,"MAX_LIFESPAN":800}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let saved = PopulationTunables::load(&path, PopulationTunables::default()).unwrap();
        assert_eq!(saved.min_lifespan, 400);
        assert_eq!(saved.equilibrium_population(), 240.0);
    }

    #[tokio::test]
    async fn stats_report_equilibrium() {
        let (state, _events) = test_state(0);
        let response = create_router(state)
            .oneshot(Request::builder().uri("/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["equilibrium"], 420.0);
    }

    #[tokio::test]
    async fn terminated_worker_returns_unavailable() {
        let (state, _events) = test_state(0);
        let mut status = state.handle.status_receiver();
        state.handle.terminate();
        while *status.borrow_and_update() != ChannelStatus::Terminated {
            status.changed().await.unwrap();
        }

        let response = create_router(state)
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/souls/1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
