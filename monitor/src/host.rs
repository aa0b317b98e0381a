use std::{
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{extract::State, routing::get, Json, Router};
use chrono::Utc;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde::Serialize;
use tokio::{
    net::TcpListener,
    sync::{mpsc, Mutex},
};
use tracing::{info, warn};

use sitemon_common::{
    ChunkRequest, DeviceIdentity, DeviceProfile, EnvironmentReading, FirmwareDescriptor,
    FirmwareWriter, FwState, MessageRouter, OtaAction, OtaEngine, OtaError, RouterEvent,
    RuntimeConfig, TOPIC_ATTRIBUTES, TOPIC_TELEMETRY,
};

const CURRENT_VERSION: &str = env!("CARGO_PKG_VERSION");

// The simulator stages into memory and only writes the finished image out,
// mirroring the ESP slot size.
const SIMULATED_SLOT_BYTES: u64 = 4 * 1024 * 1024;

#[derive(Clone)]
struct AppState {
    engine: Arc<Mutex<OtaEngine<ImageFileWriter>>>,
    mqtt: AsyncClient,
    router: MessageRouter,
    profile: DeviceProfile,
    ota_completed_epoch: Arc<Mutex<Option<i64>>>,
    led_on: Arc<AtomicBool>,
}

/// Host stand-in for the ESP flash slot: chunks accumulate in memory and a
/// finalized image lands on disk where a developer can inspect it.
struct ImageFileWriter {
    output_path: PathBuf,
    staged: Option<Vec<u8>>,
}

impl ImageFileWriter {
    fn new(output_path: PathBuf) -> Self {
        Self {
            output_path,
            staged: None,
        }
    }
}

impl FirmwareWriter for ImageFileWriter {
    fn free_space(&self) -> u64 {
        SIMULATED_SLOT_BYTES
    }

    fn begin(&mut self, total_size: u64) -> Result<(), OtaError> {
        if self.staged.is_none() {
            self.staged = Some(Vec::with_capacity(total_size as usize));
        }
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<(), OtaError> {
        let Some(staged) = self.staged.as_mut() else {
            return Err(OtaError::Write("no open image session".to_string()));
        };
        staged.extend_from_slice(data);
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), OtaError> {
        let Some(staged) = self.staged.take() else {
            return Err(OtaError::Finalize("no open image session".to_string()));
        };
        std::fs::write(&self.output_path, staged)
            .map_err(|err| OtaError::Finalize(err.to_string()))
    }

    fn abort(&mut self) {
        self.staged = None;
    }
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    profile: &'static str,
    #[serde(rename = "deviceName")]
    device_name: &'static str,
    #[serde(rename = "fwVersion")]
    fw_version: &'static str,
    #[serde(rename = "ledOn")]
    led_on: bool,
}

#[derive(Debug, Serialize)]
struct OtaStatusResponse {
    #[serde(rename = "fwState")]
    fw_state: &'static str,
    version: Option<String>,
    #[serde(rename = "bytesWritten")]
    bytes_written: u64,
    #[serde(rename = "totalBytes")]
    total_bytes: Option<u64>,
    #[serde(rename = "progressPct")]
    progress_pct: Option<u8>,
    #[serde(rename = "lastError")]
    last_error: Option<String>,
    #[serde(rename = "lastCompletedEpoch")]
    last_completed_epoch: Option<i64>,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut runtime = load_runtime_config();
    runtime.sanitize();

    if let Ok(device_id) = std::env::var("DEVICE_ID") {
        runtime.network.device_id = device_id;
    }
    let (profile, recognized) = DeviceProfile::from_device_id(&runtime.network.device_id);
    if !recognized {
        warn!(
            "unknown device id prefix `{}`; defaulting to {} profile",
            runtime.network.device_id,
            profile.as_str()
        );
    }
    info!(
        "simulator `{}` running as {} (`{}`), firmware v{CURRENT_VERSION}",
        runtime.network.device_id,
        profile.as_str(),
        profile.config().device_name
    );

    let mqtt_host = std::env::var("MQTT_HOST").unwrap_or(runtime.network.mqtt_host.clone());
    let mqtt_port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(runtime.network.mqtt_port);

    let mut mqtt_options =
        MqttOptions::new(runtime.network.device_id.clone(), mqtt_host, mqtt_port);
    mqtt_options.set_max_packet_size(64 * 1024, 64 * 1024);
    let access_token =
        std::env::var("DEVICE_TOKEN").unwrap_or(runtime.network.access_token.clone());
    if !access_token.is_empty() {
        mqtt_options.set_credentials(access_token, String::new());
    }

    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 64);

    let router = MessageRouter::new(runtime.ota.transport);
    let output_path = std::env::var("OTA_OUTPUT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("sitemon-update.bin"));
    let writer = ImageFileWriter::new(output_path);

    let app_state = AppState {
        engine: Arc::new(Mutex::new(OtaEngine::new(runtime.ota.clone(), writer))),
        mqtt,
        router,
        profile,
        ota_completed_epoch: Arc::new(Mutex::new(None)),
        led_on: Arc::new(AtomicBool::new(false)),
    };

    let (event_tx, event_rx) = mpsc::channel::<RouterEvent>(64);
    spawn_mqtt_loop(app_state.clone(), eventloop, event_tx);
    spawn_ota_loop(app_state.clone(), event_rx, runtime.ota.tick_interval_ms);
    spawn_telemetry_loop(app_state.clone());

    let app = Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/api/ota/status", get(handle_get_ota_status))
        .with_state(app_state);

    let port = std::env::var("MONITOR_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr: SocketAddr = format!("0.0.0.0:{port}")
        .parse()
        .context("invalid listen address")?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("status API listening on http://{addr}");

    axum::serve(listener, app)
        .await
        .context("status API server failed")?;
    Ok(())
}

fn load_runtime_config() -> RuntimeConfig {
    let path = std::env::var("SITEMON_CONFIG").unwrap_or_else(|_| "sitemon-runtime.json".into());
    match std::fs::read(&path) {
        Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|err| {
            warn!("invalid runtime config in `{path}`: {err}; using defaults");
            RuntimeConfig::default()
        }),
        Err(_) => RuntimeConfig::default(),
    }
}

fn spawn_mqtt_loop(
    app_state: AppState,
    mut eventloop: rumqttc::EventLoop,
    event_tx: mpsc::Sender<RouterEvent>,
) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    match app_state.router.route(&message.topic, &message.payload) {
                        Some(RouterEvent::LedState(on)) => {
                            app_state.led_on.store(on, Ordering::Relaxed);
                            info!("indicator led {}", if on { "on" } else { "off" });
                        }
                        Some(event) => {
                            if event_tx.send(event).await.is_err() {
                                warn!("ota event channel closed; stopping mqtt loop");
                                return;
                            }
                        }
                        None if app_state
                            .router
                            .expects_firmware_payload(&message.topic) =>
                        {
                            warn!(
                                "dropping malformed firmware payload on {}",
                                message.topic
                            );
                        }
                        None => {}
                    }
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                    on_mqtt_connected(&app_state).await;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}

/// Subscriptions, identity attributes, and the firmware-attribute request
/// are re-issued on every (re)connect.
async fn on_mqtt_connected(app_state: &AppState) {
    for topic in app_state.router.subscriptions() {
        if let Err(err) = app_state.mqtt.subscribe(topic, QoS::AtLeastOnce).await {
            warn!("failed to subscribe {topic}: {err}");
        }
    }

    let identity = DeviceIdentity {
        mac_address: "02:00:00:00:00:01".to_string(),
        device_type: app_state.profile.as_str(),
        device_name: app_state.profile.config().device_name,
        fw_version: CURRENT_VERSION,
    };
    if let Ok(payload) = serde_json::to_vec(&identity) {
        if let Err(err) = app_state
            .mqtt
            .publish(TOPIC_ATTRIBUTES, QoS::AtLeastOnce, false, payload)
            .await
        {
            warn!("failed to publish device identity: {err}");
        }
    }

    let (topic, payload) = app_state.router.attribute_request();
    if let Err(err) = app_state
        .mqtt
        .publish(topic, QoS::AtLeastOnce, false, payload)
        .await
    {
        warn!("failed to request firmware attributes: {err}");
    }
}

fn spawn_ota_loop(
    app_state: AppState,
    mut event_rx: mpsc::Receiver<RouterEvent>,
    tick_interval_ms: u64,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(tick_interval_ms));

        loop {
            let actions_and_target = tokio::select! {
                event = event_rx.recv() => {
                    let Some(event) = event else {
                        warn!("ota event channel disconnected; stopping ota loop");
                        return;
                    };
                    let mut engine = app_state.engine.lock().await;
                    let actions = apply_router_event(&mut engine, &app_state.router, event);
                    let target = request_target(&engine);
                    (actions, target)
                }
                _ = interval.tick() => {
                    let mut engine = app_state.engine.lock().await;
                    let actions = engine.tick(monotonic_ms());
                    let target = request_target(&engine);
                    (actions, target)
                }
            };

            let (actions, target) = actions_and_target;
            execute_ota_actions(&app_state, actions, &target).await;
        }
    });
}

fn apply_router_event(
    engine: &mut OtaEngine<ImageFileWriter>,
    router: &MessageRouter,
    event: RouterEvent,
) -> Vec<OtaAction> {
    match event {
        RouterEvent::FirmwareAnnounced(attrs) => {
            let Some(descriptor) = FirmwareDescriptor::from_attributes(attrs, router.transport())
            else {
                warn!("ignoring unusable firmware announcement");
                return Vec::new();
            };

            if descriptor.version == CURRENT_VERSION {
                info!(
                    "announced firmware v{} is already running; ignoring",
                    descriptor.version
                );
                return Vec::new();
            }

            info!(
                "firmware announced: `{}` v{} ({} bytes, {}-byte chunks)",
                descriptor.title, descriptor.version, descriptor.size, descriptor.chunk_size
            );
            engine.announce(descriptor)
        }
        RouterEvent::ChunkDelivered(chunk) => {
            let actions = engine.chunk_received(chunk.index, &chunk.data);
            let progress = engine.progress();
            info!(
                "chunk {} received ({} bytes); offset {}/{}",
                progress.chunks_received,
                chunk.data.len(),
                progress.offset,
                engine.descriptor().map(|d| d.size).unwrap_or_default()
            );
            actions
        }
        // Handled in the mqtt loop before events reach this loop.
        RouterEvent::LedState(_) => Vec::new(),
    }
}

fn request_target(engine: &OtaEngine<ImageFileWriter>) -> Option<(String, String)> {
    engine
        .descriptor()
        .map(|d| (d.title.clone(), d.version.clone()))
}

async fn execute_ota_actions(
    app_state: &AppState,
    actions: Vec<OtaAction>,
    target: &Option<(String, String)>,
) {
    for action in actions {
        match action {
            OtaAction::PublishState(payload) => {
                let Ok(body) = serde_json::to_vec(&payload) else {
                    continue;
                };
                if let Err(err) = app_state
                    .mqtt
                    .publish(TOPIC_ATTRIBUTES, QoS::AtLeastOnce, false, body)
                    .await
                {
                    warn!("failed to publish fw_state {}: {err}", payload.fw_state);
                }
            }
            OtaAction::RequestChunk {
                request_id,
                index,
                offset,
                chunk_size,
            } => {
                let Some((title, version)) = target.as_ref() else {
                    continue;
                };
                let (topic, payload) = app_state.router.chunk_request(&ChunkRequest {
                    title,
                    version,
                    request_id,
                    index,
                    offset,
                    chunk_size,
                });
                info!("requesting chunk {index} at offset {offset}");
                if let Err(err) = app_state
                    .mqtt
                    .publish(topic, QoS::AtLeastOnce, false, payload)
                    .await
                {
                    warn!("failed to publish chunk request: {err}");
                }
            }
            OtaAction::ScheduleRestart { delay_ms } => {
                {
                    let mut epoch = app_state.ota_completed_epoch.lock().await;
                    *epoch = Some(Utc::now().timestamp());
                }
                info!("firmware image staged; simulator would restart in {delay_ms} ms");
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                info!("restart point reached; simulator keeps running for inspection");
            }
        }
    }
}

fn spawn_telemetry_loop(app_state: AppState) {
    tokio::spawn(async move {
        let profile_config = app_state.profile.config();
        let mut interval =
            tokio::time::interval(Duration::from_millis(profile_config.env_sensor_interval_ms));
        let mut tick: u64 = 0;

        loop {
            interval.tick().await;
            tick = tick.saturating_add(1);

            // Hardware integration point: the ESP target reads a DHT11,
            // PIR, and HC-SR04 here.
            let reading = EnvironmentReading {
                temperature: 24.0 + ((tick % 8) as f32 * 0.2),
                humidity: 55.0 + ((tick % 6) as f32 * 0.5),
                air_quality: profile_config
                    .enable_air_quality
                    .then_some(40 + ((tick % 10) as i32 * 3)),
                people_count: (app_state.profile == DeviceProfile::Building)
                    .then_some((tick % 23) as u32),
                motion_detected: (app_state.profile == DeviceProfile::Carpark)
                    .then_some(tick % 4 == 0),
            };

            let Ok(payload) = serde_json::to_vec(&reading) else {
                continue;
            };
            if let Err(err) = app_state
                .mqtt
                .publish(TOPIC_TELEMETRY, QoS::AtLeastOnce, false, payload)
                .await
            {
                warn!("failed to publish telemetry: {err}");
            }

            let status = app_state.engine.lock().await.status();
            if !matches!(status.state, FwState::Idle | FwState::Updated) {
                info!(
                    "ota status: {} {}/{} bytes",
                    status.state.as_str(),
                    status.bytes_written,
                    status.total_bytes.unwrap_or_default()
                );
            }
        }
    });
}

async fn handle_get_status(State(app_state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        profile: app_state.profile.as_str(),
        device_name: app_state.profile.config().device_name,
        fw_version: CURRENT_VERSION,
        led_on: app_state.led_on.load(Ordering::Relaxed),
    })
}

async fn handle_get_ota_status(State(app_state): State<AppState>) -> Json<OtaStatusResponse> {
    let snapshot = app_state.engine.lock().await.status();
    let last_completed_epoch = *app_state.ota_completed_epoch.lock().await;

    Json(OtaStatusResponse {
        fw_state: snapshot.state.as_str(),
        version: snapshot.version,
        bytes_written: snapshot.bytes_written,
        total_bytes: snapshot.total_bytes,
        progress_pct: snapshot.progress_pct,
        last_error: snapshot.last_error,
        last_completed_epoch,
    })
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
