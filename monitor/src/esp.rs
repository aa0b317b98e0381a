use core::ffi::c_void;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, RecvTimeoutError},
        Arc, Mutex, OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use chrono::Utc;
use dht_sensor::dht11;
use embedded_svc::{
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    delay::Ets,
    gpio::{
        AnyIOPin, AnyInputPin, AnyOutputPin, IOPin, Input, InputOutput, InputPin, Output,
        OutputPin, PinDriver, Pull,
    },
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    ota::EspOta,
    sys::{
        esp_ota_abort, esp_ota_begin, esp_ota_end, esp_ota_get_next_update_partition,
        esp_ota_handle_t, esp_ota_set_boot_partition, esp_ota_write, esp_partition_t,
    },
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};

use sitemon_common::{
    config::NetworkConfig, ChunkRequest, DeviceIdentity, DeviceProfile, EnvironmentReading,
    FirmwareDescriptor, FirmwareWriter, FwState, MessageRouter, OccupancyReading, OtaAction,
    OtaEngine, OtaError, ProfileConfig, RouterEvent, RuntimeConfig, TOPIC_ATTRIBUTES,
    TOPIC_TELEMETRY,
};

const NVS_NAMESPACE: &str = "sitemon";
const NVS_RUNTIME_KEY: &str = "runtime_json";

const CURRENT_VERSION: &str = env!("CARGO_PKG_VERSION");

// Chunk responses are the largest inbound payloads: a 4 KiB chunk grows to
// ~5.5 KiB once base64-wrapped in JSON, and the binary variant may carry a
// full 8 KiB chunk.
const MQTT_BUFFER_SIZE: usize = 16 * 1024;
const MAX_MQTT_PAYLOAD_BYTES: usize = 16 * 1024;

const WATCHDOG_TIMEOUT_SEC: u32 = 30;
const WIFI_RESTART_GRACE_MS: u64 = 300_000;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;

const DHT11_PIN: i32 = 16;
const PIR_PIN: i32 = 5;
const SONIC_TRIGGER_PIN: i32 = 6;
const SONIC_ECHO_PIN: i32 = 7;
const LED_PIN: i32 = 4;

const SONIC_DETECTION_THRESHOLD_CM: f32 = 10.0;
const PARKING_SPOT_NAME: &str = "spot_A1";

#[derive(Clone)]
struct SharedState {
    engine: Arc<Mutex<OtaEngine<EspFirmwareWriter>>>,
    mqtt_connected: Arc<AtomicBool>,
}

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

impl NvsStore {
    fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self.lock.lock().unwrap();
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 4096];

        match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
            Some(value) => Ok(serde_json::from_str::<RuntimeConfig>(value)?),
            None => Ok(RuntimeConfig::default()),
        }
    }
}

/// Flash session over the raw OTA partition API. The inactive slot is
/// resolved once at startup; a handle exists only while a session is open.
struct EspFirmwareWriter {
    partition: *const esp_partition_t,
    handle: Option<esp_ota_handle_t>,
}

// The partition pointer refers to the static partition table.
unsafe impl Send for EspFirmwareWriter {}

impl EspFirmwareWriter {
    fn new() -> anyhow::Result<Self> {
        let partition = unsafe { esp_ota_get_next_update_partition(core::ptr::null()) };
        if partition.is_null() {
            return Err(anyhow!("no inactive OTA partition available"));
        }
        Ok(Self {
            partition,
            handle: None,
        })
    }
}

impl FirmwareWriter for EspFirmwareWriter {
    fn free_space(&self) -> u64 {
        unsafe { u64::from((*self.partition).size) }
    }

    fn begin(&mut self, total_size: u64) -> Result<(), OtaError> {
        if self.handle.is_some() {
            return Ok(());
        }

        let mut handle: esp_ota_handle_t = unsafe { core::mem::zeroed() };
        let rc = unsafe { esp_ota_begin(self.partition, total_size as usize, &mut handle) };
        if rc != 0 {
            return Err(OtaError::Begin(format!("esp_ota_begin: esp_err_t={rc}")));
        }
        self.handle = Some(handle);
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<(), OtaError> {
        let Some(handle) = self.handle else {
            return Err(OtaError::Write("no open flash session".to_string()));
        };
        let rc = unsafe { esp_ota_write(handle, data.as_ptr() as *const c_void, data.len()) };
        if rc != 0 {
            return Err(OtaError::Write(format!("esp_ota_write: esp_err_t={rc}")));
        }
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), OtaError> {
        let Some(handle) = self.handle.take() else {
            return Err(OtaError::Finalize("no open flash session".to_string()));
        };

        let rc = unsafe { esp_ota_end(handle) };
        if rc != 0 {
            return Err(OtaError::Finalize(format!("esp_ota_end: esp_err_t={rc}")));
        }

        let rc = unsafe { esp_ota_set_boot_partition(self.partition) };
        if rc != 0 {
            return Err(OtaError::Finalize(format!(
                "esp_ota_set_boot_partition: esp_err_t={rc}"
            )));
        }
        Ok(())
    }

    fn abort(&mut self) {
        if let Some(handle) = self.handle.take() {
            let rc = unsafe { esp_ota_abort(handle) };
            if rc != 0 {
                warn!("esp_ota_abort failed: esp_err_t={rc}");
            }
        }
    }
}

enum WifiStartup {
    Connected(EspWifi<'static>),
    Failed,
}

struct SensorSuite {
    dht_pin: PinDriver<'static, AnyIOPin, InputOutput>,
    pir_pin: PinDriver<'static, AnyInputPin, Input>,
    sonic: Option<SonicPins>,
    delay: Ets,
    pir_was_high: bool,
}

struct SonicPins {
    trigger: PinDriver<'static, AnyOutputPin, Output>,
    echo: PinDriver<'static, AnyInputPin, Input>,
}

struct EnvironmentSample {
    temperature: Option<f32>,
    humidity: Option<f32>,
}

impl SensorSuite {
    fn new(
        dht_pin: AnyIOPin,
        pir_pin: AnyInputPin,
        sonic_pins: Option<(AnyOutputPin, AnyInputPin)>,
    ) -> anyhow::Result<Self> {
        let mut dht_pin = PinDriver::input_output_od(dht_pin)?;
        dht_pin.set_pull(Pull::Up)?;
        dht_pin.set_high()?;

        let mut pir_pin = PinDriver::input(pir_pin)?;
        pir_pin.set_pull(Pull::Down)?;

        let sonic = match sonic_pins {
            Some((trigger, echo)) => {
                let mut trigger = PinDriver::output(trigger)?;
                trigger.set_low()?;
                let echo = PinDriver::input(echo)?;
                Some(SonicPins { trigger, echo })
            }
            None => None,
        };

        Ok(Self {
            dht_pin,
            pir_pin,
            sonic,
            delay: Ets,
            pir_was_high: false,
        })
    }

    fn read_environment(&mut self) -> EnvironmentSample {
        if let Err(err) = self.dht_pin.set_high() {
            warn!("failed to set DHT11 line high before read: {err:?}");
            return EnvironmentSample {
                temperature: None,
                humidity: None,
            };
        }

        match dht11::blocking::read(&mut self.delay, &mut self.dht_pin) {
            Ok(reading) => EnvironmentSample {
                temperature: Some(f32::from(reading.temperature)),
                humidity: Some(f32::from(reading.relative_humidity)),
            },
            Err(err) => {
                warn!("failed to read DHT11 on GPIO{DHT11_PIN}: {err:?}");
                EnvironmentSample {
                    temperature: None,
                    humidity: None,
                }
            }
        }
    }

    /// Returns (motion currently detected, rising edge since last poll).
    fn poll_motion(&mut self) -> (bool, bool) {
        let high = self.pir_pin.is_high();
        let rising = high && !self.pir_was_high;
        self.pir_was_high = high;
        (high, rising)
    }

    fn measure_distance_cm(&mut self) -> Option<f32> {
        let sonic = self.sonic.as_mut()?;

        sonic.trigger.set_low().ok()?;
        Ets::delay_us(2);
        sonic.trigger.set_high().ok()?;
        Ets::delay_us(10);
        sonic.trigger.set_low().ok()?;

        // Wait for the echo pulse; 30 ms bounds the sensor's ~4 m range.
        let wait_start = Instant::now();
        while sonic.echo.is_low() {
            if wait_start.elapsed() > Duration::from_millis(30) {
                return None;
            }
        }
        let pulse_start = Instant::now();
        while sonic.echo.is_high() {
            if pulse_start.elapsed() > Duration::from_millis(30) {
                return None;
            }
        }

        let pulse_us = pulse_start.elapsed().as_micros() as f32;
        Some(pulse_us / 58.0)
    }
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };

    let mut runtime = nvs_store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    runtime.sanitize();
    ensure_wifi_defaults(&mut runtime);

    let (profile, recognized) = DeviceProfile::from_device_id(&runtime.network.device_id);
    if !recognized {
        warn!(
            "unknown device id prefix `{}`; defaulting to {} profile",
            runtime.network.device_id,
            profile.as_str()
        );
    }
    let profile_config = profile.config();
    info!(
        "device `{}` running as {} (`{}`), firmware v{CURRENT_VERSION}",
        runtime.network.device_id,
        profile.as_str(),
        profile_config.device_name
    );

    let Peripherals { modem, pins, .. } = Peripherals::take()?;

    let sonic_pins = if profile_config.has_ultrasonic {
        Some((pins.gpio6.downgrade_output(), pins.gpio7.downgrade_input()))
    } else {
        None
    };
    let sensors = SensorSuite::new(
        pins.gpio16.downgrade(),
        pins.gpio5.downgrade_input(),
        sonic_pins,
    )
    .context("failed to initialize sensor suite")?;
    let mut led_pin = PinDriver::output(pins.gpio4.downgrade_output())
        .context("failed to initialize indicator LED")?;
    led_pin.set_low().context("failed to initialize indicator LED")?;
    info!(
        "sensor suite ready: DHT11 on GPIO{DHT11_PIN}, PIR on GPIO{PIR_PIN}, LED on GPIO{LED_PIN}, ultrasonic {}",
        if profile_config.has_ultrasonic {
            format!("on GPIO{SONIC_TRIGGER_PIN}/GPIO{SONIC_ECHO_PIN}")
        } else {
            "not fitted".to_string()
        }
    );

    let wifi = match connect_wifi(modem, sys_loop.clone(), nvs_partition, &runtime.network)
        .context("wifi startup failed")?
    {
        WifiStartup::Connected(wifi) => {
            info!("wifi connected");
            wifi
        }
        WifiStartup::Failed => {
            warn!("wifi unavailable after {WIFI_CONNECT_ATTEMPTS} attempts; restarting");
            thread::sleep(Duration::from_millis(100));
            unsafe { esp_idf_svc::sys::esp_restart() };
            return Ok(());
        }
    };
    disable_wifi_power_save();

    // Confirm the running image so the bootloader stops counting it as a
    // pending rollback candidate.
    if let Ok(mut ota) = EspOta::new() {
        if let Err(err) = ota.mark_running_slot_valid() {
            warn!("failed to mark running OTA slot valid: {err:?}");
        }
    }

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;

    let mac_address = wifi
        .sta_netif()
        .get_mac()
        .map(format_mac)
        .unwrap_or_default();

    let writer = EspFirmwareWriter::new().context("failed to resolve OTA partition")?;
    let state = SharedState {
        engine: Arc::new(Mutex::new(OtaEngine::new(runtime.ota.clone(), writer))),
        mqtt_connected: Arc::new(AtomicBool::new(false)),
    };

    let router = MessageRouter::new(runtime.ota.transport);
    let (mqtt_client, mqtt_conn) = create_mqtt_client(&runtime.network)?;
    let mqtt_client = Arc::new(Mutex::new(mqtt_client));

    subscribe_topics(&mqtt_client, &router)?;
    publish_identity(
        &mqtt_client,
        &DeviceIdentity {
            mac_address,
            device_type: profile.as_str(),
            device_name: profile_config.device_name,
            fw_version: CURRENT_VERSION,
        },
    );
    publish_attribute_request(&mqtt_client, &router);

    let (event_tx, event_rx) = mpsc::channel::<RouterEvent>();
    let (led_tx, led_rx) = mpsc::channel::<bool>();
    spawn_mqtt_receiver(
        state.clone(),
        mqtt_conn,
        mqtt_client.clone(),
        router,
        event_tx,
        led_tx,
    );
    spawn_led_control(led_rx, led_pin);
    spawn_ota_loop(
        state.clone(),
        event_rx,
        mqtt_client.clone(),
        router,
        runtime.ota.tick_interval_ms,
    );
    spawn_telemetry_loop(state, mqtt_client, sensors, profile, profile_config);

    // Keep services alive for the program lifetime.
    let _wifi = wifi;

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn ensure_wifi_defaults(runtime: &mut RuntimeConfig) {
    if runtime.network.wifi_ssid.is_empty() {
        if let Some(ssid) = option_env!("WIFI_SSID") {
            runtime.network.wifi_ssid = ssid.to_string();
        }
    }

    if runtime.network.wifi_pass.is_empty() {
        if let Some(pass) = option_env!("WIFI_PASS") {
            runtime.network.wifi_pass = pass.to_string();
        }
    }

    if runtime.network.access_token.is_empty() {
        if let Some(token) = option_env!("DEVICE_TOKEN") {
            runtime.network.access_token = token.to_string();
        }
    }
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> anyhow::Result<WifiStartup> {
    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", network.wifi_ssid);

    let mut last_err = None;
    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        info!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS}");
        match wifi.connect() {
            Ok(()) => match wifi.wait_netif_up() {
                Ok(()) => {
                    info!("wifi connected and netif up on attempt {attempt}");
                    last_err = None;
                    break;
                }
                Err(err) => {
                    warn!("wifi netif up failed on attempt {attempt}: {err:#}");
                    last_err = Some(err);
                }
            },
            Err(err) => {
                warn!("wifi connect failed on attempt {attempt}: {err:#}");
                last_err = Some(err);
            }
        }

        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    match last_err {
        None => Ok(WifiStartup::Connected(esp_wifi)),
        Some(err) => {
            warn!("all {WIFI_CONNECT_ATTEMPTS} wifi connect attempts failed; last error: {err:#}");
            Ok(WifiStartup::Failed)
        }
    }
}

fn create_mqtt_client(
    network: &NetworkConfig,
) -> anyhow::Result<(EspMqttClient<'static>, EspMqttConnection)> {
    let url = format!("mqtt://{}:{}", network.mqtt_host, network.mqtt_port);

    let conf = MqttClientConfiguration {
        client_id: Some(network.device_id.as_str()),
        // ThingsBoard-style token auth: token as username, no password.
        username: if network.access_token.is_empty() {
            None
        } else {
            Some(network.access_token.as_str())
        },
        buffer_size: MQTT_BUFFER_SIZE,
        ..Default::default()
    };

    Ok(EspMqttClient::new(url.as_str(), &conf)?)
}

fn subscribe_topics(
    mqtt: &Arc<Mutex<EspMqttClient<'static>>>,
    router: &MessageRouter,
) -> anyhow::Result<()> {
    let mut mqtt = mqtt.lock().unwrap();
    for topic in router.subscriptions() {
        mqtt.subscribe(topic, QoS::AtLeastOnce)?;
    }
    Ok(())
}

fn publish_identity(mqtt: &Arc<Mutex<EspMqttClient<'static>>>, identity: &DeviceIdentity) {
    let Ok(payload) = serde_json::to_vec(identity) else {
        return;
    };
    let mut mqtt = mqtt.lock().unwrap();
    if let Err(err) = mqtt.publish(TOPIC_ATTRIBUTES, QoS::AtLeastOnce, false, &payload) {
        warn!("failed to publish device identity: {err:?}");
    }
}

fn publish_attribute_request(mqtt: &Arc<Mutex<EspMqttClient<'static>>>, router: &MessageRouter) {
    let (topic, payload) = router.attribute_request();
    let mut mqtt = mqtt.lock().unwrap();
    if let Err(err) = mqtt.publish(&topic, QoS::AtLeastOnce, false, &payload) {
        warn!("failed to request firmware attributes: {err:?}");
    }
}

fn spawn_mqtt_receiver(
    state: SharedState,
    mut conn: EspMqttConnection,
    mqtt: Arc<Mutex<EspMqttClient<'static>>>,
    router: MessageRouter,
    event_tx: mpsc::Sender<RouterEvent>,
    led_tx: mpsc::Sender<bool>,
) {
    thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(12 * 1024)
        .spawn(move || {
            loop {
                match conn.next() {
                    Ok(event) => {
                        state.mqtt_connected.store(true, Ordering::Relaxed);

                        if let EventPayload::Received {
                            topic: Some(topic),
                            data,
                            details,
                            ..
                        } = event.payload()
                        {
                            // Only full payloads are routed.
                            if !matches!(details, Details::Complete) {
                                warn!("dropping fragmented MQTT payload on topic {topic}");
                                continue;
                            }

                            if data.len() > MAX_MQTT_PAYLOAD_BYTES {
                                warn!(
                                    "dropping oversized MQTT payload on topic {} ({} bytes)",
                                    topic,
                                    data.len()
                                );
                                continue;
                            }

                            match router.route(topic, data) {
                                Some(RouterEvent::LedState(on)) => {
                                    if led_tx.send(on).is_err() {
                                        warn!("led channel closed; dropping led command");
                                    }
                                }
                                Some(event) => {
                                    if event_tx.send(event).is_err() {
                                        warn!(
                                            "ota event channel closed; stopping mqtt receiver"
                                        );
                                        return;
                                    }
                                }
                                None if router.expects_firmware_payload(topic) => {
                                    warn!("dropping malformed firmware payload on {topic}");
                                }
                                None => {}
                            }
                        }
                    }
                    Err(err) => {
                        state.mqtt_connected.store(false, Ordering::Relaxed);
                        warn!("mqtt receive loop error: {err:?}");
                        thread::sleep(Duration::from_secs(2));
                        if let Err(sub_err) = subscribe_topics(&mqtt, &router) {
                            warn!("mqtt re-subscribe failed: {sub_err:#}");
                        }
                        publish_attribute_request(&mqtt, &router);
                    }
                }
            }
        })
        .expect("failed to spawn mqtt receiver thread");
}

/// Switches the white indicator LED as commanded by the `ledState` shared
/// attribute. Runs on its own task so a slow pin write never backs up the
/// network task.
fn spawn_led_control(
    led_rx: mpsc::Receiver<bool>,
    mut led: PinDriver<'static, AnyOutputPin, Output>,
) {
    thread::Builder::new()
        .name("led-ctl".into())
        .stack_size(4 * 1024)
        .spawn(move || {
            while let Ok(on) = led_rx.recv() {
                let result = if on { led.set_high() } else { led.set_low() };
                match result {
                    Ok(()) => info!("indicator led {}", if on { "on" } else { "off" }),
                    Err(err) => warn!("failed to switch indicator led: {err:?}"),
                }
            }
            warn!("led channel disconnected; stopping led control");
        })
        .expect("failed to spawn led control thread");
}

fn spawn_ota_loop(
    state: SharedState,
    event_rx: mpsc::Receiver<RouterEvent>,
    mqtt: Arc<Mutex<EspMqttClient<'static>>>,
    router: MessageRouter,
    tick_interval_ms: u64,
) {
    thread::Builder::new()
        .name("ota-loop".into())
        .stack_size(16 * 1024)
        .spawn(move || {
            if let Err(err) = add_current_task_to_watchdog() {
                warn!("failed to register ota loop with watchdog: {err:#}");
            }

            let tick_interval = Duration::from_millis(tick_interval_ms);
            loop {
                feed_watchdog();

                match event_rx.recv_timeout(tick_interval) {
                    Ok(event) => {
                        let (actions, target) = {
                            let mut engine = state.engine.lock().unwrap();
                            let actions = apply_router_event(&mut engine, &router, event);
                            (actions, request_target(&engine))
                        };
                        execute_ota_actions(&mqtt, &router, actions, &target);
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => {
                        warn!("ota event channel disconnected; stopping ota loop");
                        return;
                    }
                }

                let (actions, target) = {
                    let mut engine = state.engine.lock().unwrap();
                    (engine.tick(monotonic_ms()), request_target(&engine))
                };
                execute_ota_actions(&mqtt, &router, actions, &target);
            }
        })
        .expect("failed to spawn ota loop thread");
}

fn apply_router_event(
    engine: &mut OtaEngine<EspFirmwareWriter>,
    router: &MessageRouter,
    event: RouterEvent,
) -> Vec<OtaAction> {
    match event {
        RouterEvent::FirmwareAnnounced(attrs) => {
            let Some(descriptor) =
                FirmwareDescriptor::from_attributes(attrs, router.transport())
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
        // Handled on the led task before events reach this loop.
        RouterEvent::LedState(_) => Vec::new(),
    }
}

/// (title, version) of the in-flight descriptor, captured inside the engine
/// lock so request publishing can happen outside it.
fn request_target(engine: &OtaEngine<EspFirmwareWriter>) -> Option<(String, String)> {
    engine
        .descriptor()
        .map(|d| (d.title.clone(), d.version.clone()))
}

fn execute_ota_actions(
    mqtt: &Arc<Mutex<EspMqttClient<'static>>>,
    router: &MessageRouter,
    actions: Vec<OtaAction>,
    target: &Option<(String, String)>,
) {
    for action in actions {
        match action {
            OtaAction::PublishState(payload) => {
                let Ok(body) = serde_json::to_vec(&payload) else {
                    continue;
                };
                let mut mqtt = mqtt.lock().unwrap();
                if let Err(err) = mqtt.publish(TOPIC_ATTRIBUTES, QoS::AtLeastOnce, false, &body) {
                    warn!("failed to publish fw_state {}: {err:?}", payload.fw_state);
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
                let (topic, payload) = router.chunk_request(&ChunkRequest {
                    title,
                    version,
                    request_id,
                    index,
                    offset,
                    chunk_size,
                });
                info!("requesting chunk {index} at offset {offset}");
                let mut mqtt = mqtt.lock().unwrap();
                if let Err(err) = mqtt.publish(&topic, QoS::AtLeastOnce, false, &payload) {
                    warn!("failed to publish chunk request: {err:?}");
                }
            }
            OtaAction::ScheduleRestart { delay_ms } => {
                info!(
                    "firmware update applied at epoch {}; restarting in {delay_ms} ms",
                    Utc::now().timestamp()
                );
                // Grace period lets the final fw_state publish flush.
                thread::sleep(Duration::from_millis(delay_ms));
                unsafe { esp_idf_svc::sys::esp_restart() };
            }
        }
    }
}

fn spawn_telemetry_loop(
    state: SharedState,
    mqtt: Arc<Mutex<EspMqttClient<'static>>>,
    mut sensors: SensorSuite,
    profile: DeviceProfile,
    profile_config: &'static ProfileConfig,
) {
    thread::Builder::new()
        .name("telemetry".into())
        .stack_size(12 * 1024)
        .spawn(move || {
            let mut wifi_disconnected_since: Option<Instant> = None;
            let mut last_env_ms = 0_u64;
            let mut last_pir_ms = 0_u64;
            let mut last_scan_ms = 0_u64;
            let mut people_count = 0_u32;
            let mut motion = false;
            let mut spot_occupied: Option<bool> = None;

            loop {
                let now_ms = monotonic_ms();
                maintain_wifi_health(&mut wifi_disconnected_since);

                if profile_config.enable_pir
                    && now_ms.saturating_sub(last_pir_ms) >= profile_config.pir_interval_ms
                {
                    last_pir_ms = now_ms;
                    let (high, rising) = sensors.poll_motion();
                    motion = high;
                    if rising && profile == DeviceProfile::Building {
                        people_count = people_count.saturating_add(1);
                    }
                }

                if profile_config.has_ultrasonic
                    && now_ms.saturating_sub(last_scan_ms) >= profile_config.ultrasonic_interval_ms
                {
                    last_scan_ms = now_ms;
                    if let Some(distance) = sensors.measure_distance_cm() {
                        let occupied = distance < SONIC_DETECTION_THRESHOLD_CM;
                        // Publish only on state change to keep traffic down.
                        if spot_occupied != Some(occupied)
                            && state.mqtt_connected.load(Ordering::Relaxed)
                        {
                            spot_occupied = Some(occupied);
                            publish_occupancy(&mqtt, occupied, now_ms);
                        }
                    }
                }

                if profile_config.enable_temp_humidity
                    && now_ms.saturating_sub(last_env_ms) >= profile_config.env_sensor_interval_ms
                {
                    last_env_ms = now_ms;
                    let sample = sensors.read_environment();
                    if !state.mqtt_connected.load(Ordering::Relaxed) {
                        warn!("mqtt not connected; skipping telemetry publish");
                    } else if let (Some(temperature), Some(humidity)) =
                        (sample.temperature, sample.humidity)
                    {
                        let reading = EnvironmentReading {
                            temperature,
                            humidity,
                            air_quality: None,
                            people_count: (profile == DeviceProfile::Building)
                                .then_some(people_count),
                            motion_detected: (profile == DeviceProfile::Carpark)
                                .then_some(motion),
                        };
                        publish_telemetry(&mqtt, &reading);
                    } else {
                        warn!("no valid environment reading to publish");
                    }

                    let status = state.engine.lock().unwrap().status();
                    if !matches!(status.state, FwState::Idle | FwState::Updated) {
                        info!(
                            "ota status: {} {}/{} bytes",
                            status.state.as_str(),
                            status.bytes_written,
                            status.total_bytes.unwrap_or_default()
                        );
                    }
                }

                thread::sleep(Duration::from_millis(200));
            }
        })
        .expect("failed to spawn telemetry thread");
}

fn publish_telemetry(mqtt: &Arc<Mutex<EspMqttClient<'static>>>, reading: &EnvironmentReading) {
    let Ok(payload) = serde_json::to_vec(reading) else {
        return;
    };
    let mut mqtt = mqtt.lock().unwrap();
    if let Err(err) = mqtt.publish(TOPIC_TELEMETRY, QoS::AtLeastOnce, false, &payload) {
        warn!("failed to publish telemetry: {err:?}");
    }
}

fn publish_occupancy(mqtt: &Arc<Mutex<EspMqttClient<'static>>>, occupied: bool, now_ms: u64) {
    let reading = OccupancyReading {
        slot: PARKING_SPOT_NAME.to_string(),
        occupied,
        ts: now_ms,
    };
    let Ok(payload) = serde_json::to_vec(&reading) else {
        return;
    };
    let mut mqtt = mqtt.lock().unwrap();
    if let Err(err) = mqtt.publish(TOPIC_TELEMETRY, QoS::AtLeastOnce, false, &payload) {
        warn!("failed to publish occupancy: {err:?}");
    }
}

fn maintain_wifi_health(disconnected_since: &mut Option<Instant>) {
    if is_wifi_station_connected() {
        *disconnected_since = None;
        return;
    }

    let since = disconnected_since.get_or_insert_with(Instant::now);
    if since.elapsed() >= Duration::from_millis(WIFI_RESTART_GRACE_MS) {
        warn!(
            "wifi disconnected for {}s; restarting device for recovery",
            WIFI_RESTART_GRACE_MS / 1000
        );
        thread::sleep(Duration::from_millis(100));
        unsafe { esp_idf_svc::sys::esp_restart() };
    }
}

fn format_mac(mac: [u8; 6]) -> String {
    format!(
        "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

fn disable_wifi_power_save() {
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_set_ps(0) };
    if rc == esp_idf_svc::sys::ESP_OK {
        info!("wifi power save disabled");
    } else {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
}

fn is_wifi_station_connected() -> bool {
    let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
    rc == esp_idf_svc::sys::ESP_OK
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
