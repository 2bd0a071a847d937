use core::convert::TryInto;
use std::{
    sync::{Arc, Mutex, PoisonError},
    thread,
    time::Duration,
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::{Headers, Method},
    io::Write,
    mqtt::client::EventPayload,
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::gpio::AnyOutputPin;
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    http::server::{Configuration as HttpConfiguration, EspHttpConnection, EspHttpServer, Request},
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};

use garage_common::{
    config::{
        OVERRIDE_DISPLAY_NAME, OVERRIDE_MQTT_HOST, OVERRIDE_MQTT_PASS, OVERRIDE_MQTT_PORT,
        OVERRIDE_MQTT_USER,
    },
    routes::{CONTENT_TYPE_JSON, HEADER_IF_MODIFIED_SINCE, HEADER_LAST_MODIFIED},
    ActionKind, Asset, BrokerSettings, DeviceConfig, DoorController, LastModified,
    NotFoundReport, Route, MANIFEST_JSON, ROUTES,
};

use crate::{assets, relay::Relay};

const NVS_NAMESPACE: &str = "garage";
const NVS_CONFIG_KEY: &str = "config_json";
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const RELAY_PIN: i32 = 5;
const RELAY_PULSE: Duration = Duration::from_millis(400);
const RESTART_DELAY: Duration = Duration::from_millis(500);
const CATCH_ALL_METHODS: [Method; 7] = [
    Method::Get,
    Method::Post,
    Method::Put,
    Method::Delete,
    Method::Patch,
    Method::Head,
    Method::Options,
];
const REPORTED_HEADERS: [&str; 5] = [
    "Host",
    "User-Agent",
    "Accept",
    "Content-Type",
    "If-Modified-Since",
];

type HttpRequest<'r, 'c> = Request<&'r mut EspHttpConnection<'c>>;

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
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

    let base = DeviceConfig::with_chip_id(chip_id());
    let loaded = nvs_store.load_config(base.clone()).unwrap_or_else(|err| {
        warn!("failed to load config from NVS: {err:#}");
        base
    });
    let mut config = loaded.clone();
    config.apply_overrides(build_override);
    if config != loaded {
        match nvs_store.save_config(&config) {
            Ok(()) => info!("build-time overrides saved to NVS"),
            Err(err) => warn!("failed to save config to NVS: {err:#}"),
        }
    }

    info!(
        "NVS config loaded: name=`{}` ({}), host=`{}`, mqtt=`{}:{}`",
        config.display_name(),
        config.safe_name(),
        config.host_name(),
        config.mqtt_host(),
        config.mqtt_port(),
    );

    let Peripherals { modem, .. } = Peripherals::take()?;
    let relay = init_relay(RELAY_PIN);

    let wifi = connect_wifi(modem, sys_loop, nvs_partition).context("wifi startup failed")?;

    let door = Arc::new(DoorController::new());
    register_delegates(&door, relay, nvs_store);

    let broker = BrokerSettings::from_config(&config);
    let (mqtt_client, mqtt_conn) = create_mqtt_client(&broker)?;
    spawn_mqtt_receiver(mqtt_conn);

    let server = create_http_server(door, Arc::new(assets::last_modified()))?;
    info!("garage controller `{}` ready", config.host_name());

    // Keep services alive for the program lifetime.
    let _wifi = wifi;
    let _mqtt = mqtt_client;
    let _server = server;

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn build_override(key: &str) -> Option<String> {
    let value = match key {
        OVERRIDE_DISPLAY_NAME => option_env!("GARAGE_NAME"),
        OVERRIDE_MQTT_HOST => option_env!("MQTT_HOST"),
        OVERRIDE_MQTT_PORT => option_env!("MQTT_PORT"),
        OVERRIDE_MQTT_USER => option_env!("MQTT_USER"),
        OVERRIDE_MQTT_PASS => option_env!("MQTT_PASS"),
        _ => None,
    };
    value.map(str::to_string)
}

/// Low three bytes of the factory MAC, matching the id printed on the module.
fn chip_id() -> u32 {
    let mut mac = [0_u8; 6];
    let rc = unsafe { esp_idf_svc::sys::esp_efuse_mac_get_default(mac.as_mut_ptr()) };
    if rc != esp_idf_svc::sys::ESP_OK {
        warn!("failed to read factory MAC: esp_err_t={rc}");
    }
    u32::from_be_bytes([0, mac[3], mac[4], mac[5]])
}

fn init_relay(pin: i32) -> Arc<Mutex<Relay>> {
    let relay = match Relay::new(unsafe { AnyOutputPin::new(pin) }, RELAY_PULSE) {
        Ok(relay) => {
            info!("relay initialized on GPIO{pin}");
            relay
        }
        Err(err) => {
            warn!("failed to initialize relay on GPIO{pin}, running disabled: {err:#}");
            Relay::disabled()
        }
    };
    Arc::new(Mutex::new(relay))
}

fn register_delegates(door: &DoorController, relay: Arc<Mutex<Relay>>, nvs_store: NvsStore) {
    for kind in [ActionKind::Toggle, ActionKind::Open, ActionKind::Close] {
        let relay = relay.clone();
        door.register(kind, move || {
            let mut relay = relay.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(err) = relay.pulse() {
                warn!("relay pulse for {} failed: {err:#}", kind.as_str());
            }
        });
    }

    door.on_reset(move || {
        match nvs_store.clear() {
            Ok(()) => warn!("config reset to factory defaults"),
            Err(err) => warn!("failed to reset config: {err:#}"),
        }
        schedule_restart();
    });

    door.on_restart(schedule_restart);
}

fn schedule_restart() {
    warn!("restart requested, rebooting in {RESTART_DELAY:?}");
    let spawned = thread::Builder::new()
        .name("restart".into())
        .stack_size(4 * 1024)
        .spawn(|| {
            thread::sleep(RESTART_DELAY);
            unsafe { esp_idf_svc::sys::esp_restart() };
        });
    if let Err(err) = spawned {
        warn!("failed to schedule restart: {err}");
    }
}

fn create_http_server(
    door: Arc<DoorController>,
    last_modified: Arc<LastModified>,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 10 * 1024,
        max_uri_handlers: ROUTES.len() + CATCH_ALL_METHODS.len(),
        uri_match_wildcard: true,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    for &(path, route) in ROUTES {
        let door = door.clone();
        let last_modified = last_modified.clone();
        server.fn_handler::<anyhow::Error, _>(path, Method::Get, move |req| match route {
            Route::Asset(asset) => respond_cached(req, &last_modified, asset),
            Route::Manifest => write_body(req, CONTENT_TYPE_JSON, MANIFEST_JSON.as_bytes()),
            Route::State => write_state(req, &door),
            Route::Action(kind) => {
                door.perform(kind);
                write_state(req, &door)
            }
        })?;
    }

    // Registered last so the exact routes above win.
    for method in CATCH_ALL_METHODS {
        server.fn_handler::<anyhow::Error, _>("/*", method, handle_not_found)?;
    }

    Ok(server)
}

fn respond_cached(
    req: HttpRequest<'_, '_>,
    last_modified: &LastModified,
    asset: Asset,
) -> anyhow::Result<()> {
    if last_modified.is_fresh(req.header(HEADER_IF_MODIFIED_SINCE)) {
        req.into_status_response(304)?;
        return Ok(());
    }

    req.into_response(
        200,
        Some("OK"),
        &[
            ("Content-Type", asset.content_type()),
            (HEADER_LAST_MODIFIED, last_modified.as_str()),
        ],
    )?
    .write_all(assets::bytes(asset))?;
    Ok(())
}

fn write_body(req: HttpRequest<'_, '_>, content_type: &str, body: &[u8]) -> anyhow::Result<()> {
    req.into_response(200, Some("OK"), &[("Content-Type", content_type)])?
        .write_all(body)?;
    Ok(())
}

fn write_state(req: HttpRequest<'_, '_>, door: &DoorController) -> anyhow::Result<()> {
    write_body(req, CONTENT_TYPE_JSON, door.serialize_state().as_bytes())
}

fn handle_not_found(req: HttpRequest<'_, '_>) -> anyhow::Result<()> {
    let uri = req.uri().to_string();
    let rendered = NotFoundReport {
        method: method_name(req.method()),
        host: req.header("Host").unwrap_or_default(),
        uri: &uri,
        content_type: req.content_type(),
        content_length: req.content_len(),
        headers: REPORTED_HEADERS
            .iter()
            .filter_map(|&name| req.header(name).map(|value| (name, value)))
            .collect(),
    }
    .render();
    info!("{rendered}");

    req.into_status_response(404)?;
    Ok(())
}

fn method_name(method: Method) -> &'static str {
    match method {
        Method::Get => "GET",
        Method::Post => "POST",
        Method::Put => "PUT",
        Method::Delete => "DELETE",
        Method::Patch => "PATCH",
        Method::Head => "HEAD",
        Method::Options => "OPTIONS",
        _ => "UNKNOWN",
    }
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
) -> anyhow::Result<EspWifi<'static>> {
    let ssid = option_env!("WIFI_SSID").unwrap_or_default();
    let pass = option_env!("WIFI_PASS").unwrap_or_default();
    if ssid.is_empty() {
        return Err(anyhow!("WIFI_SSID was not set at build time"));
    }

    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    let auth_method = if pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: ssid.try_into().map_err(|_| anyhow!("wifi ssid too long"))?,
        password: pass
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{ssid}`");

    let mut last_err = None;
    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected on attempt {attempt}");
                last_err = None;
                break;
            }
            Err(err) => {
                warn!("wifi attempt {attempt}/{WIFI_CONNECT_ATTEMPTS} failed: {err:#}");
                last_err = Some(err);
            }
        }

        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }
    drop(wifi);

    match last_err {
        None => Ok(esp_wifi),
        Some(err) => Err(anyhow!(err).context(format!(
            "all {WIFI_CONNECT_ATTEMPTS} wifi connect attempts failed"
        ))),
    }
}

fn create_mqtt_client(
    broker: &BrokerSettings,
) -> anyhow::Result<(EspMqttClient<'static>, EspMqttConnection)> {
    let url = broker.url();
    let (username, password) = match &broker.credentials {
        Some(credentials) => (
            Some(credentials.user.as_str()),
            Some(credentials.password.as_str()),
        ),
        None => (None, None),
    };

    let conf = MqttClientConfiguration {
        client_id: Some(broker.client_id.as_str()),
        keep_alive_interval: Some(broker.keep_alive),
        username,
        password,
        ..Default::default()
    };

    info!("connecting to mqtt broker at {url}");
    Ok(EspMqttClient::new(url.as_str(), &conf)?)
}

fn spawn_mqtt_receiver(mut conn: EspMqttConnection) {
    let spawned = thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(6 * 1024)
        .spawn(move || loop {
            match conn.next() {
                Ok(event) => match event.payload() {
                    EventPayload::Connected(_) => info!("mqtt connected"),
                    EventPayload::Disconnected => warn!("mqtt disconnected"),
                    _ => {}
                },
                Err(err) => {
                    warn!("mqtt receive loop error: {err:?}");
                    thread::sleep(Duration::from_secs(2));
                }
            }
        });
    if let Err(err) = spawned {
        warn!("failed to spawn mqtt receiver: {err}");
    }
}

impl NvsStore {
    fn open(&self) -> anyhow::Result<EspNvs<esp_idf_svc::nvs::NvsDefault>> {
        Ok(EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?)
    }

    fn load_config(&self, base: DeviceConfig) -> anyhow::Result<DeviceConfig> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let nvs = self.open()?;
        // Stored length includes the NUL terminator.
        let Some(len) = nvs.str_len(NVS_CONFIG_KEY)? else {
            return Ok(base);
        };
        let mut buffer = vec![0_u8; len];

        let mut config = base;
        if let Some(value) = nvs.get_str(NVS_CONFIG_KEY, &mut buffer)? {
            config.apply_json(value.as_bytes())?;
        }
        Ok(config)
    }

    fn save_config(&self, config: &DeviceConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut nvs = self.open()?;
        let payload = String::from_utf8(config.to_json()?)?;
        nvs.set_str(NVS_CONFIG_KEY, &payload)?;
        Ok(())
    }

    fn clear(&self) -> anyhow::Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut nvs = self.open()?;
        nvs.remove(NVS_CONFIG_KEY)?;
        Ok(())
    }
}
