use std::{convert::Infallible, net::SocketAddr, path::PathBuf, sync::Arc, thread, time::Duration};

use anyhow::Context;
use axum::{
    extract::State,
    http::{
        header::{CONTENT_LENGTH, CONTENT_TYPE, HOST, IF_MODIFIED_SINCE, LAST_MODIFIED},
        HeaderMap, HeaderName, Method, StatusCode, Uri,
    },
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{any, get, MethodRouter},
    Json, Router,
};
use futures_lite::Stream;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions};
use tokio::{
    net::TcpListener,
    sync::broadcast::{self, error::RecvError},
};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use garage_common::{
    routes::CONTENT_TYPE_JSON, ActionKind, Asset, BrokerSettings, DeviceConfig, DoorController,
    FileStore, LastModified, NotFoundReport, Route, MANIFEST_JSON, ROUTES,
};

use crate::assets;

const RESTART_DELAY: Duration = Duration::from_millis(500);
const EVENTS_PATH: &str = "/events";
const WEB_LOG_CAPACITY: usize = 32;

#[derive(Clone)]
struct AppState {
    door: Arc<DoorController>,
    last_modified: Arc<LastModified>,
    log: WebLog,
}

/// Mirrors log lines to browsers subscribed on `/events` as `log` events.
#[derive(Clone)]
struct WebLog {
    tx: broadcast::Sender<String>,
}

impl WebLog {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(WEB_LOG_CAPACITY);
        Self { tx }
    }

    fn info(&self, message: String) {
        info!("{message}");
        self.publish(message);
    }

    fn warn(&self, message: String) {
        warn!("{message}");
        self.publish(message);
    }

    fn publish(&self, message: String) {
        // No subscribers is not an error.
        let _ = self.tx.send(message);
    }

    fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let data_dir = std::env::var("GARAGE_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.garage"));
    let store = FileStore::in_dir(data_dir);
    let log = WebLog::new();

    let mut base = DeviceConfig::default();
    if let Ok(host_name) = std::env::var("GARAGE_HOSTNAME") {
        base.set_host_name(&host_name);
    }

    let loaded = load_config(&store, base, &log);
    let mut config = loaded.clone();
    config.apply_overrides(|key| std::env::var(key).ok());
    if config != loaded {
        save_config(&store, &config, &log);
    }

    log.info(format!(
        "config loaded: name=`{}` ({}), host=`{}`, mqtt=`{}:{}`",
        config.display_name(),
        config.safe_name(),
        config.host_name(),
        config.mqtt_host(),
        config.mqtt_port(),
    ));

    let door = Arc::new(DoorController::new());
    register_delegates(&door, store, log.clone());

    let broker = BrokerSettings::from_config(&config);
    let (_mqtt, eventloop) = create_mqtt_client(&broker);
    spawn_mqtt_loop(eventloop);

    let app = router(AppState {
        door,
        last_modified: Arc::new(assets::last_modified()),
        log,
    });

    let port = std::env::var("GARAGE_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind garage server at {addr}"))?;

    info!("garage controller listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

fn load_config(store: &FileStore, base: DeviceConfig, log: &WebLog) -> DeviceConfig {
    store.load_into(base.clone()).unwrap_or_else(|err| {
        log.warn(format!(
            "failed to load config from {}: {err:#}",
            store.path().display()
        ));
        base
    })
}

fn save_config(store: &FileStore, config: &DeviceConfig, log: &WebLog) {
    match store.save(config) {
        Ok(()) => log.info(format!("config saved to {}", store.path().display())),
        Err(err) => log.warn(format!("failed to save config: {err:#}")),
    }
}

fn register_delegates(door: &DoorController, store: FileStore, log: WebLog) {
    // No relay on the host build; the pulse is only logged.
    for kind in [ActionKind::Toggle, ActionKind::Open, ActionKind::Close] {
        let log = log.clone();
        door.register(kind, move || log.info(format!("relay pulse: {}", kind.as_str())));
    }

    let reset_log = log.clone();
    door.on_reset(move || match store.clear() {
        Ok(()) => reset_log.warn("config reset to factory defaults".to_string()),
        Err(err) => reset_log.warn(format!("failed to reset config: {err:#}")),
    });

    door.on_restart(move || {
        log.warn(format!("restart requested, exiting in {RESTART_DELAY:?}"));
        let spawned = thread::Builder::new()
            .name("restart-request".into())
            .spawn(|| {
                thread::sleep(RESTART_DELAY);
                std::process::exit(0);
            });
        if let Err(err) = spawned {
            log.warn(format!("failed to schedule restart: {err}"));
        }
    });
}

fn create_mqtt_client(broker: &BrokerSettings) -> (AsyncClient, EventLoop) {
    let mut options = MqttOptions::new(
        broker.client_id.clone(),
        broker.address.to_string(),
        broker.port,
    );
    options.set_keep_alive(broker.keep_alive);
    if let Some(credentials) = &broker.credentials {
        options.set_credentials(credentials.user.clone(), credentials.password.clone());
    }

    AsyncClient::new(options, 16)
}

fn spawn_mqtt_loop(mut eventloop: EventLoop) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
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

fn router(state: AppState) -> Router {
    ROUTES
        .iter()
        .fold(Router::new(), |router, (path, route)| {
            router.route(path, method_router(*route))
        })
        .route(EVENTS_PATH, get(handle_events))
        .fallback(handle_not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// Only GET runs the route; HEAD and every other method get the not-found dump.
fn method_router(route: Route) -> MethodRouter<AppState> {
    any(
        move |State(state): State<AppState>, method: Method, uri: Uri, headers: HeaderMap| async move {
            if method != Method::GET {
                return not_found(&state, &method, &uri, &headers);
            }
            match route {
                Route::Asset(asset) => respond_cached(&state, asset, &headers),
                Route::Manifest => {
                    ([(CONTENT_TYPE, CONTENT_TYPE_JSON)], MANIFEST_JSON).into_response()
                }
                Route::State => Json(state.door.state()).into_response(),
                Route::Action(kind) => handle_action(&state, kind),
            }
        },
    )
}

fn respond_cached(state: &AppState, asset: Asset, headers: &HeaderMap) -> Response {
    if state
        .last_modified
        .is_fresh(header_str(headers, IF_MODIFIED_SINCE))
    {
        return StatusCode::NOT_MODIFIED.into_response();
    }

    (
        [
            (CONTENT_TYPE, asset.content_type()),
            (LAST_MODIFIED, state.last_modified.as_str()),
        ],
        assets::bytes(asset),
    )
        .into_response()
}

fn handle_action(state: &AppState, kind: ActionKind) -> Response {
    state.door.perform(kind);
    Json(state.door.state()).into_response()
}

async fn handle_events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let rx = state.log.subscribe();
    let stream = futures_lite::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(message) => {
                    let event = SseEvent::default().event("log").data(message);
                    return Some((Ok::<_, Infallible>(event), rx));
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("web log subscriber lagged, skipped {skipped} lines");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn handle_not_found(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    not_found(&state, &method, &uri, &headers)
}

fn not_found(state: &AppState, method: &Method, uri: &Uri, headers: &HeaderMap) -> Response {
    let report = NotFoundReport {
        method: method.as_str(),
        host: header_str(headers, HOST).unwrap_or_default(),
        uri: uri.path_and_query().map_or(uri.path(), |pq| pq.as_str()),
        content_type: header_str(headers, CONTENT_TYPE),
        content_length: header_str(headers, CONTENT_LENGTH).and_then(|value| value.parse().ok()),
        headers: headers
            .iter()
            .map(|(name, value)| (name.as_str(), value.to_str().unwrap_or("<binary>")))
            .collect(),
    };
    state.log.info(report.render());

    StatusCode::NOT_FOUND.into_response()
}

fn header_str(headers: &HeaderMap, name: HeaderName) -> Option<&str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}
