use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use majority_capture_server::clock::{ServerClock, ServerTimestamp};
use majority_capture_server::config::ServerSettings;
use majority_capture_server::constants::{DEFAULT_SETTINGS_PATH, REPLICA_QUEUE_CAPACITY, TICK_MS};
use majority_capture_server::replication::ReplicationMessage;
use majority_capture_server::scenario::{Scenario, ScriptedOccupancy};
use majority_capture_server::server_protocol::{
    parse_client_message, ParsedClientMessage, ServerMessage,
};
use majority_capture_server::server_utils::{
    filter_views, message_zone, parse_zone_filter, resync_views, sanitize_observer_name,
    zone_filter_from_list, zone_matches,
};
use majority_capture_server::types::ZoneView;
use majority_capture_server::world::CaptureWorld;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

type SharedState = Arc<Mutex<ServerState>>;

#[derive(Clone, Debug)]
enum OutboundMessage {
    Text(String),
    Close { code: u16, reason: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum QueuePolicy {
    DropOnFull,
    DisconnectOnFull,
}

struct ObserverContext {
    tx: mpsc::Sender<OutboundMessage>,
    name: Option<String>,
    filter: Option<HashSet<String>>,
    replica: Option<(u64, JoinHandle<()>)>,
}

struct ServerState {
    world: CaptureWorld,
    occupancy: ScriptedOccupancy,
    clock: ServerClock,
    observers: HashMap<String, ObserverContext>,
    scenario_finished: bool,
}

#[derive(Debug, Deserialize)]
struct ZonesQuery {
    zones: Option<String>,
}

#[derive(Debug, Serialize)]
struct ZonesResponse {
    #[serde(rename = "generatedAtIso")]
    generated_at_iso: String,
    #[serde(rename = "serverTimeMs")]
    server_time_ms: u64,
    zones: Vec<ZoneView>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let port = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);

    let settings_path = std::env::var("CAPTURE_SETTINGS_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_SETTINGS_PATH));
    let settings = ServerSettings::load_or_create(&settings_path);

    let scenario = match std::env::var("SCENARIO_PATH") {
        Ok(path) => Scenario::from_file(&PathBuf::from(path)),
        Err(_) => Scenario::builtin(),
    };
    let scenario = match scenario.and_then(|scenario| {
        scenario.validate(&settings)?;
        Ok(scenario)
    }) {
        Ok(scenario) => scenario,
        Err(err) => {
            error!(error = %err, "failed to load scenario");
            std::process::exit(1);
        }
    };
    let seed = std::env::var("SCENARIO_SEED")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(1);

    let world = match CaptureWorld::from_settings(&settings) {
        Ok(world) => world,
        Err(err) => {
            error!(error = %err, "invalid capture settings");
            std::process::exit(1);
        }
    };

    let clock = ServerClock::new();
    let occupancy = ScriptedOccupancy::new(
        scenario,
        world.factions().clone(),
        seed,
        clock.now(),
    );
    info!(
        scenario = %occupancy.scenario().name,
        seed,
        "scenario loaded"
    );

    let state = Arc::new(Mutex::new(ServerState {
        world,
        occupancy,
        clock,
        observers: HashMap::new(),
        scenario_finished: false,
    }));
    start_tick_loop(state.clone());

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/api/zones", get(zones_handler))
        .route("/ws", get(ws_handler))
        .with_state(state);

    let bind_addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .expect("failed to bind server socket");

    info!(port, "listening");
    axum::serve(listener, app)
        .await
        .expect("server runtime failed");
}

async fn healthz() -> impl IntoResponse {
    Json(json!({ "ok": true }))
}

async fn zones_handler(
    State(state): State<SharedState>,
    Query(query): Query<ZonesQuery>,
) -> impl IntoResponse {
    let guard = state.lock().await;
    let filter = parse_zone_filter(query.zones.as_deref());
    Json(ZonesResponse {
        generated_at_iso: chrono::Utc::now().to_rfc3339(),
        server_time_ms: guard.clock.now().as_millis(),
        zones: filter_views(guard.world.zone_views(), filter.as_ref()),
    })
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<SharedState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

async fn handle_socket(state: SharedState, socket: WebSocket) {
    let observer_id = make_id("observer");
    let (tx, mut rx) = mpsc::channel::<OutboundMessage>(REPLICA_QUEUE_CAPACITY);

    {
        let mut guard = state.lock().await;
        guard.observers.insert(
            observer_id.clone(),
            ObserverContext {
                tx: tx.clone(),
                name: None,
                filter: None,
                replica: None,
            },
        );
    }

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let writer = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            let should_close = matches!(outbound, OutboundMessage::Close { .. });
            let result = match outbound {
                OutboundMessage::Text(payload) => {
                    ws_sender.send(Message::Text(payload.into())).await
                }
                OutboundMessage::Close { code, reason } => {
                    let frame = CloseFrame {
                        code,
                        reason: reason.into(),
                    };
                    ws_sender.send(Message::Close(Some(frame))).await
                }
            };
            if result.is_err() || should_close {
                break;
            }
        }
    });

    while let Some(received) = ws_receiver.next().await {
        let Ok(message) = received else {
            break;
        };

        match message {
            Message::Text(raw) => {
                handle_client_message(&state, &observer_id, raw.as_str()).await;
            }
            Message::Binary(raw) => {
                if let Ok(text) = std::str::from_utf8(&raw) {
                    handle_client_message(&state, &observer_id, text).await;
                } else {
                    let mut guard = state.lock().await;
                    send_error(&mut guard, &observer_id, "invalid utf8 message");
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    {
        let mut guard = state.lock().await;
        disconnect_observer(&mut guard, &observer_id);
    }
    drop(tx);
    let _ = writer.await;
}

async fn handle_client_message(state: &SharedState, observer_id: &str, raw: &str) {
    let mut guard = state.lock().await;
    let Some(message) = parse_client_message(raw) else {
        send_error(&mut guard, observer_id, "invalid message");
        return;
    };

    match message {
        ParsedClientMessage::Hello { name, zones } => {
            handle_hello(&mut guard, observer_id, &name, zone_filter_from_list(zones));
        }
        ParsedClientMessage::Resync { zone } => {
            handle_resync(&mut guard, observer_id, zone.as_deref());
        }
        ParsedClientMessage::Ping { t } => {
            let pong = ServerMessage::Pong {
                t,
                server_time_ms: guard.clock.now().as_millis(),
            };
            send_to_observer(&mut guard, observer_id, &pong, QueuePolicy::DisconnectOnFull);
        }
    }
}

fn handle_hello(
    state: &mut ServerState,
    observer_id: &str,
    requested_name: &str,
    filter: Option<HashSet<String>>,
) {
    let Some(observer) = state.observers.get_mut(observer_id) else {
        return;
    };
    let name = sanitize_observer_name(requested_name);
    observer.name = Some(name.clone());
    observer.filter = filter.clone();
    let tx = observer.tx.clone();
    let previous = observer.replica.take();

    if let Some((replica_id, forwarder)) = previous {
        forwarder.abort();
        state.world.unsubscribe(replica_id);
    }

    let welcome = ServerMessage::Welcome {
        observer_id: observer_id.to_string(),
        server_time_ms: state.clock.now().as_millis(),
        factions: state
            .world
            .factions()
            .iter()
            .map(|(_, faction)| faction.key.clone())
            .collect(),
        zones: filter_views(state.world.zone_views(), filter.as_ref()),
    };
    send_to_observer(state, observer_id, &welcome, QueuePolicy::DisconnectOnFull);

    let (replica_id, replica_rx) = state.world.subscribe(REPLICA_QUEUE_CAPACITY);
    let forwarder = spawn_replica_forwarder(replica_rx, tx, filter);
    match state.observers.get_mut(observer_id) {
        Some(observer) => observer.replica = Some((replica_id, forwarder)),
        None => {
            forwarder.abort();
            state.world.unsubscribe(replica_id);
            return;
        }
    }

    info!(observer = observer_id, name = %name, replica = replica_id, "observer subscribed");
}

fn handle_resync(state: &mut ServerState, observer_id: &str, zone: Option<&str>) {
    let Some(filter) = state
        .observers
        .get(observer_id)
        .map(|observer| observer.filter.clone())
    else {
        return;
    };

    let views = match resync_views(state.world.zone_views(), zone, filter.as_ref()) {
        Ok(views) => views,
        Err(message) => {
            send_error(state, observer_id, message);
            return;
        }
    };

    for view in views {
        let message = ReplicationMessage::ZoneSync { zone: view };
        send_to_observer(state, observer_id, &message, QueuePolicy::DisconnectOnFull);
    }
}

fn spawn_replica_forwarder(
    mut replica_rx: mpsc::Receiver<ReplicationMessage>,
    tx: mpsc::Sender<OutboundMessage>,
    filter: Option<HashSet<String>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = replica_rx.recv().await {
            if !zone_matches(filter.as_ref(), message_zone(&message)) {
                continue;
            }
            let Ok(payload) = serde_json::to_string(&message) else {
                continue;
            };
            match tx.try_send(OutboundMessage::Text(payload)) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("observer queue full, replication message dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => break,
            }
        }
    })
}

fn disconnect_observer(state: &mut ServerState, observer_id: &str) {
    let Some(observer) = state.observers.remove(observer_id) else {
        return;
    };
    if let Some((replica_id, forwarder)) = observer.replica {
        forwarder.abort();
        state.world.unsubscribe(replica_id);
    }
    info!(
        observer = observer_id,
        name = observer.name.as_deref().unwrap_or("-"),
        "observer disconnected"
    );
}

fn start_tick_loop(state: SharedState) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(TICK_MS));
        loop {
            interval.tick().await;
            let mut guard = state.lock().await;
            tick_world(&mut guard);
        }
    });
}

fn tick_world(state: &mut ServerState) {
    let now: ServerTimestamp = state.clock.now();

    for action in state.occupancy.take_due_actions(now) {
        if let Err(err) = action.apply(&mut state.world, now) {
            warn!(error = %err, ?action, "scenario action failed");
        }
    }

    let report = state.world.tick(now, &mut state.occupancy);
    for seized in &report.seized {
        info!(
            zone = %seized.zone,
            faction = state.world.factions().display_key(Some(seized.faction)),
            "zone changed hands"
        );
    }

    if !state.scenario_finished && state.occupancy.is_finished(now) {
        state.scenario_finished = true;
        info!(
            scenario = %state.occupancy.scenario().name,
            dropped = state.world.notifier().dropped_messages(),
            "scenario finished, zones stay as they are"
        );
    }
}

fn send_to_observer<T: Serialize>(
    state: &mut ServerState,
    observer_id: &str,
    message: &T,
    policy: QueuePolicy,
) {
    let Ok(payload) = serde_json::to_string(message) else {
        return;
    };
    let send_failed = match state.observers.get(observer_id) {
        Some(observer) => observer.tx.try_send(OutboundMessage::Text(payload)).is_err(),
        None => false,
    };
    if send_failed && policy == QueuePolicy::DisconnectOnFull {
        if let Some(observer) = state.observers.get(observer_id) {
            let _ = observer.tx.try_send(OutboundMessage::Close {
                code: 1013,
                reason: "observer queue full".to_string(),
            });
        }
        disconnect_observer(state, observer_id);
    }
}

fn send_error(state: &mut ServerState, observer_id: &str, message: &str) {
    let error = ServerMessage::Error {
        message: message.to_string(),
    };
    send_to_observer(state, observer_id, &error, QueuePolicy::DropOnFull);
}

fn make_id(prefix: &str) -> String {
    let seq = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}_{seq}")
}
