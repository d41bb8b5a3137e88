use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    Json, Router,
    extract::{
        Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{net::TcpListener, sync::mpsc};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::{
    command::{
        CommandEnvelope, CommandKind, CommandRecord, CommandStatus, DeviceRecord, Priority,
    },
    config::Config,
    error::{FleetError, Result},
    presence::{DeviceHub, OutboundFrame, Presence},
    router::{DeliveryMode, DeliveryRouter},
    snowflake::DispatchId,
    store::{CommandStore, CreateCommand},
    sweeper,
};

#[derive(Clone)]
pub struct AppState {
    store: Arc<CommandStore>,
    hub: DeviceHub,
    router: Arc<DeliveryRouter>,
    default_ttl_seconds: i64,
    default_max_retries: u32,
    channel_buffer: usize,
    list_page_size: usize,
}

pub async fn run(config: Config) -> Result<()> {
    let store = Arc::new(CommandStore::open(
        config.command_store_path(),
        config.node_id,
    )?);
    let hub = DeviceHub::new();
    let router = Arc::new(DeliveryRouter::new(
        Arc::clone(&store),
        Arc::new(hub.clone()),
        Arc::new(hub.clone()),
    ));

    let sweeper_handle = sweeper::spawn(
        Arc::clone(&store),
        Duration::from_secs(config.sweep_interval_seconds),
    );

    let state = AppState {
        store,
        hub,
        router,
        default_ttl_seconds: config.default_ttl_seconds,
        default_max_retries: config.default_max_retries,
        channel_buffer: config.channel_buffer,
        list_page_size: config.list_page_size,
    };

    let app = Router::new()
        .route("/health", get(health))
        .route("/v1/devices", get(list_devices))
        .route("/v1/devices/{device_id}", put(register_device).get(get_device))
        .route("/v1/devices/{device_id}/channel", get(device_channel))
        .route("/v1/commands", post(create_command).get(list_commands))
        .route("/v1/commands/pending", get(drain_pending))
        .route("/v1/commands/{id}", get(get_command).delete(cancel_command))
        .route("/v1/commands/{id}/status", axum::routing::patch(report_status))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!("Starting FleetLink server on {addr}");

    let listener = TcpListener::bind(addr).await?;
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(FleetError::from);

    sweeper_handle.abort();
    info!("FleetLink server stopped");
    result
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

// ----- health ----------------------------------------------------------

async fn health() -> impl IntoResponse {
    Json(HealthResponse { status: "ok" })
}

#[derive(Serialize)]
struct HealthResponse<'a> {
    status: &'a str,
}

// ----- devices ---------------------------------------------------------

#[derive(Deserialize, Default)]
struct RegisterDeviceBody {
    #[serde(default)]
    name: Option<String>,
}

#[derive(Serialize)]
struct DeviceResponse {
    #[serde(flatten)]
    device: DeviceRecord,
    online: bool,
}

impl DeviceResponse {
    fn new(device: DeviceRecord, hub: &DeviceHub) -> Self {
        let online = hub.is_online(&device.device_id);
        Self { device, online }
    }
}

async fn register_device(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    body: Option<Json<RegisterDeviceBody>>,
) -> Result<Json<DeviceResponse>> {
    let Json(body) = body.unwrap_or_default();
    let device = state.store.register_device(&device_id, body.name)?;
    Ok(Json(DeviceResponse::new(device, &state.hub)))
}

async fn list_devices(State(state): State<AppState>) -> Result<Json<Vec<DeviceResponse>>> {
    let devices = state
        .store
        .list_devices()?
        .into_iter()
        .map(|device| DeviceResponse::new(device, &state.hub))
        .collect();
    Ok(Json(devices))
}

async fn get_device(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Result<Json<DeviceResponse>> {
    let device = state
        .store
        .get_device(&device_id)?
        .ok_or_else(|| FleetError::DeviceNotFound(device_id.clone()))?;
    Ok(Json(DeviceResponse::new(device, &state.hub)))
}

// ----- commands --------------------------------------------------------

#[derive(Deserialize)]
struct CreateCommandBody {
    device_id: String,
    kind: String,
    #[serde(default)]
    payload: Option<Value>,
    #[serde(default)]
    priority: Option<String>,
    #[serde(default)]
    ttl_seconds: Option<i64>,
    #[serde(default)]
    max_retries: Option<u32>,
}

#[derive(Serialize)]
struct CreateCommandResponse {
    command: CommandRecord,
    delivery: DeliveryMode,
}

async fn create_command(
    State(state): State<AppState>,
    Json(body): Json<CreateCommandBody>,
) -> Result<impl IntoResponse> {
    let kind: CommandKind = body.kind.parse()?;
    let priority = match body.priority.as_deref() {
        Some(raw) => raw.parse()?,
        None => Priority::default(),
    };

    let input = CreateCommand {
        device_id: body.device_id,
        kind,
        payload: body.payload.unwrap_or(Value::Null),
        priority,
        ttl_seconds: body.ttl_seconds.unwrap_or(state.default_ttl_seconds),
        max_retries: body.max_retries.unwrap_or(state.default_max_retries),
    };

    let (command, delivery) = state.router.create_and_dispatch(input).await?;
    Ok((
        StatusCode::CREATED,
        Json(CreateCommandResponse { command, delivery }),
    ))
}

#[derive(Deserialize, Default)]
struct ListCommandsQuery {
    #[serde(default)]
    device_id: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    take: Option<usize>,
}

async fn list_commands(
    State(state): State<AppState>,
    Query(params): Query<ListCommandsQuery>,
) -> Result<Json<Vec<CommandRecord>>> {
    let status = match params.status.as_deref() {
        Some(raw) => Some(raw.parse::<CommandStatus>()?),
        None => None,
    };
    let take = params.take.unwrap_or(state.list_page_size);

    let mut commands = state
        .store
        .list_commands(params.device_id.as_deref(), status)?;
    commands.truncate(take);
    Ok(Json(commands))
}

async fn get_command(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<CommandRecord>> {
    let id: DispatchId = id.parse().map_err(|_| FleetError::CommandNotFound)?;
    Ok(Json(state.store.get_command(id)?))
}

#[derive(Deserialize)]
struct DrainQuery {
    device_id: String,
}

#[derive(Serialize)]
struct DrainResponse {
    device_id: String,
    commands: Vec<CommandEnvelope>,
}

/// Poll-style drain used by a reconnecting device agent. Entries are handed
/// out at most once and their commands marked `sent` in the same operation.
async fn drain_pending(
    State(state): State<AppState>,
    Query(params): Query<DrainQuery>,
) -> Result<Json<DrainResponse>> {
    if !state.store.device_exists(&params.device_id)? {
        return Err(FleetError::DeviceNotFound(params.device_id));
    }

    let entries = state.store.drain_pending(&params.device_id)?;
    state.store.touch_device(&params.device_id)?;

    Ok(Json(DrainResponse {
        device_id: params.device_id,
        commands: entries.iter().map(CommandEnvelope::for_entry).collect(),
    }))
}

#[derive(Deserialize)]
struct ReportStatusBody {
    status: String,
    #[serde(default)]
    response_data: Option<Value>,
    #[serde(default)]
    error_message: Option<String>,
}

async fn report_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ReportStatusBody>,
) -> Result<Json<CommandRecord>> {
    let id: DispatchId = id.parse().map_err(|_| FleetError::CommandNotFound)?;
    let status: CommandStatus = body.status.parse()?;
    let record =
        state
            .store
            .apply_transition(id, status, body.response_data, body.error_message)?;
    state.store.touch_device(&record.device_id)?;
    Ok(Json(record))
}

async fn cancel_command(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    let id: DispatchId = id.parse().map_err(|_| FleetError::CommandNotFound)?;
    state.store.delete_command(id)?;
    Ok(StatusCode::NO_CONTENT)
}

// ----- device channel --------------------------------------------------

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum DeviceFrame {
    Status {
        command_id: DispatchId,
        status: String,
        #[serde(default)]
        response_data: Option<Value>,
        #[serde(default)]
        error_message: Option<String>,
    },
    Ping,
}

async fn device_channel(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse> {
    if !state.store.device_exists(&device_id)? {
        return Err(FleetError::DeviceNotFound(device_id));
    }
    Ok(ws.on_upgrade(move |socket| handle_device_socket(socket, state, device_id)))
}

/// One live device connection: register presence, drain the backlog through
/// the socket, then push new commands and consume status frames until the
/// peer goes away.
async fn handle_device_socket(socket: WebSocket, state: AppState, device_id: String) {
    info!(device = device_id, "device channel connected");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundFrame>(state.channel_buffer);

    state.hub.connect(&device_id, outbound_tx.clone());
    if let Err(err) = state.store.touch_device(&device_id) {
        warn!(device = device_id, error = %err, "failed to refresh last_seen");
    }

    // Forward outbound frames onto the socket.
    let forward_state = state.clone();
    let forward_device = device_id.clone();
    let send_task = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(err) => {
                    warn!(device = forward_device, error = %err, "failed to encode frame");
                    continue;
                }
            };
            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                report_undelivered(&forward_state, &forward_device, frame).await;
                break;
            }
        }
    });

    // Reconnect semantics: everything parked while the device was offline
    // goes out first, in drain order.
    match state.store.drain_pending(&device_id) {
        Ok(entries) => {
            for entry in &entries {
                let frame = OutboundFrame::Command(CommandEnvelope::for_entry(entry));
                if outbound_tx.send(frame).await.is_err() {
                    break;
                }
            }
        }
        Err(err) => {
            warn!(device = device_id, error = %err, "reconnect drain failed");
        }
    }

    while let Some(message) = ws_rx.next().await {
        let message = match message {
            Ok(message) => message,
            Err(err) => {
                debug!(device = device_id, error = %err, "device channel read error");
                break;
            }
        };

        match message {
            Message::Text(text) => {
                handle_device_frame(&state, &device_id, text.as_str(), &outbound_tx).await;
            }
            Message::Ping(_) | Message::Pong(_) => {
                let _ = state.store.touch_device(&device_id);
            }
            Message::Close(_) => break,
            Message::Binary(_) => {
                debug!(device = device_id, "ignoring binary frame");
            }
        }
    }

    send_task.abort();
    state.hub.disconnect(&device_id, &outbound_tx);
    if let Err(err) = state.store.touch_device(&device_id) {
        warn!(device = device_id, error = %err, "failed to persist last_seen");
    }
    info!(device = device_id, "device channel closed");
}

/// A socket write failure is the one transport-confirmed delivery failure
/// observable after hand-off. Command frames lost this way go through the
/// router's retry accounting; control frames are just dropped.
async fn report_undelivered(state: &AppState, device_id: &str, frame: OutboundFrame) {
    let OutboundFrame::Command(envelope) = frame else {
        return;
    };
    warn!(
        device = device_id,
        command = %envelope.command_id,
        "socket write failed, recording delivery failure"
    );
    if let Err(err) = state.router.handle_push_failure(envelope.command_id).await {
        warn!(
            device = device_id,
            command = %envelope.command_id,
            error = %err,
            "failed to record delivery failure"
        );
    }
}

async fn handle_device_frame(
    state: &AppState,
    device_id: &str,
    raw: &str,
    outbound: &mpsc::Sender<OutboundFrame>,
) {
    let frame: DeviceFrame = match serde_json::from_str(raw) {
        Ok(frame) => frame,
        Err(err) => {
            debug!(device = device_id, error = %err, "unparseable device frame");
            let _ = outbound
                .send(OutboundFrame::Error {
                    message: format!("unparseable frame: {err}"),
                })
                .await;
            return;
        }
    };

    match frame {
        DeviceFrame::Ping => {
            let _ = state.store.touch_device(device_id);
            let _ = outbound.send(OutboundFrame::Pong).await;
        }
        DeviceFrame::Status {
            command_id,
            status,
            response_data,
            error_message,
        } => {
            let status = match status.parse::<CommandStatus>() {
                Ok(status) => status,
                Err(err) => {
                    let _ = outbound
                        .send(OutboundFrame::Error {
                            message: err.to_string(),
                        })
                        .await;
                    return;
                }
            };

            match state
                .store
                .apply_transition(command_id, status, response_data, error_message)
            {
                Ok(_) => {
                    let _ = state.store.touch_device(device_id);
                }
                // A report for a cancelled command is a no-op, not an error.
                Err(FleetError::CommandNotFound) => {
                    debug!(
                        device = device_id,
                        command = %command_id,
                        "status report for unknown command ignored"
                    );
                }
                Err(err) => {
                    warn!(
                        device = device_id,
                        command = %command_id,
                        error = %err,
                        "rejected status report"
                    );
                    let _ = outbound
                        .send(OutboundFrame::Error {
                            message: err.to_string(),
                        })
                        .await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Priority;
    use serde_json::json;

    fn make_state(dir: &tempfile::TempDir) -> AppState {
        let store = Arc::new(CommandStore::open(dir.path().join("dispatch"), 0).unwrap());
        let hub = DeviceHub::new();
        let router = Arc::new(DeliveryRouter::new(
            Arc::clone(&store),
            Arc::new(hub.clone()),
            Arc::new(hub.clone()),
        ));
        AppState {
            store,
            hub,
            router,
            default_ttl_seconds: 3_600,
            default_max_retries: 3,
            channel_buffer: 8,
            list_page_size: 100,
        }
    }

    fn sent_command(state: &AppState, device: &str) -> CommandRecord {
        state.store.register_device(device, None).unwrap();
        let record = state
            .store
            .create_command(CreateCommand {
                device_id: device.to_string(),
                kind: CommandKind::Reboot,
                payload: json!({}),
                priority: Priority::Normal,
                ttl_seconds: 3_600,
                max_retries: 2,
            })
            .unwrap();
        state
            .store
            .apply_transition(record.id, CommandStatus::Sent, None, None)
            .unwrap()
    }

    #[tokio::test]
    async fn failed_socket_write_consumes_a_retry() {
        let dir = tempfile::tempdir().unwrap();
        let state = make_state(&dir);
        let record = sent_command(&state, "d1");

        let frame = OutboundFrame::Command(CommandEnvelope::for_command(&record));
        report_undelivered(&state, "d1", frame).await;

        let stored = state.store.get_command(record.id).unwrap();
        assert_eq!(stored.retry_count, 1);
        assert_eq!(stored.status, CommandStatus::Sent);
    }

    #[tokio::test]
    async fn repeated_write_failures_exhaust_the_budget() {
        let dir = tempfile::tempdir().unwrap();
        let state = make_state(&dir);
        let record = sent_command(&state, "d1");

        for _ in 0..=record.max_retries {
            let frame = OutboundFrame::Command(CommandEnvelope::for_command(&record));
            report_undelivered(&state, "d1", frame).await;
        }

        let stored = state.store.get_command(record.id).unwrap();
        assert_eq!(stored.status, CommandStatus::Failed);
        assert!(stored.retry_count <= stored.max_retries);
    }

    #[tokio::test]
    async fn control_frames_never_touch_retry_accounting() {
        let dir = tempfile::tempdir().unwrap();
        let state = make_state(&dir);
        let record = sent_command(&state, "d1");

        report_undelivered(&state, "d1", OutboundFrame::Pong).await;

        let stored = state.store.get_command(record.id).unwrap();
        assert_eq!(stored.retry_count, 0);
    }
}
