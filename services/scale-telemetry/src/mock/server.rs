//! axum router for the stand-in backend: WebSocket stream plus REST API

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine as _;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::devices::{find_device, fleet};
use super::generator::MetricsGenerator;
use crate::config::MockServerConfig;
use crate::error::{Result, TelemetryError};
use crate::rest::{AuthSession, Credentials, Device, User};
use crate::wire::{ControlMessage, WireMessage};

const VALID_USERNAME: &str = "admin";
const VALID_PASSWORD: &str = "admin";
const DEFAULT_METRICS_LIMIT: usize = 50;
const MAX_METRICS_LIMIT: usize = 100;
/// Log a progress line every this many streamed messages
const LOG_EVERY: u64 = 100;

/// Shared state of the mock backend
#[derive(Clone)]
pub struct MockServerState {
    devices: Arc<Vec<Device>>,
    generator: Arc<Mutex<MetricsGenerator>>,
    stream_interval: Duration,
    shutdown: CancellationToken,
}

impl MockServerState {
    pub fn new(config: &MockServerConfig) -> Self {
        let devices = fleet(config.fleet_size);
        let generator = MetricsGenerator::new(&devices);
        Self::with_generator(devices, generator, config.stream_interval())
    }

    pub fn with_generator(
        devices: Vec<Device>,
        generator: MetricsGenerator,
        stream_interval: Duration,
    ) -> Self {
        Self {
            devices: Arc::new(devices),
            generator: Arc::new(Mutex::new(generator)),
            stream_interval: stream_interval.max(Duration::from_millis(1)),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// One metrics message per device, in fleet order
    fn next_tick(&self) -> Vec<WireMessage> {
        let mut generator = self.generator.lock();
        self.devices
            .iter()
            .map(|device| WireMessage::metrics(generator.generate(&device.id)))
            .collect()
    }
}

/// Build the mock backend router
pub fn build_router(state: MockServerState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/devices", get(list_devices_handler))
        .route("/api/devices/{id}", get(get_device_handler))
        .route("/api/devices/{id}/metrics", get(device_metrics_handler))
        .route("/api/auth/login", post(login_handler))
        .route("/api/auth/logout", post(logout_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

async fn health_handler() -> &'static str {
    "OK"
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn device_not_found(id: &str) -> Response {
    error_response(
        StatusCode::NOT_FOUND,
        format!("Device with ID {} not found", id),
    )
}

async fn list_devices_handler(State(state): State<MockServerState>) -> Json<Vec<Device>> {
    let mut devices = state.devices().to_vec();
    devices.sort_by(|a, b| a.id.cmp(&b.id));
    Json(devices)
}

async fn get_device_handler(
    State(state): State<MockServerState>,
    Path(id): Path<String>,
) -> Response {
    match find_device(state.devices(), &id) {
        Some(device) => Json(device.clone()).into_response(),
        None => device_not_found(&id),
    }
}

#[derive(Debug, Deserialize)]
struct MetricsQuery {
    limit: Option<String>,
}

async fn device_metrics_handler(
    State(state): State<MockServerState>,
    Path(id): Path<String>,
    Query(query): Query<MetricsQuery>,
) -> Response {
    if find_device(state.devices(), &id).is_none() {
        return device_not_found(&id);
    }

    let limit = query
        .limit
        .and_then(|limit| limit.parse::<usize>().ok())
        .unwrap_or(DEFAULT_METRICS_LIMIT)
        .min(MAX_METRICS_LIMIT);
    debug!("Generating {} historical metrics for '{}'", limit, id);

    let metrics = state.generator.lock().historical(&id, limit);
    Json(metrics).into_response()
}

async fn login_handler(body: Bytes) -> Response {
    let credentials: Credentials = match serde_json::from_slice(&body) {
        Ok(credentials) => credentials,
        Err(e) => {
            debug!("Rejecting login request: {}", e);
            return error_response(StatusCode::BAD_REQUEST, "Invalid request body");
        }
    };

    if credentials.username != VALID_USERNAME || credentials.password != VALID_PASSWORD {
        info!("Failed login attempt for '{}'", credentials.username);
        return error_response(StatusCode::UNAUTHORIZED, "Invalid username or password");
    }

    info!("User '{}' logged in", credentials.username);
    Json(AuthSession {
        token: issue_token(&credentials.username),
        user: User {
            id: "1".to_string(),
            username: credentials.username,
            name: "Admin User".to_string(),
        },
    })
    .into_response()
}

/// Unsigned JWT-shaped token valid for 24 hours
fn issue_token(username: &str) -> String {
    let issued_at = Utc::now().timestamp_millis();
    let payload = json!({
        "sub": username,
        "iat": issued_at,
        "exp": issued_at + 24 * 60 * 60 * 1000,
    });
    let encoded = base64::engine::general_purpose::STANDARD.encode(payload.to_string());
    format!("mock.{}.signature", encoded)
}

async fn logout_handler() -> Json<serde_json::Value> {
    Json(json!({ "message": "Logged out successfully" }))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<MockServerState>) -> Response {
    ws.on_upgrade(move |socket| stream_session(socket, state))
}

/// Stream fleet metrics to one client until it leaves or the server stops
async fn stream_session(socket: WebSocket, state: MockServerState) {
    info!(
        "Client connected, streaming {} devices every {:?}",
        state.devices().len(),
        state.stream_interval
    );

    let (mut sender, mut receiver) = socket.split();
    let mut ticker = tokio::time::interval(state.stream_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut sent: u64 = 0;

    'session: loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                let _ = sender.send(Message::Close(None)).await;
                break;
            }

            _ = ticker.tick() => {
                for message in state.next_tick() {
                    let text = match serde_json::to_string(&message) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("Failed to encode metrics for '{}': {}", message.device_id, e);
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break 'session;
                    }
                    sent += 1;
                    if sent % LOG_EVERY == 0 {
                        info!(
                            "Sent {} messages (latest: {}, weight: {:.1}kg)",
                            sent,
                            message.device_id,
                            message.data.display_weight()
                        );
                    }
                }
            }

            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ControlMessage>(text.as_str()) {
                        Ok(ControlMessage::Ping) => {
                            let pong = ControlMessage::Pong { timestamp: Utc::now() };
                            let reply = match serde_json::to_string(&pong) {
                                Ok(reply) => reply,
                                Err(e) => {
                                    warn!("Failed to encode pong: {}", e);
                                    continue;
                                }
                            };
                            if sender.send(Message::Text(reply.into())).await.is_err() {
                                break;
                            }
                        }
                        Ok(other) => debug!("Ignoring control message {:?}", other),
                        Err(e) => debug!("Ignoring client message '{}': {}", text.as_str(), e),
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("WebSocket receive error: {}", e);
                    break;
                }
            },
        }
    }

    info!("Client disconnected after {} messages", sent);
}

/// Running mock backend bound to a local port
pub struct MockServer {
    addr: SocketAddr,
    shutdown: CancellationToken,
    handle: JoinHandle<Result<()>>,
}

impl MockServer {
    /// Bind `addr` (port 0 picks a free port) and start serving
    pub async fn bind(addr: SocketAddr, state: MockServerState) -> Result<Self> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let shutdown = state.shutdown.clone();
        let stop = shutdown.clone();
        let router = build_router(state);

        let handle = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    stop.cancelled().await;
                })
                .await
                .map_err(|e| TelemetryError::Server(e.to_string()))
        });

        info!("Mock scale server listening on http://{}", addr);
        Ok(Self {
            addr,
            shutdown,
            handle,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    pub fn api_url(&self) -> String {
        format!("http://{}/api", self.addr)
    }

    /// Token that stops the server when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Wait until the server has stopped
    pub async fn wait(self) -> Result<()> {
        self.handle
            .await
            .map_err(|e| TelemetryError::Server(e.to_string()))?
    }

    /// Close all streams and stop serving
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown.cancel();
        self.wait().await?;
        debug!("Mock scale server stopped");
        Ok(())
    }
}
