//! Fake LED boards served over real HTTP for integration tests.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use axum::routing::post;
use axum::Json;
use axum::Router;
use serde_json::json;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
struct BoardState {
    info: Value,
    status: Value,
    failure: Option<(StatusCode, String)>,
    commands: Arc<Mutex<Vec<Value>>>,
}

/// A board listening on an ephemeral localhost port
pub struct FakeBoard {
    pub port: u16,
    /// `127.0.0.1:PORT`
    pub address: String,
    commands: Arc<Mutex<Vec<Value>>>,
    shutdown: CancellationToken,
}

/// `/info` body of a board in our family
pub fn family_info(device_id: &str) -> Value {
    json!({
        "system": "DDM-ESP32",
        "device_id": device_id,
        "type": "cup_base",
        "led_count": 60,
        "led_type": "WS2812B",
        "firmware_version": "2.1.0",
        "mac_address": "AA:BB:CC:DD:EE:01",
        "uptime": 3600
    })
}

/// `/status` body with every reading nominal
pub fn nominal_status() -> Value {
    json!({
        "uptime": 3600,
        "temperature": 41.5,
        "free_memory": 48000,
        "cpu_usage": 12.0,
        "wifi_strength": -55,
        "error_count": 0,
        "firmware_version": "2.1.0"
    })
}

impl FakeBoard {
    pub async fn start(info: Value) -> Result<Self> {
        Self::start_with(info, nominal_status(), None).await
    }

    /// `failure` makes every `POST /command` answer with that status and body
    pub async fn start_with(
        info: Value,
        status: Value,
        failure: Option<(u16, &str)>,
    ) -> Result<Self> {
        let commands = Arc::new(Mutex::new(Vec::new()));
        let failure = match failure {
            Some((code, body)) => Some((StatusCode::from_u16(code)?, body.to_string())),
            None => None,
        };
        let state = BoardState {
            info,
            status,
            failure,
            commands: commands.clone(),
        };
        let app = Router::new()
            .route("/info", get(info_handler))
            .route("/status", get(status_handler))
            .route("/ping", get(|| async { "pong" }))
            .route("/command", post(command_handler))
            .with_state(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                token.cancelled().await;
            });
            if let Err(e) = server.await {
                eprintln!("Fake board error: {:?}", e);
            }
        });

        Ok(Self {
            port,
            address: format!("127.0.0.1:{}", port),
            commands,
            shutdown,
        })
    }

    /// Bodies of every `POST /command` received so far
    pub fn commands(&self) -> Vec<Value> {
        self.commands.lock().unwrap().clone()
    }

    /// Poll until at least `count` commands have arrived
    pub async fn wait_for_commands(&self, count: usize) -> Vec<Value> {
        for _ in 0..100 {
            let commands = self.commands();
            if commands.len() >= count {
                return commands;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        self.commands()
    }
}

impl Drop for FakeBoard {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// An address with nothing listening on it
pub async fn dead_address() -> Result<String> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(format!("127.0.0.1:{}", port))
}

async fn info_handler(State(state): State<BoardState>) -> Json<Value> {
    Json(state.info)
}

async fn status_handler(State(state): State<BoardState>) -> Json<Value> {
    Json(state.status)
}

async fn command_handler(State(state): State<BoardState>, Json(body): Json<Value>) -> Response {
    let verb = body["command"].as_str().unwrap_or("unknown").to_string();
    state.commands.lock().unwrap().push(body);
    match state.failure {
        Some((code, message)) => (code, message).into_response(),
        None => Json(json!({
            "message": format!("{} executed", verb),
            "data": { "ok": true }
        }))
        .into_response(),
    }
}
