use crate::state::{ActivityState, ActivitySnapshot};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::{routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("некорректный адрес listen {addr}: {source}")]
    BadAddr {
        addr: String,
        source: std::net::AddrParseError,
    },
    #[error("не удалось занять адрес {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error("ошибка сервера статуса: {0}")]
    Serve(#[from] std::io::Error),
}

#[derive(Clone)]
pub struct AppState {
    pub state: Arc<ActivityState>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct HealthPayload {
    healthy: bool,
    #[serde(rename = "uptimeSeconds")]
    uptime_seconds: u64,
    #[serde(rename = "activeIDE")]
    active_ide: u32,
    #[serde(rename = "activeSSH")]
    active_ssh: u32,
}

#[derive(Debug, Serialize)]
struct StatusPayload {
    uptime: String,
    #[serde(rename = "startedAt")]
    started_at: DateTime<Utc>,
    #[serde(rename = "lastIDEActivity")]
    last_ide_activity: Option<DateTime<Utc>>,
    #[serde(rename = "lastSSHActivity")]
    last_ssh_activity: Option<DateTime<Utc>>,
    #[serde(rename = "activeIDE")]
    active_ide: u32,
    #[serde(rename = "activeSSH")]
    active_ssh: u32,
}

pub struct StatusServer {
    addr: String,
    state: Arc<ActivityState>,
    started_at: DateTime<Utc>,
}

impl StatusServer {
    pub fn new(addr: String, state: Arc<ActivityState>, started_at: DateTime<Utc>) -> Self {
        Self {
            addr,
            state,
            started_at,
        }
    }

    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<(), ServerError> {
        let addr: SocketAddr = self.addr.parse().map_err(|source| ServerError::BadAddr {
            addr: self.addr.clone(),
            source,
        })?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: self.addr.clone(),
                source,
            })?;

        info!(addr = %addr, "запущен сервер статуса");

        let app = build_router(self.state, self.started_at);
        let mut graceful_rx = shutdown.clone();
        let mut deadline_rx = shutdown;

        let server = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = graceful_rx.changed().await;
            })
            .into_future();
        tokio::pin!(server);

        tokio::select! {
            result = &mut server => result?,
            _ = deadline_rx.changed() => {
                match tokio::time::timeout(SHUTDOWN_GRACE, &mut server).await {
                    Ok(result) => result?,
                    Err(_) => {
                        warn!("сервер статуса не завершил обработку запросов вовремя, прерываем");
                    }
                }
            }
        }

        info!("сервер статуса остановлен");
        Ok(())
    }
}

pub fn build_router(state: Arc<ActivityState>, started_at: DateTime<Utc>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .with_state(AppState { state, started_at })
}

fn uptime_seconds(started_at: DateTime<Utc>) -> u64 {
    Utc::now()
        .signed_duration_since(started_at)
        .num_seconds()
        .max(0) as u64
}

async fn health_handler(State(app): State<AppState>) -> impl IntoResponse {
    let snapshot: ActivitySnapshot = app.state.snapshot().await;

    Json(HealthPayload {
        healthy: true,
        uptime_seconds: uptime_seconds(app.started_at),
        active_ide: snapshot.active_ide,
        active_ssh: snapshot.active_ssh,
    })
}

async fn status_handler(State(app): State<AppState>) -> impl IntoResponse {
    let snapshot = app.state.snapshot().await;
    let uptime = uptime_seconds(app.started_at);

    Json(StatusPayload {
        uptime: humantime::format_duration(Duration::from_secs(uptime)).to_string(),
        started_at: app.started_at,
        last_ide_activity: snapshot.last_ide_activity,
        last_ssh_activity: snapshot.last_ssh_activity,
        active_ide: snapshot.active_ide,
        active_ssh: snapshot.active_ssh,
    })
}
