//! Gateway HTTP server: health, status, and the Telegram webhook.

use crate::channels::{ChannelHandle, ChannelRegistry, Incoming, TelegramChannel, TelegramUpdate};
use crate::config::{self, Config};
use crate::llm::ClientRegistry;
use crate::memory::{InMemoryStore, MemoryStore};
use crate::routing::SchedulerRegistry;
use crate::scheduler::SchedulerError;
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const PROTOCOL_VERSION: u32 = 1;

/// Memory, clients, transports and schedulers shared by the gateway and the console.
#[derive(Clone)]
pub(crate) struct Core {
    pub config: Arc<Config>,
    pub clients: Arc<ClientRegistry>,
    pub channel_registry: Arc<ChannelRegistry>,
    pub schedulers: Arc<SchedulerRegistry>,
}

impl Core {
    pub fn new(config: Config) -> Self {
        let config = Arc::new(config);
        let clients = Arc::new(ClientRegistry::new());
        let memory: Arc<dyn MemoryStore> = Arc::new(InMemoryStore::new(
            config.memory.max_entries,
            config.memory.retention_hours,
        ));
        let schedulers = Arc::new(SchedulerRegistry::new(config.clone(), clients.clone(), memory));
        Self {
            config,
            clients,
            channel_registry: Arc::new(ChannelRegistry::new()),
            schedulers,
        }
    }

    /// Hand an inbound message to its conversation's scheduler.
    pub async fn dispatch(&self, incoming: Incoming) {
        let Some(outbound) = self.channel_registry.get(&incoming.transport).await else {
            log::warn!("gateway: no transport registered for {}", incoming.transport);
            return;
        };
        let channel_id = incoming.channel_id.clone();
        match self.schedulers.route(incoming, outbound).await {
            Ok(seq) => log::debug!("gateway: queued message {} for channel {}", seq, channel_id),
            Err(SchedulerError::NotAllowed(id)) => {
                log::debug!("gateway: ignoring message from unlisted chat {}", id)
            }
            Err(e) => log::warn!("gateway: dropping message for channel {}: {}", channel_id, e),
        }
    }
}

/// Shared state for the HTTP handlers.
#[derive(Clone)]
pub struct GatewayState {
    core: Core,
    /// Sender for inbound channel messages (e.g. Telegram webhook POSTs). Processor task receives.
    inbound_tx: mpsc::Sender<Incoming>,
}

/// Run the gateway server; binds to config.gateway.bind:config.gateway.port.
/// Starts the Telegram transport when a bot token is configured (webhook mode when a webhook
/// URL is set, long-poll otherwise). Blocks until shutdown (e.g. Ctrl+C).
pub async fn run_gateway(config: Config) -> Result<()> {
    let bind_addr = format!("{}:{}", config.gateway.bind.trim(), config.gateway.port);
    let core = Core::new(config);
    let (inbound_tx, mut inbound_rx) = mpsc::channel::<Incoming>(64);
    let mut channel_tasks: Vec<JoinHandle<()>> = Vec::new();
    let reaper = core.schedulers.start_reaper();

    {
        let core = core.clone();
        tokio::spawn(async move {
            while let Some(incoming) = inbound_rx.recv().await {
                core.dispatch(incoming).await;
            }
        });
    }

    let telegram_webhook_for_shutdown: Option<Arc<TelegramChannel>> =
        match config::resolve_telegram_token(&core.config) {
            Some(token) => {
                let telegram = Arc::new(TelegramChannel::new(Some(token)));
                core.channel_registry
                    .register(telegram.id().to_string(), telegram.clone())
                    .await;
                if let Some(url) = core.config.channels.telegram.webhook_url.as_deref() {
                    let secret = core.config.channels.telegram.webhook_secret.as_deref();
                    if let Err(e) = telegram.set_webhook(url, secret).await {
                        log::warn!("telegram set_webhook failed: {}", e);
                    } else {
                        log::info!("telegram channel registered (webhook mode): {}", url);
                    }
                    Some(telegram)
                } else {
                    channel_tasks.push(telegram.start_inbound(inbound_tx.clone()));
                    log::info!("telegram channel registered and getUpdates loop started");
                    None
                }
            }
            None => {
                log::warn!("no telegram bot token configured; gateway will only serve HTTP");
                None
            }
        };

    let state = GatewayState {
        core: core.clone(),
        inbound_tx,
    };
    let app = Router::new()
        .route("/", get(health_http))
        .route("/status", get(status_http))
        .route("/telegram/webhook", post(telegram_webhook))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("gateway listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(
            core,
            channel_tasks,
            reaper,
            telegram_webhook_for_shutdown,
        ))
        .await
        .context("gateway server exited")?;
    log::info!("gateway stopped");
    Ok(())
}

/// Future that completes when the process should shut down (SIGINT or SIGTERM).
/// Stops transports, removes the Telegram webhook if used, awaits transport tasks, then stops
/// every scheduler (in-progress ticks run to completion) and the idle reaper.
async fn shutdown_signal(
    core: Core,
    channel_tasks: Vec<JoinHandle<()>>,
    reaper: Option<JoinHandle<()>>,
    telegram_webhook: Option<Arc<TelegramChannel>>,
) {
    wait_for_signal().await;
    log::info!("shutdown signal received, stopping channels and schedulers");

    core.channel_registry.stop_all().await;

    if let Some(t) = telegram_webhook {
        if let Err(e) = t.delete_webhook().await {
            log::debug!("telegram delete_webhook on shutdown: {}", e);
        }
    }

    for h in channel_tasks {
        let _ = h.await;
    }
    log::info!("channel tasks finished");

    core.schedulers.shutdown().await;
    if let Some(h) = reaper {
        let _ = h.await;
    }
}

pub(crate) async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                log::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// POST /telegram/webhook receives Telegram update JSON; verifies optional secret, pushes Incoming.
async fn telegram_webhook(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    if let Some(ref expected) = state.core.config.channels.telegram.webhook_secret {
        let provided = headers
            .get("X-Telegram-Bot-Api-Secret-Token")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if provided != expected.as_str() {
            return StatusCode::FORBIDDEN;
        }
    }
    let update: TelegramUpdate = match serde_json::from_slice(&body) {
        Ok(u) => u,
        Err(_) => return StatusCode::BAD_REQUEST,
    };
    let Some(incoming) = update.into_incoming() else {
        return StatusCode::OK;
    };
    if state.inbound_tx.send(incoming).await.is_err() {
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    StatusCode::OK
}

/// GET / returns a simple health JSON for liveness checks.
async fn health_http(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    Json(json!({
        "runtime": "running",
        "protocol": PROTOCOL_VERSION,
        "port": state.core.config.gateway.port,
    }))
}

/// GET /status lists running schedulers with their buffer state, and live LLM clients.
async fn status_http(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    let channels = state.core.schedulers.status().await;
    let clients: Vec<serde_json::Value> = state
        .core
        .clients
        .active()
        .await
        .into_iter()
        .map(|(key, holders, last_used)| {
            json!({
                "provider": key.provider,
                "name": key.name,
                "model": key.model,
                "holders": holders,
                "lastUsed": last_used,
            })
        })
        .collect();
    Json(json!({
        "channels": channels,
        "clients": clients,
    }))
}
