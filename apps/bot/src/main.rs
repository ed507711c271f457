//! Telegram bridge for the Product Visor event bus.
//!
//! Two loops share the process: the long-poll loop feeding recognized chat
//! commands to the bus, and the outgoing bridge draining the bus consume
//! stream into chat deliveries. Shutdown cancels the bridge first, then
//! closes the bus connections, consume before publish.

mod bridge;
mod commands;
mod config;
mod telegram;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{error, info, warn};
use visor_auth::MachineTokenProvider;
use visor_bus::BusManager;
use visor_session::store_from_env;
use visor_telemetry::serve_metrics;
use visor_templates::TemplateCatalog;

use crate::commands::{CommandHandler, is_start_command};
use crate::config::Config;
use crate::telegram::TelegramClient;

const POLL_TIMEOUT_SECS: u64 = 30;
const POLL_ERROR_PAUSE: Duration = Duration::from_secs(3);

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    visor_telemetry::init("visor-bot");

    let config = Config::from_env()?;
    info!(metrics = %config.metrics_addr, "starting visor-bot");

    let bus = Arc::new(BusManager::new(config.bus_config()));
    bus.start().await?;

    let metrics_addr = config.metrics_addr;
    tokio::spawn(async move {
        if let Err(err) = serve_metrics(metrics_addr).await {
            error!(error = %err, "metrics server failed");
        }
    });

    let http = reqwest::Client::new();
    let telegram = TelegramClient::new(
        http.clone(),
        config.telegram_api_base.clone(),
        config.bot_token.clone(),
    );

    // Warm the machine-token cache; backend calls made on behalf of the bot
    // reuse this credential. Failure here is not fatal.
    let tokens = MachineTokenProvider::from_config(http.clone(), config.token.clone());
    match tokens.get().await {
        Ok(_) => info!("machine token cache warmed"),
        Err(err) => warn!(error = %err, "machine token warm-up failed"),
    }

    let sessions = store_from_env(Duration::from_secs(config.session_ttl_secs)).await?;
    let handler = CommandHandler::new(
        bus.clone(),
        config.topic_user_events.clone(),
        sessions.clone(),
    );

    let bridge_task = tokio::spawn(run_bridge(bus.clone(), telegram.clone()));

    info!("visor-bot started");
    poll_updates(&telegram, &handler).await;

    info!("shutting down");
    bridge_task.abort();
    let _ = bridge_task.await;
    bus.stop().await;
    info!("visor-bot stopped");
    Ok(())
}

/// Attaches the consume stream (lazy, retry-wrapped) and drains it for the
/// process lifetime. Exhausted retries disable the outgoing direction but
/// leave command handling alive; an external supervisor restarts the process.
async fn run_bridge(bus: Arc<BusManager>, telegram: TelegramClient) {
    let stream = match bus.consume().await {
        Ok(stream) => stream,
        Err(err) => {
            error!(error = %err, "bus consumer unavailable; outgoing bridge disabled");
            return;
        }
    };
    bridge::run(stream, telegram, TemplateCatalog::builtin()).await;
}

/// Long-poll loop delivering inbound commands until ctrl-c.
async fn poll_updates(telegram: &TelegramClient, handler: &CommandHandler) {
    let mut offset: Option<i64> = None;
    loop {
        let batch = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            batch = telegram.get_updates(offset, POLL_TIMEOUT_SECS) => batch,
        };
        let updates = match batch {
            Ok(updates) => updates,
            Err(err) => {
                warn!(error = %err, "getUpdates failed");
                tokio::time::sleep(POLL_ERROR_PAUSE).await;
                continue;
            }
        };
        for update in updates {
            offset = Some(update.update_id + 1);
            let Some(message) = update.message else {
                continue;
            };
            if message.text.as_deref().is_some_and(is_start_command) {
                handler.handle_start(&message).await;
            }
        }
    }
}
