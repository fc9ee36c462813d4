use anyhow::{Context, Result};
use notifs_monitor::{DeviceFeed, DualBrokerManager, RumqttConnector, TracingNotifier};
use notifs_shared::{load_config, NotificationPolicy};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting realtime notifications monitor...");

    // 加载配置
    let config = load_config().context("Failed to load monitor configuration")?;
    info!(
        "Monitoring device {} (local: {}, cloud: {})",
        config.device_id,
        config.local.endpoint(),
        config.cloud.endpoint()
    );

    // 启动双 broker 管理器
    let (manager, manager_task) = DualBrokerManager::spawn(
        config.local.clone(),
        config.cloud.clone(),
        config.retry,
        Arc::new(RumqttConnector::new()),
    );

    // 订阅设备主题，必须在 connect 之前
    let feed = DeviceFeed::attach(
        manager.clone(),
        &config.device_id,
        NotificationPolicy::new(config.thresholds),
        Arc::new(TracingNotifier),
        config.feed.history_limit,
    )
    .context("Failed to attach device feed")?;

    // 连接状态变化日志
    let mut status_rx = manager.watch_status();
    let status_task = tokio::spawn(async move {
        while status_rx.changed().await.is_ok() {
            let status = *status_rx.borrow_and_update();
            match status.connection_type() {
                Some(role) => info!("MQTT connected via {} broker", role),
                None => warn!(
                    "MQTT not connected (local: {:?}, cloud: {:?})",
                    status.local, status.cloud
                ),
            }
        }
    });

    match manager.connect().await {
        Ok(role) => info!("Initial connection established with {} broker", role),
        Err(e) => warn!("Initial connection failed: {}. Retrying in background", e),
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Received shutdown signal, stopping monitor...");

    let messages = feed.snapshot().messages;
    info!(
        "Messages received: telemetry={} commands={} results={} alerts={} all={}",
        messages.telemetry.len(),
        messages.commands.len(),
        messages.results.len(),
        messages.alerts.len(),
        messages.all.len()
    );

    feed.detach();
    status_task.abort();

    if let Err(e) = manager.shutdown().await {
        error!("Failed to shut down MQTT manager: {}", e);
    }
    if let Err(e) = manager_task.await {
        error!("MQTT manager task failed: {}", e);
    }

    info!("Monitor stopped");
    Ok(())
}
