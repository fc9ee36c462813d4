use anyhow::Result;
use async_trait::async_trait;
use notifs_shared::{truncate_string, Notification};
use tracing::{debug, warn};

/// 本地通知的投递端（推送、托盘提示等由实现决定）
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<()>;
}

// 无界面运行时把通知写入日志
#[derive(Debug, Clone, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        warn!("🔔 {}: {}", notification.title, notification.body);
        debug!(
            "Notification data: {}",
            truncate_string(&notification.data.to_string(), 512)
        );
        Ok(())
    }
}
