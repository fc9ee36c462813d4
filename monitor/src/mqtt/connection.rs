use notifs_shared::{BrokerConfig, BrokerRole, ConnectError, ConnectionState, RetryConfig};
use std::collections::BTreeSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::link::BrokerLink;
use super::retry::{RetrySchedule, RetryStep};

struct RetryTimer {
    generation: u64,
    cancel: CancellationToken,
}

/// 单个 broker 的连接生命周期
///
/// 由管理器任务独占。每次发起连接都会递增 `epoch`，
/// 过期连接尝试的结果和旧连接上的事件据此丢弃。
pub struct BrokerConnection {
    role: BrokerRole,
    config: BrokerConfig,
    state: ConnectionState,
    epoch: u64,
    link: Option<Box<dyn BrokerLink>>,
    active_topics: BTreeSet<String>,
    retry: RetrySchedule,
    retry_timer: Option<RetryTimer>,
    timer_generation: u64,
    last_error: Option<String>,
}

impl BrokerConnection {
    pub fn new(role: BrokerRole, config: BrokerConfig, retry: RetryConfig) -> Self {
        Self {
            role,
            config,
            state: ConnectionState::Disconnected,
            epoch: 0,
            link: None,
            active_topics: BTreeSet::new(),
            retry: RetrySchedule::new(retry),
            retry_timer: None,
            timer_generation: 0,
            last_error: None,
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn active_topics(&self) -> impl Iterator<Item = &str> {
        self.active_topics.iter().map(String::as_str)
    }

    /// 当前连接上的事件才会被处理
    pub fn accepts(&self, epoch: u64) -> bool {
        epoch == self.epoch && self.state == ConnectionState::Connected
    }

    /// Disconnected -> Connecting，返回本次尝试的 epoch
    pub fn begin_connect(&mut self) -> Option<u64> {
        if self.state != ConnectionState::Disconnected {
            return None;
        }

        self.cancel_retry_timer();
        self.epoch += 1;
        self.state = ConnectionState::Connecting;
        Some(self.epoch)
    }

    /// Connecting -> Connected，并重新订阅登记表中的全部主题
    pub fn complete_connect<'a>(
        &mut self,
        epoch: u64,
        link: Box<dyn BrokerLink>,
        topics: impl IntoIterator<Item = &'a str>,
    ) -> bool {
        if epoch != self.epoch || self.state != ConnectionState::Connecting {
            debug!("Discarding stale {} connection (epoch {})", self.role, epoch);
            link.close();
            return false;
        }

        self.state = ConnectionState::Connected;
        self.last_error = None;
        self.retry.reset();
        self.active_topics.clear();
        self.link = Some(link);
        info!("Connected to {} broker at {}", self.role, self.config.endpoint());

        for topic in topics {
            self.subscribe(topic);
        }
        true
    }

    /// Connecting -> Disconnected
    pub fn fail_connect(&mut self, epoch: u64, error: &ConnectError) -> bool {
        if epoch != self.epoch || self.state != ConnectionState::Connecting {
            return false;
        }

        warn!("Failed to connect to {} broker: {}", self.role, error);
        self.state = ConnectionState::Disconnected;
        self.last_error = Some(error.to_string());
        true
    }

    /// 连接意外关闭：Connected -> Disconnected
    pub fn handle_closed(&mut self, epoch: u64, reason: &str) -> bool {
        if !self.accepts(epoch) {
            return false;
        }

        warn!("Connection to {} broker lost: {}", self.role, reason);
        self.link = None;
        self.active_topics.clear();
        self.state = ConnectionState::Disconnected;
        self.last_error = Some(reason.to_string());
        true
    }

    pub fn subscribe(&mut self, topic: &str) {
        if self.active_topics.contains(topic) {
            return;
        }
        let Some(link) = self.link.as_ref().filter(|_| self.is_connected()) else {
            return;
        };

        match link.subscribe(topic) {
            Ok(()) => {
                info!("Subscribed to MQTT topic: {} ({})", topic, self.role);
                self.active_topics.insert(topic.to_string());
            }
            Err(e) => warn!("Failed to subscribe to {} on {} broker: {}", topic, self.role, e),
        }
    }

    pub fn unsubscribe(&mut self, topic: &str) {
        if !self.active_topics.remove(topic) {
            return;
        }
        if let Some(link) = &self.link {
            match link.unsubscribe(topic) {
                Ok(()) => info!("Unsubscribed from MQTT topic: {} ({})", topic, self.role),
                Err(e) => warn!("Failed to unsubscribe from {} on {} broker: {}", topic, self.role, e),
            }
        }
    }

    /// 未连接时记录警告并丢弃，不排队
    pub fn publish(&self, topic: &str, payload: Vec<u8>) -> bool {
        let Some(link) = self.link.as_ref().filter(|_| self.is_connected()) else {
            warn!("Cannot publish to {}: {} broker is not connected", topic, self.role);
            return false;
        };

        match link.publish(topic, payload) {
            Ok(()) => {
                debug!("Published MQTT message to topic: {} ({})", topic, self.role);
                true
            }
            Err(e) => {
                warn!("Failed to publish to {} on {} broker: {}", topic, self.role, e);
                false
            }
        }
    }

    /// 关闭连接并取消重试；任何状态下都以 Disconnected 结束
    pub fn disconnect(&mut self) {
        self.epoch += 1;
        self.cancel_retry_timer();
        self.retry.reset();
        self.active_topics.clear();

        if let Some(link) = self.link.take() {
            link.close();
            info!("Disconnected from {} broker", self.role);
        }
        self.state = ConnectionState::Disconnected;
    }

    pub fn next_retry_step(&mut self) -> RetryStep {
        self.retry.next_step()
    }

    /// 登记新的重试定时器，替换旧的，返回其代号
    pub fn arm_retry_timer(&mut self, cancel: CancellationToken) -> u64 {
        self.cancel_retry_timer();
        self.timer_generation += 1;
        self.retry_timer = Some(RetryTimer {
            generation: self.timer_generation,
            cancel,
        });
        self.timer_generation
    }

    /// 定时器到期；只有当前定时器有效
    pub fn take_due_timer(&mut self, generation: u64) -> bool {
        match &self.retry_timer {
            Some(timer) if timer.generation == generation => {
                self.retry_timer = None;
                true
            }
            _ => false,
        }
    }

    pub fn has_pending_retry(&self) -> bool {
        self.retry_timer.is_some()
    }

    pub fn cancel_retry_timer(&mut self) {
        if let Some(timer) = self.retry_timer.take() {
            timer.cancel.cancel();
        }
    }
}

impl Drop for BrokerConnection {
    fn drop(&mut self) {
        self.cancel_retry_timer();
    }
}
