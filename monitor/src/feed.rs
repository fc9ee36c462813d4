use chrono::{DateTime, Utc};
use notifs_shared::{
    connection_lost_notification, BrokerRole, CommandKind, CommandPayload, InboundMessage,
    MqttError, MqttTopic, Notification, NotificationDecision, NotificationPolicy, TopicClass,
    TopicFilter,
};
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::mqtt::{ManagerEvent, MqttManagerHandle, SubscriptionId};
use crate::notifier::Notifier;

// 收到的一条消息在界面上的记录
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedEntry {
    pub topic: String,
    pub source: BrokerRole,
    pub received_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<CommandKind>,
    pub payload: Value,
}

impl FeedEntry {
    fn from_message(message: &InboundMessage, payload: Value) -> Self {
        let command = match MqttTopic::from_string(&message.topic) {
            Some(MqttTopic::CommandLight(_)) => Some(CommandKind::Light),
            Some(MqttTopic::CommandFan(_)) => Some(CommandKind::Fan),
            _ => None,
        };

        Self {
            topic: message.topic.clone(),
            source: message.source,
            received_at: message.received_at,
            command,
            payload,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bucket {
    Telemetry,
    Commands,
    Results,
    Alerts,
    All,
}

impl From<TopicClass> for Bucket {
    fn from(class: TopicClass) -> Self {
        match class {
            TopicClass::Telemetry => Bucket::Telemetry,
            TopicClass::Command => Bucket::Commands,
            TopicClass::Result => Bucket::Results,
            TopicClass::Alert => Bucket::Alerts,
        }
    }
}

// 按类别保存的最近消息，各自有上限
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FeedMessages {
    pub telemetry: VecDeque<FeedEntry>,
    pub commands: VecDeque<FeedEntry>,
    pub results: VecDeque<FeedEntry>,
    pub alerts: VecDeque<FeedEntry>,
    pub all: VecDeque<FeedEntry>,
}

impl FeedMessages {
    fn bucket_mut(&mut self, bucket: Bucket) -> &mut VecDeque<FeedEntry> {
        match bucket {
            Bucket::Telemetry => &mut self.telemetry,
            Bucket::Commands => &mut self.commands,
            Bucket::Results => &mut self.results,
            Bucket::Alerts => &mut self.alerts,
            Bucket::All => &mut self.all,
        }
    }

    fn push(&mut self, bucket: Bucket, entry: FeedEntry, limit: usize) {
        let entries = self.bucket_mut(bucket);
        entries.push_back(entry);
        while entries.len() > limit {
            entries.pop_front();
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedSnapshot {
    pub is_connected: bool,
    pub connection_type: Option<BrokerRole>,
    /// 最近一次连接失败的原因，重新连上后清空
    pub error: Option<String>,
    pub messages: FeedMessages,
}

// 单个订阅的处理：归档，再按策略决定是否通知
struct Route {
    messages: Arc<watch::Sender<FeedMessages>>,
    notify_tx: mpsc::UnboundedSender<Notification>,
    policy: NotificationPolicy,
    device_id: String,
    bucket: Bucket,
    class: Option<TopicClass>,
    history_limit: usize,
}

impl Route {
    fn handle(&self, message: &InboundMessage) {
        let payload = message.payload.to_value();
        let entry = FeedEntry::from_message(message, payload.clone());
        self.messages
            .send_modify(|buckets| buckets.push(self.bucket, entry, self.history_limit));

        let Some(class) = self.class else {
            return;
        };
        if let NotificationDecision::Notify(notification) =
            self.policy.evaluate(&self.device_id, class, &payload)
        {
            let _ = self.notify_tx.send(notification);
        }
    }
}

/// 单个设备的实时消息视图
///
/// 订阅设备的五个主题和 `#`，把消息按类别归档，
/// 经通知策略筛选后交给 [`Notifier`]。
pub struct DeviceFeed {
    manager: MqttManagerHandle,
    device_id: String,
    messages: Arc<watch::Sender<FeedMessages>>,
    error: Arc<watch::Sender<Option<String>>>,
    subscriptions: Vec<SubscriptionId>,
    tasks: Vec<JoinHandle<()>>,
}

impl DeviceFeed {
    pub fn attach(
        manager: MqttManagerHandle,
        device_id: &str,
        policy: NotificationPolicy,
        notifier: Arc<dyn Notifier>,
        history_limit: usize,
    ) -> Result<Self, MqttError> {
        let (messages, _) = watch::channel(FeedMessages::default());
        let messages = Arc::new(messages);
        let (error, _) = watch::channel(None);
        let error = Arc::new(error);
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        // connect 之前就要开始接收事件
        let events = manager.events();

        let mut routes: Vec<(String, Bucket, Option<TopicClass>)> = MqttTopic::for_device(device_id)
            .iter()
            .map(|topic| (topic.to_string(), Bucket::from(topic.class()), Some(topic.class())))
            .collect();
        routes.push((TopicFilter::everything().to_string(), Bucket::All, None));

        let mut subscriptions = Vec::with_capacity(routes.len());
        for (topic, bucket, class) in routes {
            let route = Route {
                messages: messages.clone(),
                notify_tx: notify_tx.clone(),
                policy: policy.clone(),
                device_id: device_id.to_string(),
                bucket,
                class,
                history_limit: history_limit.max(1),
            };

            match manager.subscribe(&topic, move |message: &InboundMessage| route.handle(message)) {
                Ok(id) => subscriptions.push(id),
                Err(e) => {
                    for id in subscriptions {
                        let _ = manager.remove_subscription(id);
                    }
                    return Err(e);
                }
            }
        }

        let tasks = vec![
            tokio::spawn(deliver_notifications(notify_rx, notifier)),
            tokio::spawn(watch_connection(events, notify_tx, error.clone())),
        ];

        info!("Device feed attached for {}", device_id);
        Ok(Self {
            manager,
            device_id: device_id.to_string(),
            messages,
            error,
            subscriptions,
            tasks,
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn is_connected(&self) -> bool {
        self.manager.is_connected()
    }

    pub fn connection_type(&self) -> Option<BrokerRole> {
        self.manager.connection_type()
    }

    pub fn snapshot(&self) -> FeedSnapshot {
        FeedSnapshot {
            is_connected: self.manager.is_connected(),
            connection_type: self.manager.connection_type(),
            error: self.error.borrow().clone(),
            messages: self.messages.borrow().clone(),
        }
    }

    /// 消息列表变化时通知界面重新渲染
    pub fn watch_messages(&self) -> watch::Receiver<FeedMessages> {
        self.messages.subscribe()
    }

    /// 向设备下发 `{"value": value}`
    pub fn send_command(&self, kind: CommandKind, value: impl Into<Value>) -> Result<(), MqttError> {
        let topic = match kind {
            CommandKind::Light => MqttTopic::CommandLight(self.device_id.clone()),
            CommandKind::Fan => MqttTopic::CommandFan(self.device_id.clone()),
        };
        let payload = CommandPayload { value: value.into() };

        debug!("Sending {} command to {}", kind, topic);
        self.manager.publish(&topic.to_string(), &payload)
    }

    pub fn send_named_command(&self, kind: &str, value: impl Into<Value>) -> Result<(), MqttError> {
        self.send_command(kind.parse()?, value)
    }

    /// 移除本视图登记的回调；同主题的其他订阅者不受影响
    pub fn detach(mut self) {
        for id in std::mem::take(&mut self.subscriptions) {
            if let Err(e) = self.manager.remove_subscription(id) {
                debug!("Could not remove {}: {}", id, e);
            }
        }
        info!("Device feed detached for {}", self.device_id);
    }
}

impl Drop for DeviceFeed {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn deliver_notifications(mut rx: mpsc::UnboundedReceiver<Notification>, notifier: Arc<dyn Notifier>) {
    while let Some(notification) = rx.recv().await {
        if let Err(e) = notifier.notify(&notification).await {
            error!("Failed to deliver notification {:?}: {}", notification.title, e);
        }
    }
}

// 记录连接错误；两个 broker 都不可达时提示一次
async fn watch_connection(
    mut events: broadcast::Receiver<ManagerEvent>,
    notify_tx: mpsc::UnboundedSender<Notification>,
    error: Arc<watch::Sender<Option<String>>>,
) {
    // 另一端仍在线时的失败不算连接错误
    let mut connected = false;
    loop {
        match events.recv().await {
            Ok(ManagerEvent::BrokersUnreachable) => {
                let _ = notify_tx.send(connection_lost_notification());
            }
            Ok(ManagerEvent::ConnectionError { role, reason }) if !connected => {
                error.send_replace(Some(format!("{} broker: {}", role, reason)));
            }
            Ok(ManagerEvent::StatusChanged(status)) => {
                connected = status.is_connected();
                if connected {
                    error.send_if_modified(|current| current.take().is_some());
                }
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!("Device feed missed {} connection events", skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
}
